//! Per-sweep chunk permutation with randomization windows.

use std::sync::Arc;

use tracing::debug;

use crate::config::{RandomizationWindow, RandomizerConfig};
use crate::data::{ChunkDescription, ChunkWindow, RandomizedChunk};
use crate::rng::DeterministicRng;

/// Produces the permuted chunk order of a sweep.
///
/// Every returned chunk must satisfy `window.begin <= index < window.end`,
/// both window endpoints must be non-decreasing in `index`, and positions
/// must be cumulative in permuted order.
pub trait ChunkRandomizer: Send {
    /// Randomized chunks of `sweep`. Calling twice with the same sweep yields
    /// the same order.
    fn randomize(&self, sweep: usize) -> Arc<[RandomizedChunk]>;
}

/// Shuffles chunks with a seeded generator and attaches windows sized in
/// chunks or samples.
pub struct WindowedChunkRandomizer {
    chunks: Vec<ChunkDescription>,
    window: RandomizationWindow,
    seed: u64,
    shuffle_chunks: bool,
}

impl WindowedChunkRandomizer {
    /// Create a randomizer over `chunks` (deserializer order).
    pub fn new(chunks: Vec<ChunkDescription>, config: &RandomizerConfig) -> Self {
        Self {
            chunks,
            window: config.window,
            seed: config.seed,
            shuffle_chunks: config.shuffle_chunks,
        }
    }

    /// Number of chunks permuted per sweep.
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    fn chunk_windows(&self, randomized: &mut [RandomizedChunk]) {
        let count = randomized.len();
        match self.window {
            RandomizationWindow::Chunks(width) => {
                let width = width.max(1);
                for chunk in randomized.iter_mut() {
                    chunk.window = if count <= width {
                        ChunkWindow {
                            begin: 0,
                            end: count,
                        }
                    } else {
                        let begin = chunk.index.saturating_sub((width - 1) / 2).min(count - width);
                        ChunkWindow {
                            begin,
                            end: begin + width,
                        }
                    };
                }
            }
            RandomizationWindow::Samples(range) => {
                let range = range.max(1);
                let before = range / 2;
                let after = range - before;
                let ends: Vec<usize> = randomized.iter().map(|c| c.sample_end_position()).collect();
                let starts: Vec<usize> =
                    randomized.iter().map(|c| c.sample_position_start).collect();
                for chunk in randomized.iter_mut() {
                    let low = chunk.sample_position_start.saturating_sub(before);
                    let high = chunk.sample_position_start + after;
                    let begin = ends.partition_point(|&end| end <= low).min(chunk.index);
                    let end = starts
                        .partition_point(|&start| start < high)
                        .max(chunk.index + 1);
                    chunk.window = ChunkWindow { begin, end };
                }
            }
        }
    }
}

impl ChunkRandomizer for WindowedChunkRandomizer {
    fn randomize(&self, sweep: usize) -> Arc<[RandomizedChunk]> {
        let mut order = self.chunks.clone();
        if self.shuffle_chunks {
            let mut rng = DeterministicRng::new(self.seed.wrapping_add(sweep as u64));
            rng.shuffle(&mut order);
        }

        let mut sequence_position = 0;
        let mut sample_position = 0;
        let mut randomized: Vec<RandomizedChunk> = order
            .into_iter()
            .enumerate()
            .map(|(index, original)| {
                let chunk = RandomizedChunk {
                    index,
                    original,
                    sequence_position_start: sequence_position,
                    sample_position_start: sample_position,
                    window: ChunkWindow {
                        begin: index,
                        end: index + 1,
                    },
                };
                sequence_position += original.number_of_sequences;
                sample_position += original.number_of_samples;
                chunk
            })
            .collect();
        self.chunk_windows(&mut randomized);
        debug!(
            sweep,
            chunks = randomized.len(),
            window = ?self.window,
            "randomized chunk order"
        );
        randomized.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunks(samples: &[usize]) -> Vec<ChunkDescription> {
        samples
            .iter()
            .enumerate()
            .map(|(idx, &number_of_samples)| ChunkDescription {
                id: idx as u32,
                number_of_sequences: number_of_samples,
                number_of_samples,
            })
            .collect()
    }

    fn config(window: RandomizationWindow, shuffle_chunks: bool) -> RandomizerConfig {
        RandomizerConfig {
            seed: 11,
            window,
            shuffle_chunks,
        }
    }

    fn assert_window_invariants(randomized: &[RandomizedChunk]) {
        for pair in randomized.windows(2) {
            assert!(pair[0].window.begin <= pair[1].window.begin);
            assert!(pair[0].window.end <= pair[1].window.end);
        }
        for chunk in randomized {
            assert!(chunk.window.contains(chunk.index), "{chunk:?}");
            assert!(chunk.window.end <= randomized.len());
        }
    }

    #[test]
    fn unshuffled_width_one_is_identity() {
        let randomizer =
            WindowedChunkRandomizer::new(chunks(&[2, 3, 4]), &config(RandomizationWindow::Chunks(1), false));
        let randomized = randomizer.randomize(0);
        let ids: Vec<_> = randomized.iter().map(|c| c.original.id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
        let starts: Vec<_> = randomized.iter().map(|c| c.sequence_position_start).collect();
        assert_eq!(starts, vec![0, 2, 5]);
        for chunk in randomized.iter() {
            assert_eq!(chunk.window.width(), 1);
        }
    }

    #[test]
    fn chunk_windows_are_bounded_and_monotone() {
        for width in 1..=7 {
            let randomizer = WindowedChunkRandomizer::new(
                chunks(&[1; 10]),
                &config(RandomizationWindow::Chunks(width), true),
            );
            let randomized = randomizer.randomize(3);
            assert_window_invariants(&randomized);
            for chunk in randomized.iter() {
                assert_eq!(chunk.window.width(), width);
            }
        }
    }

    #[test]
    fn wide_window_covers_all_chunks() {
        let randomizer =
            WindowedChunkRandomizer::new(chunks(&[1, 1, 1]), &config(RandomizationWindow::Chunks(8), true));
        for chunk in randomizer.randomize(0).iter() {
            assert_eq!(chunk.window, ChunkWindow { begin: 0, end: 3 });
        }
    }

    #[test]
    fn sample_windows_are_bounded_and_monotone() {
        let randomizer = WindowedChunkRandomizer::new(
            chunks(&[5, 1, 8, 3, 3, 9, 2, 4]),
            &config(RandomizationWindow::Samples(10), true),
        );
        for sweep in 0..4 {
            let randomized = randomizer.randomize(sweep);
            assert_window_invariants(&randomized);
        }
    }

    #[test]
    fn sample_window_smaller_than_chunks_degenerates_to_own_chunk() {
        let randomizer = WindowedChunkRandomizer::new(
            chunks(&[10, 10, 10]),
            &config(RandomizationWindow::Samples(1), false),
        );
        for chunk in randomizer.randomize(0).iter() {
            assert_eq!(chunk.window.width(), 1);
        }
    }

    #[test]
    fn same_sweep_same_order_different_sweeps_differ() {
        let randomizer = WindowedChunkRandomizer::new(
            chunks(&[1; 16]),
            &config(RandomizationWindow::Chunks(2), true),
        );
        let first: Vec<_> = randomizer.randomize(1).iter().map(|c| c.original.id).collect();
        let again: Vec<_> = randomizer.randomize(1).iter().map(|c| c.original.id).collect();
        let other: Vec<_> = randomizer.randomize(2).iter().map(|c| c.original.id).collect();
        assert_eq!(first, again);
        assert_ne!(first, other);
    }
}
