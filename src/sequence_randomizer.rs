//! Windowed, swap-based sequence randomization over a rolling working set.
//!
//! Cursors over the permuted chunk order of the current sweep:
//! - `h`: first chunk still held in the working set.
//! - `i`: first chunk whose sequence layout is not final yet.
//! - `j`: first chunk whose positions have not been shuffled yet.
//! - `k`: first chunk whose sequences have not been loaded yet.
//!
//! `h <= i <= j <= k` always holds, and the emission cursor stays inside
//! `[h, i)` while the sweep is not exhausted. Once chunk `c` is below `i` no
//! later shuffle touches its positions, so emission and seek can replay it.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::debug;

use crate::chunk_randomizer::ChunkRandomizer;
use crate::data::{ChunkInfo, ChunkWindow, RandomizedChunk, RandomizedSequenceDescription};
use crate::deserializer::Deserializer;
use crate::errors::{ReaderError, Result};
use crate::rng::DeterministicRng;

/// Emits the sequences of a sweep in a reproducible, locally shuffled order.
pub struct SequenceRandomizer {
    deserializer: Arc<dyn Deserializer>,
    chunk_randomizer: Box<dyn ChunkRandomizer>,
    base_seed: u64,
    sweep: usize,
    chunks: Arc<[RandomizedChunk]>,
    rng: DeterministicRng,
    /// Per-chunk sequence vectors for chunks `[h, k)`.
    window: VecDeque<Vec<RandomizedSequenceDescription>>,
    /// Sample bookkeeping for chunks `[h, i)`.
    chunk_info: VecDeque<ChunkInfo>,
    /// Sweep sample offset where chunk `i` starts.
    finalized_samples: usize,
    h: usize,
    i: usize,
    j: usize,
    k: usize,
    current_chunk: usize,
    current_sequence: usize,
    current_sample: usize,
}

impl SequenceRandomizer {
    /// Create a randomizer positioned at the start of sweep 0.
    ///
    /// Sweep `s` uses the chunk order `chunk_randomizer.randomize(s)` and the
    /// sequence seed `base_seed + s`.
    pub fn new(
        deserializer: Arc<dyn Deserializer>,
        chunk_randomizer: Box<dyn ChunkRandomizer>,
        base_seed: u64,
    ) -> Result<Self> {
        let chunks = chunk_randomizer.randomize(0);
        check_chunk_table(&chunks)?;
        let mut randomizer = Self {
            deserializer,
            chunk_randomizer,
            base_seed,
            sweep: 0,
            chunks,
            rng: DeterministicRng::new(base_seed),
            window: VecDeque::new(),
            chunk_info: VecDeque::new(),
            finalized_samples: 0,
            h: 0,
            i: 0,
            j: 0,
            k: 0,
            current_chunk: 0,
            current_sequence: 0,
            current_sample: 0,
        };
        randomizer.reset(base_seed)?;
        Ok(randomizer)
    }

    /// Restart the current sweep's chunk order with the sequence seed `seed`.
    pub fn reset(&mut self, seed: u64) -> Result<()> {
        self.rng = DeterministicRng::new(seed);
        self.window.clear();
        self.chunk_info.clear();
        self.finalized_samples = 0;
        self.h = 0;
        self.i = 0;
        self.j = 0;
        self.k = 0;
        self.current_chunk = 0;
        self.current_sequence = 0;
        self.current_sample = 0;
        debug!(
            sweep = self.sweep,
            seed,
            chunks = self.chunks.len(),
            "sequence randomizer reset"
        );
        self.randomize_next_chunk_if_needed()?;
        self.skip_empty_chunks()
    }

    /// Move to the start of `sweep`, re-permuting chunks and reseeding.
    ///
    /// Fails with [`ReaderError::Corrupt`] when the chunk randomizer returns a
    /// table whose positions or windows are inconsistent; the randomizer is
    /// left unchanged in that case.
    pub fn reset_sweep(&mut self, sweep: usize) -> Result<()> {
        let chunks = self.chunk_randomizer.randomize(sweep);
        check_chunk_table(&chunks)?;
        self.sweep = sweep;
        self.chunks = chunks;
        self.reset(self.base_seed.wrapping_add(sweep as u64))
    }

    /// Sweep currently being emitted.
    pub fn sweep(&self) -> usize {
        self.sweep
    }

    /// Sweep sample offset of the next sequence to be emitted.
    pub fn sample_position(&self) -> usize {
        self.current_sample
    }

    /// Sweep sequence position of the next sequence to be emitted.
    pub fn sequence_position(&self) -> usize {
        self.current_sequence
    }

    /// Total samples in one sweep.
    pub fn sweep_samples(&self) -> usize {
        self.chunks.last().map_or(0, RandomizedChunk::sample_end_position)
    }

    /// Randomized chunk table of the current sweep.
    pub fn randomized_chunks(&self) -> &[RandomizedChunk] {
        &self.chunks
    }

    /// Chunks currently held in the working set (`[h, k)`).
    pub fn current_chunks(&self) -> &[RandomizedChunk] {
        &self.chunks[self.h..self.k]
    }

    /// Permuted index of the chunk being emitted, if the sweep is not exhausted.
    pub fn current_chunk_index(&self) -> Option<usize> {
        (self.current_chunk < self.chunks.len()).then_some(self.current_chunk)
    }

    /// Working-set cursors `(h, i, j, k)`.
    pub fn cursors(&self) -> (usize, usize, usize, usize) {
        (self.h, self.i, self.j, self.k)
    }

    /// Earliest sweep sample offset still retained in the working set.
    pub fn earliest_retained_sample(&self) -> usize {
        self.chunk_info
            .front()
            .map_or(self.finalized_samples, |info| info.start)
    }

    /// Next sequences totalling at most `sample_count` samples.
    ///
    /// The first sequence is always returned, even when it alone exceeds
    /// `sample_count`; further sequences are taken only while they fit. An
    /// empty result means the sweep is exhausted.
    pub fn next_sequences(
        &mut self,
        sample_count: usize,
    ) -> Result<Vec<RandomizedSequenceDescription>> {
        let mut result = Vec::new();
        let mut remaining = sample_count;
        while self.current_chunk < self.chunks.len() {
            let sequence = self.sequence_at(self.current_sequence).clone();
            if !result.is_empty() && sequence.number_of_samples > remaining {
                break;
            }
            let exhausted_budget = sequence.number_of_samples >= remaining;
            remaining = remaining.saturating_sub(sequence.number_of_samples);
            result.push(sequence);
            self.advance()?;
            if exhausted_budget {
                break;
            }
        }
        Ok(result)
    }

    /// Position at the first sequence boundary at or after `sample_offset` of
    /// `sweep`, returning the offset landed on.
    ///
    /// Offsets inside a sequence round forward. Landing on the end of the
    /// sweep rolls over to the start of `sweep + 1`; the returned offset is
    /// then the sweep length. Offsets past the sweep length fail with
    /// [`ReaderError::Configuration`] and leave the position unchanged.
    pub fn seek(&mut self, sample_offset: usize, sweep: usize) -> Result<usize> {
        let sweep_samples = self.sweep_samples();
        if sample_offset > sweep_samples {
            return Err(ReaderError::Configuration(format!(
                "seek offset {sample_offset} is past the sweep length {sweep_samples}"
            )));
        }
        if sweep != self.sweep || sample_offset < self.earliest_retained_sample() {
            self.reset_sweep(sweep)?;
        }

        if let Some(back) = self.chunk_info.back()
            && sample_offset < back.end()
            && sample_offset < self.current_sample
        {
            let slot = self
                .chunk_info
                .partition_point(|info| info.end() <= sample_offset);
            let chunk = self.h + slot;
            self.current_chunk = chunk;
            self.current_sequence = self.chunks[chunk].sequence_position_start;
            self.current_sample = self.chunk_info[slot].start;
            self.skip_empty_chunks()?;
        }

        while self.current_sample < sample_offset && self.current_chunk < self.chunks.len() {
            self.next_sequences(1)?;
        }

        let landed = self.current_sample;
        if self.current_chunk >= self.chunks.len() {
            self.reset_sweep(sweep + 1)?;
        }
        Ok(landed)
    }

    fn advance(&mut self) -> Result<()> {
        let number_of_samples = self.sequence_at(self.current_sequence).number_of_samples;
        self.current_sequence += 1;
        self.current_sample += number_of_samples;
        self.skip_empty_chunks()
    }

    /// Move the emission cursor past finished (or empty) chunks, randomizing
    /// ahead as it goes.
    fn skip_empty_chunks(&mut self) -> Result<()> {
        while self.current_chunk < self.chunks.len()
            && self.current_sequence >= self.chunks[self.current_chunk].sequence_end_position()
        {
            self.current_chunk += 1;
            self.randomize_next_chunk_if_needed()?;
        }
        Ok(())
    }

    fn randomize_next_chunk_if_needed(&mut self) -> Result<()> {
        if self.current_chunk < self.i {
            debug_assert!(self.current_chunk >= self.h);
            return Ok(());
        }
        debug_assert_eq!(self.i, self.current_chunk);
        if self.i >= self.chunks.len() {
            return Ok(());
        }

        self.release_head_chunks();

        // Every chunk whose window reaches back to `i` is shuffled now, so the
        // layout of chunk `i` is final afterwards.
        let mut end_to_randomize = self.chunks[self.i].window.end;
        while end_to_randomize < self.chunks.len()
            && self.chunks[end_to_randomize].window.begin <= self.i
        {
            end_to_randomize += 1;
        }
        let end_to_load = self.chunks[end_to_randomize - 1].window.end;
        for chunk_index in self.k..end_to_load {
            self.add_randomized_sequences_for_chunk(chunk_index)?;
        }

        let end_position = self.chunks[end_to_randomize - 1].sequence_end_position();
        let first_position = self
            .chunks
            .get(self.j)
            .map_or(end_position, |chunk| chunk.sequence_position_start);
        for t in first_position..end_position {
            let window = self.chunks[self.chunk_index_for_position(t)].window;
            // A window of one chunk keeps deserializer order.
            if window.width() == 1 {
                continue;
            }
            let position_begin = self.chunks[window.begin].sequence_position_start;
            let position_end = self.chunks[window.end - 1].sequence_end_position();
            loop {
                let candidate = self.rng.index_in(position_begin, position_end);
                if self.is_valid_for_position(t, self.sequence_at(candidate))
                    && self.is_valid_for_position(candidate, self.sequence_at(t))
                {
                    self.swap_positions(t, candidate);
                    break;
                }
            }
        }

        #[cfg(debug_assertions)]
        self.verify_placement(first_position, end_position)?;

        let number_of_samples = self.window[self.i - self.h]
            .iter()
            .map(|sequence| sequence.number_of_samples)
            .sum();
        self.chunk_info.push_back(ChunkInfo {
            start: self.finalized_samples,
            number_of_samples,
        });
        self.finalized_samples += number_of_samples;

        self.i += 1;
        self.j = end_to_randomize;
        self.k = end_to_load;
        debug!(
            h = self.h,
            i = self.i,
            j = self.j,
            k = self.k,
            "advanced randomized region"
        );
        Ok(())
    }

    /// Drop head chunks that have been emitted and that no pending shuffle
    /// can reach.
    fn release_head_chunks(&mut self) {
        let reachable_from = self
            .chunks
            .get(self.j)
            .map_or(self.current_chunk, |chunk| chunk.window.begin);
        while self.h < self.current_chunk && self.h < reachable_from && self.h < self.i {
            self.window.pop_front();
            self.chunk_info.pop_front();
            self.h += 1;
        }
    }

    fn add_randomized_sequences_for_chunk(&mut self, chunk_index: usize) -> Result<()> {
        debug_assert_eq!(chunk_index, self.k);
        let chunk = self.chunks[chunk_index];
        let sequences = self
            .deserializer
            .sequences_for_chunk(chunk.original.id)?
            .into_iter()
            .map(|sequence| RandomizedSequenceDescription {
                id: sequence.id,
                number_of_samples: sequence.number_of_samples,
                chunk_id: chunk.original.id,
                chunk_index,
                key: sequence.key,
            })
            .collect::<Vec<_>>();
        if sequences.len() != chunk.original.number_of_sequences {
            return Err(ReaderError::Corrupt {
                position: chunk.sequence_position_start,
                details: format!(
                    "chunk {} reported {} sequences but listed {}",
                    chunk.original.id,
                    chunk.original.number_of_sequences,
                    sequences.len()
                ),
            });
        }
        self.window.push_back(sequences);
        self.k += 1;
        Ok(())
    }

    #[cfg(debug_assertions)]
    fn verify_placement(&self, first_position: usize, end_position: usize) -> Result<()> {
        for t in first_position..end_position {
            if !self.is_valid_for_position(t, self.sequence_at(t)) {
                return Err(ReaderError::Corrupt {
                    position: t,
                    details: "sequence placed outside its chunk window".into(),
                });
            }
        }
        Ok(())
    }

    fn is_valid_for_position(&self, position: usize, sequence: &RandomizedSequenceDescription) -> bool {
        self.chunks[self.chunk_index_for_position(position)]
            .window
            .contains(sequence.chunk_index)
    }

    /// Permuted index of the chunk holding sweep sequence `position`.
    fn chunk_index_for_position(&self, position: usize) -> usize {
        self.chunks
            .partition_point(|chunk| chunk.sequence_position_start <= position)
            - 1
    }

    fn locate(&self, position: usize) -> (usize, usize) {
        let chunk_index = self.chunk_index_for_position(position);
        let offset = position - self.chunks[chunk_index].sequence_position_start;
        (chunk_index - self.h, offset)
    }

    fn sequence_at(&self, position: usize) -> &RandomizedSequenceDescription {
        let (slot, offset) = self.locate(position);
        &self.window[slot][offset]
    }

    fn swap_positions(&mut self, a: usize, b: usize) {
        let (slot_a, offset_a) = self.locate(a);
        let (slot_b, offset_b) = self.locate(b);
        if slot_a == slot_b {
            self.window[slot_a].swap(offset_a, offset_b);
            return;
        }
        let ((low_slot, low_offset), (high_slot, high_offset)) = if slot_a < slot_b {
            ((slot_a, offset_a), (slot_b, offset_b))
        } else {
            ((slot_b, offset_b), (slot_a, offset_a))
        };
        let slots = self.window.make_contiguous();
        let (head, tail) = slots.split_at_mut(high_slot);
        std::mem::swap(&mut head[low_slot][low_offset], &mut tail[0][high_offset]);
    }
}

/// Reject chunk tables the swap pass cannot work with: indices out of order,
/// positions that are not cumulative, or windows that miss their own chunk,
/// run past the table or move backwards.
fn check_chunk_table(chunks: &[RandomizedChunk]) -> Result<()> {
    let corrupt = |position: usize, details: String| {
        Err(ReaderError::Corrupt { position, details })
    };
    let mut sequence_position = 0;
    let mut sample_position = 0;
    let mut previous = ChunkWindow { begin: 0, end: 0 };
    for (index, chunk) in chunks.iter().enumerate() {
        if chunk.index != index {
            return corrupt(index, format!("chunk at {index} claims index {}", chunk.index));
        }
        if chunk.sequence_position_start != sequence_position
            || chunk.sample_position_start != sample_position
        {
            return corrupt(
                index,
                format!(
                    "chunk {index} starts at sequence {} / sample {}, expected {sequence_position} / {sample_position}",
                    chunk.sequence_position_start, chunk.sample_position_start
                ),
            );
        }
        let window = chunk.window;
        if !window.contains(index) || window.end > chunks.len() {
            return corrupt(
                index,
                format!(
                    "window [{}, {}) of chunk {index} is outside [0, {}) or misses the chunk",
                    window.begin,
                    window.end,
                    chunks.len()
                ),
            );
        }
        if window.begin < previous.begin || window.end < previous.end {
            return corrupt(
                index,
                format!(
                    "window [{}, {}) of chunk {index} moves back from [{}, {})",
                    window.begin, window.end, previous.begin, previous.end
                ),
            );
        }
        previous = window;
        sequence_position = chunk.sequence_end_position();
        sample_position = chunk.sample_end_position();
    }
    Ok(())
}
