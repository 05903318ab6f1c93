use std::collections::HashSet;
use std::io;
use std::sync::Arc;

use sequence_reader::{
    ChunkDescription, ChunkHandle, ChunkId, ChunkPrefetcher, Deserializer, InMemoryDeserializer,
    RandomizationWindow, RandomizerConfig, ReaderError, Result, SequenceDescription, SequenceId,
    SequenceRandomizer, WindowedChunkRandomizer,
};

fn randomizer(samples: &[&[usize]], window: RandomizationWindow, seed: u64) -> SequenceRandomizer {
    let deserializer = Arc::new(InMemoryDeserializer::from_sample_counts(samples));
    let config = RandomizerConfig {
        seed,
        window,
        shuffle_chunks: true,
    };
    let chunk_randomizer = WindowedChunkRandomizer::new(deserializer.chunk_descriptions(), &config);
    SequenceRandomizer::new(deserializer, Box::new(chunk_randomizer), seed).unwrap()
}

fn ids(randomizer: &mut SequenceRandomizer, sample_count: usize) -> Vec<SequenceId> {
    randomizer
        .next_sequences(sample_count)
        .unwrap()
        .into_iter()
        .map(|sequence| sequence.id)
        .collect()
}

fn four_sequences() -> SequenceRandomizer {
    randomizer(&[&[1, 1, 2, 2]], RandomizationWindow::Chunks(1), 0)
}

#[test]
fn single_chunk_emits_in_order_with_forward_progress() {
    let mut randomizer = four_sequences();
    assert_eq!(ids(&mut randomizer, 0), vec![0]);
    assert_eq!(ids(&mut randomizer, 1), vec![1]);
    assert_eq!(ids(&mut randomizer, 2), vec![2]);
    assert_eq!(ids(&mut randomizer, 3), vec![3]);
    assert!(ids(&mut randomizer, 3).is_empty());
}

#[test]
fn seek_inside_a_sequence_rounds_forward() {
    let mut randomizer = four_sequences();
    assert_eq!(randomizer.seek(3, 0).unwrap(), 4);
    assert_eq!(ids(&mut randomizer, 100), vec![3]);
    assert!(ids(&mut randomizer, 100).is_empty());
}

#[test]
fn seek_past_the_sweep_rolls_into_the_next() {
    let mut randomizer = four_sequences();
    assert_eq!(randomizer.seek(5, 0).unwrap(), 6);
    assert_eq!(randomizer.sweep(), 1);
    assert_eq!(ids(&mut randomizer, 1), vec![0]);
}

#[test]
fn window_of_two_chunks_is_reproducible_and_local() {
    let samples: &[&[usize]] = &[&[1; 10], &[1; 10], &[1; 10]];
    let run = || {
        let mut randomizer = randomizer(samples, RandomizationWindow::Chunks(2), 42);
        let mut emitted = Vec::new();
        loop {
            let batch = randomizer.next_sequences(4).unwrap();
            if batch.is_empty() {
                return emitted;
            }
            emitted.extend(batch);
        }
    };

    let first = run();
    let second = run();
    assert_eq!(first.len(), 30);
    assert_eq!(
        first.iter().map(|s| s.id).collect::<Vec<_>>(),
        second.iter().map(|s| s.id).collect::<Vec<_>>()
    );
    for (position, sequence) in first.iter().enumerate() {
        let slot = position / 10;
        assert!(
            sequence.chunk_index.abs_diff(slot) <= 1,
            "sequence {} from chunk {} emitted in slot {slot}",
            sequence.id,
            sequence.chunk_index
        );
    }
}

#[test]
fn seek_to_exactly_the_sweep_end_rolls_over() {
    let mut randomizer = four_sequences();
    assert_eq!(randomizer.seek(6, 0).unwrap(), 6);
    assert_eq!(randomizer.sweep(), 1);
    assert_eq!(randomizer.sample_position(), 0);
}

#[test]
fn seek_beyond_the_sweep_is_rejected() {
    let mut randomizer = four_sequences();
    assert_eq!(ids(&mut randomizer, 1), vec![0]);
    assert!(matches!(
        randomizer.seek(100, 0),
        Err(ReaderError::Configuration(_))
    ));
    assert_eq!(randomizer.sweep(), 0);
    assert_eq!(randomizer.sample_position(), 1);
    assert_eq!(ids(&mut randomizer, 1), vec![1]);
}

/// Fails to materialize the listed chunks.
struct FlakyDisk {
    inner: InMemoryDeserializer,
    failing: HashSet<ChunkId>,
}

impl Deserializer for FlakyDisk {
    fn chunk_descriptions(&self) -> Vec<ChunkDescription> {
        self.inner.chunk_descriptions()
    }

    fn sequences_for_chunk(&self, chunk_id: ChunkId) -> Result<Vec<SequenceDescription>> {
        self.inner.sequences_for_chunk(chunk_id)
    }

    fn get_chunk(&self, chunk_id: ChunkId) -> Result<ChunkHandle> {
        if self.failing.contains(&chunk_id) {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated chunk file").into());
        }
        self.inner.get_chunk(chunk_id)
    }
}

fn flaky_disk(failing: &[ChunkId]) -> Arc<FlakyDisk> {
    let counts = vec![&[1usize, 1][..]; 10];
    Arc::new(FlakyDisk {
        inner: InMemoryDeserializer::from_sample_counts(&counts),
        failing: failing.iter().copied().collect(),
    })
}

#[test]
fn consumer_gets_its_chunk_even_when_another_finishes_first() {
    let prefetcher = ChunkPrefetcher::new(flaky_disk(&[]));
    prefetcher.start().unwrap();
    // The single worker runs in queue order, so chunk 9 lands first.
    prefetcher.prefetch([9, 7]);
    let chunk = prefetcher.get_prefetched(7).unwrap();
    assert_eq!(chunk.chunk_id(), 7);
    assert_eq!(prefetcher.cached_len(), 1);
    assert_eq!(prefetcher.get_prefetched(9).unwrap().chunk_id(), 9);
}

#[test]
fn deserializer_failure_is_rethrown_on_the_consumer() {
    let prefetcher = ChunkPrefetcher::new(flaky_disk(&[4]));
    prefetcher.start().unwrap();
    prefetcher.prefetch([4]);
    match prefetcher.get_prefetched(4) {
        Err(ReaderError::DeserializerFailed { chunk_id, source }) => {
            assert_eq!(chunk_id, 4);
            assert!(matches!(*source, ReaderError::Io(_)));
        }
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("chunk 4 should have failed"),
    }
}
