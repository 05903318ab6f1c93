//! Deserializer interfaces and in-memory / corpus-filtered implementations.
//!
//! Ownership model:
//! - A `Deserializer` is shared (`Arc`) by the sequence randomizer, which only
//!   reads metadata, and the chunk prefetcher, which materializes chunks.
//! - `ChunkHandle` values are shared and immutable; whoever holds one keeps
//!   the chunk alive.

use std::collections::HashMap;
use std::sync::Arc;

use crate::corpus::CorpusDescriptor;
use crate::data::{Chunk, ChunkDescription, InMemoryChunk, SequenceDescription};
use crate::errors::{ReaderError, Result};
use crate::types::{ChunkId, SampleCount, SequenceId};

/// Shared, immutable handle to a materialized chunk.
pub type ChunkHandle = Arc<dyn Chunk>;

/// Corpus access used by the randomizers and the prefetcher.
///
/// `chunk_descriptions` and `sequences_for_chunk` must be stable for the
/// lifetime of the deserializer. `get_chunk` may block on I/O and is only
/// called from the prefetch worker (or the caller thread when prefetching is
/// disabled).
pub trait Deserializer: Send + Sync {
    /// All chunks of the corpus, in deserializer order.
    fn chunk_descriptions(&self) -> Vec<ChunkDescription>;
    /// Sequences of `chunk_id`, in a stable order.
    fn sequences_for_chunk(&self, chunk_id: ChunkId) -> Result<Vec<SequenceDescription>>;
    /// Materialize the data of `chunk_id`.
    fn get_chunk(&self, chunk_id: ChunkId) -> Result<ChunkHandle>;
}

/// Deserializer over sequences held in memory.
///
/// Payloads default to the little-endian bytes of the sequence id.
pub struct InMemoryDeserializer {
    chunks: Vec<ChunkDescription>,
    sequences: HashMap<ChunkId, Vec<SequenceDescription>>,
    data: HashMap<ChunkId, Arc<InMemoryChunk>>,
}

impl InMemoryDeserializer {
    /// Create a deserializer where `chunks[i]` holds the sequences of chunk `i`.
    /// The `chunk_id` stored in each description is overwritten with `i`.
    pub fn new(chunks: Vec<Vec<SequenceDescription>>) -> Self {
        let mut descriptions = Vec::with_capacity(chunks.len());
        let mut sequences = HashMap::with_capacity(chunks.len());
        let mut data = HashMap::with_capacity(chunks.len());
        for (idx, mut chunk_sequences) in chunks.into_iter().enumerate() {
            let chunk_id = idx as ChunkId;
            for sequence in &mut chunk_sequences {
                sequence.chunk_id = chunk_id;
            }
            descriptions.push(ChunkDescription {
                id: chunk_id,
                number_of_sequences: chunk_sequences.len(),
                number_of_samples: chunk_sequences
                    .iter()
                    .map(|sequence| sequence.number_of_samples)
                    .sum(),
            });
            let payloads = chunk_sequences
                .iter()
                .map(|sequence| (sequence.id, sequence.id.to_le_bytes().to_vec()));
            data.insert(chunk_id, Arc::new(InMemoryChunk::new(chunk_id, payloads)));
            sequences.insert(chunk_id, chunk_sequences);
        }
        Self {
            chunks: descriptions,
            sequences,
            data,
        }
    }

    /// Build a corpus from per-chunk sample counts. Sequence ids are assigned
    /// consecutively from zero across chunks and keyed by their decimal id.
    pub fn from_sample_counts(chunks: &[&[SampleCount]]) -> Self {
        let mut next_id: SequenceId = 0;
        let chunks: Vec<Vec<SequenceDescription>> = chunks
            .iter()
            .enumerate()
            .map(|(chunk_idx, samples)| {
                samples
                    .iter()
                    .map(|&number_of_samples| {
                        let id = next_id;
                        next_id += 1;
                        SequenceDescription::new(id, number_of_samples, chunk_idx as ChunkId)
                            .with_key(id.to_string())
                    })
                    .collect::<Vec<_>>()
            })
            .collect();
        Self::new(chunks)
    }

    /// Total number of samples in the corpus.
    pub fn total_samples(&self) -> SampleCount {
        self.chunks.iter().map(|chunk| chunk.number_of_samples).sum()
    }
}

impl Deserializer for InMemoryDeserializer {
    fn chunk_descriptions(&self) -> Vec<ChunkDescription> {
        self.chunks.clone()
    }

    fn sequences_for_chunk(&self, chunk_id: ChunkId) -> Result<Vec<SequenceDescription>> {
        self.sequences
            .get(&chunk_id)
            .cloned()
            .ok_or(ReaderError::UnknownChunk { chunk_id })
    }

    fn get_chunk(&self, chunk_id: ChunkId) -> Result<ChunkHandle> {
        let chunk = self
            .data
            .get(&chunk_id)
            .ok_or(ReaderError::UnknownChunk { chunk_id })?;
        Ok(Arc::clone(chunk) as ChunkHandle)
    }
}

/// Deserializer wrapper that only exposes sequences included by a corpus.
///
/// Invalid sequences are dropped as well. Chunk descriptions are recomputed
/// from the surviving sequences and chunks left empty are omitted.
pub struct CorpusFilteredDeserializer {
    inner: Arc<dyn Deserializer>,
    corpus: Arc<CorpusDescriptor>,
    chunks: Vec<ChunkDescription>,
}

impl CorpusFilteredDeserializer {
    /// Wrap `inner`, scanning every chunk once to recompute its description.
    pub fn new(inner: Arc<dyn Deserializer>, corpus: Arc<CorpusDescriptor>) -> Result<Self> {
        let mut filtered = Self {
            inner,
            corpus,
            chunks: Vec::new(),
        };
        let mut chunks = Vec::new();
        for chunk in filtered.inner.chunk_descriptions() {
            let sequences = filtered.included_sequences(chunk.id)?;
            if sequences.is_empty() {
                continue;
            }
            chunks.push(ChunkDescription {
                id: chunk.id,
                number_of_sequences: sequences.len(),
                number_of_samples: sequences
                    .iter()
                    .map(|sequence| sequence.number_of_samples)
                    .sum(),
            });
        }
        filtered.chunks = chunks;
        Ok(filtered)
    }

    /// The corpus used for filtering.
    pub fn corpus(&self) -> &Arc<CorpusDescriptor> {
        &self.corpus
    }

    fn included_sequences(&self, chunk_id: ChunkId) -> Result<Vec<SequenceDescription>> {
        let mut included = Vec::new();
        for sequence in self.inner.sequences_for_chunk(chunk_id)? {
            if !sequence.is_valid {
                continue;
            }
            let keep = match &sequence.key {
                Some(key) => self.corpus.is_included(key)?,
                None => self.corpus.is_included(&sequence.id.to_string())?,
            };
            if keep {
                included.push(sequence);
            }
        }
        Ok(included)
    }
}

impl Deserializer for CorpusFilteredDeserializer {
    fn chunk_descriptions(&self) -> Vec<ChunkDescription> {
        self.chunks.clone()
    }

    fn sequences_for_chunk(&self, chunk_id: ChunkId) -> Result<Vec<SequenceDescription>> {
        self.included_sequences(chunk_id)
    }

    fn get_chunk(&self, chunk_id: ChunkId) -> Result<ChunkHandle> {
        self.inner.get_chunk(chunk_id)
    }
}
