use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

pub use crate::types::{ChunkId, SampleCount, SequenceId, SequenceKey};

/// Sequence metadata produced by a deserializer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceDescription {
    /// Stable id, unique within a sweep.
    pub id: SequenceId,
    /// Number of samples in the sequence (at least one for valid sequences).
    pub number_of_samples: SampleCount,
    /// Chunk the sequence belongs to.
    pub chunk_id: ChunkId,
    /// Invalid sequences are skipped by corpus filtering.
    pub is_valid: bool,
    /// Optional textual key used for corpus inclusion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<SequenceKey>,
}

impl SequenceDescription {
    /// Build a valid, keyless sequence description.
    pub fn new(id: SequenceId, number_of_samples: SampleCount, chunk_id: ChunkId) -> Self {
        Self {
            id,
            number_of_samples,
            chunk_id,
            is_valid: true,
            key: None,
        }
    }

    /// Attach a textual key.
    pub fn with_key(mut self, key: impl Into<SequenceKey>) -> Self {
        self.key = Some(key.into());
        self
    }
}

/// Chunk metadata produced by a deserializer. Chunks partition the corpus.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkDescription {
    /// Deserializer-assigned chunk id.
    pub id: ChunkId,
    /// Number of sequences in the chunk.
    pub number_of_sequences: usize,
    /// Total samples across the chunk's sequences.
    pub number_of_samples: SampleCount,
}

/// Half-open range `[begin, end)` of permuted chunk indices.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkWindow {
    /// First permuted chunk index inside the window.
    pub begin: usize,
    /// One past the last permuted chunk index inside the window.
    pub end: usize,
}

impl ChunkWindow {
    /// Returns `true` when the permuted chunk index lies inside the window.
    pub fn contains(&self, chunk_index: usize) -> bool {
        self.begin <= chunk_index && chunk_index < self.end
    }

    /// Number of chunks spanned by the window.
    pub fn width(&self) -> usize {
        self.end.saturating_sub(self.begin)
    }
}

/// A chunk placed in the permuted order of one sweep.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RandomizedChunk {
    /// Position of the chunk in the permuted order.
    pub index: usize,
    /// The deserializer's description of the chunk.
    pub original: ChunkDescription,
    /// First sweep sequence position the chunk occupies.
    pub sequence_position_start: usize,
    /// First sweep sample position the chunk occupies.
    pub sample_position_start: usize,
    /// Permuted chunk indices the chunk's sequences may be placed into.
    pub window: ChunkWindow,
}

impl RandomizedChunk {
    /// One past the last sweep sequence position of the chunk.
    pub fn sequence_end_position(&self) -> usize {
        self.sequence_position_start + self.original.number_of_sequences
    }

    /// One past the last sweep sample position of the chunk.
    pub fn sample_end_position(&self) -> usize {
        self.sample_position_start + self.original.number_of_samples
    }
}

/// A sequence as emitted by the sequence randomizer.
///
/// `chunk_index` is a non-owning reference into the sweep's randomized chunk
/// table and is only meaningful until the next sweep reset.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RandomizedSequenceDescription {
    /// Deserializer-assigned sequence id.
    pub id: SequenceId,
    /// Number of samples in the sequence.
    pub number_of_samples: SampleCount,
    /// Deserializer chunk the sequence was read from.
    pub chunk_id: ChunkId,
    /// Permuted index of the chunk the sequence was read from.
    pub chunk_index: usize,
    /// Textual key carried over from the deserializer, if any.
    pub key: Option<SequenceKey>,
}

/// Sample bookkeeping for one randomized chunk, used by seek.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkInfo {
    /// Sweep sample offset of the chunk's first sample.
    pub start: usize,
    /// Total samples in the chunk.
    pub number_of_samples: SampleCount,
}

impl ChunkInfo {
    /// One past the chunk's last sweep sample offset.
    pub fn end(&self) -> usize {
        self.start + self.number_of_samples
    }
}

/// Materialized chunk data returned by a deserializer.
pub trait Chunk: Send + Sync {
    /// Deserializer chunk id.
    fn chunk_id(&self) -> ChunkId;
    /// Raw payload of a sequence held by this chunk.
    fn sequence_data(&self, sequence_id: SequenceId) -> Option<&[u8]>;
}

/// Chunk whose sequence payloads live in memory.
#[derive(Clone, Default)]
pub struct InMemoryChunk {
    chunk_id: ChunkId,
    payloads: HashMap<SequenceId, Vec<u8>>,
}

impl InMemoryChunk {
    /// Create a chunk from `(sequence id, payload)` pairs.
    pub fn new(chunk_id: ChunkId, payloads: impl IntoIterator<Item = (SequenceId, Vec<u8>)>) -> Self {
        Self {
            chunk_id,
            payloads: payloads.into_iter().collect(),
        }
    }

    /// Number of sequences with a payload.
    pub fn len(&self) -> usize {
        self.payloads.len()
    }

    /// Returns `true` when the chunk holds no payloads.
    pub fn is_empty(&self) -> bool {
        self.payloads.is_empty()
    }
}

impl Chunk for InMemoryChunk {
    fn chunk_id(&self) -> ChunkId {
        self.chunk_id
    }

    fn sequence_data(&self, sequence_id: SequenceId) -> Option<&[u8]> {
        self.payloads.get(&sequence_id).map(Vec::as_slice)
    }
}

impl fmt::Debug for InMemoryChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryChunk")
            .field("chunk_id", &self.chunk_id)
            .field("sequences", &self.payloads.len())
            .finish()
    }
}
