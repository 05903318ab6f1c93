use std::io;

use thiserror::Error;

use crate::types::{ChunkId, SequenceId, SequenceKey};

/// Error type for corpus, randomization, prefetch and configuration failures.
#[derive(Debug, Error)]
pub enum ReaderError {
    /// A numeric-mode key was not a plain unsigned decimal.
    #[error("invalid numeric sequence key '{key}'")]
    InvalidKey {
        /// The rejected key.
        key: SequenceKey,
    },
    /// A string-mode id was never assigned to a key.
    #[error("sequence id {id} has no registered key")]
    UnknownSequenceId {
        /// The unassigned id.
        id: SequenceId,
    },
    /// A chunk was requested from the prefetcher without being queued.
    #[error("chunk {chunk_id} was requested but never prefetched")]
    NotPrefetched {
        /// The requested chunk.
        chunk_id: ChunkId,
    },
    /// The deserializer failed to load a chunk.
    #[error("deserializer failed to materialize chunk {chunk_id}: {source}")]
    DeserializerFailed {
        /// The chunk that failed.
        chunk_id: ChunkId,
        /// The deserializer's error.
        #[source]
        source: Box<ReaderError>,
    },
    /// A background worker panicked.
    #[error("background worker panicked: {message}")]
    WorkerPanicked {
        /// Panic payload rendered as text.
        message: String,
    },
    /// The prefetcher stopped while a consumer was waiting.
    #[error("chunk prefetcher stopped while a consumer was waiting")]
    PrefetcherStopped,
    /// The randomized chunk table or sequence layout broke an invariant.
    #[error("randomized sequence layout corrupted at position {position}: {details}")]
    Corrupt {
        /// Sweep sequence position (or chunk index for table checks).
        position: usize,
        /// What was wrong.
        details: String,
    },
    /// A chunk id the deserializer does not own.
    #[error("deserializer does not own chunk {chunk_id}")]
    UnknownChunk {
        /// The unknown chunk.
        chunk_id: ChunkId,
    },
    /// Invalid configuration or corpus.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// Filesystem failure.
    #[error(transparent)]
    Io(#[from] io::Error),
    /// Malformed JSON configuration.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ReaderError>;

impl ReaderError {
    pub(crate) fn deserializer_failed(chunk_id: ChunkId, source: ReaderError) -> Self {
        Self::DeserializerFailed {
            chunk_id,
            source: Box::new(source),
        }
    }

    /// Chunk id a `DeserializerFailed` error refers to, if any.
    pub fn failed_chunk(&self) -> Option<ChunkId> {
        match self {
            Self::DeserializerFailed { chunk_id, .. } => Some(*chunk_id),
            _ => None,
        }
    }
}
