#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

/// Epoch-level reader combining randomization, filtering and prefetching.
pub mod block;
/// First-failure capture for worker threads.
pub mod capture;
/// Per-sweep chunk permutation and randomization windows.
pub mod chunk_randomizer;
/// Reader configuration types.
pub mod config;
/// Centralized constants used across randomizers, prefetcher, and corpus.
pub mod constants;
/// Sequence and chunk descriptor types.
pub mod data;
/// Corpus key registry and inclusion filtering.
pub mod corpus;
/// Deserializer trait and built-in deserializers.
pub mod deserializer;
/// Background chunk prefetching.
pub mod prefetch;
/// Deterministic pseudo-random number generation.
pub mod rng;
/// Windowed swap-based sequence randomization.
pub mod sequence_randomizer;
/// Shared type aliases.
pub mod types;

mod errors;

pub use block::{BlockRandomizer, LoadedSequence, Sequences};
pub use capture::ErrorCapture;
pub use chunk_randomizer::{ChunkRandomizer, WindowedChunkRandomizer};
pub use config::{
    CorpusConfig, EpochConfig, PrefetchConfig, RandomizationWindow, RandomizerConfig,
    ReaderConfig,
};
pub use corpus::CorpusDescriptor;
pub use data::{
    Chunk, ChunkDescription, ChunkInfo, ChunkWindow, InMemoryChunk, RandomizedChunk,
    RandomizedSequenceDescription, SequenceDescription,
};
pub use deserializer::{ChunkHandle, CorpusFilteredDeserializer, Deserializer, InMemoryDeserializer};
pub use errors::{ReaderError, Result};
pub use prefetch::ChunkPrefetcher;
pub use rng::DeterministicRng;
pub use sequence_randomizer::SequenceRandomizer;
pub use types::{ChunkId, SampleCount, SequenceId, SequenceKey};
