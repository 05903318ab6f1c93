/// Identifier of a chunk as reported by the deserializer.
/// Example: `7`
pub type ChunkId = u32;
/// Stable sequence identifier, unique within a sweep.
/// Example: `1042`
pub type SequenceId = u64;
/// Textual sequence key as it appears in corpus inclusion files.
/// Examples: `1042`, `utt_0007_a`
pub type SequenceKey = String;
/// Number of samples (frames, tokens, ...) a sequence or chunk spans.
pub type SampleCount = usize;
