/// Constants used by chunk and sequence randomization.
pub mod randomizer {
    /// Base seed used when a configuration does not provide one.
    pub const DEFAULT_SEED: u64 = 0;
    /// Default randomization window width, in chunks.
    pub const DEFAULT_WINDOW_CHUNKS: usize = 1;
    /// Golden-ratio increment used by the SplitMix64 state update.
    pub const SPLITMIX_INCREMENT: u64 = 0x9E37_79B9_7F4A_7C15;
    /// First SplitMix64 finalizer multiplier.
    pub const SPLITMIX_MUL_A: u64 = 0xBF58_476D_1CE4_E5B9;
    /// Second SplitMix64 finalizer multiplier.
    pub const SPLITMIX_MUL_B: u64 = 0x94D0_49BB_1331_11EB;
}

/// Constants used by the background chunk prefetcher.
pub mod prefetcher {
    /// Name given to the prefetch worker thread.
    pub const WORKER_THREAD_NAME: &str = "chunk-prefetcher";
    /// Panic message used when a panic payload is neither `&str` nor `String`.
    pub const UNKNOWN_PANIC_MESSAGE: &str = "worker panicked with a non-string payload";
}

/// Constants used by corpus inclusion files.
pub mod corpus {
    /// Trailing byte stripped from keys read from CRLF files.
    pub const CARRIAGE_RETURN: char = '\r';
}

/// Constants used by epoch configuration.
pub mod epoch {
    /// Epoch size meaning "exactly one sweep over the corpus".
    pub const FULL_SWEEP: usize = 0;
    /// Default minibatch size in samples.
    pub const DEFAULT_MINIBATCH_SIZE: usize = 256;
}
