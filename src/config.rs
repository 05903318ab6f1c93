use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::constants::epoch::{DEFAULT_MINIBATCH_SIZE, FULL_SWEEP};
use crate::constants::randomizer::{DEFAULT_SEED, DEFAULT_WINDOW_CHUNKS};
use crate::corpus::CorpusDescriptor;
use crate::errors::{ReaderError, Result};

/// Width of the window each chunk's sequences may be spread across.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RandomizationWindow {
    /// Window measured in chunks.
    Chunks(usize),
    /// Window measured in samples, converted to whole chunks per sweep.
    Samples(usize),
}

impl Default for RandomizationWindow {
    fn default() -> Self {
        Self::Chunks(DEFAULT_WINDOW_CHUNKS)
    }
}

/// Controls chunk permutation and in-window sequence shuffling.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RandomizerConfig {
    /// Base seed; sweep `s` is randomized with `seed + s`.
    pub seed: u64,
    /// Randomization window width.
    pub window: RandomizationWindow,
    /// Permute chunk order per sweep. When `false` chunks keep deserializer order.
    pub shuffle_chunks: bool,
}

impl Default for RandomizerConfig {
    fn default() -> Self {
        Self {
            seed: DEFAULT_SEED,
            window: RandomizationWindow::default(),
            shuffle_chunks: true,
        }
    }
}

/// Background chunk prefetching.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrefetchConfig {
    /// When disabled, chunks are loaded synchronously on the caller thread.
    pub enabled: bool,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Which sequences of the corpus are read.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorpusConfig {
    /// File listing included sequence keys, one per line. `None` includes all.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inclusion_file: Option<PathBuf>,
    /// Parse keys as unsigned decimal ids instead of registering strings.
    pub numeric_keys: bool,
}

/// Per-epoch reading parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EpochConfig {
    /// Zero-based epoch number.
    pub epoch_index: usize,
    /// Samples per epoch; `0` means one full sweep.
    pub epoch_size: usize,
    /// Samples requested per minibatch.
    pub minibatch_size: usize,
    /// Rank of this worker among `number_of_workers`.
    pub worker_rank: usize,
    /// Number of workers reading the same sweep order.
    pub number_of_workers: usize,
}

impl Default for EpochConfig {
    fn default() -> Self {
        Self {
            epoch_index: 0,
            epoch_size: FULL_SWEEP,
            minibatch_size: DEFAULT_MINIBATCH_SIZE,
            worker_rank: 0,
            number_of_workers: 1,
        }
    }
}

impl EpochConfig {
    /// Check worker and minibatch parameters.
    pub fn validate(&self) -> Result<()> {
        if self.number_of_workers == 0 {
            return Err(ReaderError::Configuration(
                "number_of_workers must be at least 1".into(),
            ));
        }
        if self.worker_rank >= self.number_of_workers {
            return Err(ReaderError::Configuration(format!(
                "worker_rank {} out of range for {} workers",
                self.worker_rank, self.number_of_workers
            )));
        }
        if self.minibatch_size == 0 {
            return Err(ReaderError::Configuration(
                "minibatch_size must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Top-level reader configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    /// Chunk permutation and window settings.
    pub randomizer: RandomizerConfig,
    /// Background chunk loading.
    pub prefetch: PrefetchConfig,
    /// Corpus inclusion settings.
    pub corpus: CorpusConfig,
}

impl ReaderConfig {
    /// Load and validate a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Parse and validate a JSON configuration.
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check window parameters.
    pub fn validate(&self) -> Result<()> {
        match self.randomizer.window {
            RandomizationWindow::Chunks(0) => Err(ReaderError::Configuration(
                "randomization window must span at least one chunk".into(),
            )),
            RandomizationWindow::Samples(0) => Err(ReaderError::Configuration(
                "randomization window must span at least one sample".into(),
            )),
            _ => Ok(()),
        }
    }

    /// Build the corpus descriptor described by `corpus`.
    pub fn corpus_descriptor(&self) -> Result<CorpusDescriptor> {
        match &self.corpus.inclusion_file {
            Some(path) => CorpusDescriptor::from_file(path, self.corpus.numeric_keys),
            None => Ok(CorpusDescriptor::new(self.corpus.numeric_keys)),
        }
    }
}
