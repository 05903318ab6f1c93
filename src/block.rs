//! Epoch-level reading surface tying the randomizers, the corpus filter and
//! the prefetcher together.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info};

use crate::chunk_randomizer::WindowedChunkRandomizer;
use crate::config::{EpochConfig, ReaderConfig};
use crate::constants::epoch::FULL_SWEEP;
use crate::corpus::CorpusDescriptor;
use crate::data::RandomizedSequenceDescription;
use crate::deserializer::{ChunkHandle, CorpusFilteredDeserializer, Deserializer};
use crate::errors::{ReaderError, Result};
use crate::prefetch::ChunkPrefetcher;
use crate::sequence_randomizer::SequenceRandomizer;
use crate::types::ChunkId;

/// A randomized sequence with the chunk holding its payload.
#[derive(Clone)]
pub struct LoadedSequence {
    /// Where the sequence came from and how many samples it has.
    pub description: RandomizedSequenceDescription,
    /// Materialized chunk containing the sequence.
    pub chunk: ChunkHandle,
}

impl LoadedSequence {
    /// Payload bytes of the sequence.
    pub fn data(&self) -> Option<&[u8]> {
        self.chunk.sequence_data(self.description.id)
    }
}

/// One minibatch worth of sequences for this worker.
#[derive(Clone, Default)]
pub struct Sequences {
    /// Sequences kept for this worker, in emission order.
    pub data: Vec<LoadedSequence>,
    /// `true` once the epoch's sample budget has been consumed.
    pub end_of_epoch: bool,
}

/// Reads epochs of randomized sequences, one minibatch at a time.
pub struct BlockRandomizer {
    deserializer: Arc<dyn Deserializer>,
    randomizer: SequenceRandomizer,
    prefetcher: Option<ChunkPrefetcher>,
    /// Chunks loaded for the current sweep, keyed by randomized chunk index.
    loaded: BTreeMap<usize, ChunkHandle>,
    epoch: EpochConfig,
    epoch_start: usize,
    epoch_samples: usize,
    sweep_samples: usize,
}

impl BlockRandomizer {
    /// Build a reader over `deserializer`, filtered by the configured
    /// inclusion file when one is set, and position it at epoch 0.
    pub fn new(deserializer: Arc<dyn Deserializer>, config: &ReaderConfig) -> Result<Self> {
        config.validate()?;
        if config.corpus.inclusion_file.is_some() {
            let corpus = Arc::new(config.corpus_descriptor()?);
            return Self::with_corpus(deserializer, corpus, config);
        }
        Self::build(deserializer, config)
    }

    /// Build a reader that only sees sequences included by `corpus`.
    pub fn with_corpus(
        deserializer: Arc<dyn Deserializer>,
        corpus: Arc<CorpusDescriptor>,
        config: &ReaderConfig,
    ) -> Result<Self> {
        config.validate()?;
        let filtered = CorpusFilteredDeserializer::new(deserializer, corpus)?;
        Self::build(Arc::new(filtered), config)
    }

    fn build(deserializer: Arc<dyn Deserializer>, config: &ReaderConfig) -> Result<Self> {
        let chunk_randomizer =
            WindowedChunkRandomizer::new(deserializer.chunk_descriptions(), &config.randomizer);
        let randomizer = SequenceRandomizer::new(
            Arc::clone(&deserializer),
            Box::new(chunk_randomizer),
            config.randomizer.seed,
        )?;
        let sweep_samples = randomizer.sweep_samples();
        if sweep_samples == 0 {
            return Err(ReaderError::Configuration(
                "corpus contains no samples".into(),
            ));
        }

        let prefetcher = if config.prefetch.enabled {
            let prefetcher = ChunkPrefetcher::new(Arc::clone(&deserializer));
            prefetcher.start()?;
            Some(prefetcher)
        } else {
            None
        };

        let mut reader = Self {
            deserializer,
            randomizer,
            prefetcher,
            loaded: BTreeMap::new(),
            epoch: EpochConfig::default(),
            epoch_start: 0,
            epoch_samples: sweep_samples,
            sweep_samples,
        };
        reader.start_epoch(EpochConfig::default())?;
        Ok(reader)
    }

    /// Position at the first sequence boundary at or after global sample
    /// `epoch_index * epoch_size`.
    pub fn start_epoch(&mut self, epoch: EpochConfig) -> Result<()> {
        epoch.validate()?;
        let epoch_samples = if epoch.epoch_size == FULL_SWEEP {
            self.sweep_samples
        } else {
            epoch.epoch_size
        };
        let epoch_start = epoch.epoch_index * epoch_samples;
        let sweep = epoch_start / self.sweep_samples;
        let offset = epoch_start % self.sweep_samples;

        self.loaded.clear();
        if let Some(prefetcher) = &self.prefetcher {
            prefetcher.clear();
        }
        let landed = self.randomizer.seek(offset, sweep)?;
        self.epoch = epoch;
        self.epoch_start = epoch_start;
        self.epoch_samples = epoch_samples;
        info!(
            epoch = epoch.epoch_index,
            epoch_samples,
            sweep,
            offset,
            landed,
            worker_rank = epoch.worker_rank,
            number_of_workers = epoch.number_of_workers,
            "epoch started"
        );
        self.prefetch_ahead();
        Ok(())
    }

    /// Next minibatch of sequences for this worker.
    ///
    /// Every worker walks the same global order; only sequences from chunks
    /// assigned to this worker are returned, so `data` may be empty while the
    /// epoch is still running.
    ///
    /// A chunk that fails to load is reported as
    /// [`ReaderError::DeserializerFailed`] and the reader stays at the start of
    /// the minibatch, so the next call retries it.
    pub fn next_sequences(&mut self) -> Result<Sequences> {
        let epoch_end = self.epoch_start + self.epoch_samples;
        let position = self.global_sample_position();
        if position >= epoch_end {
            return Ok(Sequences {
                data: Vec::new(),
                end_of_epoch: true,
            });
        }

        let request = self.epoch.minibatch_size.min(epoch_end - position);
        let (sweep, offset) = (self.randomizer.sweep(), self.randomizer.sample_position());
        let descriptions = self.randomizer.next_sequences(request)?;
        let data = match self.load_local(descriptions) {
            Ok(data) => data,
            Err(err) => {
                self.randomizer.seek(offset, sweep)?;
                return Err(err);
            }
        };

        self.release_unreachable_chunks();
        self.roll_sweep_if_exhausted()?;
        self.prefetch_ahead();

        Ok(Sequences {
            data,
            end_of_epoch: self.global_sample_position() >= epoch_end,
        })
    }

    /// Sweep currently being read.
    pub fn sweep(&self) -> usize {
        self.randomizer.sweep()
    }

    /// Samples consumed since the start of sweep 0.
    pub fn global_sample_position(&self) -> usize {
        self.randomizer.sweep() * self.sweep_samples + self.randomizer.sample_position()
    }

    /// Total samples in one sweep over the (filtered) corpus.
    pub fn sweep_samples(&self) -> usize {
        self.sweep_samples
    }

    /// Number of chunks currently held for the running sweep.
    pub fn loaded_chunks(&self) -> usize {
        self.loaded.len()
    }

    fn is_local_chunk(&self, chunk_index: usize) -> bool {
        chunk_index % self.epoch.number_of_workers == self.epoch.worker_rank
    }

    fn load_local(
        &mut self,
        descriptions: Vec<RandomizedSequenceDescription>,
    ) -> Result<Vec<LoadedSequence>> {
        let mut data = Vec::with_capacity(descriptions.len());
        for description in descriptions {
            if !self.is_local_chunk(description.chunk_index) {
                continue;
            }
            let chunk = self.loaded_chunk(description.chunk_index)?;
            data.push(LoadedSequence { description, chunk });
        }
        Ok(data)
    }

    fn loaded_chunk(&mut self, chunk_index: usize) -> Result<ChunkHandle> {
        if let Some(chunk) = self.loaded.get(&chunk_index) {
            return Ok(Arc::clone(chunk));
        }
        let chunk_id = self.chunk_id(chunk_index);
        let chunk = match &self.prefetcher {
            Some(prefetcher) => {
                prefetcher.prefetch([chunk_id]);
                prefetcher.get_prefetched(chunk_id)?
            }
            None => self
                .deserializer
                .get_chunk(chunk_id)
                .map_err(|source| ReaderError::deserializer_failed(chunk_id, source))?,
        };
        self.loaded.insert(chunk_index, Arc::clone(&chunk));
        Ok(chunk)
    }

    fn chunk_id(&self, chunk_index: usize) -> ChunkId {
        self.randomizer.randomized_chunks()[chunk_index].original.id
    }

    /// Chunks below the current chunk's window can no longer be emitted.
    fn release_unreachable_chunks(&mut self) {
        match self.reachable_from() {
            Some(begin) => self.loaded = self.loaded.split_off(&begin),
            None => self.loaded.clear(),
        }
    }

    fn reachable_from(&self) -> Option<usize> {
        self.randomizer
            .current_chunk_index()
            .map(|index| self.randomizer.randomized_chunks()[index].window.begin)
    }

    fn roll_sweep_if_exhausted(&mut self) -> Result<()> {
        if self.randomizer.current_chunk_index().is_some() {
            return Ok(());
        }
        let next = self.randomizer.sweep() + 1;
        self.randomizer.reset_sweep(next)?;
        self.loaded.clear();
        if let Some(prefetcher) = &self.prefetcher {
            prefetcher.clear();
        }
        debug!(sweep = next, "rolled into next sweep");
        Ok(())
    }

    fn prefetch_ahead(&self) {
        let (Some(prefetcher), Some(begin)) = (&self.prefetcher, self.reachable_from()) else {
            return;
        };
        let wanted: Vec<ChunkId> = self
            .randomizer
            .current_chunks()
            .iter()
            .filter(|chunk| {
                chunk.index >= begin
                    && self.is_local_chunk(chunk.index)
                    && !self.loaded.contains_key(&chunk.index)
            })
            .map(|chunk| chunk.original.id)
            .collect();
        prefetcher.prefetch(wanted);
    }
}

impl Drop for BlockRandomizer {
    fn drop(&mut self) {
        if let Some(prefetcher) = &self.prefetcher {
            prefetcher.stop();
        }
    }
}
