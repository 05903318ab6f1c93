use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use tracing::{debug, warn};

use crate::capture::ErrorCapture;
use crate::constants::prefetcher::{UNKNOWN_PANIC_MESSAGE, WORKER_THREAD_NAME};
use crate::deserializer::{ChunkHandle, Deserializer};
use crate::errors::{ReaderError, Result};
use crate::types::ChunkId;

/// Background cache of chunks the randomizer is about to consume.
///
/// A single worker thread drains the pending queue, materializes each chunk
/// through the deserializer (outside the lock) and parks it in the cache until
/// exactly one consumer takes it with [`ChunkPrefetcher::get_prefetched`].
pub struct ChunkPrefetcher {
    deserializer: Arc<dyn Deserializer>,
    shared: Arc<SharedState>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

/// State shared with the worker thread.
struct SharedState {
    state: Mutex<PrefetchState>,
    ready: Condvar,
    capture: ErrorCapture,
    stats: PrefetcherStats,
}

/// Pending queue, claimed ids, cache and per-chunk failures, guarded by one mutex.
#[derive(Default)]
struct PrefetchState {
    pending: VecDeque<ChunkId>,
    claimed: HashSet<ChunkId>,
    cache: HashMap<ChunkId, ChunkHandle>,
    failed: HashMap<ChunkId, ReaderError>,
    running: bool,
}

#[derive(Default)]
/// Prefetcher runtime counters.
struct PrefetcherStats {
    fetched: AtomicUsize,
    errors: AtomicUsize,
}

impl ChunkPrefetcher {
    /// Create a stopped prefetcher over `deserializer`.
    pub fn new(deserializer: Arc<dyn Deserializer>) -> Self {
        Self {
            deserializer,
            shared: Arc::new(SharedState {
                state: Mutex::new(PrefetchState::default()),
                ready: Condvar::new(),
                capture: ErrorCapture::new(),
                stats: PrefetcherStats::default(),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Spawn the worker. Does nothing while a worker is already running.
    pub fn start(&self) -> Result<()> {
        let mut worker = self.worker.lock().expect("prefetch worker poisoned");
        if worker.is_some() {
            return Ok(());
        }
        self.shared.lock().running = true;
        let shared = Arc::clone(&self.shared);
        let deserializer = Arc::clone(&self.deserializer);
        let spawned = thread::Builder::new()
            .name(WORKER_THREAD_NAME.into())
            .spawn(move || run_worker(&shared, deserializer.as_ref()));
        match spawned {
            Ok(handle) => {
                *worker = Some(handle);
                debug!("chunk prefetcher started");
                Ok(())
            }
            Err(err) => {
                self.shared.lock().running = false;
                Err(err.into())
            }
        }
    }

    /// Stop and join the worker. Waiting consumers fail with
    /// [`ReaderError::PrefetcherStopped`].
    pub fn stop(&self) {
        let handle = self.worker.lock().expect("prefetch worker poisoned").take();
        let Some(handle) = handle else {
            return;
        };
        self.shared.lock().running = false;
        self.shared.ready.notify_all();
        let _ = handle.join();
        debug!("chunk prefetcher stopped");
    }

    /// Returns `true` while the worker thread is alive.
    pub fn is_running(&self) -> bool {
        self.shared.lock().running
    }

    /// Queue the ids that are not already claimed.
    pub fn prefetch(&self, chunk_ids: impl IntoIterator<Item = ChunkId>) {
        let mut state = self.shared.lock();
        let mut queued = false;
        for chunk_id in chunk_ids {
            if state.claimed.insert(chunk_id) {
                state.pending.push_back(chunk_id);
                queued = true;
            }
        }
        drop(state);
        if queued {
            self.shared.ready.notify_all();
        }
    }

    /// Block until `chunk_id` is materialized, then remove and return it.
    ///
    /// Fails with [`ReaderError::NotPrefetched`] when the id is not claimed.
    /// When the worker failed to materialize `chunk_id` (an error or a panic
    /// inside the deserializer) that failure is returned as
    /// [`ReaderError::DeserializerFailed`] and the claim is released, so the
    /// chunk can be queued again.
    pub fn get_prefetched(&self, chunk_id: ChunkId) -> Result<ChunkHandle> {
        let mut state = self.shared.lock();
        if !state.claimed.contains(&chunk_id) {
            return Err(ReaderError::NotPrefetched { chunk_id });
        }
        loop {
            if let Some(chunk) = state.cache.remove(&chunk_id) {
                state.claimed.remove(&chunk_id);
                return Ok(chunk);
            }
            if let Some(err) = state.failed.remove(&chunk_id) {
                state.claimed.remove(&chunk_id);
                return Err(err);
            }
            if !state.running {
                return Err(ReaderError::PrefetcherStopped);
            }
            state = self
                .shared
                .ready
                .wait(state)
                .expect("prefetch state poisoned");
        }
    }

    /// Drop pending ids, claims, cached chunks and unconsumed failures.
    /// A materialization already in flight finishes and is discarded.
    pub fn clear(&self) {
        let mut state = self.shared.lock();
        state.pending.clear();
        state.claimed.clear();
        state.cache.clear();
        for (chunk_id, err) in state.failed.drain() {
            warn!(chunk_id, error = %err, "discarding unconsumed prefetch failure");
        }
    }

    /// Number of failed chunks whose failure no consumer has taken yet.
    pub fn failed_len(&self) -> usize {
        self.shared.lock().failed.len()
    }

    /// Number of materialized chunks waiting for a consumer.
    pub fn cached_len(&self) -> usize {
        self.shared.lock().cache.len()
    }

    /// Number of ids queued but not yet taken by the worker.
    pub fn pending_len(&self) -> usize {
        self.shared.lock().pending.len()
    }

    /// Total chunks materialized by the worker.
    pub fn fetched_count(&self) -> usize {
        self.shared.stats.fetched.load(Ordering::Relaxed)
    }

    /// Total chunk materializations that failed.
    pub fn error_count(&self) -> usize {
        self.shared.stats.errors.load(Ordering::Relaxed)
    }
}

impl Drop for ChunkPrefetcher {
    fn drop(&mut self) {
        self.stop();
    }
}

impl SharedState {
    fn lock(&self) -> std::sync::MutexGuard<'_, PrefetchState> {
        self.state.lock().expect("prefetch state poisoned")
    }
}

fn run_worker(shared: &SharedState, deserializer: &dyn Deserializer) {
    loop {
        let mut batch = {
            let mut state = shared.lock();
            while state.pending.is_empty() && state.running {
                state = shared.ready.wait(state).expect("prefetch state poisoned");
            }
            if !state.running {
                return;
            }
            std::mem::take(&mut state.pending)
        };
        debug!(chunks = batch.len(), "prefetch batch taken");

        while let Some(chunk_id) = batch.pop_front() {
            {
                let mut state = shared.lock();
                if !state.running {
                    // Unfetched ids stay claimed; a restarted worker serves them.
                    batch.push_front(chunk_id);
                    batch.extend(state.pending.drain(..));
                    state.pending = batch;
                    return;
                }
                if !state.claimed.contains(&chunk_id) {
                    continue;
                }
            }

            // Errors come back as values; the capture only ever holds a panic,
            // which is taken right away and pinned on this chunk.
            let fetched = shared
                .capture
                .safe_run(|| Ok(deserializer.get_chunk(chunk_id)))
                .unwrap_or_else(|| {
                    Err(shared.capture.take().unwrap_or_else(|| ReaderError::WorkerPanicked {
                        message: UNKNOWN_PANIC_MESSAGE.into(),
                    }))
                });

            let mut state = shared.lock();
            let claimed = state.claimed.contains(&chunk_id);
            match fetched {
                Ok(chunk) => {
                    shared.stats.fetched.fetch_add(1, Ordering::Relaxed);
                    if claimed {
                        state.cache.insert(chunk_id, chunk);
                    } else {
                        debug!(chunk_id, "discarding chunk cleared while in flight");
                    }
                }
                Err(source) => {
                    shared.stats.errors.fetch_add(1, Ordering::Relaxed);
                    if claimed {
                        warn!(chunk_id, error = %source, "chunk materialization failed");
                        state
                            .failed
                            .insert(chunk_id, ReaderError::deserializer_failed(chunk_id, source));
                    } else {
                        debug!(chunk_id, "discarding failure of chunk cleared while in flight");
                    }
                }
            }
            drop(state);
            shared.ready.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{ChunkDescription, SequenceDescription};
    use crate::deserializer::InMemoryDeserializer;
    use std::io;
    use std::sync::mpsc;
    use std::time::Duration;

    fn in_memory(chunks: usize) -> Arc<InMemoryDeserializer> {
        let counts: Vec<Vec<usize>> = (0..chunks).map(|_| vec![1, 2]).collect();
        let slices: Vec<&[usize]> = counts.iter().map(Vec::as_slice).collect();
        Arc::new(InMemoryDeserializer::from_sample_counts(&slices))
    }

    /// Fails `get_chunk` for the listed ids.
    struct FailingDeserializer {
        inner: Arc<InMemoryDeserializer>,
        failing: HashSet<ChunkId>,
    }

    impl Deserializer for FailingDeserializer {
        fn chunk_descriptions(&self) -> Vec<ChunkDescription> {
            self.inner.chunk_descriptions()
        }

        fn sequences_for_chunk(&self, chunk_id: ChunkId) -> Result<Vec<SequenceDescription>> {
            self.inner.sequences_for_chunk(chunk_id)
        }

        fn get_chunk(&self, chunk_id: ChunkId) -> Result<ChunkHandle> {
            if self.failing.contains(&chunk_id) {
                return Err(io::Error::other("disk read failed").into());
            }
            self.inner.get_chunk(chunk_id)
        }
    }

    /// Panics inside `get_chunk` for one id.
    struct PanickingDeserializer {
        inner: Arc<InMemoryDeserializer>,
        panicking: ChunkId,
    }

    impl Deserializer for PanickingDeserializer {
        fn chunk_descriptions(&self) -> Vec<ChunkDescription> {
            self.inner.chunk_descriptions()
        }

        fn sequences_for_chunk(&self, chunk_id: ChunkId) -> Result<Vec<SequenceDescription>> {
            self.inner.sequences_for_chunk(chunk_id)
        }

        fn get_chunk(&self, chunk_id: ChunkId) -> Result<ChunkHandle> {
            if chunk_id == self.panicking {
                panic!("chunk index overflow");
            }
            self.inner.get_chunk(chunk_id)
        }
    }

    fn failure(result: Result<ChunkHandle>) -> ReaderError {
        match result {
            Err(err) => err,
            Ok(chunk) => panic!("chunk {} loaded but should have failed", chunk.chunk_id()),
        }
    }

    /// Blocks `get_chunk` until the test releases it.
    struct GatedDeserializer {
        inner: Arc<InMemoryDeserializer>,
        entered: Mutex<mpsc::Sender<ChunkId>>,
        gate: Mutex<mpsc::Receiver<()>>,
    }

    impl Deserializer for GatedDeserializer {
        fn chunk_descriptions(&self) -> Vec<ChunkDescription> {
            self.inner.chunk_descriptions()
        }

        fn sequences_for_chunk(&self, chunk_id: ChunkId) -> Result<Vec<SequenceDescription>> {
            self.inner.sequences_for_chunk(chunk_id)
        }

        fn get_chunk(&self, chunk_id: ChunkId) -> Result<ChunkHandle> {
            self.entered.lock().unwrap().send(chunk_id).unwrap();
            self.gate.lock().unwrap().recv().unwrap();
            self.inner.get_chunk(chunk_id)
        }
    }

    #[test]
    fn unknown_id_is_not_prefetched() {
        let prefetcher = ChunkPrefetcher::new(in_memory(2));
        prefetcher.start().unwrap();
        assert!(matches!(
            prefetcher.get_prefetched(1),
            Err(ReaderError::NotPrefetched { chunk_id: 1 })
        ));
    }

    #[test]
    fn consumer_waits_for_its_own_chunk() {
        let prefetcher = ChunkPrefetcher::new(in_memory(10));
        prefetcher.start().unwrap();
        prefetcher.prefetch([9, 7]);
        let chunk = prefetcher.get_prefetched(7).unwrap();
        assert_eq!(chunk.chunk_id(), 7);
        let other = prefetcher.get_prefetched(9).unwrap();
        assert_eq!(other.chunk_id(), 9);
        assert_eq!(prefetcher.cached_len(), 0);
        assert_eq!(prefetcher.fetched_count(), 2);
    }

    #[test]
    fn second_take_without_requeue_fails() {
        let prefetcher = ChunkPrefetcher::new(in_memory(3));
        prefetcher.start().unwrap();
        prefetcher.prefetch([2, 2, 2]);
        prefetcher.get_prefetched(2).unwrap();
        assert!(matches!(
            prefetcher.get_prefetched(2),
            Err(ReaderError::NotPrefetched { chunk_id: 2 })
        ));
        prefetcher.prefetch([2]);
        assert_eq!(prefetcher.get_prefetched(2).unwrap().chunk_id(), 2);
    }

    #[test]
    fn failure_is_rethrown_and_claim_released() {
        let deserializer = Arc::new(FailingDeserializer {
            inner: in_memory(6),
            failing: HashSet::from([4]),
        });
        let prefetcher = ChunkPrefetcher::new(deserializer);
        prefetcher.start().unwrap();
        prefetcher.prefetch([4]);
        assert_eq!(failure(prefetcher.get_prefetched(4)).failed_chunk(), Some(4));
        assert!(matches!(
            prefetcher.get_prefetched(4),
            Err(ReaderError::NotPrefetched { .. })
        ));

        // The worker keeps serving after a failure.
        prefetcher.prefetch([5]);
        assert_eq!(prefetcher.get_prefetched(5).unwrap().chunk_id(), 5);
        assert_eq!(prefetcher.error_count(), 1);
    }

    #[test]
    fn stop_wakes_waiting_consumer() {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (gate_tx, gate_rx) = mpsc::channel();
        let deserializer = Arc::new(GatedDeserializer {
            inner: in_memory(2),
            entered: Mutex::new(entered_tx),
            gate: Mutex::new(gate_rx),
        });
        let prefetcher = Arc::new(ChunkPrefetcher::new(deserializer));
        prefetcher.start().unwrap();
        prefetcher.prefetch([0]);
        assert_eq!(entered_rx.recv_timeout(Duration::from_secs(5)).unwrap(), 0);

        let consumer = {
            let prefetcher = Arc::clone(&prefetcher);
            thread::spawn(move || prefetcher.get_prefetched(0))
        };
        let stopper = {
            let prefetcher = Arc::clone(&prefetcher);
            thread::spawn(move || prefetcher.stop())
        };
        assert!(matches!(
            consumer.join().unwrap(),
            Err(ReaderError::PrefetcherStopped)
        ));

        // Let the in-flight materialization finish so the worker can exit.
        gate_tx.send(()).unwrap();
        stopper.join().unwrap();
        assert!(!prefetcher.is_running());
    }

    #[test]
    fn clear_discards_in_flight_chunk() {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (gate_tx, gate_rx) = mpsc::channel();
        let deserializer = Arc::new(GatedDeserializer {
            inner: in_memory(3),
            entered: Mutex::new(entered_tx),
            gate: Mutex::new(gate_rx),
        });
        let prefetcher = ChunkPrefetcher::new(deserializer);
        prefetcher.start().unwrap();
        prefetcher.prefetch([0, 1]);
        assert_eq!(entered_rx.recv_timeout(Duration::from_secs(5)).unwrap(), 0);

        prefetcher.clear();
        assert_eq!(prefetcher.pending_len(), 0);
        gate_tx.send(()).unwrap();

        prefetcher.prefetch([2]);
        assert_eq!(entered_rx.recv_timeout(Duration::from_secs(5)).unwrap(), 2);
        gate_tx.send(()).unwrap();
        assert_eq!(prefetcher.get_prefetched(2).unwrap().chunk_id(), 2);
        assert_eq!(prefetcher.cached_len(), 0);
        assert!(matches!(
            prefetcher.get_prefetched(0),
            Err(ReaderError::NotPrefetched { .. })
        ));
    }

    #[test]
    fn restart_after_stop() {
        let prefetcher = ChunkPrefetcher::new(in_memory(2));
        prefetcher.start().unwrap();
        prefetcher.stop();
        prefetcher.stop();
        prefetcher.start().unwrap();
        assert!(prefetcher.is_running());
        prefetcher.prefetch([1]);
        assert_eq!(prefetcher.get_prefetched(1).unwrap().chunk_id(), 1);
    }

    #[test]
    fn each_failed_chunk_reports_its_own_failure() {
        let deserializer = Arc::new(FailingDeserializer {
            inner: in_memory(8),
            failing: HashSet::from([4, 5]),
        });
        let prefetcher = ChunkPrefetcher::new(deserializer);
        prefetcher.start().unwrap();
        prefetcher.prefetch([4, 5, 6]);

        // The worker runs in queue order, so both failures are recorded once 6 lands.
        assert_eq!(prefetcher.get_prefetched(6).unwrap().chunk_id(), 6);
        assert_eq!(prefetcher.failed_len(), 2);
        for chunk_id in [5, 4] {
            match failure(prefetcher.get_prefetched(chunk_id)) {
                ReaderError::DeserializerFailed { chunk_id: failed, source } => {
                    assert_eq!(failed, chunk_id);
                    assert!(matches!(*source, ReaderError::Io(_)));
                }
                other => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(prefetcher.failed_len(), 0);
        assert_eq!(prefetcher.error_count(), 2);
    }

    #[test]
    fn consumers_of_two_failed_chunks_both_wake() {
        let deserializer = Arc::new(FailingDeserializer {
            inner: in_memory(8),
            failing: HashSet::from([2, 3]),
        });
        let prefetcher = Arc::new(ChunkPrefetcher::new(deserializer));
        prefetcher.start().unwrap();
        prefetcher.prefetch([2, 3]);
        let consumers: Vec<_> = [2, 3]
            .into_iter()
            .map(|chunk_id| {
                let prefetcher = Arc::clone(&prefetcher);
                thread::spawn(move || failure(prefetcher.get_prefetched(chunk_id)).failed_chunk())
            })
            .collect();
        let mut failed: Vec<_> = consumers
            .into_iter()
            .map(|consumer| consumer.join().unwrap())
            .collect();
        failed.sort_unstable();
        assert_eq!(failed, vec![Some(2), Some(3)]);
    }

    #[test]
    fn panic_is_pinned_on_its_chunk() {
        let deserializer = Arc::new(PanickingDeserializer {
            inner: in_memory(4),
            panicking: 1,
        });
        let prefetcher = ChunkPrefetcher::new(deserializer);
        prefetcher.start().unwrap();
        prefetcher.prefetch([1, 2]);
        assert_eq!(prefetcher.get_prefetched(2).unwrap().chunk_id(), 2);
        match failure(prefetcher.get_prefetched(1)) {
            ReaderError::DeserializerFailed { chunk_id: 1, source } => {
                assert!(matches!(*source, ReaderError::WorkerPanicked { .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(prefetcher.is_running());
        prefetcher.prefetch([3]);
        assert_eq!(prefetcher.get_prefetched(3).unwrap().chunk_id(), 3);
    }

    #[test]
    fn clear_drops_unconsumed_failures() {
        let deserializer = Arc::new(FailingDeserializer {
            inner: in_memory(4),
            failing: HashSet::from([0]),
        });
        let prefetcher = ChunkPrefetcher::new(deserializer);
        prefetcher.start().unwrap();
        prefetcher.prefetch([0, 1]);
        prefetcher.get_prefetched(1).unwrap();
        assert_eq!(prefetcher.failed_len(), 1);
        prefetcher.clear();
        assert_eq!(prefetcher.failed_len(), 0);
        assert!(matches!(
            prefetcher.get_prefetched(0),
            Err(ReaderError::NotPrefetched { chunk_id: 0 })
        ));
    }
}
