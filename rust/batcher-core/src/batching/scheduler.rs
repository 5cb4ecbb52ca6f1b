// rust/batcher-core/src/batching/scheduler.rs

//! The stream scheduler: delivers batches in index order, one epoch at a
//! time, while the loader pool works ahead.
//!
//! The scheduler keeps `min(loader_threads, num_batches)` batches in flight.
//! Every delivered batch releases one slot, which is immediately refilled
//! with the next prefetch index (wrapping into the following epoch).
//! Completions that arrive ahead of the cursor wait in a reorder buffer.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, trace};

use super::events::{BatchParts, BatchTransform, BatcherState, LifecycleObserver, ProgressLogger};
use super::index_map::BatchIndexMap;
use super::pool::{DispatchPolicy, LoaderPool};
use super::worker::{Completion, SamplingPlan, WorkerContext};
use crate::array::Array;
use crate::config::LoaderConfig;
use crate::error::{BatcherError, Result};
use crate::manifest::ShardManifest;
use crate::store::ShardStore;

/// One delivered batch.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub index: usize,
    pub epoch: usize,
    /// One array per manifest field.
    pub parts: BatchParts,
}

impl Batch {
    pub fn field(&self, idx: usize) -> Option<&Array> {
        self.parts.get(idx)
    }

    pub fn rows(&self) -> usize {
        self.parts.first().map_or(0, Array::rows)
    }
}

/// Streams fixed-size batches over a sharded dataset.
///
/// `next_batch` returns `Ok(None)` once per epoch; the following call starts
/// the next epoch. After any error the batcher stops its workers and every
/// later call returns [`BatcherError::Halted`].
pub struct StreamBatcher {
    pool: LoaderPool,
    index_map: Arc<BatchIndexMap>,
    observers: Vec<Box<dyn LifecycleObserver>>,
    reorder: BTreeMap<usize, BatchParts>,
    batch_idx: usize,
    prefetch_batch_idx: usize,
    current_epoch: usize,
    current_iter: usize,
    in_flight: usize,
    in_flight_cap: usize,
    poll_interval: Duration,
    started: Instant,
    epoch_started: Option<Instant>,
    halted: bool,
}

impl StreamBatcher {
    pub fn builder() -> StreamBatcherBuilder {
        StreamBatcherBuilder::new()
    }

    /// Returns the next batch of the current epoch, or `Ok(None)` at the end
    /// of the epoch.
    ///
    /// # Errors
    ///
    /// Returns the first load, shape or transform error raised by a worker,
    /// a [`BatcherError::Worker`] error if a loader thread dies, and
    /// [`BatcherError::Halted`] on every call after an error.
    pub fn next_batch(&mut self) -> Result<Option<Batch>> {
        if self.halted {
            return Err(BatcherError::Halted);
        }
        let result = self.advance();
        if let Err(e) = &result {
            error!(
                epoch = self.current_epoch,
                batch_idx = self.batch_idx,
                error = %e,
                "Stream batcher halted"
            );
            self.halted = true;
            self.pool.shutdown();
        }
        result
    }

    /// Iterates over the rest of the current epoch.
    ///
    /// Called at an epoch boundary this yields exactly one full epoch.
    pub fn epoch(&mut self) -> Epoch<'_> {
        Epoch {
            batcher: self,
            done: false,
        }
    }

    pub fn num_batches(&self) -> usize {
        self.index_map.num_batches()
    }

    pub fn batch_size(&self) -> usize {
        self.index_map.batch_size()
    }

    pub fn index_map(&self) -> &BatchIndexMap {
        &self.index_map
    }

    /// Epochs completed so far.
    pub fn current_epoch(&self) -> usize {
        self.current_epoch
    }

    /// Index of the next batch to deliver.
    pub fn batch_idx(&self) -> usize {
        self.batch_idx
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    fn advance(&mut self) -> Result<Option<Batch>> {
        let num_batches = self.index_map.num_batches();

        if self.batch_idx == num_batches {
            let state = self.snapshot(num_batches);
            for observer in &mut self.observers {
                observer.on_end_of_epoch(&state);
            }
            info!(epoch = self.current_epoch, num_batches, "Epoch complete");
            self.batch_idx = 0;
            self.current_epoch += 1;
            self.epoch_started = None;
            return Ok(None);
        }

        if self.batch_idx == 0 {
            self.epoch_started = Some(Instant::now());
            self.prime()?;
        }

        let index = self.batch_idx;
        let parts = self.next_in_order()?;

        let state = self.snapshot(index);
        for observer in &mut self.observers {
            if index == 0 {
                observer.on_start_of_epoch(&state);
            } else {
                observer.on_end_of_iteration(&state);
            }
        }
        self.current_iter += 1;
        self.batch_idx += 1;
        self.enqueue_next()?;

        Ok(Some(Batch {
            index,
            epoch: self.current_epoch,
            parts,
        }))
    }

    /// Fills the pipeline up to the in-flight cap.
    fn prime(&mut self) -> Result<()> {
        while self.in_flight < self.in_flight_cap {
            self.enqueue_next()?;
        }
        debug!(in_flight = self.in_flight, epoch = self.current_epoch, "Primed loader pool");
        Ok(())
    }

    fn enqueue_next(&mut self) -> Result<()> {
        let num_batches = self.index_map.num_batches();
        if num_batches == 0 || self.in_flight >= self.in_flight_cap {
            return Ok(());
        }
        self.pool.dispatch(self.prefetch_batch_idx)?;
        self.prefetch_batch_idx = (self.prefetch_batch_idx + 1) % num_batches;
        self.in_flight += 1;
        Ok(())
    }

    /// Returns the parts for the cursor, stashing completions that arrive
    /// early.
    fn next_in_order(&mut self) -> Result<BatchParts> {
        let cursor = self.batch_idx;
        loop {
            if let Some(parts) = self.reorder.remove(&cursor) {
                self.in_flight -= 1;
                return Ok(parts);
            }

            let Completion {
                index,
                worker_id,
                result,
            } = self.receive()?;
            let parts = result?;
            trace!(index, worker_id, cursor, "Received batch");

            if self.reorder.insert(index, parts).is_some() {
                return Err(BatcherError::worker(
                    worker_id,
                    format!("batch {index} was delivered twice"),
                ));
            }
            if self.reorder.len() > self.in_flight_cap {
                return Err(BatcherError::worker(
                    worker_id,
                    format!(
                        "{} batches buffered out of order, at most {} can be in flight",
                        self.reorder.len(),
                        self.in_flight_cap
                    ),
                ));
            }
        }
    }

    /// Blocks for the next completion, checking that the workers are still
    /// alive every poll interval.
    fn receive(&mut self) -> Result<Completion> {
        loop {
            if let Some(completion) = self.pool.recv_timeout(self.poll_interval)? {
                return Ok(completion);
            }
            if let Some(worker_id) = self.pool.finished_worker() {
                // A worker that failed publishes its error before exiting.
                if let Some(completion) = self.pool.try_recv() {
                    return Ok(completion);
                }
                return Err(BatcherError::worker(
                    worker_id,
                    "loader thread exited without reporting an error",
                ));
            }
            trace!(cursor = self.batch_idx, "Waiting for loader pool");
        }
    }

    fn snapshot(&self, batch_idx: usize) -> BatcherState {
        BatcherState {
            batch_idx,
            epoch: self.current_epoch,
            iteration: self.current_iter,
            num_batches: self.index_map.num_batches(),
            batch_size: self.index_map.batch_size(),
            elapsed: self.started.elapsed(),
            epoch_elapsed: self
                .epoch_started
                .map(|t| t.elapsed())
                .unwrap_or_default(),
        }
    }
}

impl Iterator for StreamBatcher {
    type Item = Result<Batch>;

    /// `None` marks the end of an epoch; calling again starts the next one.
    fn next(&mut self) -> Option<Self::Item> {
        self.next_batch().transpose()
    }
}

/// The remaining batches of one epoch. See [`StreamBatcher::epoch`].
pub struct Epoch<'a> {
    batcher: &'a mut StreamBatcher,
    done: bool,
}

impl Iterator for Epoch<'_> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.batcher.next_batch() {
            Ok(Some(batch)) => Some(Ok(batch)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Builder for [`StreamBatcher`].
pub struct StreamBatcherBuilder {
    manifest: Option<ShardManifest>,
    store: Option<Arc<dyn ShardStore>>,
    config: LoaderConfig,
    transforms: Vec<Box<dyn BatchTransform>>,
    observers: Vec<Box<dyn LifecycleObserver>>,
}

impl StreamBatcherBuilder {
    /// Creates a builder with default loader settings.
    pub fn new() -> Self {
        Self {
            manifest: None,
            store: None,
            config: LoaderConfig::default(),
            transforms: Vec::new(),
            observers: Vec::new(),
        }
    }

    pub fn manifest(mut self, manifest: ShardManifest) -> Self {
        self.manifest = Some(manifest);
        self
    }

    pub fn store(mut self, store: Arc<dyn ShardStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Replaces all loader settings at once.
    pub fn loader_config(mut self, config: LoaderConfig) -> Self {
        self.config = config;
        self
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.config.batch_size = size;
        self
    }

    pub fn loader_threads(mut self, n: usize) -> Self {
        self.config.loader_threads = n;
        self
    }

    /// Enables weighted random shard sampling. Requires a seed.
    pub fn randomize(mut self, enable: bool) -> Self {
        self.config.randomize = enable;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.config.seed = Some(seed);
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn publish_timeout(mut self, timeout: Duration) -> Self {
        self.config.publish_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Logs progress every `every` batches.
    pub fn log_every(mut self, every: usize) -> Self {
        self.config.log_every = every;
        self
    }

    /// Appends a transform; transforms run in the order they are added.
    pub fn transform(mut self, transform: impl BatchTransform + 'static) -> Self {
        self.transforms.push(Box::new(transform));
        self
    }

    pub fn observer(mut self, observer: impl LifecycleObserver + 'static) -> Self {
        self.observers.push(Box::new(observer));
        self
    }

    /// Validates the configuration, builds the batch index map and starts
    /// the loader threads.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for invalid loader settings, a missing
    /// manifest or store, a batch layout the shards cannot satisfy, or a
    /// randomized loader with no shard of positive sampling weight.
    pub fn build(self) -> Result<StreamBatcher> {
        let manifest = self
            .manifest
            .ok_or_else(|| BatcherError::config("shard manifest is required"))?;
        let store = self
            .store
            .ok_or_else(|| BatcherError::config("shard store is required"))?;
        let config = self.config;
        config.validate()?;

        let index_map = BatchIndexMap::from_manifest(&manifest, config.batch_size)?;
        let num_batches = index_map.num_batches();

        let sampling = match (config.randomize, config.seed) {
            (true, Some(seed)) if num_batches > 0 => {
                Some(SamplingPlan::new(seed, index_map.weights())?)
            }
            _ => None,
        };
        let policy = if config.randomize {
            DispatchPolicy::Routed
        } else {
            DispatchPolicy::Shared
        };

        let index_map = Arc::new(index_map);
        let context = Arc::new(WorkerContext {
            manifest: Arc::new(manifest),
            index_map: Arc::clone(&index_map),
            store,
            transforms: self.transforms,
            sampling,
            poll_interval: config.poll_interval(),
            publish_timeout: config.publish_timeout(),
        });
        let pool = LoaderPool::spawn(context, config.loader_threads, policy)?;

        let mut observers = self.observers;
        if config.log_every > 0 {
            observers.push(Box::new(ProgressLogger::new(config.log_every)));
        }

        info!(
            num_batches,
            batch_size = config.batch_size,
            loader_threads = config.loader_threads,
            randomize = config.randomize,
            "Stream batcher ready"
        );

        Ok(StreamBatcher {
            pool,
            index_map,
            observers,
            reorder: BTreeMap::new(),
            batch_idx: 0,
            prefetch_batch_idx: 0,
            current_epoch: 0,
            current_iter: 0,
            in_flight: 0,
            in_flight_cap: config.loader_threads.min(num_batches),
            poll_interval: config.poll_interval(),
            started: Instant::now(),
            epoch_started: None,
            halted: false,
        })
    }
}

impl Default for StreamBatcherBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::ShardDescriptor;
    use crate::store::MemoryShardStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::thread;

    /// Single-field shards holding global row ids, plus a second field with
    /// two features per row.
    fn dataset(counts: &[usize]) -> (ShardManifest, Arc<MemoryShardStore>) {
        let store = Arc::new(MemoryShardStore::new());
        let mut shards = Vec::new();
        let mut offset = 0i64;
        for (idx, &rows) in counts.iter().enumerate() {
            let ids: Vec<i64> = (offset..offset + rows as i64).collect();
            let features: Vec<f32> = ids.iter().flat_map(|&id| [id as f32, -(id as f32)]).collect();
            let id_path = format!("train/ids_{idx:03}.npy");
            let x_path = format!("train/x_{idx:03}.npy");
            store.insert(id_path.clone(), Array::from_vec(vec![rows], ids).unwrap());
            store.insert(x_path.clone(), Array::from_vec(vec![rows, 2], features).unwrap());
            shards.push(ShardDescriptor::new([id_path, x_path], rows));
            offset += rows as i64;
        }
        (ShardManifest::new(shards).unwrap(), store)
    }

    fn builder(counts: &[usize], batch_size: usize, threads: usize) -> StreamBatcherBuilder {
        let (manifest, store) = dataset(counts);
        StreamBatcher::builder()
            .manifest(manifest)
            .store(store)
            .batch_size(batch_size)
            .loader_threads(threads)
            .poll_interval(Duration::from_millis(10))
            .publish_timeout(Duration::from_millis(10))
    }

    fn ids(batch: &Batch) -> Vec<i64> {
        batch.field(0).unwrap().to_vec::<i64>().unwrap()
    }

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        Start { epoch: usize, batch_idx: usize, iteration: usize },
        Iteration { epoch: usize, batch_idx: usize },
        End { epoch: usize, batch_idx: usize },
    }

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<Event>>>);

    impl Recorder {
        fn events(&self) -> Vec<Event> {
            self.0.lock().unwrap().clone()
        }
    }

    impl LifecycleObserver for Recorder {
        fn on_start_of_epoch(&mut self, state: &BatcherState) {
            self.0.lock().unwrap().push(Event::Start {
                epoch: state.epoch,
                batch_idx: state.batch_idx,
                iteration: state.iteration,
            });
        }

        fn on_end_of_iteration(&mut self, state: &BatcherState) {
            self.0.lock().unwrap().push(Event::Iteration {
                epoch: state.epoch,
                batch_idx: state.batch_idx,
            });
        }

        fn on_end_of_epoch(&mut self, state: &BatcherState) {
            self.0.lock().unwrap().push(Event::End {
                epoch: state.epoch,
                batch_idx: state.batch_idx,
            });
        }
    }

    #[test]
    fn test_ten_ten_by_four() {
        let mut batcher = builder(&[10, 10], 4, 2).build().unwrap();
        assert_eq!(batcher.num_batches(), 5);

        let batches: Vec<Batch> = batcher.epoch().collect::<Result<_>>().unwrap();
        let contents: Vec<Vec<i64>> = batches.iter().map(ids).collect();
        assert_eq!(
            contents,
            vec![
                vec![0, 1, 2, 3],
                vec![4, 5, 6, 7],
                vec![8, 9, 10, 11],
                vec![12, 13, 14, 15],
                vec![16, 17, 18, 19],
            ]
        );

        let split = &batches[2];
        let x = split.field(1).unwrap();
        assert_eq!(x.shape(), &[4, 2]);
        assert_eq!(
            x.to_vec::<f32>().unwrap(),
            vec![8.0, -8.0, 9.0, -9.0, 10.0, -10.0, 11.0, -11.0]
        );
        assert!(batches.iter().all(|b| b.epoch == 0 && b.rows() == 4));
    }

    #[test]
    fn test_order_holds_under_adversarial_completion() {
        // Early batches are the slowest to prepare.
        let delay_early = |parts: BatchParts| -> Result<BatchParts> {
            let first = parts[0].to_vec::<i64>()?[0];
            thread::sleep(Duration::from_millis((40 - first.min(40)) as u64));
            Ok(parts)
        };
        let mut batcher = builder(&[13, 9, 18], 2, 4)
            .transform(delay_early)
            .build()
            .unwrap();

        let indices: Vec<usize> = batcher.epoch().map(|b| b.unwrap().index).collect();
        assert_eq!(indices, (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn test_epoch_restart_is_identical() {
        let mut batcher = builder(&[7, 11], 3, 3).build().unwrap();

        let first: Vec<Batch> = (&mut batcher).collect::<Result<_>>().unwrap();
        assert_eq!(batcher.current_epoch(), 1);
        assert_eq!(batcher.batch_idx(), 0);

        let second: Vec<Batch> = (&mut batcher).collect::<Result<_>>().unwrap();
        assert_eq!(first.len(), 6);
        assert_eq!(
            first.iter().map(|b| b.index).collect::<Vec<_>>(),
            second.iter().map(|b| b.index).collect::<Vec<_>>()
        );
        assert_eq!(
            first.iter().map(|b| &b.parts).collect::<Vec<_>>(),
            second.iter().map(|b| &b.parts).collect::<Vec<_>>()
        );
        assert!(second.iter().all(|b| b.epoch == 1));
    }

    #[test]
    fn test_lifecycle_events() {
        let recorder = Recorder::default();
        let mut batcher = builder(&[10, 10], 4, 2)
            .observer(recorder.clone())
            .build()
            .unwrap();

        for _ in 0..2 {
            while batcher.next_batch().unwrap().is_some() {}
        }

        let mut expected = Vec::new();
        for epoch in 0..2 {
            expected.push(Event::Start {
                epoch,
                batch_idx: 0,
                iteration: epoch * 5,
            });
            for batch_idx in 1..5 {
                expected.push(Event::Iteration { epoch, batch_idx });
            }
            expected.push(Event::End { epoch, batch_idx: 5 });
        }
        assert_eq!(recorder.events(), expected);
    }

    #[test]
    fn test_batch_larger_than_dataset() {
        let recorder = Recorder::default();
        let mut batcher = builder(&[3, 2], 8, 2)
            .observer(recorder.clone())
            .build()
            .unwrap();

        assert_eq!(batcher.num_batches(), 0);
        assert!(batcher.next_batch().unwrap().is_none());
        assert!(batcher.next_batch().unwrap().is_none());
        assert_eq!(batcher.current_epoch(), 2);
        assert_eq!(
            recorder.events(),
            vec![
                Event::End { epoch: 0, batch_idx: 0 },
                Event::End { epoch: 1, batch_idx: 0 }
            ]
        );
    }

    #[test]
    fn test_single_shard_without_splits() {
        let mut batcher = builder(&[24], 6, 2).build().unwrap();
        assert!(batcher.index_map().spans().iter().all(|s| !s.is_split()));

        let batches: Vec<Batch> = batcher.epoch().collect::<Result<_>>().unwrap();
        assert_eq!(batches.len(), 4);
        for (k, batch) in batches.iter().enumerate() {
            let start = k as i64 * 6;
            assert_eq!(ids(batch), (start..start + 6).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_randomized_runs_are_reproducible() {
        let run = |seed: u64| -> Vec<Vec<i64>> {
            let mut batcher = builder(&[30, 20, 25], 5, 3)
                .randomize(true)
                .seed(seed)
                .build()
                .unwrap();
            let mut out = Vec::new();
            for _ in 0..2 {
                for batch in batcher.epoch() {
                    out.push(ids(&batch.unwrap()));
                }
            }
            out
        };

        let a = run(2345);
        let b = run(2345);
        assert_eq!(a.len(), 30);
        assert_eq!(a, b);
        assert_ne!(a, run(99));

        for window in &a {
            assert_eq!(window.len(), 5);
            let shard = |id: i64| match id {
                0..=29 => 0,
                30..=49 => 1,
                _ => 2,
            };
            assert!(window.iter().all(|&id| shard(id) == shard(window[0])));
        }
    }

    #[test]
    fn test_randomize_requires_seed() {
        let err = builder(&[10], 2, 1).randomize(true).build().err().unwrap();
        assert!(err.is_config());
    }

    #[test]
    fn test_randomized_fields_stay_row_aligned() {
        let mut batcher = builder(&[30, 20, 25], 5, 3)
            .randomize(true)
            .seed(17)
            .build()
            .unwrap();

        for _ in 0..2 {
            for batch in batcher.epoch() {
                let batch = batch.unwrap();
                let x = batch.field(1).unwrap();
                assert_eq!(x.shape(), &[5, 2]);
                let x = x.to_vec::<f32>().unwrap();
                for (row, &id) in ids(&batch).iter().enumerate() {
                    assert_eq!(x[row * 2], id as f32, "batch {}", batch.index);
                    assert_eq!(x[row * 2 + 1], -(id as f32), "batch {}", batch.index);
                }
            }
        }
    }

    #[test]
    fn test_batch_larger_than_a_shard_rejected() {
        let layouts: [&[usize]; 2] = [&[10, 2, 10], &[2, 30]];
        for counts in layouts {
            for randomize in [false, true] {
                let err = builder(counts, 4, 1)
                    .randomize(randomize)
                    .seed(1)
                    .build()
                    .err()
                    .unwrap();
                assert!(err.is_config(), "{counts:?}");
                assert!(err.to_string().contains("larger than shard"), "{err}");
            }
        }
    }

    #[test]
    fn test_randomize_needs_positive_weight() {
        let (manifest, store) = dataset(&[8, 8]);
        let shards = manifest
            .shards()
            .iter()
            .cloned()
            .map(|shard| shard.with_fraction(0.0))
            .collect();
        let err = StreamBatcher::builder()
            .manifest(ShardManifest::new(shards).unwrap())
            .store(store)
            .batch_size(4)
            .loader_threads(1)
            .randomize(true)
            .seed(1)
            .build()
            .err()
            .unwrap();
        assert!(err.is_config());
        assert!(err.to_string().contains("positive sampling weight"), "{err}");
    }

    #[test]
    fn test_prefetch_stays_within_loader_threads() {
        let threads = 3;
        let prepared = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&prepared);
        let count = move |parts: BatchParts| -> Result<BatchParts> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(parts)
        };
        let mut batcher = builder(&[40, 24], 4, threads)
            .transform(count)
            .build()
            .unwrap();

        let mut delivered = 0;
        let mut max_ahead = 0;
        for _ in 0..2 {
            for batch in batcher.epoch() {
                batch.unwrap();
                delivered += 1;
                // give the workers time to run as far ahead as they can
                thread::sleep(Duration::from_millis(10));
                let ahead = prepared.load(Ordering::SeqCst) - delivered;
                assert!(ahead <= threads, "{ahead} batches prepared ahead of the consumer");
                max_ahead = max_ahead.max(ahead);
            }
        }
        assert_eq!(delivered, 32);
        assert!(max_ahead >= 1);
    }

    #[test]
    fn test_invalid_construction() {
        assert!(builder(&[10], 0, 1).build().err().unwrap().is_config());
        assert!(builder(&[10], 2, 0).build().err().unwrap().is_config());
        assert!(builder(&[2, 1, 5], 4, 1).build().err().unwrap().is_config());
        assert!(StreamBatcher::builder().build().err().unwrap().is_config());
    }

    #[test]
    fn test_missing_shard_halts() {
        let (manifest, _) = dataset(&[8, 8]);
        let store = Arc::new(MemoryShardStore::new());
        let mut batcher = StreamBatcher::builder()
            .manifest(manifest)
            .store(store)
            .batch_size(4)
            .loader_threads(2)
            .poll_interval(Duration::from_millis(10))
            .publish_timeout(Duration::from_millis(10))
            .build()
            .unwrap();

        let err = batcher.next_batch().unwrap_err();
        assert!(matches!(err, BatcherError::Storage { .. }));
        assert!(batcher.is_halted());
        assert!(matches!(batcher.next_batch(), Err(BatcherError::Halted)));
    }

    #[test]
    fn test_shape_mismatch_is_fatal() {
        let (_, store) = dataset(&[8]);
        let manifest = ShardManifest::new(vec![ShardDescriptor::new(
            ["train/ids_000.npy", "train/x_000.npy"],
            12,
        )])
        .unwrap();
        let mut batcher = StreamBatcher::builder()
            .manifest(manifest)
            .store(store)
            .batch_size(4)
            .loader_threads(1)
            .poll_interval(Duration::from_millis(10))
            .build()
            .unwrap();

        let err = batcher.next_batch().unwrap_err();
        assert!(matches!(
            err,
            BatcherError::ShardShape { expected: 12, actual: 8, .. }
        ));
    }

    #[test]
    fn test_transform_error_is_fatal() {
        let reject = |_: BatchParts| -> Result<BatchParts> { Err(BatcherError::array("rejected")) };
        let mut batcher = builder(&[8], 4, 1).transform(reject).build().unwrap();
        let mut epoch = batcher.epoch();
        assert!(matches!(epoch.next(), Some(Err(BatcherError::Array { .. }))));
        assert!(epoch.next().is_none());
    }

    #[test]
    fn test_dead_worker_is_detected() {
        let explode = |_: BatchParts| -> Result<BatchParts> { panic!("transform panicked") };
        let mut batcher = builder(&[8], 4, 1).transform(explode).build().unwrap();
        let err = batcher.next_batch().unwrap_err();
        assert!(matches!(err, BatcherError::Worker { worker_id: 0, .. }));
    }

    #[test]
    fn test_drop_mid_epoch() {
        let mut batcher = builder(&[40], 2, 4).build().unwrap();
        assert!(batcher.next_batch().unwrap().is_some());
        drop(batcher);
    }

    #[test]
    fn test_progress_logging_enabled_by_config() {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("batcher_core=info"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
        let mut batcher = builder(&[12], 2, 2).log_every(2).build().unwrap();
        assert_eq!(batcher.epoch().count(), 6);
    }
}
