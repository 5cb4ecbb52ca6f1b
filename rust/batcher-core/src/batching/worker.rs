// rust/batcher-core/src/batching/worker.rs

//! Loader worker: turns batch indices into assembled batch parts.
//!
//! Each worker owns a private shard cache, so no locking is needed around
//! loads or evictions. Workers talk to the scheduler only through the work
//! and completion channels they are constructed with.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use rand::distr::weighted::WeightedIndex;
use rand::distr::Distribution;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tracing::{debug, error, info, trace, warn};

use super::events::{BatchParts, BatchTransform};
use super::index_map::{BatchIndexMap, ShardSpan};
use crate::array::Array;
use crate::config::WORKER_SEED_STRIDE;
use crate::error::{BatcherError, Result};
use crate::manifest::ShardManifest;
use crate::store::ShardStore;

/// Transform timings are reported once per this many batches.
const TIMING_REPORT_INTERVAL: usize = 100;

/// A finished (or failed) batch, tagged with the index it was requested as.
#[derive(Debug)]
pub struct Completion {
    pub index: usize,
    pub worker_id: usize,
    pub result: Result<BatchParts>,
}

/// Weighted shard sampling shared by all workers in randomized mode.
#[derive(Debug, Clone)]
pub struct SamplingPlan {
    pub seed: u64,
    pub weights: WeightedIndex<f64>,
}

impl SamplingPlan {
    /// # Errors
    ///
    /// Returns a configuration error if no shard has positive weight.
    pub fn new(seed: u64, weights: &[f64]) -> Result<Self> {
        let weights = WeightedIndex::new(weights.iter().copied()).map_err(|e| {
            BatcherError::config(format!(
                "randomized loading needs a shard with positive sampling weight: {e}"
            ))
        })?;
        Ok(Self { seed, weights })
    }

    /// Seed for worker `worker_id`.
    pub fn worker_seed(&self, worker_id: usize) -> u64 {
        self.seed
            .wrapping_add((worker_id as u64).wrapping_mul(WORKER_SEED_STRIDE))
    }
}

/// Everything workers share read-only.
pub struct WorkerContext {
    pub manifest: Arc<ShardManifest>,
    pub index_map: Arc<BatchIndexMap>,
    pub store: Arc<dyn ShardStore>,
    pub transforms: Vec<Box<dyn BatchTransform>>,
    /// `Some` in randomized mode.
    pub sampling: Option<SamplingPlan>,
    pub poll_interval: Duration,
    pub publish_timeout: Duration,
}

/// Shard index -> loaded field arrays.
#[derive(Default)]
struct ShardCache {
    shards: HashMap<usize, Vec<Array>>,
}

impl ShardCache {
    /// Loads every field of `shard` unless it is already cached, permuting
    /// rows with `shuffle` when given. All fields share one permutation.
    fn ensure_loaded(
        &mut self,
        worker_id: usize,
        shard: usize,
        context: &WorkerContext,
        shuffle: Option<&mut StdRng>,
    ) -> Result<()> {
        if self.shards.contains_key(&shard) {
            return Ok(());
        }

        let descriptor = context.manifest.shard(shard).ok_or_else(|| {
            BatcherError::config(format!("shard {shard} is not in the manifest"))
        })?;

        let started = Instant::now();
        let mut fields = Vec::with_capacity(descriptor.paths.len());
        for path in &descriptor.paths {
            let array = context.store.load(path)?;
            if array.rows() != descriptor.rows {
                return Err(BatcherError::shard_shape(path, descriptor.rows, array.rows()));
            }
            fields.push(array);
        }

        if let Some(rng) = shuffle {
            let mut permutation: Vec<usize> = (0..descriptor.rows).collect();
            permutation.shuffle(rng);
            fields = fields
                .iter()
                .map(|field| field.take_rows(&permutation))
                .collect::<Result<_>>()?;
        }

        debug!(
            worker_id,
            shard,
            rows = descriptor.rows,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Loaded shard"
        );
        self.shards.insert(shard, fields);
        Ok(())
    }

    fn fields(&self, shard: usize) -> Result<&[Array]> {
        self.shards
            .get(&shard)
            .map(Vec::as_slice)
            .ok_or_else(|| BatcherError::array(format!("shard {shard} is not loaded")))
    }

    /// Slices every field out of the cached shards named by `span`,
    /// concatenating the pieces of a split span.
    fn assemble(&self, span: &ShardSpan, num_fields: usize) -> Result<BatchParts> {
        let parts = span.parts();
        (0..num_fields)
            .map(|field| {
                let mut batch: Option<Array> = None;
                for part in &parts {
                    let piece = self.fields(part.shard)?[field].slice_rows(part.rows.clone())?;
                    batch = Some(match batch {
                        None => piece,
                        Some(head) => head.concat_rows(&piece)?,
                    });
                }
                batch.ok_or_else(|| BatcherError::array("batch span covers no shards"))
            })
            .collect()
    }

    /// Drops every shard not referenced by `span`.
    fn evict_except(&mut self, worker_id: usize, span: &ShardSpan) {
        self.shards.retain(|&shard, _| {
            let keep = span.references(shard);
            if !keep {
                debug!(worker_id, shard, "Evicted shard");
            }
            keep
        });
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.shards.len()
    }
}

/// Worker-private RNG and shard distribution.
struct ShardSampler {
    rng: StdRng,
    weights: WeightedIndex<f64>,
}

impl ShardSampler {
    /// Draws a shard by weight, then a uniform window of `batch_size` rows
    /// inside it. Loads (and shuffles) the shard if it is not cached.
    fn sample_span(
        &mut self,
        worker_id: usize,
        cache: &mut ShardCache,
        context: &WorkerContext,
    ) -> Result<ShardSpan> {
        let shard = self.weights.sample(&mut self.rng);
        cache.ensure_loaded(worker_id, shard, context, Some(&mut self.rng))?;

        let batch_size = context.index_map.batch_size();
        let rows = context.index_map.shard_rows(shard).unwrap_or(0);
        let last_start = rows.checked_sub(batch_size).ok_or_else(|| {
            BatcherError::config(format!(
                "shard {shard} has {rows} rows, fewer than batch_size {batch_size}"
            ))
        })?;
        let start = self.rng.random_range(0..=last_start);

        Ok(ShardSpan::Single {
            shard,
            rows: start..start + batch_size,
        })
    }
}

/// Accumulated time spent in each transform.
struct TransformTimings {
    totals: Vec<Duration>,
    batches: usize,
}

impl TransformTimings {
    fn new(transforms: usize) -> Self {
        Self {
            totals: vec![Duration::ZERO; transforms],
            batches: 0,
        }
    }

    fn finish_batch(&mut self, worker_id: usize, transforms: &[Box<dyn BatchTransform>]) {
        self.batches += 1;
        if self.batches % TIMING_REPORT_INTERVAL != 0 {
            return;
        }
        for (transform, total) in transforms.iter().zip(&mut self.totals) {
            debug!(
                worker_id,
                transform = transform.name(),
                batches = TIMING_REPORT_INTERVAL,
                avg_us = (total.as_micros() / TIMING_REPORT_INTERVAL as u128) as u64,
                "Transform timing"
            );
            *total = Duration::ZERO;
        }
    }
}

/// One loader thread's state.
pub struct LoaderWorker {
    id: usize,
    context: Arc<WorkerContext>,
    work: Receiver<usize>,
    completions: Sender<Completion>,
    stop: Arc<AtomicBool>,
    cache: ShardCache,
    sampler: Option<ShardSampler>,
    timings: TransformTimings,
}

impl LoaderWorker {
    pub fn new(
        id: usize,
        context: Arc<WorkerContext>,
        work: Receiver<usize>,
        completions: Sender<Completion>,
        stop: Arc<AtomicBool>,
    ) -> Self {
        let sampler = context.sampling.as_ref().map(|plan| ShardSampler {
            rng: StdRng::seed_from_u64(plan.worker_seed(id)),
            weights: plan.weights.clone(),
        });
        let timings = TransformTimings::new(context.transforms.len());
        Self {
            id,
            context,
            work,
            completions,
            stop,
            cache: ShardCache::default(),
            sampler,
            timings,
        }
    }

    /// Runs until the stop flag is set or the work channel closes. A failed
    /// batch is published as an error and ends the worker.
    pub fn run(mut self) {
        info!(worker_id = self.id, "Loader worker started");

        while !self.stop.load(Ordering::Relaxed) {
            let index = match self.work.recv_timeout(self.context.poll_interval) {
                Ok(index) => index,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };

            match self.prepare(index) {
                Ok((span, parts)) => {
                    if !self.publish(index, Ok(parts)) {
                        break;
                    }
                    self.cache.evict_except(self.id, &span);
                }
                Err(e) => {
                    error!(worker_id = self.id, index, error = %e, "Failed to prepare batch");
                    self.publish(index, Err(e));
                    break;
                }
            }
        }

        info!(worker_id = self.id, "Loader worker stopped");
    }

    /// Resolves, loads, assembles and transforms batch `index`.
    fn prepare(&mut self, index: usize) -> Result<(ShardSpan, BatchParts)> {
        let context = Arc::clone(&self.context);

        let span = match self.sampler.as_mut() {
            Some(sampler) => sampler.sample_span(self.id, &mut self.cache, &context)?,
            None => context.index_map.span(index).cloned().ok_or_else(|| {
                BatcherError::config(format!(
                    "batch index {} out of range for {} batches",
                    index,
                    context.index_map.num_batches()
                ))
            })?,
        };

        for part in span.parts() {
            self.cache.ensure_loaded(self.id, part.shard, &context, None)?;
        }
        let mut parts = self.cache.assemble(&span, context.manifest.num_fields())?;

        for (transform, total) in context.transforms.iter().zip(&mut self.timings.totals) {
            let started = Instant::now();
            parts = transform.transform(parts)?;
            *total += started.elapsed();
        }
        self.timings.finish_batch(self.id, &context.transforms);

        trace!(worker_id = self.id, index, ?span, "Prepared batch");
        Ok((span, parts))
    }

    /// Hands a completion to the scheduler, retrying on a full channel until
    /// it is accepted. Returns false if the worker should exit instead.
    fn publish(&self, index: usize, result: Result<BatchParts>) -> bool {
        let mut completion = Completion {
            index,
            worker_id: self.id,
            result,
        };
        loop {
            match self
                .completions
                .send_timeout(completion, self.context.publish_timeout)
            {
                Ok(()) => return true,
                Err(SendTimeoutError::Timeout(pending)) => {
                    if self.stop.load(Ordering::Relaxed) {
                        return false;
                    }
                    warn!(worker_id = self.id, index, "Completion channel full, retrying publish");
                    completion = pending;
                }
                Err(SendTimeoutError::Disconnected(_)) => return false,
            }
        }
    }
}
