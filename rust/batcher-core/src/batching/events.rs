// rust/batcher-core/src/batching/events.rs

//! Hooks into batch preparation and the consumer's epoch lifecycle.
//!
//! [`BatchTransform`]s run on loader threads, in subscription order, on every
//! assembled batch. [`LifecycleObserver`]s run on the consumer thread and see
//! a fresh [`BatcherState`] snapshot for every event.

use std::time::Duration;

use tracing::info;

use crate::array::Array;
use crate::error::Result;

/// One array per manifest field, each with `batch_size` rows.
pub type BatchParts = Vec<Array>;

/// Transforms assembled batch parts on the loader thread that produced them.
pub trait BatchTransform: Send + Sync {
    /// Name used in timing logs.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    fn transform(&self, parts: BatchParts) -> Result<BatchParts>;
}

impl<F> BatchTransform for F
where
    F: Fn(BatchParts) -> Result<BatchParts> + Send + Sync,
{
    fn transform(&self, parts: BatchParts) -> Result<BatchParts> {
        self(parts)
    }
}

/// Snapshot of the scheduler's cursor, built for each lifecycle event.
#[derive(Debug, Clone, PartialEq)]
pub struct BatcherState {
    /// Index of the batch just delivered; `num_batches` at the end of an
    /// epoch.
    pub batch_idx: usize,
    pub epoch: usize,
    /// Iterations completed before this event, counted across epochs.
    pub iteration: usize,
    pub num_batches: usize,
    pub batch_size: usize,
    /// Time since the batcher was built.
    pub elapsed: Duration,
    /// Time since the current epoch's first batch was requested.
    pub epoch_elapsed: Duration,
}

/// Callbacks fired by the scheduler on the consumer thread.
///
/// The first batch of an epoch fires `on_start_of_epoch`, every later batch
/// fires `on_end_of_iteration`, and the call that finds the epoch exhausted
/// fires `on_end_of_epoch`.
pub trait LifecycleObserver: Send {
    fn on_start_of_epoch(&mut self, _state: &BatcherState) {}

    fn on_end_of_iteration(&mut self, _state: &BatcherState) {}

    fn on_end_of_epoch(&mut self, _state: &BatcherState) {}
}

/// Logs progress, throughput and the remaining time of the current epoch.
#[derive(Debug, Clone)]
pub struct ProgressLogger {
    every: usize,
}

impl ProgressLogger {
    /// Logs every `every` batches; 0 disables per-batch lines and keeps only
    /// the end-of-epoch summary.
    pub fn new(every: usize) -> Self {
        Self { every }
    }

    fn eta(state: &BatcherState) -> Option<Duration> {
        let done = state.batch_idx + 1;
        if state.epoch_elapsed.is_zero() {
            return None;
        }
        let remaining = state.num_batches.saturating_sub(done) as u32;
        Some(state.epoch_elapsed / done as u32 * remaining)
    }
}

impl LifecycleObserver for ProgressLogger {
    fn on_start_of_epoch(&mut self, state: &BatcherState) {
        info!(
            epoch = state.epoch,
            num_batches = state.num_batches,
            batch_size = state.batch_size,
            "Epoch started"
        );
    }

    fn on_end_of_iteration(&mut self, state: &BatcherState) {
        if self.every == 0 || (state.batch_idx + 1) % self.every != 0 {
            return;
        }
        let secs = state.epoch_elapsed.as_secs_f64();
        let rate = if secs > 0.0 {
            (state.batch_idx + 1) as f64 / secs
        } else {
            0.0
        };
        info!(
            epoch = state.epoch,
            batch = state.batch_idx + 1,
            num_batches = state.num_batches,
            batches_per_sec = rate,
            eta = ?Self::eta(state),
            "Epoch progress"
        );
    }

    fn on_end_of_epoch(&mut self, state: &BatcherState) {
        info!(
            epoch = state.epoch,
            num_batches = state.num_batches,
            epoch_secs = state.epoch_elapsed.as_secs_f64(),
            total_secs = state.elapsed.as_secs_f64(),
            "Epoch finished"
        );
    }
}
