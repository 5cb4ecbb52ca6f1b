// rust/batcher-core/src/batching/pool.rs

//! The loader thread pool and its channels.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, info, warn};

use super::worker::{Completion, LoaderWorker, WorkerContext};
use crate::error::{BatcherError, Result};

/// How batch indices are handed to workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchPolicy {
    /// One queue; whichever worker is free takes the next index.
    Shared,
    /// One queue per worker; index `i` always goes to worker `i % threads`,
    /// so each worker sees the same index sequence on every run.
    Routed,
}

/// A set of named loader threads plus the work and completion channels.
///
/// Dropping the pool stops and joins every thread.
pub struct LoaderPool {
    policy: DispatchPolicy,
    work: Vec<Sender<usize>>,
    completions: Receiver<Completion>,
    stop: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl LoaderPool {
    /// Spawns `threads` workers named `batch-loader-{i}`.
    ///
    /// # Errors
    ///
    /// Returns an error if `threads` is zero or a thread cannot be spawned.
    pub fn spawn(
        context: Arc<WorkerContext>,
        threads: usize,
        policy: DispatchPolicy,
    ) -> Result<Self> {
        if threads == 0 {
            return Err(BatcherError::config("loader_threads must be greater than 0"));
        }

        let (completion_tx, completion_rx) = bounded(threads * 2);
        let stop = Arc::new(AtomicBool::new(false));

        let receivers: Vec<Receiver<usize>>;
        let work: Vec<Sender<usize>>;
        match policy {
            DispatchPolicy::Shared => {
                let (tx, rx) = unbounded();
                work = vec![tx];
                receivers = vec![rx; threads];
            }
            DispatchPolicy::Routed => {
                let (txs, rxs): (Vec<Sender<usize>>, Vec<Receiver<usize>>) =
                    (0..threads).map(|_| unbounded()).unzip();
                work = txs;
                receivers = rxs;
            }
        }

        let mut pool = Self {
            policy,
            work,
            completions: completion_rx,
            stop: stop.clone(),
            handles: Vec::with_capacity(threads),
        };

        for (id, rx) in receivers.into_iter().enumerate() {
            let worker = LoaderWorker::new(
                id,
                Arc::clone(&context),
                rx,
                completion_tx.clone(),
                stop.clone(),
            );
            let handle = thread::Builder::new()
                .name(format!("batch-loader-{id}"))
                .spawn(move || worker.run())
                .map_err(|e| BatcherError::worker(id, format!("failed to spawn thread: {e}")))?;
            pool.handles.push(handle);
        }

        info!(threads, ?policy, "Loader pool started");
        Ok(pool)
    }

    pub fn threads(&self) -> usize {
        self.handles.len()
    }

    /// Queues batch `index` for loading.
    pub fn dispatch(&self, index: usize) -> Result<()> {
        let slot = match self.policy {
            DispatchPolicy::Shared => 0,
            DispatchPolicy::Routed => index % self.work.len().max(1),
        };
        let sender = self
            .work
            .get(slot)
            .ok_or_else(|| BatcherError::worker(slot, "loader pool is shut down"))?;
        sender
            .send(index)
            .map_err(|_| BatcherError::worker(slot, "work queue closed"))?;
        debug!(index, slot, "Dispatched batch");
        Ok(())
    }

    /// Waits up to `timeout` for the next completion. `Ok(None)` on timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if every worker has exited.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<Completion>> {
        match self.completions.recv_timeout(timeout) {
            Ok(completion) => Ok(Some(completion)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(BatcherError::worker(
                0,
                "all loader threads have exited",
            )),
        }
    }

    /// A completion that is already waiting, if any.
    pub fn try_recv(&self) -> Option<Completion> {
        self.completions.try_recv().ok()
    }

    /// Id of a worker thread that has finished, if any. Workers only finish
    /// on shutdown, after a failed batch, or by panicking.
    pub fn finished_worker(&self) -> Option<usize> {
        self.handles.iter().position(|handle| handle.is_finished())
    }

    /// Stops all workers and waits for them to exit. Idempotent.
    pub fn shutdown(&mut self) {
        if self.handles.is_empty() {
            return;
        }
        self.stop.store(true, Ordering::Relaxed);
        self.work.clear();

        for (id, handle) in self.handles.drain(..).enumerate() {
            if handle.join().is_err() {
                warn!(worker_id = id, "Loader thread panicked");
            }
        }
        info!("Loader pool stopped");
    }
}

impl Drop for LoaderPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
