// rust/batcher-core/src/batching/mod.rs

//! Minibatch streaming over sharded array files.
//!
//! The dataset is the row-wise concatenation of the shards listed in a
//! [`ShardManifest`](crate::manifest::ShardManifest). A [`BatchIndexMap`]
//! resolves each batch index to one or two shard row ranges, a pool of
//! loader threads assembles batches ahead of time, and a [`StreamBatcher`]
//! hands them out in index order, one epoch at a time.
//!
//! # Example
//!
//! ```ignore
//! use batcher_core::batching::StreamBatcher;
//! use std::sync::Arc;
//!
//! let mut batcher = StreamBatcher::builder()
//!     .manifest(manifest)
//!     .store(Arc::new(store))
//!     .batch_size(128)
//!     .loader_threads(4)
//!     .build()?;
//!
//! loop {
//!     for batch in batcher.epoch() {
//!         let batch = batch?;
//!         // batch.parts holds one array per manifest field
//!     }
//! }
//! ```

mod events;
mod index_map;
mod pool;
mod scheduler;
mod worker;

pub use events::{BatchParts, BatchTransform, BatcherState, LifecycleObserver, ProgressLogger};
pub use index_map::{BatchIndexMap, RowRange, ShardSpan};
pub use pool::{DispatchPolicy, LoaderPool};
pub use scheduler::{Batch, Epoch, StreamBatcher, StreamBatcherBuilder};
pub use worker::{Completion, LoaderWorker, SamplingPlan, WorkerContext};
