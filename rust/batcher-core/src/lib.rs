// rust/batcher-core/src/lib.rs

//! Stream Batcher - Core Library
//!
//! Streams fixed-size minibatches out of sharded on-disk arrays, loading and
//! assembling them on a pool of worker threads while the training loop
//! consumes them in order.

pub mod config;
pub mod error;
pub mod storage;

// Re-export commonly used types for convenience
pub use config::BatcherConfig;
pub use error::{BatcherError, Result};
pub use storage::{LocalStorage, StorageBackend, StorageReader, StorageWriter};

pub mod array;
pub use array::{Array, DType, Element};

pub mod manifest;
pub use manifest::{ShardDescriptor, ShardManifest};

pub mod store;
pub use store::{MemoryShardStore, NpyShardStore, ShardStore};

pub mod batching;
pub use batching::{
    Batch, BatchIndexMap, BatchParts, BatchTransform, BatcherState, LifecycleObserver,
    ProgressLogger, ShardSpan, StreamBatcher, StreamBatcherBuilder,
};

pub mod runtime;
pub use runtime::Runtime;
