// rust/batcher-core/src/storage/mod.rs

//! Storage abstraction for shard files.
//!
//! Shard stores read array files through [`StorageBackend`], so loaders work
//! against the local filesystem in production and against mocks in tests.
//!
//! # Example
//!
//! ```no_run
//! use batcher_core::config::StorageConfig;
//! use batcher_core::storage::{LocalStorage, StorageBackend};
//! use std::path::Path;
//!
//! let storage = LocalStorage::new(&StorageConfig::default()).unwrap();
//! let mut reader = storage.open_read(Path::new("train/x_000.npy")).unwrap();
//! let bytes = reader.read_all().unwrap();
//! ```

mod local;
mod traits;

pub use local::LocalStorage;
pub use traits::{StorageBackend, StorageReader, StorageWriter};
