// rust/batcher-core/src/store.rs

//! Shard stores: where loader workers get shard field arrays from.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::array::{decode_npy, Array};
use crate::error::{BatcherError, Result};
use crate::storage::StorageBackend;

/// Loads one field array of a shard.
///
/// Called concurrently from every loader thread.
pub trait ShardStore: Send + Sync {
    /// Loads the array stored at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the array cannot be read or decoded.
    fn load(&self, path: &Path) -> Result<Array>;
}

/// Reads `.npy` files through a storage backend.
pub struct NpyShardStore {
    storage: Arc<dyn StorageBackend>,
}

impl NpyShardStore {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }
}

impl ShardStore for NpyShardStore {
    fn load(&self, path: &Path) -> Result<Array> {
        let mut reader = self.storage.open_read(path)?;
        let bytes = reader.read_all()?;
        let array = decode_npy(&bytes).map_err(|e| match e {
            BatcherError::Array { message } => {
                BatcherError::array(format!("'{}': {}", path.display(), message))
            }
            other => other,
        })?;
        debug!(path = %path.display(), shape = ?array.shape(), "Loaded npy shard field");
        Ok(array)
    }
}

/// Keeps arrays in memory, keyed by path.
///
/// Useful for synthetic data and tests. Counts loads so callers can observe
/// how often shards are fetched.
#[derive(Default)]
pub struct MemoryShardStore {
    arrays: RwLock<HashMap<PathBuf, Array>>,
    loads: AtomicUsize,
}

impl MemoryShardStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, path: impl Into<PathBuf>, array: Array) {
        let mut arrays = self.arrays.write().unwrap_or_else(|e| e.into_inner());
        arrays.insert(path.into(), array);
    }

    /// Total number of successful loads served.
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::Relaxed)
    }
}

impl ShardStore for MemoryShardStore {
    fn load(&self, path: &Path) -> Result<Array> {
        let arrays = self.arrays.read().unwrap_or_else(|e| e.into_inner());
        let array = arrays
            .get(path)
            .cloned()
            .ok_or_else(|| BatcherError::storage(path, "no such shard array"))?;
        self.loads.fetch_add(1, Ordering::Relaxed);
        Ok(array)
    }
}
