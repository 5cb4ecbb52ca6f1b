// rust/batcher-core/src/runtime.rs

//! Main runtime orchestration.
//!
//! `Runtime` ties configuration, storage and the shard store together and
//! builds stream batchers from manifest files.
//!
//! # Example
//!
//! ```no_run
//! use batcher_core::Runtime;
//!
//! let runtime = Runtime::from_config_file("batcher.toml").unwrap();
//! let mut batcher = runtime.stream_batcher("train/manifest.toml").unwrap();
//!
//! for epoch in 0..3 {
//!     for batch in batcher.epoch() {
//!         let batch = batch.unwrap();
//!         // feed batch.parts to the model
//!     }
//! }
//! ```

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use crate::array::{write_npy, Array};
use crate::batching::{StreamBatcher, StreamBatcherBuilder};
use crate::config::BatcherConfig;
use crate::error::{BatcherError, Result};
use crate::manifest::ShardManifest;
use crate::storage::{LocalStorage, StorageBackend};
use crate::store::{NpyShardStore, ShardStore};

/// Owns the storage backend and shard store shared by every batcher it
/// builds.
pub struct Runtime {
    config: BatcherConfig,
    storage: Arc<dyn StorageBackend>,
    store: Arc<dyn ShardStore>,
}

impl Runtime {
    /// Creates a runtime with default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage backend cannot be initialized.
    pub fn new() -> Result<Self> {
        Self::from_config(BatcherConfig::default())
    }

    /// Creates a runtime from a TOML configuration file, then applies
    /// environment overrides.
    pub fn from_config_file(path: impl AsRef<Path>) -> Result<Self> {
        let config = BatcherConfig::from_file(path)?.with_env_overrides();
        Self::from_config(config)
    }

    /// Creates a runtime from a configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the storage
    /// backend cannot be initialized.
    pub fn from_config(config: BatcherConfig) -> Result<Self> {
        config.validate()?;

        let storage: Arc<dyn StorageBackend> = Arc::new(LocalStorage::new(&config.storage)?);
        let store: Arc<dyn ShardStore> = Arc::new(NpyShardStore::new(storage.clone()));

        Ok(Self {
            config,
            storage,
            store,
        })
    }

    /// Reads a shard manifest through the storage backend.
    pub fn load_manifest(&self, path: impl AsRef<Path>) -> Result<ShardManifest> {
        let path = path.as_ref();
        let bytes = self.storage.open_read(path)?.read_all()?;
        let text = String::from_utf8(bytes)
            .map_err(|e| BatcherError::manifest_with_source("shard manifest is not UTF-8", e))?;
        text.parse()
    }

    /// Writes a shard manifest through the storage backend.
    pub fn write_manifest(&self, path: impl AsRef<Path>, manifest: &ShardManifest) -> Result<()> {
        let path = path.as_ref();
        let text = manifest.to_toml_string()?;
        let mut writer = self.storage.open_write(path)?;
        writer.write_all(text.as_bytes()).map_err(|e| {
            BatcherError::storage_with_source(path, "failed to write shard manifest", e)
        })?;
        writer.finish()
    }

    /// Writes one shard field as an `.npy` file.
    pub fn write_shard_field(&self, path: impl AsRef<Path>, array: &Array) -> Result<()> {
        write_npy(self.storage.as_ref(), path.as_ref(), array)
    }

    /// A batcher builder preloaded with the manifest at `manifest_path`, the
    /// runtime's shard store and the configured loader settings. Use it to
    /// add transforms and observers before building.
    pub fn stream_batcher_builder(
        &self,
        manifest_path: impl AsRef<Path>,
    ) -> Result<StreamBatcherBuilder> {
        let manifest = self.load_manifest(manifest_path)?;
        Ok(StreamBatcher::builder()
            .manifest(manifest)
            .store(self.store.clone())
            .loader_config(self.config.loader.clone()))
    }

    /// Builds and starts a batcher over the manifest at `manifest_path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the manifest cannot be read or the batcher cannot
    /// be built from it.
    pub fn stream_batcher(&self, manifest_path: impl AsRef<Path>) -> Result<StreamBatcher> {
        self.stream_batcher_builder(manifest_path)?.build()
    }

    /// Returns the current configuration.
    pub fn config(&self) -> &BatcherConfig {
        &self.config
    }

    /// Returns a reference to the storage backend.
    pub fn storage(&self) -> &Arc<dyn StorageBackend> {
        &self.storage
    }

    pub fn store(&self) -> &Arc<dyn ShardStore> {
        &self.store
    }
}
