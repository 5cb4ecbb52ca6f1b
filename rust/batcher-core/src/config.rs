// rust/batcher-core/src/config.rs

//! Configuration for the stream batcher.
//!
//! Configuration is parsed from TOML, can be overridden from `SB_`-prefixed
//! environment variables, and is validated before a batcher is built.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{BatcherError, Result};

/// Seed stride between loader workers: worker `i` seeds its RNG with
/// `seed + i * WORKER_SEED_STRIDE`.
pub const WORKER_SEED_STRIDE: u64 = 83;

// Top-level batcher configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BatcherConfig {
    pub storage: StorageConfig,
    pub loader: LoaderConfig,
}

// Storage configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    // Directory shard paths in the manifest are resolved against.
    pub base_path: PathBuf,
    // Buffer size in bytes for buffered reads.
    pub buffer_size: usize,
    // Whether to memory-map shard files.
    pub use_mmap: bool,
    // File size threshold (bytes) above which to use mmap.
    pub mmap_threshold: u64,
}

/// Loader pool and scheduling options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Rows per batch.
    pub batch_size: usize,
    /// Number of loader worker threads; also the number of batches kept in
    /// flight.
    pub loader_threads: usize,
    /// Sample batches from weighted random shards instead of walking the
    /// batch index map.
    pub randomize: bool,
    /// Base RNG seed. Required when `randomize` is set.
    pub seed: Option<u64>,
    /// How long a worker waits on the work queue before re-checking the stop
    /// flag, in milliseconds.
    pub poll_interval_ms: u64,
    /// How long a single publish attempt waits on a full completion channel
    /// before retrying, in milliseconds.
    pub publish_timeout_ms: u64,
    /// Iterations between progress log lines; 0 disables progress logging.
    pub log_every: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("./data"),
            buffer_size: 64 * 1024, // 64 KB
            use_mmap: true,
            mmap_threshold: 1024 * 1024, // 1 MB
        }
    }
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            batch_size: 128,
            loader_threads: 4,
            randomize: false,
            seed: None,
            poll_interval_ms: 100,
            publish_timeout_ms: 1_000,
            log_every: 0,
        }
    }
}

impl LoaderConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    /// Validate loader options.
    ///
    /// # Errors
    ///
    /// Returns an error for zero sizes or a randomized loader without a seed.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(BatcherError::config("loader.batch_size must be greater than 0"));
        }
        if self.loader_threads == 0 {
            return Err(BatcherError::config(
                "loader.loader_threads must be greater than 0",
            ));
        }
        if self.randomize && self.seed.is_none() {
            return Err(BatcherError::config(
                "loader.seed is required when loader.randomize is enabled",
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(BatcherError::config(
                "loader.poll_interval_ms must be greater than 0",
            ));
        }
        if self.publish_timeout_ms == 0 {
            return Err(BatcherError::config(
                "loader.publish_timeout_ms must be greater than 0",
            ));
        }
        Ok(())
    }
}

impl FromStr for BatcherConfig {
    type Err = BatcherError;

    /// Parse configuration from a TOML string.
    fn from_str(s: &str) -> Result<Self> {
        toml::from_str(s)
            .map_err(|e| BatcherError::config_with_source("failed to parse TOML config", e))
    }
}

impl BatcherConfig {
    // Load configuration from a TOML file.
    //
    // # Errors
    //
    // Returns an error if the file cannot be read, parsed, or is invalid.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            BatcherError::storage_with_source(path, "failed to read config file", e)
        })?;
        let config: Self = content.parse()?;
        config.validate()?;
        Ok(config)
    }

    // Apply environment variable overrides.
    //
    // Variables are prefixed with `SB_` and name the section and field, e.g.
    // `SB_STORAGE_BASE_PATH` or `SB_LOADER_SEED`. Unparseable values are
    // ignored.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(val) = std::env::var("SB_STORAGE_BASE_PATH") {
            self.storage.base_path = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("SB_STORAGE_BUFFER_SIZE") {
            if let Ok(v) = val.parse() {
                self.storage.buffer_size = v;
            }
        }
        if let Ok(val) = std::env::var("SB_STORAGE_USE_MMAP") {
            if let Ok(v) = val.parse() {
                self.storage.use_mmap = v;
            }
        }
        if let Ok(val) = std::env::var("SB_STORAGE_MMAP_THRESHOLD") {
            if let Ok(v) = val.parse() {
                self.storage.mmap_threshold = v;
            }
        }

        if let Ok(val) = std::env::var("SB_LOADER_BATCH_SIZE") {
            if let Ok(v) = val.parse() {
                self.loader.batch_size = v;
            }
        }
        if let Ok(val) = std::env::var("SB_LOADER_THREADS") {
            if let Ok(v) = val.parse() {
                self.loader.loader_threads = v;
            }
        }
        if let Ok(val) = std::env::var("SB_LOADER_RANDOMIZE") {
            if let Ok(v) = val.parse() {
                self.loader.randomize = v;
            }
        }
        if let Ok(val) = std::env::var("SB_LOADER_SEED") {
            if let Ok(v) = val.parse() {
                self.loader.seed = Some(v);
            }
        }
        if let Ok(val) = std::env::var("SB_LOADER_POLL_INTERVAL_MS") {
            if let Ok(v) = val.parse() {
                self.loader.poll_interval_ms = v;
            }
        }
        if let Ok(val) = std::env::var("SB_LOADER_PUBLISH_TIMEOUT_MS") {
            if let Ok(v) = val.parse() {
                self.loader.publish_timeout_ms = v;
            }
        }
        if let Ok(val) = std::env::var("SB_LOADER_LOG_EVERY") {
            if let Ok(v) = val.parse() {
                self.loader.log_every = v;
            }
        }

        self
    }

    // Validate all configuration values.
    //
    // # Errors
    //
    // Returns an error if any configuration value is invalid.
    pub fn validate(&self) -> Result<()> {
        if self.storage.buffer_size == 0 {
            return Err(BatcherError::config(
                "storage.buffer_size must be greater than 0",
            ));
        }

        self.loader.validate()
    }
}

/// Held by every test that reads or writes `SB_` variables.
#[cfg(test)]
pub(crate) static ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = BatcherConfig::default();

        assert_eq!(config.storage.base_path, PathBuf::from("./data"));
        assert_eq!(config.storage.buffer_size, 64 * 1024);
        assert!(config.storage.use_mmap);
        assert_eq!(config.storage.mmap_threshold, 1024 * 1024);

        assert_eq!(config.loader.batch_size, 128);
        assert_eq!(config.loader.loader_threads, 4);
        assert!(!config.loader.randomize);
        assert!(config.loader.seed.is_none());
        assert_eq!(config.loader.poll_interval(), Duration::from_millis(100));
        assert_eq!(config.loader.publish_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn test_default_validates() {
        assert!(BatcherConfig::default().validate().is_ok());
    }

    #[test]
    fn test_from_str_empty() {
        let config: BatcherConfig = "".parse().unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_str_full() {
        let toml = r#"
            [storage]
            base_path = "/data/shards"
            buffer_size = 131072
            use_mmap = false
            mmap_threshold = 2097152

            [loader]
            batch_size = 32
            loader_threads = 8
            randomize = true
            seed = 42
            poll_interval_ms = 50
            publish_timeout_ms = 250
            log_every = 100
        "#;

        let config: BatcherConfig = toml.parse().unwrap();

        assert_eq!(config.storage.base_path, PathBuf::from("/data/shards"));
        assert_eq!(config.storage.buffer_size, 131072);
        assert!(!config.storage.use_mmap);
        assert_eq!(config.storage.mmap_threshold, 2097152);

        assert_eq!(config.loader.batch_size, 32);
        assert_eq!(config.loader.loader_threads, 8);
        assert!(config.loader.randomize);
        assert_eq!(config.loader.seed, Some(42));
        assert_eq!(config.loader.poll_interval_ms, 50);
        assert_eq!(config.loader.publish_timeout_ms, 250);
        assert_eq!(config.loader.log_every, 100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_str_partial_keeps_defaults() {
        let toml = r#"
            [loader]
            batch_size = 16
        "#;
        let config: BatcherConfig = toml.parse().unwrap();

        assert_eq!(config.loader.batch_size, 16);
        assert_eq!(config.loader.loader_threads, 4);
        assert_eq!(config.storage.buffer_size, 64 * 1024);
    }

    #[test]
    fn test_from_str_invalid_toml() {
        let result: std::result::Result<BatcherConfig, _> = "invalid = [".parse();
        assert!(result.is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [storage]
            base_path = "/tmp/shards"
            "#
        )
        .unwrap();

        let config = BatcherConfig::from_file(file.path()).unwrap();
        assert_eq!(config.storage.base_path, PathBuf::from("/tmp/shards"));
    }

    #[test]
    fn test_from_file_rejects_invalid() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [loader]
            randomize = true
            "#
        )
        .unwrap();

        let err = BatcherConfig::from_file(file.path()).unwrap_err();
        assert!(err.is_config());
        assert!(err.to_string().contains("seed"));
    }

    #[test]
    fn test_from_file_not_found() {
        assert!(BatcherConfig::from_file("/nonexistent/batcher.toml").is_err());
    }

    #[test]
    fn test_validate_zero_batch_size() {
        let mut config = BatcherConfig::default();
        config.loader.batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_zero_threads() {
        let mut config = BatcherConfig::default();
        config.loader.loader_threads = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_randomize_requires_seed() {
        let mut config = BatcherConfig::default();
        config.loader.randomize = true;
        assert!(config.validate().is_err());

        config.loader.seed = Some(7);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_zero_buffer_size() {
        let mut config = BatcherConfig::default();
        config.storage.buffer_size = 0;
        assert!(config.validate().is_err());
    }

    fn clear_sb_env_vars() {
        for (key, _) in std::env::vars() {
            if key.starts_with("SB_") {
                std::env::remove_var(&key);
            }
        }
    }

    // Environment variables are process-global, so all override cases live
    // in one test.
    #[test]
    fn test_env_overrides() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        clear_sb_env_vars();

        std::env::set_var("SB_STORAGE_BASE_PATH", "/env/shards");
        std::env::set_var("SB_LOADER_BATCH_SIZE", "64");
        std::env::set_var("SB_LOADER_THREADS", "2");
        std::env::set_var("SB_LOADER_RANDOMIZE", "true");
        std::env::set_var("SB_LOADER_SEED", "12345");

        let config = BatcherConfig::default().with_env_overrides();

        assert_eq!(config.storage.base_path, PathBuf::from("/env/shards"));
        assert_eq!(config.loader.batch_size, 64);
        assert_eq!(config.loader.loader_threads, 2);
        assert!(config.loader.randomize);
        assert_eq!(config.loader.seed, Some(12345));

        clear_sb_env_vars();

        std::env::set_var("SB_LOADER_BATCH_SIZE", "not_a_number");
        let config = BatcherConfig::default().with_env_overrides();
        assert_eq!(config.loader.batch_size, 128);

        clear_sb_env_vars();
    }

    #[test]
    fn test_serialize_roundtrip() {
        let mut original = BatcherConfig::default();
        original.loader.seed = Some(9);
        let toml_str = toml::to_string(&original).unwrap();
        let parsed: BatcherConfig = toml_str.parse().unwrap();

        assert_eq!(original.storage.base_path, parsed.storage.base_path);
        assert_eq!(original.loader.batch_size, parsed.loader.batch_size);
        assert_eq!(parsed.loader.seed, Some(9));
    }
}
