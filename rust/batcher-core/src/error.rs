// rust/batcher-core/src/error.rs

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BatcherError {

    #[error("Storage error at '{path}': {message}")]
    Storage {
        path: PathBuf,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Manifest error: {message}")]
    Manifest {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Array error: {message}")]
    Array {
        message: String,
    },

    #[error("Shard file '{path}' has {actual} rows, manifest declares {expected}")]
    ShardShape {
        path: PathBuf,
        expected: usize,
        actual: usize,
    },

    #[error("Loader worker {worker_id} failed: {message}")]
    Worker {
        worker_id: usize,
        message: String,
    },

    #[error("Batcher halted after an earlier fatal error")]
    Halted,
}

pub type Result<T> = std::result::Result<T, BatcherError>;

// Convenience constructors
impl BatcherError {

    pub fn storage(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Storage {
            path: path.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn storage_with_source(
        path: impl Into<PathBuf>,
        message: impl Into<String>,
        source: std::io::Error,
    ) -> Self {
        Self::Storage {
            path: path.into(),
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    pub fn config_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn manifest(message: impl Into<String>) -> Self {
        Self::Manifest {
            message: message.into(),
            source: None,
        }
    }

    pub fn manifest_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Manifest {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn array(message: impl Into<String>) -> Self {
        Self::Array {
            message: message.into(),
        }
    }

    pub fn shard_shape(path: impl Into<PathBuf>, expected: usize, actual: usize) -> Self {
        Self::ShardShape {
            path: path.into(),
            expected,
            actual,
        }
    }

    pub fn worker(worker_id: usize, message: impl Into<String>) -> Self {
        Self::Worker {
            worker_id,
            message: message.into(),
        }
    }

    /// Returns true for errors raised while validating construction inputs.
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config { .. } | Self::Manifest { .. })
    }
}
