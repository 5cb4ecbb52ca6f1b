// rust/batcher-core/src/manifest.rs

//! The shard manifest: which files make up the dataset, in order.
//!
//! A manifest is written once by preprocessing and read at startup:
//!
//! ```toml
//! [[shards]]
//! paths = ["train/x_000.npy", "train/y_000.npy"]
//! rows = 1000
//!
//! [[shards]]
//! paths = ["train/x_001.npy", "train/y_001.npy"]
//! rows = 812
//! ```
//!
//! Each shard stores one array file per field, and every shard has the same
//! fields in the same order. `fraction` optionally sets a shard's sampling
//! weight for randomized loading; it must be given for all shards or none.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{BatcherError, Result};

/// One shard: a file per field plus the shard's row count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardDescriptor {
    pub paths: Vec<PathBuf>,
    pub rows: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fraction: Option<f64>,
}

impl ShardDescriptor {
    pub fn new<P: Into<PathBuf>>(paths: impl IntoIterator<Item = P>, rows: usize) -> Self {
        Self {
            paths: paths.into_iter().map(Into::into).collect(),
            rows,
            fraction: None,
        }
    }

    #[must_use]
    pub fn with_fraction(mut self, fraction: f64) -> Self {
        self.fraction = Some(fraction);
        self
    }
}

/// Ordered list of shards. Immutable once loaded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShardManifest {
    #[serde(default)]
    shards: Vec<ShardDescriptor>,
}

impl FromStr for ShardManifest {
    type Err = BatcherError;

    fn from_str(s: &str) -> Result<Self> {
        let manifest: Self = toml::from_str(s)
            .map_err(|e| BatcherError::manifest_with_source("failed to parse shard manifest", e))?;
        manifest.validate()?;
        Ok(manifest)
    }
}

impl ShardManifest {
    /// Builds a manifest from descriptors.
    ///
    /// # Errors
    ///
    /// Returns an error if the descriptors are inconsistent, see [`validate`].
    ///
    /// [`validate`]: ShardManifest::validate
    pub fn new(shards: Vec<ShardDescriptor>) -> Result<Self> {
        let manifest = Self { shards };
        manifest.validate()?;
        Ok(manifest)
    }

    /// Loads a manifest from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            BatcherError::storage_with_source(path, "failed to read shard manifest", e)
        })?;
        content.parse()
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string(self)
            .map_err(|e| BatcherError::manifest_with_source("failed to serialize shard manifest", e))
    }

    /// Checks that every shard has at least one field, that all shards have
    /// the same number of fields, and that sampling fractions are either
    /// absent everywhere or present, finite and non-negative everywhere.
    pub fn validate(&self) -> Result<()> {
        let Some(first) = self.shards.first() else {
            return Ok(());
        };
        let fields = first.paths.len();
        let with_fraction = self.shards.iter().filter(|s| s.fraction.is_some()).count();

        if with_fraction != 0 && with_fraction != self.shards.len() {
            return Err(BatcherError::manifest(format!(
                "{} of {} shards declare a sampling fraction; declare it for all or none",
                with_fraction,
                self.shards.len()
            )));
        }

        for (idx, shard) in self.shards.iter().enumerate() {
            if shard.paths.is_empty() {
                return Err(BatcherError::manifest(format!("shard {idx} lists no field files")));
            }
            if shard.paths.len() != fields {
                return Err(BatcherError::manifest(format!(
                    "shard {} has {} fields, shard 0 has {}",
                    idx,
                    shard.paths.len(),
                    fields
                )));
            }
            if let Some(fraction) = shard.fraction {
                if !fraction.is_finite() || fraction < 0.0 {
                    return Err(BatcherError::manifest(format!(
                        "shard {idx} has invalid sampling fraction {fraction}"
                    )));
                }
            }
        }

        Ok(())
    }

    pub fn shards(&self) -> &[ShardDescriptor] {
        &self.shards
    }

    pub fn shard(&self, idx: usize) -> Option<&ShardDescriptor> {
        self.shards.get(idx)
    }

    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    /// Number of fields per shard; 0 for an empty manifest.
    pub fn num_fields(&self) -> usize {
        self.shards.first().map_or(0, |s| s.paths.len())
    }

    pub fn row_counts(&self) -> Vec<usize> {
        self.shards.iter().map(|s| s.rows).collect()
    }

    pub fn total_rows(&self) -> usize {
        self.shards.iter().map(|s| s.rows).sum()
    }

    /// Declared sampling fractions, if the manifest carries them.
    pub fn fractions(&self) -> Option<Vec<f64>> {
        self.shards.iter().map(|s| s.fraction).collect()
    }
}
