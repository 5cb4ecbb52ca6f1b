// rust/batcher-core/src/batching/index_map.rs

//! Mapping from global batch indices to shard row ranges.
//!
//! The dataset is the concatenation of all shards in manifest order. Batch
//! `i` covers global rows `i*b .. (i+1)*b`; the map resolves that range to
//! either a slice of one shard or the tail of one shard followed by the head
//! of the next. Rows past the last full batch are never yielded.

use std::ops::Range;

use crate::error::{BatcherError, Result};
use crate::manifest::ShardManifest;

/// A row range inside one shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowRange {
    pub shard: usize,
    pub rows: Range<usize>,
}

/// Where the rows of one batch live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShardSpan {
    /// All rows come from a single shard.
    Single { shard: usize, rows: Range<usize> },
    /// `head` runs to the end of one shard, `tail` starts at the beginning of
    /// the next non-empty shard.
    Split { head: RowRange, tail: RowRange },
}

impl ShardSpan {
    /// The row ranges in delivery order.
    pub fn parts(&self) -> Vec<RowRange> {
        match self {
            ShardSpan::Single { shard, rows } => vec![RowRange {
                shard: *shard,
                rows: rows.clone(),
            }],
            ShardSpan::Split { head, tail } => vec![head.clone(), tail.clone()],
        }
    }

    /// Total number of rows covered.
    pub fn len(&self) -> usize {
        match self {
            ShardSpan::Single { rows, .. } => rows.len(),
            ShardSpan::Split { head, tail } => head.rows.len() + tail.rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn references(&self, shard: usize) -> bool {
        match self {
            ShardSpan::Single { shard: s, .. } => *s == shard,
            ShardSpan::Split { head, tail } => head.shard == shard || tail.shard == shard,
        }
    }

    pub fn is_split(&self) -> bool {
        matches!(self, ShardSpan::Split { .. })
    }
}

/// Batch index -> span, plus the reverse shard -> batches index and the
/// per-shard sampling weights used by randomized loading.
#[derive(Debug, Clone)]
pub struct BatchIndexMap {
    batch_size: usize,
    row_counts: Vec<usize>,
    spans: Vec<ShardSpan>,
    shard_batches: Vec<Vec<usize>>,
    weights: Vec<f64>,
}

impl BatchIndexMap {
    /// Builds the map for shards with the given row counts.
    ///
    /// Sampling weights default to each shard's fraction of the total rows.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `batch_size` is zero, if any
    /// non-empty shard holds fewer rows than a batch while the dataset has
    /// at least one batch, or if a batch would need rows past the last shard.
    pub fn build(row_counts: &[usize], batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(BatcherError::config("batch_size must be greater than 0"));
        }

        let total: usize = row_counts.iter().sum();
        let num_batches = total / batch_size;

        if num_batches > 0 {
            let smallest = row_counts
                .iter()
                .enumerate()
                .filter(|(_, rows)| **rows > 0)
                .min_by_key(|(_, rows)| **rows);
            if let Some((shard, &rows)) = smallest {
                if rows < batch_size {
                    return Err(BatcherError::config(format!(
                        "batch_size {batch_size} is larger than shard {shard} ({rows} rows)"
                    )));
                }
            }
        }

        // cumulative[i] = rows in shards 0..=i; offsets[i] = rows in shards 0..i
        let mut cumulative = Vec::with_capacity(row_counts.len());
        let mut offsets = Vec::with_capacity(row_counts.len());
        let mut running = 0;
        for &rows in row_counts {
            offsets.push(running);
            running += rows;
            cumulative.push(running);
        }

        let mut spans = Vec::with_capacity(num_batches);
        let mut shard_batches = vec![Vec::new(); row_counts.len()];
        let mut cur = 0;

        for batch in 0..num_batches {
            let start = batch * batch_size;
            let end = start + batch_size;

            while cur < row_counts.len() && cumulative[cur] <= start {
                cur += 1;
            }
            if cur == row_counts.len() {
                return Err(exhausted(batch, row_counts.len()));
            }

            let span = if end <= cumulative[cur] {
                ShardSpan::Single {
                    shard: cur,
                    rows: start - offsets[cur]..end - offsets[cur],
                }
            } else {
                let mut next = cur + 1;
                while next < row_counts.len() && row_counts[next] == 0 {
                    next += 1;
                }
                // Every non-empty shard holds a full batch, so the tail fits.
                if next == row_counts.len() {
                    return Err(exhausted(batch, row_counts.len()));
                }
                ShardSpan::Split {
                    head: RowRange {
                        shard: cur,
                        rows: start - offsets[cur]..row_counts[cur],
                    },
                    tail: RowRange {
                        shard: next,
                        rows: 0..end - offsets[next],
                    },
                }
            };

            for part in span.parts() {
                shard_batches[part.shard].push(batch);
            }
            spans.push(span);
        }

        let weights = if total == 0 {
            vec![0.0; row_counts.len()]
        } else {
            row_counts
                .iter()
                .map(|&rows| rows as f64 / total as f64)
                .collect()
        };

        Ok(Self {
            batch_size,
            row_counts: row_counts.to_vec(),
            spans,
            shard_batches,
            weights,
        })
    }

    /// Builds the map for a manifest, taking sampling weights from the
    /// manifest's declared fractions when present.
    pub fn from_manifest(manifest: &ShardManifest, batch_size: usize) -> Result<Self> {
        let map = Self::build(&manifest.row_counts(), batch_size)?;
        match manifest.fractions() {
            Some(fractions) => map.with_weights(fractions),
            None => Ok(map),
        }
    }

    /// Replaces the per-shard sampling weights. Empty shards must have
    /// weight zero.
    pub fn with_weights(mut self, weights: Vec<f64>) -> Result<Self> {
        if weights.len() != self.row_counts.len() {
            return Err(BatcherError::config(format!(
                "{} sampling weights given for {} shards",
                weights.len(),
                self.row_counts.len()
            )));
        }
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(BatcherError::config(
                "sampling weights must be finite and non-negative",
            ));
        }
        if let Some(shard) = weights
            .iter()
            .zip(&self.row_counts)
            .position(|(&w, &rows)| rows == 0 && w > 0.0)
        {
            return Err(BatcherError::config(format!(
                "shard {shard} is empty but has sampling weight {}",
                weights[shard]
            )));
        }
        self.weights = weights;
        Ok(self)
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn num_batches(&self) -> usize {
        self.spans.len()
    }

    pub fn num_shards(&self) -> usize {
        self.row_counts.len()
    }

    pub fn shard_rows(&self, shard: usize) -> Option<usize> {
        self.row_counts.get(shard).copied()
    }

    pub fn span(&self, batch: usize) -> Option<&ShardSpan> {
        self.spans.get(batch)
    }

    pub fn spans(&self) -> &[ShardSpan] {
        &self.spans
    }

    /// Batch indices whose span touches `shard`, ascending.
    pub fn batches_for_shard(&self, shard: usize) -> &[usize] {
        self.shard_batches
            .get(shard)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }
}

fn exhausted(batch: usize, shards: usize) -> BatcherError {
    BatcherError::config(format!(
        "shard list exhausted: batch {batch} needs rows past the last of {shards} shards"
    ))
}
