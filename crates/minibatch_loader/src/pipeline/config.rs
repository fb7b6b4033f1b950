//! src/pipeline/config.rs
//!
//! Configuration for the loading pipeline.
//!
//! The sizes here fix every allocation the pipeline makes: buffer pools
//! are provisioned once at `start()` from `batch_size`, `datum_size`,
//! `max_datum_size` and `target_size`, and are never reallocated mid-run.
//!
//! Example:
//! ```ignore
//! let config = LoaderConfig::builder()
//!     .batch_size(128)
//!     .datum_size(3 * 224 * 224)
//!     .target_size(4)
//!     .build();
//! ```

use anyhow::{ensure, Result};

/// Sizing and threading parameters for a [`Loader`](super::Loader).
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Items per minibatch.
    pub batch_size: usize,
    /// Bytes per decoded datum.
    pub datum_size: usize,
    /// Bytes per label.
    pub target_size: usize,
    /// Width in bytes of one decoded element; the post-decode transpose
    /// keeps elements of this size intact. Defaults to 1.
    pub elem_size: usize,
    /// Worst-case bytes per raw (compressed) item. Sizes the read-side
    /// buffers; defaults to `datum_size`.
    pub max_datum_size: Option<usize>,
    /// Number of decode workers. `None` derives a count from the
    /// available hardware parallelism; the count is always clamped to
    /// `batch_size` so no worker gets an empty share.
    pub decode_threads: Option<usize>,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            batch_size: 1,
            datum_size: 1,
            target_size: 1,
            elem_size: 1,
            max_datum_size: None,
            decode_threads: None,
        }
    }
}

impl LoaderConfig {
    pub fn builder() -> LoaderConfigBuilder {
        LoaderConfigBuilder::default()
    }

    pub(crate) fn validate(&self) -> Result<()> {
        ensure!(self.batch_size > 0, "batch_size must be greater than 0");
        ensure!(self.datum_size > 0, "datum_size must be greater than 0");
        ensure!(self.target_size > 0, "target_size must be greater than 0");
        ensure!(self.elem_size > 0, "elem_size must be greater than 0");
        ensure!(
            self.datum_size % self.elem_size == 0,
            "datum_size ({}) must be a multiple of elem_size ({})",
            self.datum_size,
            self.elem_size
        );
        if let Some(max) = self.max_datum_size {
            ensure!(
                max >= self.datum_size,
                "max_datum_size ({}) must be at least datum_size ({})",
                max,
                self.datum_size
            );
        }
        if let Some(threads) = self.decode_threads {
            ensure!(threads > 0, "decode_threads must be greater than 0");
        }
        self.read_data_bytes()?;
        self.decoded_data_bytes()?;
        self.target_bytes()?;
        Ok(())
    }

    /// Capacity of the read pool's data half (worst-case raw batch).
    pub(crate) fn read_data_bytes(&self) -> Result<usize> {
        let per_item = self.max_datum_size.unwrap_or(self.datum_size);
        checked_total(self.batch_size, per_item, "raw data")
    }

    /// Capacity of the decode pool's data half (exact decoded batch).
    pub(crate) fn decoded_data_bytes(&self) -> Result<usize> {
        checked_total(self.batch_size, self.datum_size, "decoded data")
    }

    /// Capacity of either pool's target half.
    pub(crate) fn target_bytes(&self) -> Result<usize> {
        checked_total(self.batch_size, self.target_size, "target")
    }
}

fn checked_total(batch_size: usize, per_item: usize, what: &str) -> Result<usize> {
    batch_size
        .checked_mul(per_item)
        .ok_or_else(|| anyhow::anyhow!("{} buffer size overflows usize", what))
}

/// Builder for [`LoaderConfig`] with method chaining.
#[derive(Default)]
pub struct LoaderConfigBuilder {
    config: LoaderConfig,
}

impl LoaderConfigBuilder {
    pub fn batch_size(mut self, size: usize) -> Self {
        self.config.batch_size = size;
        self
    }

    pub fn datum_size(mut self, size: usize) -> Self {
        self.config.datum_size = size;
        self
    }

    pub fn target_size(mut self, size: usize) -> Self {
        self.config.target_size = size;
        self
    }

    pub fn elem_size(mut self, size: usize) -> Self {
        self.config.elem_size = size;
        self
    }

    pub fn max_datum_size(mut self, size: usize) -> Self {
        self.config.max_datum_size = Some(size);
        self
    }

    pub fn decode_threads(mut self, threads: usize) -> Self {
        self.config.decode_threads = Some(threads);
        self
    }

    pub fn build(self) -> LoaderConfig {
        self.config
    }
}
