//! src/reader.rs
//!
//! The archive reader seam.
//!
//! The pipeline does not parse archives itself; it drives a [`Reader`]
//! that fills one [`BufferPair`] per call with a full minibatch. The
//! reader owns iteration order: shuffling, epoch reshuffling, subset
//! selection and the starting position are all its business, configured
//! through [`ReaderConfig`]. The pipeline only guarantees that batches
//! are delivered downstream in the order the reader produced them.

use crate::buffer::BufferPair;
use anyhow::{ensure, Result};
use std::path::PathBuf;

/// Produces minibatches from a persistent archive.
///
/// Implementations must append up to `batch_size` items to the data half
/// of the pair and exactly `batch_size` items to the target half. An
/// `Err` from [`read`](Reader::read) is unrecoverable and stops the
/// pipeline.
pub trait Reader: Send {
    /// Fills both halves of `pair` with one minibatch.
    fn read(&mut self, pair: &mut BufferPair) -> Result<()>;

    /// Rewinds to the start-of-epoch position.
    fn reset(&mut self);

    /// Total number of items this reader iterates over.
    fn item_count(&self) -> usize;
}

/// File-system layout and iteration order for an archive reader.
///
/// ```ignore
/// let config = ReaderConfig::builder()
///     .repo_dir("/data/imagenet")
///     .archive_dir("/data/imagenet/archive")
///     .shuffle(true)
///     .reshuffle(true)
///     .subset_percent(10)
///     .build()?;
/// ```
#[derive(Debug, Clone)]
pub struct ReaderConfig {
    /// Root of the dataset repository.
    pub repo_dir: PathBuf,
    /// Directory holding the packed archive files.
    pub archive_dir: PathBuf,
    /// Index file mapping items to archive offsets.
    pub index_file: PathBuf,
    /// Dataset metadata file.
    pub meta_file: PathBuf,
    /// Common prefix of archive file names.
    pub archive_prefix: String,
    /// Whether to shuffle the iteration order.
    pub shuffle: bool,
    /// Whether to draw a fresh shuffle each epoch.
    pub reshuffle: bool,
    /// Archive file index to start reading from.
    pub start_file_idx: usize,
    /// Deterministic fraction of the dataset to iterate, in percent.
    pub subset_percent: u8,
}

impl ReaderConfig {
    pub fn builder() -> ReaderConfigBuilder {
        ReaderConfigBuilder::default()
    }
}

#[derive(Default)]
pub struct ReaderConfigBuilder {
    repo_dir: PathBuf,
    archive_dir: PathBuf,
    index_file: PathBuf,
    meta_file: PathBuf,
    archive_prefix: String,
    shuffle: bool,
    reshuffle: bool,
    start_file_idx: usize,
    subset_percent: Option<u8>,
}

impl ReaderConfigBuilder {
    pub fn repo_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.repo_dir = dir.into();
        self
    }

    pub fn archive_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.archive_dir = dir.into();
        self
    }

    pub fn index_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.index_file = path.into();
        self
    }

    pub fn meta_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.meta_file = path.into();
        self
    }

    pub fn archive_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.archive_prefix = prefix.into();
        self
    }

    pub fn shuffle(mut self, shuffle: bool) -> Self {
        self.shuffle = shuffle;
        self
    }

    /// Draw a fresh shuffle each epoch instead of replaying the first one.
    pub fn reshuffle(mut self, reshuffle: bool) -> Self {
        self.reshuffle = reshuffle;
        self
    }

    pub fn start_file_idx(mut self, idx: usize) -> Self {
        self.start_file_idx = idx;
        self
    }

    /// Train on a deterministic fraction of the dataset. Must be in 1..=100.
    pub fn subset_percent(mut self, percent: u8) -> Self {
        self.subset_percent = Some(percent);
        self
    }

    pub fn build(self) -> Result<ReaderConfig> {
        let subset_percent = self.subset_percent.unwrap_or(100);
        ensure!(
            (1..=100).contains(&subset_percent),
            "subset_percent must be in 1..=100, got {}",
            subset_percent
        );
        Ok(ReaderConfig {
            repo_dir: self.repo_dir,
            archive_dir: self.archive_dir,
            index_file: self.index_file,
            meta_file: self.meta_file,
            archive_prefix: self.archive_prefix,
            shuffle: self.shuffle,
            reshuffle: self.reshuffle,
            start_file_idx: self.start_file_idx,
            subset_percent,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_full_sequential() -> Result<()> {
        let config = ReaderConfig::builder().build()?;
        assert!(!config.shuffle);
        assert!(!config.reshuffle);
        assert_eq!(config.subset_percent, 100);
        assert_eq!(config.start_file_idx, 0);
        Ok(())
    }

    #[test]
    fn subset_percent_is_validated() {
        assert!(ReaderConfig::builder().subset_percent(0).build().is_err());
        assert!(ReaderConfig::builder().subset_percent(101).build().is_err());
        assert!(ReaderConfig::builder().subset_percent(1).build().is_ok());
        assert!(ReaderConfig::builder().subset_percent(100).build().is_ok());
    }
}
