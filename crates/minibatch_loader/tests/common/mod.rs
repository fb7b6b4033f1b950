#![allow(dead_code)]

//! Synthetic collaborators for exercising the pipeline end to end
//! without a real archive, codec or accelerator.

use anyhow::{anyhow, ensure, Result};
use minibatch_loader::{BufferPair, Device, DeviceKind, Media, Reader, ReaderConfig};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::HashMap;
use std::sync::Mutex;
use std::thread::ThreadId;

/// In-memory reader over `(datum, target)` byte items.
///
/// Iteration order follows the [`ReaderConfig`]: optional seeded shuffle,
/// fresh shuffle per epoch when `reshuffle` is set, a deterministic
/// subset, and a starting offset. The stream wraps around, so the
/// pipeline can always read ahead; one "epoch" is `item_count()` items.
pub struct VecReader {
    items: Vec<(Vec<u8>, Vec<u8>)>,
    order: Vec<usize>,
    batch_size: usize,
    cursor: usize,
    epoch: usize,
    config: ReaderConfig,
    seed: u64,
}

impl VecReader {
    pub fn new(
        items: Vec<(Vec<u8>, Vec<u8>)>,
        batch_size: usize,
        config: ReaderConfig,
        seed: u64,
    ) -> Self {
        let mut reader = Self {
            items,
            order: Vec::new(),
            batch_size,
            cursor: 0,
            epoch: 0,
            config,
            seed,
        };
        reader.rebuild_order();
        reader
    }

    /// Sequential reader over the full item set.
    pub fn sequential(items: Vec<(Vec<u8>, Vec<u8>)>, batch_size: usize) -> Self {
        let config = ReaderConfig::builder().build().unwrap();
        Self::new(items, batch_size, config, 0)
    }

    fn rebuild_order(&mut self) {
        // The subset is a fixed prefix; only its order changes per epoch.
        let keep = (self.items.len() * self.config.subset_percent as usize / 100).max(1);
        let mut order: Vec<usize> = (0..keep.min(self.items.len())).collect();
        if self.config.shuffle {
            let seed = if self.config.reshuffle {
                self.seed.wrapping_add(self.epoch as u64)
            } else {
                self.seed
            };
            order.shuffle(&mut StdRng::seed_from_u64(seed));
        }
        self.order = order;
        self.cursor = self.config.start_file_idx % self.order.len().max(1);
    }
}

impl Reader for VecReader {
    fn read(&mut self, pair: &mut BufferPair) -> Result<()> {
        ensure!(!self.order.is_empty(), "reader has no items");
        for _ in 0..self.batch_size {
            let index = self.order[self.cursor % self.order.len()];
            self.cursor += 1;
            let (datum, target) = &self.items[index];
            pair.data.append_item(datum)?;
            pair.target.append_item(target)?;
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.epoch += 1;
        self.rebuild_order();
    }

    fn item_count(&self) -> usize {
        self.order.len()
    }
}

/// Emits batch `k` as `batch_size` items all carrying the byte `k`.
/// Never exhausts; `reset` rewinds to batch 0.
pub struct CountingReader {
    batch_size: usize,
    next_batch: u8,
}

impl CountingReader {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size,
            next_batch: 0,
        }
    }
}

impl Reader for CountingReader {
    fn read(&mut self, pair: &mut BufferPair) -> Result<()> {
        for _ in 0..self.batch_size {
            pair.data.append_item(&[self.next_batch])?;
            pair.target.append_item(&[self.next_batch])?;
        }
        self.next_batch = self.next_batch.wrapping_add(1);
        Ok(())
    }

    fn reset(&mut self) {
        self.next_batch = 0;
    }

    fn item_count(&self) -> usize {
        usize::from(u8::MAX) * self.batch_size
    }
}

/// Delegates to [`CountingReader`] until `fail_on` reads have happened,
/// then errors out like a corrupt archive would.
pub struct FailingReader {
    inner: CountingReader,
    reads: usize,
    fail_on: usize,
}

impl FailingReader {
    pub fn new(batch_size: usize, fail_on: usize) -> Self {
        Self {
            inner: CountingReader::new(batch_size),
            reads: 0,
            fail_on,
        }
    }
}

impl Reader for FailingReader {
    fn read(&mut self, pair: &mut BufferPair) -> Result<()> {
        self.reads += 1;
        if self.reads >= self.fail_on {
            return Err(anyhow!("archive block {} is corrupt", self.reads));
        }
        self.inner.read(pair)
    }

    fn reset(&mut self) {
        self.reads = 0;
        self.inner.reset();
    }

    fn item_count(&self) -> usize {
        self.inner.item_count()
    }
}

/// Appends one data item fewer than promised, leaving a hole that the
/// decode workers must surface as a fatal condition.
pub struct ShortReader {
    batch_size: usize,
}

impl ShortReader {
    pub fn new(batch_size: usize) -> Self {
        Self { batch_size }
    }
}

impl Reader for ShortReader {
    fn read(&mut self, pair: &mut BufferPair) -> Result<()> {
        for i in 0..self.batch_size.saturating_sub(1) {
            pair.data.append_item(&[i as u8])?;
        }
        for i in 0..self.batch_size {
            pair.target.append_item(&[i as u8])?;
        }
        Ok(())
    }

    fn reset(&mut self) {}

    fn item_count(&self) -> usize {
        self.batch_size
    }
}

/// Copies the source into the destination, zero-padding any remainder.
pub struct IdentityMedia;

impl Media for IdentityMedia {
    fn transform(&self, src: &[u8], dst: &mut [u8]) -> Result<()> {
        let n = src.len().min(dst.len());
        dst[..n].copy_from_slice(&src[..n]);
        dst[n..].fill(0);
        Ok(())
    }
}

/// Identity transform that also records which thread decoded each item,
/// keyed by the item's first byte.
#[derive(Default)]
pub struct ThreadTagMedia {
    pub decoded_by: Mutex<HashMap<u8, ThreadId>>,
}

impl Media for ThreadTagMedia {
    fn transform(&self, src: &[u8], dst: &mut [u8]) -> Result<()> {
        self.decoded_by
            .lock()
            .unwrap()
            .insert(src[0], std::thread::current().id());
        IdentityMedia.transform(src, dst)
    }
}

/// Fails every transform.
pub struct FailingMedia;

impl Media for FailingMedia {
    fn transform(&self, _src: &[u8], _dst: &mut [u8]) -> Result<()> {
        Err(anyhow!("unsupported codec"))
    }
}

/// A device whose initialization fails, as a driver without a usable
/// accelerator would.
pub struct BrokenDevice;

impl Device for BrokenDevice {
    fn init(&self) -> Result<()> {
        Err(anyhow!("no accelerator present"))
    }

    fn kind(&self) -> DeviceKind {
        DeviceKind::Cpu
    }

    fn copy_data(&self, _slot: usize, _src: &[u8]) -> Result<()> {
        Ok(())
    }

    fn copy_labels(&self, _slot: usize, _src: &[u8]) -> Result<()> {
        Ok(())
    }
}
