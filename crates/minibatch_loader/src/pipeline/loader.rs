//! src/pipeline/loader.rs
//!
//! The consumer-facing loader: owns the collaborators, wires the stages
//! together and runs the start/stop/reset lifecycle.
//!
//! # Lifecycle
//!
//! `start()` allocates both pools and brings up the decode workers, the
//! manager and the read thread; on any failure nothing is left running.
//! `stop()` quiesces the three independently blocked stages without
//! deadlock: it first stops the read thread, then lets the manager drain
//! whatever is already buffered while the consumer side is drained for
//! it, and finally joins the worker pool. `reset()` is
//! `stop(); reader.reset(); start()`.
//!
//! # Consuming batches
//!
//! `next()` advances the consumer's cursor on the decode pool, blocking
//! until the next minibatch has been staged on the device. The first call
//! after `start()` does not advance — there is no previous batch to
//! release. `next_into()` is the testing variant that copies the decoded
//! batch into caller-provided buffers instead.

use crate::device::{Device, DeviceKind};
use crate::media::Media;
use crate::pipeline::config::LoaderConfig;
use crate::pipeline::decode::{DecodeParams, DecodeWorkerPool};
use crate::pipeline::read_stage::ReadStage;
use crate::pipeline::PipelineStatus;
use crate::pool::BufferPool;
use crate::reader::Reader;
use anyhow::{anyhow, ensure, Context, Result};
use std::sync::{Arc, Mutex};
use std::thread;

pub struct Loader {
    config: LoaderConfig,
    reader: Arc<Mutex<Box<dyn Reader>>>,
    media: Arc<dyn Media>,
    device: Arc<dyn Device>,
    status: Arc<PipelineStatus>,
    read_pool: Option<Arc<BufferPool>>,
    decode_pool: Option<Arc<BufferPool>>,
    read_stage: Option<ReadStage>,
    decode_workers: Option<DecodeWorkerPool>,
    first: bool,
}

impl Loader {
    pub fn new(
        config: LoaderConfig,
        reader: Box<dyn Reader>,
        media: Arc<dyn Media>,
        device: Arc<dyn Device>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            reader: Arc::new(Mutex::new(reader)),
            media,
            device,
            status: Arc::new(PipelineStatus::default()),
            read_pool: None,
            decode_pool: None,
            read_stage: None,
            decode_workers: None,
            first: true,
        })
    }

    pub fn is_running(&self) -> bool {
        self.read_stage.is_some()
    }

    /// Allocates the pools and starts all pipeline threads.
    pub fn start(&mut self) -> Result<()> {
        ensure!(!self.is_running(), "loader is already running");
        self.config.validate()?;
        self.status.clear();
        self.first = true;

        let read_pool = Arc::new(
            BufferPool::new(
                self.config.read_data_bytes()?,
                self.config.target_bytes()?,
                false,
            )
            .context("failed to allocate read buffers")?,
        );
        let pinned = self.device.kind() != DeviceKind::Cpu;
        let decode_pool = Arc::new(
            BufferPool::new(
                self.config.decoded_data_bytes()?,
                self.config.target_bytes()?,
                pinned,
            )
            .context("failed to allocate decode buffers")?,
        );

        let params = DecodeParams {
            batch_size: self.config.batch_size,
            datum_size: self.config.datum_size,
            target_size: self.config.target_size,
            elem_size: self.config.elem_size,
            decode_threads: self.config.decode_threads,
        };
        let decode_workers = DecodeWorkerPool::spawn(
            &params,
            read_pool.clone(),
            decode_pool.clone(),
            self.device.clone(),
            self.media.clone(),
            self.status.clone(),
        )?;

        let read_stage = match ReadStage::spawn(
            read_pool.clone(),
            self.reader.clone(),
            self.status.clone(),
        ) {
            Ok(stage) => stage,
            Err(err) => {
                // stop_and_join marks both pools done, so nothing hangs.
                drop(decode_workers);
                return Err(err);
            }
        };

        tracing::debug!(
            batch_size = self.config.batch_size,
            decode_threads = decode_workers.thread_count(),
            pinned,
            "loader started"
        );

        self.read_pool = Some(read_pool);
        self.decode_pool = Some(decode_pool);
        self.decode_workers = Some(decode_workers);
        self.read_stage = Some(read_stage);
        Ok(())
    }

    /// Quiesces the pipeline and frees the pools. Safe to call when the
    /// loader is not running.
    pub fn stop(&mut self) {
        let (Some(mut read_stage), Some(mut decode_workers), Some(read_pool), Some(decode_pool)) = (
            self.read_stage.take(),
            self.decode_workers.take(),
            self.read_pool.take(),
            self.decode_pool.take(),
        ) else {
            return;
        };

        // 1. Stop the read thread. It may be blocked on read-pool space,
        // which only frees up through manager progress, so keep draining
        // the consumer side while waiting.
        read_stage.request_stop();
        while !read_stage.is_stopped() {
            Self::drain_one(&decode_pool);
            read_pool.notify_non_full();
            thread::yield_now();
        }
        read_stage.join();

        // 2. Let the manager finish whatever was already read. The read
        // pool's done mark tells it not to wait for more input; draining
        // the decode pool keeps it from blocking on output space. The
        // mark must not block, because the manager holds the read pool
        // mutex while it waits for decode space.
        let mut read_marked = false;
        while !decode_workers.manager_stopped() {
            Self::drain_one(&decode_pool);
            if !read_marked {
                read_marked = read_pool.try_mark_done();
            }
            thread::yield_now();
        }
        if !read_marked {
            read_pool.mark_done();
        }
        while Self::drain_one(&decode_pool) {}

        // 3. Everything is unblocked; collect the threads.
        decode_workers.stop_and_join();
        tracing::debug!("loader stopped");
    }

    /// Advances the consumer past one buffered minibatch so its slot can
    /// be reused. Returns false once the pool is empty.
    fn drain_one(pool: &BufferPool) -> bool {
        let mut state = pool.lock();
        if state.is_empty() {
            return false;
        }
        pool.advance_read(&mut state);
        drop(state);
        pool.notify_non_full();
        true
    }

    /// Stops the pipeline, rewinds the reader and starts over.
    pub fn reset(&mut self) -> Result<()> {
        self.stop();
        self.reader.lock().unwrap().reset();
        self.start()
    }

    /// Hands the consumer the next minibatch: releases the previous one
    /// (except on the first call after `start()`) and blocks until the
    /// next one has been decoded and staged on the device.
    pub fn next(&mut self) -> Result<()> {
        let pool = self
            .decode_pool
            .as_ref()
            .ok_or_else(|| anyhow!("loader is not running"))?;

        let mut state = pool.lock();
        if self.first {
            self.first = false;
        } else {
            pool.advance_read(&mut state);
            pool.notify_non_full();
        }
        loop {
            if !state.is_empty() {
                return Ok(());
            }
            if state.is_done() {
                drop(state);
                return Err(self.status.to_error("pipeline stopped"));
            }
            state = pool.wait_non_empty(state);
        }
    }

    /// Copies the next decoded minibatch into the buffers passed in.
    /// Only used for testing purposes.
    pub fn next_into(&mut self, data: &mut [u8], targets: &mut [u8]) -> Result<()> {
        let pool = self
            .decode_pool
            .as_ref()
            .ok_or_else(|| anyhow!("loader is not running"))?;

        let mut state = pool.lock();
        loop {
            if !state.is_empty() {
                break;
            }
            if state.is_done() {
                drop(state);
                return Err(self.status.to_error("pipeline stopped"));
            }
            state = pool.wait_non_empty(state);
        }

        let slot = state.read_slot();
        // Reader's view of an advanced slot; released below.
        let pair = unsafe { pool.pair(slot) };
        data.copy_from_slice(&pair.data.as_slice()[..data.len()]);
        targets.copy_from_slice(&pair.target.as_slice()[..targets.len()]);
        pool.advance_read(&mut state);
        drop(state);
        pool.notify_non_full();
        Ok(())
    }

    /// Number of decode workers, once the pipeline is running.
    pub fn decode_thread_count(&self) -> Option<usize> {
        self.decode_workers
            .as_ref()
            .map(DecodeWorkerPool::thread_count)
    }

    /// Total items the reader iterates over.
    pub fn item_count(&self) -> usize {
        self.reader.lock().unwrap().item_count()
    }

    /// Runs `f` against the reader. Collaborator accessor; the reader is
    /// shared with the read thread, so keep the closure short.
    pub fn with_reader<T>(&self, f: impl FnOnce(&mut dyn Reader) -> T) -> T {
        let mut reader = self.reader.lock().unwrap();
        f(&mut **reader)
    }

    pub fn media(&self) -> &Arc<dyn Media> {
        &self.media
    }

    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }
}

impl Drop for Loader {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferPair;
    use crate::device::CpuDevice;

    struct CountingReader {
        batch_size: usize,
        cursor: u8,
    }

    impl Reader for CountingReader {
        fn read(&mut self, pair: &mut BufferPair) -> Result<()> {
            for _ in 0..self.batch_size {
                pair.data.append_item(&[self.cursor])?;
                pair.target.append_item(&[self.cursor])?;
                self.cursor = self.cursor.wrapping_add(1);
            }
            Ok(())
        }

        fn reset(&mut self) {
            self.cursor = 0;
        }

        fn item_count(&self) -> usize {
            256
        }
    }

    struct CopyMedia;

    impl Media for CopyMedia {
        fn transform(&self, src: &[u8], dst: &mut [u8]) -> Result<()> {
            dst.copy_from_slice(src);
            Ok(())
        }
    }

    struct FakeAccelerator;

    impl Device for FakeAccelerator {
        fn init(&self) -> Result<()> {
            Ok(())
        }

        fn kind(&self) -> DeviceKind {
            DeviceKind::Cuda
        }

        fn copy_data(&self, _slot: usize, _src: &[u8]) -> Result<()> {
            Ok(())
        }

        fn copy_labels(&self, _slot: usize, _src: &[u8]) -> Result<()> {
            Ok(())
        }
    }

    fn loader_with_device(device: Arc<dyn Device>) -> Result<Loader> {
        let config = LoaderConfig::builder()
            .batch_size(2)
            .datum_size(1)
            .target_size(1)
            .decode_threads(1)
            .build();
        let reader = Box::new(CountingReader {
            batch_size: 2,
            cursor: 0,
        });
        Loader::new(config, reader, Arc::new(CopyMedia), device)
    }

    #[cfg(unix)]
    #[test]
    fn accelerator_device_gets_pinned_decode_buffers() -> Result<()> {
        let mut loader = loader_with_device(Arc::new(FakeAccelerator))?;
        loader.start()?;
        assert!(loader.decode_pool.as_ref().unwrap().is_pinned());
        assert!(!loader.read_pool.as_ref().unwrap().is_pinned());
        loader.stop();
        Ok(())
    }

    #[test]
    fn cpu_device_keeps_buffers_unpinned() -> Result<()> {
        let mut loader = loader_with_device(Arc::new(CpuDevice::new()))?;
        loader.start()?;
        assert!(!loader.decode_pool.as_ref().unwrap().is_pinned());
        loader.stop();
        Ok(())
    }

    #[test]
    fn double_start_is_rejected() -> Result<()> {
        let mut loader = loader_with_device(Arc::new(CpuDevice::new()))?;
        loader.start()?;
        assert!(loader.start().is_err());
        loader.stop();
        Ok(())
    }

    #[test]
    fn stop_without_start_is_a_no_op() -> Result<()> {
        let mut loader = loader_with_device(Arc::new(CpuDevice::new()))?;
        loader.stop();
        assert!(loader.next().is_err());
        Ok(())
    }
}
