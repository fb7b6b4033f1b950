//! src/pipeline/read_stage.rs
//!
//! The single producer thread that keeps the read pool filled.
//!
//! One cycle: wait for a free slot, hand the slot's pair to the reader to
//! fill, publish it. Backpressure comes purely from the pool's depth of
//! two, so the reader runs at most one minibatch ahead of the decoder.
//! The stage is the only writer to the read pool and the only caller of
//! `Reader::read`; it does no decoding.

use crate::pipeline::PipelineStatus;
use crate::pool::BufferPool;
use crate::reader::Reader;
use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

pub(crate) struct ReadStage {
    handle: Option<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
}

impl ReadStage {
    pub(crate) fn spawn(
        pool: Arc<BufferPool>,
        reader: Arc<Mutex<Box<dyn Reader>>>,
        status: Arc<PipelineStatus>,
    ) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let handle = {
            let stop = stop.clone();
            thread::Builder::new()
                .name("loader-read".into())
                .spawn(move || run(&pool, &reader, &status, &stop))
                .context("failed to spawn read thread")?
        };
        Ok(Self {
            handle: Some(handle),
            stop,
        })
    }

    pub(crate) fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.handle
            .as_ref()
            .map(|handle| handle.is_finished())
            .unwrap_or(true)
    }

    pub(crate) fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run(
    pool: &BufferPool,
    reader: &Mutex<Box<dyn Reader>>,
    status: &PipelineStatus,
    stop: &AtomicBool,
) {
    while !stop.load(Ordering::Acquire) {
        let mut state = pool.lock();
        loop {
            if stop.load(Ordering::Acquire) || state.is_done() {
                return;
            }
            if !state.is_full() {
                break;
            }
            state = pool.wait_non_full(state);
        }

        let slot = state.write_slot();
        // Sole writer of the tentative slot until advance_write below.
        let pair = unsafe { pool.pair_mut(slot) };
        pair.clear();
        match reader.lock().unwrap().read(pair) {
            Ok(()) => {
                pool.advance_write(&mut state);
                drop(state);
                pool.notify_non_empty();
            }
            Err(err) => {
                status.fail(format!("archive read failed: {:#}", err));
                drop(state);
                pool.mark_done();
                return;
            }
        }
    }
}
