//! src/pipeline/decode.rs
//!
//! The decode worker pool and its manager thread.
//!
//! # Batch partition
//!
//! A minibatch is split statically across N workers. Worker `id` owns
//! items `[id * items_per_thread, min((id + 1) * items_per_thread,
//! batch_size))`; the intervals are disjoint and cover the batch exactly,
//! so each worker writes its own byte range of the output pair and the
//! per-item decode path takes no locks.
//!
//! N is derived from the hardware parallelism (or the configured
//! override) such that `items_per_thread * N >= batch_size` and
//! `items_per_thread * (N - 1) < batch_size`: only the last worker can
//! get a short tail, and no worker gets an empty share.
//!
//! # Dispatch and join
//!
//! The manager owns both pools' stage roles for this half of the
//! pipeline: it is the reader of the read pool and the writer of the
//! decode pool. Per batch it publishes the input and output slots, raises
//! every worker's start signal, and then sleeps on the `ended` condvar
//! until all N workers have checked in. Because the manager holds the
//! decode pool guard across dispatch and join, only one batch is ever in
//! flight, which is what makes the workers' unsynchronized slice writes
//! sound.
//!
//! Workers increment the join counter on *every* exit from the batch
//! body. A missing or undecodable item raises the shared failure flag
//! instead of skipping the increment; a skipped increment would leave the
//! manager waiting forever.
//!
//! Lock order: a pool mutex may be held while taking the coordination
//! mutex, never the reverse.

use crate::device::Device;
use crate::media::Media;
use crate::pipeline::PipelineStatus;
use crate::pool::BufferPool;
use crate::transpose::transpose;
use anyhow::{Context, Result};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

/// Immutable per-worker share of a batch, fixed at spawn time.
#[derive(Debug, Clone, Copy)]
struct Partition {
    start_ind: usize,
    end_ind: usize,
    data_offset: usize,
    target_offset: usize,
    target_span: usize,
}

/// Worker count and share size for one batch configuration.
pub(crate) fn worker_layout(batch_size: usize, override_threads: Option<usize>) -> (usize, usize) {
    let cores = override_threads
        .unwrap_or_else(|| {
            thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
        .max(1);
    let items_per_thread = (batch_size - 1) / cores + 1;
    let count = ((batch_size - 1) / items_per_thread + 1).min(batch_size);
    debug_assert!(items_per_thread * count >= batch_size);
    debug_assert!(items_per_thread * (count - 1) < batch_size);
    (count, items_per_thread)
}

struct CoordState {
    start_signaled: Vec<bool>,
    end_signaled: usize,
    input_slot: usize,
    output_slot: usize,
    decode_failed: bool,
    done: bool,
    stop_manager: bool,
    manager_stopped: bool,
}

struct Coordination {
    state: Mutex<CoordState>,
    started: Condvar,
    ended: Condvar,
}

impl Coordination {
    fn new(worker_count: usize) -> Self {
        Self {
            state: Mutex::new(CoordState {
                start_signaled: vec![false; worker_count],
                end_signaled: 0,
                input_slot: 0,
                output_slot: 0,
                decode_failed: false,
                done: false,
                stop_manager: false,
                manager_stopped: false,
            }),
            started: Condvar::new(),
            ended: Condvar::new(),
        }
    }

    fn stop_requested(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.stop_manager || state.done
    }
}

pub(crate) struct DecodeWorkerPool {
    workers: Vec<JoinHandle<()>>,
    manager: Option<JoinHandle<()>>,
    coord: Arc<Coordination>,
    read_pool: Arc<BufferPool>,
    decode_pool: Arc<BufferPool>,
    thread_count: usize,
}

pub(crate) struct DecodeParams {
    pub batch_size: usize,
    pub datum_size: usize,
    pub target_size: usize,
    pub elem_size: usize,
    pub decode_threads: Option<usize>,
}

impl DecodeWorkerPool {
    pub(crate) fn spawn(
        params: &DecodeParams,
        read_pool: Arc<BufferPool>,
        decode_pool: Arc<BufferPool>,
        device: Arc<dyn Device>,
        media: Arc<dyn Media>,
        status: Arc<PipelineStatus>,
    ) -> Result<Self> {
        let (thread_count, items_per_thread) =
            worker_layout(params.batch_size, params.decode_threads);
        let coord = Arc::new(Coordination::new(thread_count));

        let mut workers = Vec::with_capacity(thread_count);
        for id in 0..thread_count {
            let start_ind = id * items_per_thread;
            let end_ind = ((id + 1) * items_per_thread).min(params.batch_size);
            let partition = Partition {
                start_ind,
                end_ind,
                data_offset: start_ind * params.datum_size,
                target_offset: start_ind * params.target_size,
                target_span: (end_ind - start_ind) * params.target_size,
            };
            let worker = Worker {
                id,
                partition,
                datum_size: params.datum_size,
                target_size: params.target_size,
                coord: coord.clone(),
                read_pool: read_pool.clone(),
                decode_pool: decode_pool.clone(),
                media: media.clone(),
            };
            let handle = thread::Builder::new()
                .name(format!("loader-decode-{}", id))
                .spawn(move || worker.run())
                .with_context(|| format!("failed to spawn decode worker {}", id))?;
            workers.push(handle);
        }

        let manager = {
            let mut manager = Manager {
                coord: coord.clone(),
                read_pool: read_pool.clone(),
                decode_pool: decode_pool.clone(),
                device,
                status,
                batch_size: params.batch_size,
                datum_size: params.datum_size,
                target_size: params.target_size,
                elem_size: params.elem_size,
                worker_count: thread_count,
                scratch: vec![0u8; params.batch_size * params.datum_size],
                buffer_index: 0,
            };
            thread::Builder::new()
                .name("loader-manage".into())
                .spawn(move || manager.run())
                .context("failed to spawn manager thread")?
        };

        Ok(Self {
            workers,
            manager: Some(manager),
            coord,
            read_pool,
            decode_pool,
            thread_count,
        })
    }

    pub(crate) fn thread_count(&self) -> usize {
        self.thread_count
    }

    pub(crate) fn manager_stopped(&self) -> bool {
        self.coord.state.lock().unwrap().manager_stopped
    }

    /// Stops workers and the manager and joins them all, abandoning any
    /// batch in flight. Graceful draining is the caller's business; this
    /// only guarantees that every thread comes home.
    pub(crate) fn stop_and_join(&mut self) {
        {
            let mut state = self.coord.state.lock().unwrap();
            state.done = true;
            state.stop_manager = true;
        }
        self.coord.started.notify_all();
        self.coord.ended.notify_all();
        // Wake the manager out of any pool wait. Decode first: while the
        // manager waits for decode space it still holds the read pool
        // mutex, so the read pool must be marked last.
        self.decode_pool.mark_done();
        self.read_pool.mark_done();

        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        if let Some(handle) = self.manager.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for DecodeWorkerPool {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

struct Worker {
    id: usize,
    partition: Partition,
    datum_size: usize,
    target_size: usize,
    coord: Arc<Coordination>,
    read_pool: Arc<BufferPool>,
    decode_pool: Arc<BufferPool>,
    media: Arc<dyn Media>,
}

impl Worker {
    fn run(&self) {
        loop {
            let (input_slot, output_slot) = {
                let mut state = self.coord.state.lock().unwrap();
                loop {
                    if state.done {
                        return;
                    }
                    if state.start_signaled[self.id] {
                        state.start_signaled[self.id] = false;
                        break;
                    }
                    state = self.coord.started.wait(state).unwrap();
                }
                (state.input_slot, state.output_slot)
            };

            let ok = self.decode_share(input_slot, output_slot);

            let mut state = self.coord.state.lock().unwrap();
            if !ok {
                state.decode_failed = true;
            }
            state.end_signaled += 1;
            debug_assert!(state.end_signaled <= state.start_signaled.len());
            drop(state);
            self.coord.ended.notify_one();
        }
    }

    /// Decodes this worker's items and copies its target span. Returns
    /// false on a missing or undecodable item; the caller still checks in
    /// with the manager either way.
    fn decode_share(&self, input_slot: usize, output_slot: usize) -> bool {
        // The manager dispatched these slots for the current batch and
        // will not touch them until every worker has checked in.
        let input = unsafe { self.read_pool.pair(input_slot) };
        let output = unsafe { self.decode_pool.pair(output_slot) };

        let mut dst_offset = self.partition.data_offset;
        for index in self.partition.start_ind..self.partition.end_ind {
            let Some(src) = input.data.item(index) else {
                return false;
            };
            let dst = unsafe { output.data.slice_mut(dst_offset, self.datum_size) };
            if self.media.transform(src, dst).is_err() {
                return false;
            }
            dst_offset += self.datum_size;
        }

        let span_end = self.partition.target_offset + self.partition.target_span;
        if input.target.len() < span_end {
            return false;
        }
        debug_assert_eq!(
            input.target.item(self.partition.start_ind).map(<[u8]>::len),
            Some(self.target_size)
        );
        let src = &input.target.as_slice()[self.partition.target_offset..span_end];
        let dst = unsafe {
            output
                .target
                .slice_mut(self.partition.target_offset, self.partition.target_span)
        };
        dst.copy_from_slice(src);
        true
    }
}

struct Manager {
    coord: Arc<Coordination>,
    read_pool: Arc<BufferPool>,
    decode_pool: Arc<BufferPool>,
    device: Arc<dyn Device>,
    status: Arc<PipelineStatus>,
    batch_size: usize,
    datum_size: usize,
    target_size: usize,
    elem_size: usize,
    worker_count: usize,
    scratch: Vec<u8>,
    buffer_index: usize,
}

impl Manager {
    fn run(&mut self) {
        if let Err(err) = self.device.init() {
            self.status.fail(format!("device init failed: {:#}", err));
        } else {
            while self.consume() {}
        }

        self.coord.state.lock().unwrap().manager_stopped = true;
        // Nothing new will reach the consumer; let it drain and observe.
        self.decode_pool.mark_done();
        tracing::debug!("manager stopped");
    }

    /// Takes one input pair, runs a full batch against it, and releases
    /// the slot. Returns false when the pipeline should stop.
    fn consume(&mut self) -> bool {
        let read_pool = self.read_pool.clone();
        let mut state = read_pool.lock();
        loop {
            if self.coord.stop_requested() {
                return false;
            }
            if !state.is_empty() {
                break;
            }
            if state.is_done() {
                return false;
            }
            state = read_pool.wait_non_empty(state);
        }

        let input_slot = state.read_slot();
        if !self.produce(input_slot) {
            return false;
        }
        read_pool.advance_read(&mut state);
        drop(state);
        read_pool.notify_non_full();
        true
    }

    /// Produces one decoded minibatch into the decode pool and stages it
    /// on the device. Called with the read pool guard held so the input
    /// pair stays put for the whole batch.
    fn produce(&mut self, input_slot: usize) -> bool {
        let decode_pool = self.decode_pool.clone();
        let mut state = decode_pool.lock();
        loop {
            if self.coord.stop_requested() {
                return false;
            }
            if !state.is_full() {
                break;
            }
            if state.is_done() {
                return false;
            }
            state = decode_pool.wait_non_full(state);
        }
        let output_slot = state.write_slot();

        {
            let mut coord = self.coord.state.lock().unwrap();
            coord.input_slot = input_slot;
            coord.output_slot = output_slot;
            for signal in coord.start_signaled.iter_mut() {
                *signal = true;
            }
        }
        self.coord.started.notify_all();

        {
            let mut coord = self.coord.state.lock().unwrap();
            while coord.end_signaled < self.worker_count {
                if coord.stop_manager || coord.done {
                    return false;
                }
                coord = self.coord.ended.wait(coord).unwrap();
            }
            coord.end_signaled = 0;
            if coord.decode_failed {
                drop(coord);
                self.status
                    .fail("decode failed: missing or undecodable item in batch");
                return false;
            }
        }

        // All workers have checked in: the output pair is exclusively
        // ours again.
        let output = unsafe { decode_pool.pair_mut(output_slot) };
        let data_bytes = self.batch_size * self.datum_size;
        transpose(
            &output.data.as_slice()[..data_bytes],
            &mut self.scratch,
            self.batch_size,
            self.datum_size / self.elem_size,
            self.elem_size,
        );
        output.data.as_mut_slice()[..data_bytes].copy_from_slice(&self.scratch);

        let target_bytes = self.batch_size * self.target_size;
        let staged = self
            .device
            .copy_data(self.buffer_index, &output.data.as_slice()[..data_bytes])
            .and_then(|_| {
                self.device
                    .copy_labels(self.buffer_index, &output.target.as_slice()[..target_bytes])
            });
        if let Err(err) = staged {
            self.status.fail(format!("device copy failed: {:#}", err));
            return false;
        }
        self.buffer_index = 1 - self.buffer_index;

        decode_pool.advance_write(&mut state);
        drop(state);
        decode_pool.notify_non_empty();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_covers_every_batch_exactly() {
        for batch_size in 1..=64 {
            for cores in 1..=16 {
                let (count, per_thread) = worker_layout(batch_size, Some(cores));
                assert!(count >= 1 && count <= batch_size);
                assert!(per_thread * count >= batch_size);
                assert!(per_thread * (count - 1) < batch_size);
            }
        }
    }

    #[test]
    fn layout_clamps_to_batch_size() {
        let (count, per_thread) = worker_layout(3, Some(8));
        assert_eq!(count, 3);
        assert_eq!(per_thread, 1);
    }

    #[test]
    fn layout_collapses_to_one_worker() {
        let (count, per_thread) = worker_layout(1, Some(1));
        assert_eq!(count, 1);
        assert_eq!(per_thread, 1);
    }

    #[test]
    fn partitions_tile_the_batch() {
        for (batch_size, cores) in [(7, 3), (8, 3), (9, 4), (1, 4), (16, 16)] {
            let (count, per_thread) = worker_layout(batch_size, Some(cores));
            let mut covered = 0;
            for id in 0..count {
                let start = id * per_thread;
                let end = ((id + 1) * per_thread).min(batch_size);
                assert_eq!(start, covered, "share {} must begin where {} ended", id, id);
                assert!(end > start, "share {} must not be empty", id);
                covered = end;
            }
            assert_eq!(covered, batch_size);
        }
    }
}
