//! src/pool.rs
//!
//! Double-buffered ring of [`BufferPair`]s shared between two pipeline
//! stages.
//!
//! A pool holds exactly two slots. One stage is the pool's writer and one
//! is its reader; the writer fills the slot at the write cursor while the
//! reader drains the slot at the read cursor, and both cursors only move
//! forward modulo 2. Depth two is deliberate: it is the minimum that lets
//! the upstream stage fill the next pair while the downstream stage is
//! still working on the previous one, and anything deeper only adds
//! latency because the device copy downstream is the rate limiter.
//!
//! All cursor and occupancy state sits under a single mutex with two
//! condition variables (`non_empty`, `non_full`) for backpressure in both
//! directions. Every wait site re-checks its predicate and the pool's
//! `done` flag, so [`BufferPool::mark_done`] unblocks any waiter in
//! bounded time during shutdown.

use crate::buffer::BufferPair;
use anyhow::Result;
use std::cell::UnsafeCell;
use std::sync::{Condvar, Mutex, MutexGuard};

/// Cursor and occupancy state, guarded by the pool mutex.
#[derive(Debug)]
pub(crate) struct PoolState {
    read_pos: usize,
    write_pos: usize,
    occupied: usize,
    done: bool,
}

impl PoolState {
    pub(crate) fn is_empty(&self) -> bool {
        self.occupied == 0
    }

    pub(crate) fn is_full(&self) -> bool {
        self.occupied == 2
    }

    pub(crate) fn is_done(&self) -> bool {
        self.done
    }

    /// Slot index currently owned by the reader stage.
    pub(crate) fn read_slot(&self) -> usize {
        self.read_pos
    }

    /// Slot index currently owned by the writer stage.
    pub(crate) fn write_slot(&self) -> usize {
        self.write_pos
    }
}

/// Depth-2 paired ring with two-sided condition-variable backpressure.
pub struct BufferPool {
    slots: [UnsafeCell<BufferPair>; 2],
    state: Mutex<PoolState>,
    non_empty: Condvar,
    non_full: Condvar,
    pinned: bool,
}

// Slot contents are handed out per the cursor protocol: the tentative
// write slot to the single writer stage, advanced slots to the single
// reader stage. The mutex only guards the cursors, never the bytes.
unsafe impl Send for BufferPool {}
unsafe impl Sync for BufferPool {}

impl BufferPool {
    pub fn new(data_capacity: usize, target_capacity: usize, pinned: bool) -> Result<Self> {
        let slots = [
            UnsafeCell::new(BufferPair::new(data_capacity, target_capacity, pinned)?),
            UnsafeCell::new(BufferPair::new(data_capacity, target_capacity, pinned)?),
        ];
        Ok(Self {
            slots,
            state: Mutex::new(PoolState {
                read_pos: 0,
                write_pos: 0,
                occupied: 0,
                done: false,
            }),
            non_empty: Condvar::new(),
            non_full: Condvar::new(),
            pinned,
        })
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap()
    }

    pub(crate) fn try_lock(&self) -> Option<MutexGuard<'_, PoolState>> {
        self.state.try_lock().ok()
    }

    pub(crate) fn wait_non_empty<'a>(
        &self,
        guard: MutexGuard<'a, PoolState>,
    ) -> MutexGuard<'a, PoolState> {
        self.non_empty.wait(guard).unwrap()
    }

    pub(crate) fn wait_non_full<'a>(
        &self,
        guard: MutexGuard<'a, PoolState>,
    ) -> MutexGuard<'a, PoolState> {
        self.non_full.wait(guard).unwrap()
    }

    /// Publishes the tentative write slot and moves the write cursor on.
    pub(crate) fn advance_write(&self, state: &mut PoolState) {
        debug_assert!(state.occupied < 2);
        state.write_pos = (state.write_pos + 1) % 2;
        state.occupied += 1;
    }

    /// Releases the slot at the read cursor back to the writer.
    pub(crate) fn advance_read(&self, state: &mut PoolState) {
        debug_assert!(state.occupied > 0);
        state.read_pos = (state.read_pos + 1) % 2;
        state.occupied -= 1;
    }

    pub(crate) fn notify_non_empty(&self) {
        self.non_empty.notify_all();
    }

    pub(crate) fn notify_non_full(&self) {
        self.non_full.notify_all();
    }

    /// Marks the pool terminal and wakes every waiter. Once done, stages
    /// stop waiting for new pairs; anything still occupied can be drained.
    pub(crate) fn mark_done(&self) {
        let mut state = self.lock();
        state.done = true;
        drop(state);
        self.non_empty.notify_all();
        self.non_full.notify_all();
    }

    /// Non-blocking variant of [`mark_done`](Self::mark_done) for the
    /// teardown path, where the mutex may be held by a stage that is
    /// itself waiting to be unblocked.
    pub(crate) fn try_mark_done(&self) -> bool {
        match self.try_lock() {
            Some(mut state) => {
                state.done = true;
                drop(state);
                self.non_empty.notify_all();
                self.non_full.notify_all();
                true
            }
            None => false,
        }
    }

    /// Shared view of a slot.
    ///
    /// # Safety
    ///
    /// `slot` must currently be readable by the caller under the cursor
    /// protocol: either an advanced (occupied) slot observed through the
    /// pool lock, or a slot the manager has dispatched to the decode
    /// workers for the current batch.
    pub(crate) unsafe fn pair(&self, slot: usize) -> &BufferPair {
        &*self.slots[slot].get()
    }

    /// Exclusive view of a slot.
    ///
    /// # Safety
    ///
    /// The caller must be the unique stage entitled to mutate `slot`:
    /// the writer stage between observing the write cursor and advancing
    /// it, with no decode worker holding ranges into the slot.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn pair_mut(&self, slot: usize) -> &mut BufferPair {
        &mut *self.slots[slot].get()
    }
}
