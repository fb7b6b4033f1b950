//! src/buffer.rs
//!
//! Fixed-capacity byte buffers that travel through the loading pipeline.
//!
//! A [`Buffer`] is allocated once at pipeline start and never reallocated
//! mid-run. It is used in two modes:
//!
//! - **Appended**: the producing stage grows the buffer item by item with
//!   [`Buffer::append_item`], which records each item's offset and length
//!   in the item index.
//! - **Sliced**: a consuming stage asks for item `i` with [`Buffer::item`]
//!   and gets back a borrowed byte slice.
//!
//! Decode workers additionally write decoded output through
//! [`Buffer::slice_mut`], which hands out raw disjoint ranges of the same
//! buffer to several threads at once. That path is `unsafe`: exclusivity
//! is guaranteed by the pipeline's batch partition, not by the type system,
//! so the byte storage lives in an `UnsafeCell`.
//!
//! Buffers can be pinned (page-locked) so an accelerator can DMA directly
//! out of them; pinning uses `mlock` and is released on drop.

use anyhow::{ensure, Result};
use std::cell::UnsafeCell;

/// A contiguous byte region of fixed capacity with an item index.
pub struct Buffer {
    bytes: UnsafeCell<Box<[u8]>>,
    items: Vec<(usize, usize)>,
    len: usize,
    pinned: bool,
}

// The UnsafeCell makes Buffer !Sync by default. Shared access is
// synchronized externally by the pool cursors and the batch partition:
// a buffer is either owned by a single appending stage (`&mut`), or read
// by consumers, or written through disjoint `slice_mut` ranges.
unsafe impl Send for Buffer {}
unsafe impl Sync for Buffer {}

impl Buffer {
    /// Allocates a zeroed buffer of `capacity` bytes. With `pinned` the
    /// region is additionally page-locked; failure to lock is reported as
    /// an allocation failure.
    pub fn new(capacity: usize, pinned: bool) -> Result<Self> {
        ensure!(capacity > 0, "buffer capacity must be greater than 0");
        let bytes = vec![0u8; capacity].into_boxed_slice();
        if pinned {
            pin_region(bytes.as_ptr(), capacity)?;
        }
        Ok(Self {
            bytes: UnsafeCell::new(bytes),
            items: Vec::new(),
            len: 0,
            pinned,
        })
    }

    pub fn capacity(&self) -> usize {
        unsafe { (&*self.bytes.get()).len() }
    }

    /// Number of appended bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned
    }

    pub fn item_count(&self) -> usize {
        self.items.len()
    }

    /// Forgets all appended items. The underlying bytes are left as-is.
    pub fn clear(&mut self) {
        self.items.clear();
        self.len = 0;
    }

    /// Appends one item and records it in the item index.
    pub fn append_item(&mut self, src: &[u8]) -> Result<()> {
        let end = self.len + src.len();
        ensure!(
            end <= self.capacity(),
            "buffer overflow: item of {} bytes does not fit ({} of {} bytes used)",
            src.len(),
            self.len,
            self.capacity()
        );
        unsafe {
            (&mut *self.bytes.get())[self.len..end].copy_from_slice(src);
        }
        self.items.push((self.len, src.len()));
        self.len = end;
        Ok(())
    }

    /// Borrows item `i` as recorded by the item index.
    pub fn item(&self, index: usize) -> Option<&[u8]> {
        let &(offset, len) = self.items.get(index)?;
        Some(unsafe { &(&*self.bytes.get())[offset..offset + len] })
    }

    /// Full-capacity view of the underlying bytes.
    pub fn as_slice(&self) -> &[u8] {
        unsafe { &(&*self.bytes.get())[..] }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { &mut (&mut *self.bytes.get())[..] }
    }

    /// Mutable view of `offset..offset + len` obtained through a shared
    /// reference.
    ///
    /// # Safety
    ///
    /// The caller must guarantee that no other slice handed out through
    /// this method overlaps the range, and that no reader observes the
    /// buffer until all writers for the current batch have finished. The
    /// decode partition provides both: worker ranges are disjoint by
    /// construction and the manager joins every worker before the buffer
    /// becomes readable.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn slice_mut(&self, offset: usize, len: usize) -> &mut [u8] {
        debug_assert!(offset + len <= self.capacity());
        let base = (*self.bytes.get()).as_mut_ptr();
        std::slice::from_raw_parts_mut(base.add(offset), len)
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if self.pinned {
            unpin_region(unsafe { (*self.bytes.get()).as_ptr() }, self.capacity());
        }
    }
}

/// A (data, target) pair of buffers that moves through the pipeline as a
/// unit. The target half always carries exactly one label per batch item;
/// the data half carries the variable-size raw items or the fixed-stride
/// decoded output.
pub struct BufferPair {
    pub data: Buffer,
    pub target: Buffer,
}

impl BufferPair {
    pub fn new(data_capacity: usize, target_capacity: usize, pinned: bool) -> Result<Self> {
        Ok(Self {
            data: Buffer::new(data_capacity, pinned)?,
            target: Buffer::new(target_capacity, pinned)?,
        })
    }

    /// Resets both halves for the next fill.
    pub fn clear(&mut self) {
        self.data.clear();
        self.target.clear();
    }
}

#[cfg(unix)]
fn pin_region(ptr: *const u8, len: usize) -> Result<()> {
    let rc = unsafe { libc::mlock(ptr as *const libc::c_void, len) };
    ensure!(
        rc == 0,
        "mlock of {} bytes failed: {}",
        len,
        std::io::Error::last_os_error()
    );
    Ok(())
}

#[cfg(unix)]
fn unpin_region(ptr: *const u8, len: usize) {
    unsafe {
        libc::munlock(ptr as *const libc::c_void, len);
    }
}

#[cfg(not(unix))]
fn pin_region(_ptr: *const u8, _len: usize) -> Result<()> {
    anyhow::bail!("pinned buffers are not supported on this platform");
}

#[cfg(not(unix))]
fn unpin_region(_ptr: *const u8, _len: usize) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_slice_back() -> Result<()> {
        let mut buf = Buffer::new(16, false)?;
        buf.append_item(&[1, 2, 3])?;
        buf.append_item(&[4])?;
        assert_eq!(buf.item_count(), 2);
        assert_eq!(buf.len(), 4);
        assert_eq!(buf.item(0), Some(&[1u8, 2, 3][..]));
        assert_eq!(buf.item(1), Some(&[4u8][..]));
        assert_eq!(buf.item(2), None);
        Ok(())
    }

    #[test]
    fn overflow_is_rejected() -> Result<()> {
        let mut buf = Buffer::new(4, false)?;
        buf.append_item(&[0; 3])?;
        assert!(buf.append_item(&[0; 2]).is_err());
        // The failed append must not corrupt the index.
        assert_eq!(buf.item_count(), 1);
        assert_eq!(buf.len(), 3);
        Ok(())
    }

    #[test]
    fn clear_resets_the_index() -> Result<()> {
        let mut buf = Buffer::new(8, false)?;
        buf.append_item(&[9, 9])?;
        buf.clear();
        assert_eq!(buf.item_count(), 0);
        assert!(buf.is_empty());
        assert_eq!(buf.item(0), None);
        Ok(())
    }

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(Buffer::new(0, false).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn pinned_buffer_reports_pinned() -> Result<()> {
        let buf = Buffer::new(64, true)?;
        assert!(buf.is_pinned());
        assert!(!Buffer::new(64, false)?.is_pinned());
        Ok(())
    }

    #[test]
    fn disjoint_regions_land_where_expected() -> Result<()> {
        let buf = Buffer::new(8, false)?;
        unsafe {
            buf.slice_mut(0, 4).copy_from_slice(&[1, 2, 3, 4]);
            buf.slice_mut(4, 4).copy_from_slice(&[5, 6, 7, 8]);
        }
        assert_eq!(buf.as_slice(), &[1, 2, 3, 4, 5, 6, 7, 8]);
        Ok(())
    }
}
