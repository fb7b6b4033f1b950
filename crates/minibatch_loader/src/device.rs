//! src/device.rs
//!
//! The accelerator seam and the host-memory device.
//!
//! The pipeline stages decoded minibatches into one of two device-side
//! regions, toggling the slot after every batch so the training consumer
//! can read slot `k` while slot `1 - k` is being written. Real drivers
//! (CUDA and friends) implement [`Device`] out of crate; [`CpuDevice`]
//! ships here both as the host-only backend and as the reference for the
//! slot discipline.

use anyhow::{ensure, Result};
use std::sync::Mutex;

/// Device class, consulted when sizing host buffers: everything except
/// [`DeviceKind::Cpu`] gets page-locked decode buffers for DMA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Cpu,
    Cuda,
}

/// Staging target for decoded minibatches.
pub trait Device: Send + Sync {
    /// Binds and prepares device resources. Called once, from the thread
    /// that will issue every copy.
    fn init(&self) -> Result<()>;

    fn kind(&self) -> DeviceKind;

    /// Stages decoded data into device-visible region `slot` (0 or 1).
    fn copy_data(&self, slot: usize, src: &[u8]) -> Result<()>;

    /// Stages labels into device-visible region `slot` (0 or 1).
    fn copy_labels(&self, slot: usize, src: &[u8]) -> Result<()>;
}

/// Host-memory device: staging regions are plain heap buffers.
///
/// Each slot has its own lock so the consumer can read one slot while
/// the pipeline writes the other.
#[derive(Default)]
pub struct CpuDevice {
    slots: [StagingSlot; 2],
}

#[derive(Default)]
struct StagingSlot {
    data: Mutex<Vec<u8>>,
    labels: Mutex<Vec<u8>>,
}

impl CpuDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the data staged in `slot`.
    pub fn data(&self, slot: usize) -> Vec<u8> {
        self.slots[slot].data.lock().unwrap().clone()
    }

    /// Copy of the labels staged in `slot`.
    pub fn labels(&self, slot: usize) -> Vec<u8> {
        self.slots[slot].labels.lock().unwrap().clone()
    }
}

impl Device for CpuDevice {
    fn init(&self) -> Result<()> {
        Ok(())
    }

    fn kind(&self) -> DeviceKind {
        DeviceKind::Cpu
    }

    fn copy_data(&self, slot: usize, src: &[u8]) -> Result<()> {
        ensure!(slot < 2, "device slot out of range: {}", slot);
        let mut staged = self.slots[slot].data.lock().unwrap();
        staged.clear();
        staged.extend_from_slice(src);
        Ok(())
    }

    fn copy_labels(&self, slot: usize, src: &[u8]) -> Result<()> {
        ensure!(slot < 2, "device slot out of range: {}", slot);
        let mut staged = self.slots[slot].labels.lock().unwrap();
        staged.clear();
        staged.extend_from_slice(src);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_are_independent() -> Result<()> {
        let device = CpuDevice::new();
        device.copy_data(0, &[1, 2])?;
        device.copy_data(1, &[3, 4])?;
        device.copy_labels(0, &[9])?;
        assert_eq!(device.data(0), vec![1, 2]);
        assert_eq!(device.data(1), vec![3, 4]);
        assert_eq!(device.labels(0), vec![9]);
        assert!(device.labels(1).is_empty());
        Ok(())
    }

    #[test]
    fn out_of_range_slot_is_rejected() {
        let device = CpuDevice::new();
        assert!(device.copy_data(2, &[0]).is_err());
        assert!(device.copy_labels(7, &[0]).is_err());
    }
}
