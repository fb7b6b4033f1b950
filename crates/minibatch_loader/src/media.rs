//! src/media.rs
//!
//! The per-item transform seam.
//!
//! A [`Media`] turns one raw archive item (typically compressed image,
//! audio or video bytes) into a fixed-size decoded datum. Concrete codecs
//! live outside the pipeline; decode workers only rely on the transform
//! filling the destination slice completely, padding or cropping as the
//! codec sees fit.

use anyhow::Result;

/// Decodes one raw item into exactly `dst.len()` bytes.
///
/// Called concurrently from every decode worker, so implementations must
/// be `Send + Sync` and keep per-call state on the stack.
pub trait Media: Send + Sync {
    fn transform(&self, src: &[u8], dst: &mut [u8]) -> Result<()>;
}
