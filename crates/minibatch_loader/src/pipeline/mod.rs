//! src/pipeline/mod.rs
//!
//! The three-stage loading pipeline.
//!
//! ```text
//! Reader ──> ReadStage ──> read pool ──> Manager ──> decode workers
//!                        (depth 2)          │       (disjoint slices)
//!                                           v
//!                                      decode pool ──> device staging
//!                                        (depth 2)      (slot 0 / 1)
//! ```
//!
//! Each stage blocks only on its neighboring pool's emptiness or fullness,
//! plus the manager's per-batch dispatch and join barriers. The
//! [`Loader`] owns the wiring and the lifecycle.

pub(crate) mod config;
pub(crate) mod decode;
pub(crate) mod loader;
pub(crate) mod read_stage;

pub use config::{LoaderConfig, LoaderConfigBuilder};
pub use loader::Loader;

use std::sync::Mutex;

/// First-failure record shared by every stage.
///
/// Stages report fatal conditions here instead of panicking; the consumer
/// surfaces the recorded message from `next()` once the pipeline drains.
#[derive(Default)]
pub(crate) struct PipelineStatus {
    message: Mutex<Option<String>>,
}

impl PipelineStatus {
    /// Records a fatal condition. The first failure wins; later ones are
    /// logged and dropped.
    pub(crate) fn fail(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::error!(error = %message, "pipeline failure");
        let mut slot = self.message.lock().unwrap();
        if slot.is_none() {
            *slot = Some(message);
        }
    }

    /// The recorded failure, or `fallback` when the pipeline stopped
    /// without one (plain shutdown).
    pub(crate) fn to_error(&self, fallback: &str) -> anyhow::Error {
        let slot = self.message.lock().unwrap();
        match slot.as_deref() {
            Some(message) => anyhow::anyhow!("{}", message),
            None => anyhow::anyhow!("{}", fallback),
        }
    }

    pub(crate) fn clear(&self) {
        *self.message.lock().unwrap() = None;
    }
}
