//! Threaded minibatch loader for training pipelines.
//!
//! Streams items from a persistent archive, decodes them in parallel and
//! stages fixed-size minibatches into device-visible memory, so a
//! training loop never stalls on I/O or decoding. Three long-lived
//! stages are connected by depth-2 buffer pools with backpressure in
//! both directions:
//!
//! 1. A read thread fills raw input pairs from the [`Reader`].
//! 2. A pool of decode workers fans one batch out across disjoint
//!    slices of the output pair, running the [`Media`] transform.
//! 3. A manager thread dispatches and joins each batch, transposes the
//!    decoded data to datum-major order and copies it to the [`Device`].
//!
//! Batches reach the consumer in exactly the order the reader produced
//! them. See [`Loader`] for the lifecycle and [`LoaderConfig`] for
//! sizing.

pub mod buffer;
pub mod device;
pub mod media;
pub mod pipeline;
pub mod pool;
pub mod reader;
pub mod transpose;

pub use buffer::{Buffer, BufferPair};
pub use device::{CpuDevice, Device, DeviceKind};
pub use media::Media;
pub use pipeline::{Loader, LoaderConfig, LoaderConfigBuilder};
pub use pool::BufferPool;
pub use reader::{Reader, ReaderConfig, ReaderConfigBuilder};
