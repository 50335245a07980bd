//! Blocksnap block reader core
//!
//! This crate turns a raw block device or disk-image file into a sequence
//! of fixed-size blocks for a backup stream:
//! - Retrying positional device I/O (optionally O_DIRECT / F_NOCACHE)
//! - A bounded pool of reusable block buffers
//! - A bitmap-driven block device abstraction that skips unused blocks
//! - A single-thread readahead engine with watermark backpressure and
//!   miss-driven synchronous catch-up

pub mod bitmap;
pub mod device;
pub mod fs;
pub mod pool;
pub mod provider;
pub mod raw_io;
mod readahead;

// Re-exports
pub use bitmap::UsedBitmap;
pub use device::{ByteSource, RetryingReader};
pub use fs::{Fault, Filesystem};
pub use pool::{BlockBuf, BufferPool};
pub use provider::{MemVolume, RawImageVolume, VolumeProvider};
pub use raw_io::{ALIGNMENT, RawFile};
