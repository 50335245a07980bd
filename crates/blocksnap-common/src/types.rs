//! Shared value types

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Fixed geometry of a block device or disk image
///
/// Both values are constant for the device's lifetime. Valid block
/// indices are `0..block_count()`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    /// Block size in bytes
    pub block_size: u32,
    /// Total device size in bytes
    pub total_size: u64,
}

impl Geometry {
    /// Create a validated geometry
    pub fn new(block_size: u32, total_size: u64) -> Result<Self> {
        if block_size == 0 {
            return Err(Error::geometry("block size must be > 0"));
        }
        Ok(Self {
            block_size,
            total_size,
        })
    }

    /// Number of addressable blocks
    #[must_use]
    pub const fn block_count(&self) -> u64 {
        self.total_size / self.block_size as u64
    }

    /// Bitmap length needed to cover every block, one bit per block
    #[must_use]
    pub const fn bitmap_bytes(&self) -> usize {
        self.block_count().div_ceil(8) as usize
    }

    /// Byte offset of the given block
    #[must_use]
    pub const fn block_offset(&self, block: u64) -> u64 {
        block * self.block_size as u64
    }
}
