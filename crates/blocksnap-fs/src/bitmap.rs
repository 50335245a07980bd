//! Used-block bitmap
//!
//! One bit per block, bit `i` set ⇔ block `i` holds allocated filesystem
//! content. Bit `i` lives at byte `i / 8`, bit `i % 8`. The bitmap is
//! provider-supplied and read-only for the device's lifetime.

use blocksnap_common::{Error, Result};
use bytes::Bytes;

/// Read-only allocation bitmap covering `block_count` blocks
#[derive(Clone, Debug)]
pub struct UsedBitmap {
    bits: Bytes,
    block_count: u64,
}

impl UsedBitmap {
    /// Wrap provider-supplied bitmap bytes
    ///
    /// `bits` must cover at least `ceil(block_count / 8)` bytes; any
    /// trailing bits past `block_count` are ignored by every query.
    pub fn new(bits: Bytes, block_count: u64) -> Result<Self> {
        let expected = block_count.div_ceil(8) as usize;
        if bits.len() < expected {
            return Err(Error::BitmapTooShort {
                expected,
                actual: bits.len(),
            });
        }
        Ok(Self { bits, block_count })
    }

    /// Number of blocks this bitmap covers
    #[must_use]
    pub fn block_count(&self) -> u64 {
        self.block_count
    }

    /// True iff `block` is in range and its bit is set
    #[must_use]
    pub fn has_block(&self, block: u64) -> bool {
        if block >= self.block_count {
            return false;
        }
        let byte = self.bits[(block / 8) as usize];
        byte & (1 << (block % 8)) != 0
    }

    /// Index of the first used block at or after `from`, if any
    ///
    /// Fast-forwards over whole zero bytes so large unused regions cost
    /// one comparison per 8 blocks.
    #[must_use]
    pub fn next_used(&self, mut from: u64) -> Option<u64> {
        while from < self.block_count {
            if from % 8 == 0 && self.bits[(from / 8) as usize] == 0 {
                from += 8;
                continue;
            }
            if self.has_block(from) {
                return Some(from);
            }
            from += 1;
        }
        None
    }

    /// Exact number of used blocks
    ///
    /// The final byte is masked so counting stops at `block_count`, not at
    /// the byte boundary.
    #[must_use]
    pub fn used_blocks(&self) -> u64 {
        let full_bytes = (self.block_count / 8) as usize;
        let mut used: u64 = self.bits[..full_bytes]
            .iter()
            .map(|b| u64::from(b.count_ones()))
            .sum();

        let rem = (self.block_count % 8) as u32;
        if rem > 0 {
            let mask = (1u8 << rem) - 1;
            used += u64::from((self.bits[full_bytes] & mask).count_ones());
        }
        used
    }
}
