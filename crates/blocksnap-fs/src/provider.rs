//! Volume providers
//!
//! The core never parses filesystem metadata itself; a provider supplies
//! the geometry, the used-block bitmap, and an open device handle.
//! Format-specific providers (NTFS, ext...) live outside this crate and
//! only need to implement [`VolumeProvider`].

use crate::device::ByteSource;
use crate::raw_io::RawFile;
use blocksnap_common::{Error, Geometry, Result};
use bytes::Bytes;
use std::path::Path;
use std::sync::Arc;

/// Source of everything the block reader needs to know about a volume
pub trait VolumeProvider: Send + Sync {
    /// Block size in bytes; constant, > 0
    fn block_size(&self) -> u32;

    /// Total device size in bytes; constant for the device's lifetime
    fn total_size(&self) -> u64;

    /// Used-block bitmap, at least `ceil(total/block/8)` bytes, stable
    /// for the device's lifetime
    fn bitmap(&self) -> Bytes;

    /// The open device handle
    fn device(&self) -> Arc<dyn ByteSource>;
}

/// Format-agnostic provider over a raw image file or block device
///
/// The bitmap comes from a sidecar file; without one every block is
/// treated as used (a full-device copy).
#[derive(Debug)]
pub struct RawImageVolume {
    device: Arc<RawFile>,
    geometry: Geometry,
    bitmap: Bytes,
}

impl RawImageVolume {
    /// Open an image or device, with an optional sidecar bitmap file
    pub fn open(
        image: impl AsRef<Path>,
        block_size: u32,
        bitmap_path: Option<&Path>,
        direct_io: bool,
    ) -> Result<Self> {
        let device = Arc::new(RawFile::open(image, direct_io)?);
        let geometry = Geometry::new(block_size, device.size())?;

        let bitmap = match bitmap_path {
            Some(path) => {
                let bytes = std::fs::read(path).map_err(|source| Error::OpenDevice {
                    path: path.to_string_lossy().to_string(),
                    source,
                })?;
                if bytes.len() < geometry.bitmap_bytes() {
                    return Err(Error::BitmapTooShort {
                        expected: geometry.bitmap_bytes(),
                        actual: bytes.len(),
                    });
                }
                Bytes::from(bytes)
            }
            None => Bytes::from(vec![0xff; geometry.bitmap_bytes()]),
        };

        Ok(Self {
            device,
            geometry,
            bitmap,
        })
    }
}

impl VolumeProvider for RawImageVolume {
    fn block_size(&self) -> u32 {
        self.geometry.block_size
    }

    fn total_size(&self) -> u64 {
        self.geometry.total_size
    }

    fn bitmap(&self) -> Bytes {
        self.bitmap.clone()
    }

    fn device(&self) -> Arc<dyn ByteSource> {
        Arc::clone(&self.device) as Arc<dyn ByteSource>
    }
}

/// In-memory volume, mainly for embedding and tests
pub struct MemVolume {
    device: Arc<MemSource>,
    block_size: u32,
    bitmap: Bytes,
}

struct MemSource(Vec<u8>);

impl ByteSource for MemSource {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> std::io::Result<usize> {
        let offset = offset as usize;
        if offset >= self.0.len() {
            return Ok(0);
        }
        let n = buf.len().min(self.0.len() - offset);
        buf[..n].copy_from_slice(&self.0[offset..offset + n]);
        Ok(n)
    }

    fn size(&self) -> u64 {
        self.0.len() as u64
    }
}

impl MemVolume {
    /// Build a volume over `data` with the given block size and bitmap
    pub fn new(block_size: u32, data: Vec<u8>, bitmap: Bytes) -> Result<Self> {
        let geometry = Geometry::new(block_size, data.len() as u64)?;
        if bitmap.len() < geometry.bitmap_bytes() {
            return Err(Error::BitmapTooShort {
                expected: geometry.bitmap_bytes(),
                actual: bitmap.len(),
            });
        }
        Ok(Self {
            device: Arc::new(MemSource(data)),
            block_size,
            bitmap,
        })
    }
}

impl VolumeProvider for MemVolume {
    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn total_size(&self) -> u64 {
        self.device.0.len() as u64
    }

    fn bitmap(&self) -> Bytes {
        self.bitmap.clone()
    }

    fn device(&self) -> Arc<dyn ByteSource> {
        Arc::clone(&self.device) as Arc<dyn ByteSource>
    }
}
