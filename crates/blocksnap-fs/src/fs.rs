//! Block device abstraction
//!
//! [`Filesystem`] exposes a disk image or block device as fixed-size
//! blocks, answering existence from the provider's bitmap and reading
//! only allocated content. With readahead enabled, reads are served from
//! the background prefetch cache; without it they go straight to the
//! device through the retrying reader.

use crate::bitmap::UsedBitmap;
use crate::device::RetryingReader;
use crate::pool::{BlockBuf, BufferPool};
use crate::provider::VolumeProvider;
use crate::readahead::Readahead;
use blocksnap_common::{Geometry, Result, config::ReaderConfig};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, warn};

/// Sticky record of the first unrecoverable device fault
///
/// Once set it is never cleared; the caller must treat every subsequent
/// read as suspect and report the image as incomplete.
#[derive(Clone, Debug)]
pub struct Fault {
    /// Human-readable description of the first fault
    pub reason: String,
    /// When the device degraded
    pub since: Instant,
}

/// Shared state behind a [`Filesystem`], also visible to the readahead
/// worker thread.
pub(crate) struct FsInner {
    reader: RetryingReader,
    bitmap: UsedBitmap,
    geometry: Geometry,
    pool: BufferPool,
    fault: Mutex<Option<Fault>>,
}

impl FsInner {
    /// Synchronous seek+read of one allocated block into a pooled buffer
    ///
    /// A failure records the sticky fault and hands the buffer back.
    pub(crate) fn read_block_direct(&self, block: u64) -> Result<BlockBuf> {
        let mut buf = self.pool.acquire();
        let offset = self.geometry.block_offset(block);
        match self.reader.read_exact_at(offset, buf.as_mut_slice()) {
            Ok(()) => Ok(buf),
            Err(err) => {
                self.pool.release(buf);
                self.record_fault(&err);
                error!(block, %err, "reading block from device failed");
                Err(err)
            }
        }
    }

    pub(crate) fn bitmap(&self) -> &UsedBitmap {
        &self.bitmap
    }

    pub(crate) fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub(crate) fn fault(&self) -> Option<Fault> {
        self.fault.lock().clone()
    }

    fn record_fault(&self, err: &blocksnap_common::Error) {
        let mut fault = self.fault.lock();
        if fault.is_none() {
            *fault = Some(Fault {
                reason: err.to_string(),
                since: Instant::now(),
            });
        }
    }
}

/// Bitmap-driven block reader over one device
///
/// Consumer calls are expected to be serialized per instance; the only
/// concurrent party is the engine's own worker thread.
pub struct Filesystem {
    pub(crate) inner: Arc<FsInner>,
    readahead: Option<Readahead>,
}

impl Filesystem {
    /// Build a reader from a volume provider
    ///
    /// Starts the readahead worker when `config.readahead` is set; it is
    /// stopped and joined exactly once on drop.
    pub fn new(provider: &dyn VolumeProvider, config: &ReaderConfig) -> Result<Self> {
        config.tuning.validate()?;

        let geometry = Geometry::new(provider.block_size(), provider.total_size())?;
        let bitmap = UsedBitmap::new(provider.bitmap(), geometry.block_count())?;
        let reader = RetryingReader::new(provider.device(), &config.tuning);
        let pool = BufferPool::new(geometry.block_size as usize, config.tuning.max_idle_buffers);

        let inner = Arc::new(FsInner {
            reader,
            bitmap,
            geometry,
            pool,
            fault: Mutex::new(None),
        });

        let readahead = config
            .readahead
            .then(|| Readahead::start(Arc::clone(&inner), &config.tuning));

        Ok(Self { inner, readahead })
    }

    /// True iff the bitmap marks `block` as used
    ///
    /// Pure bitmap probe; never touches the device.
    #[must_use]
    pub fn has_block(&self, block: u64) -> bool {
        self.inner.bitmap.has_block(block)
    }

    /// Read one block
    ///
    /// `Ok(None)` for unused blocks. The returned buffer is owned by the
    /// caller and must eventually go back through [`release_buffer`].
    /// Device faults return `Err` and leave the sticky fault set.
    ///
    /// [`release_buffer`]: Filesystem::release_buffer
    pub fn read_block(&self, block: u64) -> Result<Option<BlockBuf>> {
        if !self.inner.bitmap.has_block(block) {
            return Ok(None);
        }
        let buf = match &self.readahead {
            Some(engine) => engine.get_block(block)?,
            None => self.inner.read_block_direct(block)?,
        };
        Ok(Some(buf))
    }

    /// Read a contiguous window of blocks into caller buffers
    ///
    /// Each delivered block is copied into the next unused `dests` slot at
    /// byte `offset` and its source buffer released. Returns the indices
    /// actually delivered, in order; unused blocks are skipped and failed
    /// blocks are skipped with the fault left sticky (the caller checks
    /// [`has_error`] after the sequence).
    ///
    /// [`has_error`]: Filesystem::has_error
    pub fn read_blocks(
        &self,
        start: u64,
        count: u64,
        dests: &mut [&mut [u8]],
        offset: usize,
    ) -> Vec<u64> {
        let block_size = self.inner.geometry.block_size as usize;
        let mut delivered = Vec::new();
        let mut slot = 0usize;

        for block in start..start.saturating_add(count) {
            if slot >= dests.len() {
                break;
            }
            match self.read_block(block) {
                Ok(Some(buf)) => {
                    dests[slot][offset..offset + block_size].copy_from_slice(buf.as_slice());
                    self.release_buffer(buf);
                    delivered.push(block);
                    slot += 1;
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(block, %err, "skipping unreadable block");
                }
            }
        }

        delivered
    }

    /// Bytes of allocated content on the volume
    ///
    /// Exact popcount over the bitmap limited to the block count.
    #[must_use]
    pub fn used_space(&self) -> u64 {
        self.inner.bitmap.used_blocks() * u64::from(self.inner.geometry.block_size)
    }

    /// Whether an unrecoverable device fault has occurred
    #[must_use]
    pub fn has_error(&self) -> bool {
        self.inner.fault.lock().is_some()
    }

    /// The first device fault, if any
    #[must_use]
    pub fn fault(&self) -> Option<Fault> {
        self.inner.fault()
    }

    /// Return a consumer-held block buffer to the pool
    pub fn release_buffer(&self, buf: BlockBuf) {
        self.inner.pool.release(buf);
    }

    /// Device geometry
    #[must_use]
    pub fn geometry(&self) -> Geometry {
        self.inner.geometry
    }

    /// Number of addressable blocks
    #[must_use]
    pub fn block_count(&self) -> u64 {
        self.inner.geometry.block_count()
    }

    /// Idle buffers currently pooled
    #[must_use]
    pub fn idle_buffers(&self) -> usize {
        self.inner.pool.idle_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::MemVolume;
    use bytes::Bytes;
    use rand::RngCore;

    const BS: u32 = 4096;

    fn scenario_volume() -> MemVolume {
        // 10 blocks, bits 1,0,1,1,0,0,0,0,1,0
        let mut data = vec![0u8; 10 * BS as usize];
        rand::thread_rng().fill_bytes(&mut data);
        let bitmap = Bytes::from(vec![0b0000_1101u8, 0b0000_0001u8]);
        MemVolume::new(BS, data, bitmap).unwrap()
    }

    fn direct_config() -> ReaderConfig {
        ReaderConfig {
            readahead: false,
            ..ReaderConfig::default()
        }
    }

    #[test]
    fn test_scenario_has_block_and_used_space() {
        let volume = scenario_volume();
        let fs = Filesystem::new(&volume, &direct_config()).unwrap();

        for block in 0..10 {
            assert_eq!(fs.has_block(block), matches!(block, 0 | 2 | 3 | 8));
        }
        assert_eq!(fs.used_space(), 4 * u64::from(BS));
        assert_eq!(fs.block_count(), 10);
    }

    #[test]
    fn test_read_block_matches_device_content() {
        let mut data = vec![0u8; 10 * BS as usize];
        rand::thread_rng().fill_bytes(&mut data);
        let volume = MemVolume::new(
            BS,
            data.clone(),
            Bytes::from(vec![0b0000_1101u8, 0b0000_0001u8]),
        )
        .unwrap();
        let fs = Filesystem::new(&volume, &direct_config()).unwrap();

        let buf = fs.read_block(3).unwrap().expect("block 3 is used");
        let offset = 3 * BS as usize;
        assert_eq!(buf.as_slice(), &data[offset..offset + BS as usize]);
        fs.release_buffer(buf);

        // Unused block: no data, no error
        assert!(fs.read_block(1).unwrap().is_none());
        assert!(!fs.has_error());
    }

    #[test]
    fn test_read_blocks_delivers_used_indices() {
        let volume = scenario_volume();
        let fs = Filesystem::new(&volume, &direct_config()).unwrap();

        let mut backing: Vec<Vec<u8>> = (0..10).map(|_| vec![0u8; BS as usize]).collect();
        let mut dests: Vec<&mut [u8]> = backing.iter_mut().map(Vec::as_mut_slice).collect();

        let delivered = fs.read_blocks(0, 10, &mut dests, 0);
        assert_eq!(delivered, vec![0, 2, 3, 8]);
        assert!(!fs.has_error());
    }

    #[test]
    fn test_read_blocks_with_destination_offset() {
        let volume = scenario_volume();
        let fs = Filesystem::new(&volume, &direct_config()).unwrap();

        let header = 16usize;
        let mut backing: Vec<Vec<u8>> =
            (0..4).map(|_| vec![0xeeu8; header + BS as usize]).collect();
        let mut dests: Vec<&mut [u8]> = backing.iter_mut().map(Vec::as_mut_slice).collect();

        let delivered = fs.read_blocks(0, 10, &mut dests, header);
        assert_eq!(delivered.len(), 4);
        // Bytes before the offset stay untouched
        assert!(backing.iter().all(|d| d[..header].iter().all(|&b| b == 0xee)));
    }

    #[test]
    fn test_buffers_return_to_pool() {
        let volume = scenario_volume();
        let fs = Filesystem::new(&volume, &direct_config()).unwrap();

        let buf = fs.read_block(0).unwrap().unwrap();
        assert_eq!(fs.idle_buffers(), 0);
        fs.release_buffer(buf);
        assert_eq!(fs.idle_buffers(), 1);
    }
}
