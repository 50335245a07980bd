//! End-to-end backup stream tests over the public API

use blocksnap_common::config::{ReaderConfig, ReaderTuning};
use blocksnap_fs::{ByteSource, Filesystem, MemVolume, RawImageVolume, VolumeProvider};
use bytes::Bytes;
use rand::{Rng, RngCore};
use std::io::Write;
use std::sync::Arc;
use tempfile::NamedTempFile;

const BS: u32 = 4096;

fn random_volume(blocks: usize, density: f64) -> (MemVolume, Vec<u8>, Vec<bool>) {
    let mut rng = rand::thread_rng();
    let mut data = vec![0u8; blocks * BS as usize];
    rng.fill_bytes(&mut data);

    let used: Vec<bool> = (0..blocks).map(|_| rng.gen_bool(density)).collect();
    let mut bitmap = vec![0u8; blocks.div_ceil(8)];
    for (i, &bit) in used.iter().enumerate() {
        if bit {
            bitmap[i / 8] |= 1 << (i % 8);
        }
    }

    let volume = MemVolume::new(BS, data.clone(), Bytes::from(bitmap)).unwrap();
    (volume, data, used)
}

fn stream(fs: &Filesystem) -> Vec<(u64, Vec<u8>)> {
    let mut out = Vec::new();
    for block in 0..fs.block_count() {
        if let Some(buf) = fs.read_block(block).unwrap() {
            out.push((block, buf.to_vec()));
            fs.release_buffer(buf);
        }
    }
    out
}

/// The readahead path and the direct path must produce identical streams.
#[test]
fn test_readahead_stream_equals_direct_stream() {
    let (volume, data, used) = random_volume(200, 0.6);

    let tuning = ReaderTuning {
        readahead_high_blocks: 16,
        readahead_low_blocks: 8,
        ..ReaderTuning::default()
    };
    let prefetched = Filesystem::new(
        &volume,
        &ReaderConfig {
            readahead: true,
            tuning,
            ..ReaderConfig::default()
        },
    )
    .unwrap();
    let direct = Filesystem::new(
        &volume,
        &ReaderConfig {
            readahead: false,
            ..ReaderConfig::default()
        },
    )
    .unwrap();

    let a = stream(&prefetched);
    let b = stream(&direct);
    assert_eq!(a, b);

    // Both streams also match the raw image and the bitmap.
    for (block, content) in &a {
        assert!(used[*block as usize]);
        let offset = (*block as usize) * BS as usize;
        assert_eq!(content.as_slice(), &data[offset..offset + BS as usize]);
    }
    assert_eq!(a.len(), used.iter().filter(|&&b| b).count());
    assert!(!prefetched.has_error());
}

/// Full image copy from a file-backed volume with a sidecar bitmap.
#[test]
fn test_image_copy_with_sidecar_bitmap() {
    let mut rng = rand::thread_rng();
    let mut data = vec![0u8; 10 * BS as usize];
    rng.fill_bytes(&mut data);

    let mut image = NamedTempFile::new().unwrap();
    image.write_all(&data).unwrap();
    image.flush().unwrap();

    // Blocks 0, 2, 3 and 8 are allocated.
    let mut sidecar = NamedTempFile::new().unwrap();
    sidecar.write_all(&[0b0000_1101, 0b0000_0001]).unwrap();
    sidecar.flush().unwrap();

    let volume = RawImageVolume::open(image.path(), BS, Some(sidecar.path()), false).unwrap();
    let fs = Filesystem::new(&volume, &ReaderConfig::default()).unwrap();

    assert_eq!(fs.block_count(), 10);
    assert_eq!(fs.used_space(), 4 * u64::from(BS));

    let copied = stream(&fs);
    let blocks: Vec<u64> = copied.iter().map(|(b, _)| *b).collect();
    assert_eq!(blocks, vec![0, 2, 3, 8]);
    for (block, content) in &copied {
        let offset = (*block as usize) * BS as usize;
        assert_eq!(content.as_slice(), &data[offset..offset + BS as usize]);
    }
    assert!(!fs.has_error());
}

/// Volume whose device fails for exactly one block.
struct OneBadBlock {
    data: Vec<u8>,
    bad_block: u64,
}

struct OneBadSource {
    data: Vec<u8>,
    bad_block: u64,
}

impl ByteSource for OneBadSource {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> std::io::Result<usize> {
        let bad_start = self.bad_block * u64::from(BS);
        if offset >= bad_start && offset < bad_start + u64::from(BS) {
            return Err(std::io::Error::other("simulated medium error"));
        }
        let offset = offset as usize;
        let n = buf.len().min(self.data.len().saturating_sub(offset));
        buf[..n].copy_from_slice(&self.data[offset..offset + n]);
        Ok(n)
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

impl VolumeProvider for OneBadBlock {
    fn block_size(&self) -> u32 {
        BS
    }

    fn total_size(&self) -> u64 {
        self.data.len() as u64
    }

    fn bitmap(&self) -> Bytes {
        Bytes::from(vec![0xff; (self.data.len() / BS as usize).div_ceil(8)])
    }

    fn device(&self) -> Arc<dyn ByteSource> {
        Arc::new(OneBadSource {
            data: self.data.clone(),
            bad_block: self.bad_block,
        })
    }
}

/// A bad block is skipped, the rest of the window is still delivered and
/// the fault stays sticky for the caller to inspect afterwards.
#[test]
fn test_bad_block_is_skipped_and_fault_is_sticky() {
    let volume = OneBadBlock {
        data: vec![0xabu8; 8 * BS as usize],
        bad_block: 2,
    };
    let config = ReaderConfig {
        readahead: false,
        tuning: ReaderTuning {
            read_attempts: 2,
            retry_backoff_ms: 0,
            ..ReaderTuning::default()
        },
        ..ReaderConfig::default()
    };
    let fs = Filesystem::new(&volume, &config).unwrap();

    let mut backing: Vec<Vec<u8>> = (0..8).map(|_| vec![0u8; BS as usize]).collect();
    let mut dests: Vec<&mut [u8]> = backing.iter_mut().map(Vec::as_mut_slice).collect();

    let delivered = fs.read_blocks(0, 8, &mut dests, 0);
    assert_eq!(delivered, vec![0, 1, 3, 4, 5, 6, 7]);
    assert!(fs.has_error());

    let fault = fs.fault().expect("fault recorded");
    assert!(!fault.reason.is_empty());

    // Sticky: later successful reads do not clear it.
    let buf = fs.read_block(0).unwrap().unwrap();
    fs.release_buffer(buf);
    assert!(fs.has_error());
}

/// No buffer is leaked when the engine is torn down with a full cache.
#[test]
fn test_engine_teardown_releases_cached_buffers() {
    let (volume, _, _) = random_volume(64, 1.0);
    let tuning = ReaderTuning {
        readahead_high_blocks: 8,
        readahead_low_blocks: 4,
        ..ReaderTuning::default()
    };
    let fs = Filesystem::new(
        &volume,
        &ReaderConfig {
            readahead: true,
            tuning,
            ..ReaderConfig::default()
        },
    )
    .unwrap();

    // Prime the prefetcher, then drop with a warm cache.
    let buf = fs.read_block(0).unwrap().unwrap();
    fs.release_buffer(buf);
    drop(fs);
}
