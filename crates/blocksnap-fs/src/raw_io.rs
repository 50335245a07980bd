//! Platform-specific raw device access
//!
//! Opens disk images and block devices read-only, optionally bypassing
//! the OS page cache:
//! - Linux: O_DIRECT flag
//! - macOS: F_NOCACHE fcntl
//!
//! With direct I/O enabled the block size must be a multiple of the
//! sector size; the pooled buffers are alignment-padded accordingly.

use crate::device::ByteSource;
use blocksnap_common::{Error, Result};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

#[cfg(target_os = "linux")]
use std::os::unix::fs::OpenOptionsExt;

/// Alignment requirement for direct I/O (typically 4KB or 512 bytes)
pub const ALIGNMENT: usize = 4096;

/// Read-only raw device handle with direct I/O support
///
/// Works for both regular disk-image files and block devices; for the
/// latter the size is queried from the kernel rather than the metadata.
#[derive(Debug)]
pub struct RawFile {
    file: File,
    path: String,
    size: u64,
}

impl RawFile {
    /// Open a disk image or block device for reading
    pub fn open(path: impl AsRef<Path>, direct_io: bool) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();

        let mut options = OpenOptions::new();
        options.read(true);

        // Platform-specific direct I/O flags
        #[cfg(target_os = "linux")]
        if direct_io {
            // O_DIRECT bypasses the page cache on Linux
            options.custom_flags(libc::O_DIRECT);
        }

        let file = options.open(&path).map_err(|source| Error::OpenDevice {
            path: path_str.clone(),
            source,
        })?;

        // On macOS, use F_NOCACHE after opening
        #[cfg(target_os = "macos")]
        if direct_io {
            use std::os::unix::io::AsRawFd;
            #[allow(unsafe_code)]
            let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_NOCACHE, 1) };
            if rc == -1 {
                return Err(Error::OpenDevice {
                    path: path_str,
                    source: std::io::Error::last_os_error(),
                });
            }
        }

        #[cfg(not(any(target_os = "linux", target_os = "macos")))]
        let _ = direct_io;

        let metadata = file.metadata().map_err(|source| Error::OpenDevice {
            path: path_str.clone(),
            source,
        })?;

        // Get file/device size
        let size = if Self::is_block_device(&metadata) {
            Self::block_device_size(&file, &path_str)?
        } else {
            metadata.len()
        };

        Ok(Self {
            file,
            path: path_str,
            size,
        })
    }

    /// Check if the open handle refers to a block device
    fn is_block_device(metadata: &std::fs::Metadata) -> bool {
        use std::os::unix::fs::FileTypeExt;
        metadata.file_type().is_block_device()
    }

    /// Get block device size using ioctl
    #[cfg(target_os = "linux")]
    fn block_device_size(file: &File, path: &str) -> Result<u64> {
        use std::os::unix::io::AsRawFd;

        // BLKGETSIZE64 ioctl
        const BLKGETSIZE64: libc::c_ulong = 0x8008_1272;

        let mut size: u64 = 0;
        #[allow(unsafe_code)]
        let ret = unsafe { libc::ioctl(file.as_raw_fd(), BLKGETSIZE64, &raw mut size) };

        if ret == -1 {
            return Err(Error::OpenDevice {
                path: path.to_string(),
                source: std::io::Error::last_os_error(),
            });
        }

        Ok(size)
    }

    /// Get block device size (non-Linux fallback)
    #[cfg(not(target_os = "linux"))]
    fn block_device_size(file: &File, path: &str) -> Result<u64> {
        use std::io::{Seek, SeekFrom};
        let mut f = file;
        f.seek(SeekFrom::End(0)).map_err(|source| Error::OpenDevice {
            path: path.to_string(),
            source,
        })
    }

    /// Get the device size in bytes
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Get the device path
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl ByteSource for RawFile {
    /// Positional read; carries no seek state, so the readahead worker
    /// and direct readers can share one handle.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> std::io::Result<usize> {
        FileExt::read_at(&self.file, buf, offset)
    }

    fn size(&self) -> u64 {
        self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_open_regular_file() {
        let mut temp = NamedTempFile::new().unwrap();
        temp.write_all(&[0xabu8; 8192]).unwrap();
        temp.flush().unwrap();

        let raw = RawFile::open(temp.path(), false).unwrap();
        assert_eq!(ByteSource::size(&raw), 8192);

        let mut buf = vec![0u8; 4096];
        let n = raw.read_at(4096, &mut buf).unwrap();
        assert_eq!(n, 4096);
        assert!(buf.iter().all(|&b| b == 0xab));
    }

    #[test]
    fn test_open_missing_file() {
        let err = RawFile::open("/nonexistent/blocksnap-test", false).unwrap_err();
        assert!(err.is_device_fault());
        assert!(err.to_string().contains("/nonexistent/blocksnap-test"));
    }

    #[test]
    fn test_read_past_end_is_short() {
        let mut temp = NamedTempFile::new().unwrap();
        temp.write_all(&[1u8; 100]).unwrap();
        temp.flush().unwrap();

        let raw = RawFile::open(temp.path(), false).unwrap();
        let mut buf = vec![0u8; 4096];
        let n = raw.read_at(0, &mut buf).unwrap();
        assert_eq!(n, 100);
    }
}
