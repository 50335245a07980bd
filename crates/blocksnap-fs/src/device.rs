//! Device I/O with short-read retry
//!
//! A single read on a real block device may return fewer bytes than
//! requested. [`RetryingReader`] keeps re-reading the remainder with a
//! fixed backoff until the block is complete or the attempt budget is
//! spent; no partial result ever escapes.

use blocksnap_common::{Error, Result, config::ReaderTuning};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

/// An open, byte-addressable read source of known total size
///
/// Implemented by [`crate::RawFile`] for the owned-device case; callers
/// that keep ownership of their device hand in their own implementation
/// behind an `Arc`.
pub trait ByteSource: Send + Sync {
    /// Read up to `buf.len()` bytes at `offset`, returning the count read
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> std::io::Result<usize>;

    /// Total size of the source in bytes
    fn size(&self) -> u64;
}

/// Fill-or-fail reader over a [`ByteSource`]
pub struct RetryingReader {
    source: Arc<dyn ByteSource>,
    attempts: u32,
    backoff: Duration,
}

impl RetryingReader {
    /// Wrap a source with the retry policy from `tuning`
    pub fn new(source: Arc<dyn ByteSource>, tuning: &ReaderTuning) -> Self {
        Self {
            source,
            attempts: tuning.read_attempts.max(1),
            backoff: tuning.retry_backoff(),
        }
    }

    /// Total size of the underlying source in bytes
    #[must_use]
    pub fn source_size(&self) -> u64 {
        self.source.size()
    }

    /// Read exactly `buf.len()` bytes at `offset`
    ///
    /// Short reads and transient I/O errors are retried after the backoff,
    /// continuing from where the previous attempt stopped. Exhausting the
    /// attempt budget is a permanent fault.
    pub fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let wanted = buf.len();
        let mut got = 0usize;
        let mut attempt = 1u32;

        loop {
            match self.source.read_at(offset + got as u64, &mut buf[got..]) {
                Ok(n) => {
                    got += n;
                    if got == wanted {
                        return Ok(());
                    }
                    warn!(offset, got, wanted, attempt, "short read from device, retrying");
                }
                Err(err) => {
                    warn!(offset, attempt, %err, "device read failed, retrying");
                }
            }

            attempt += 1;
            if attempt > self.attempts {
                error!(offset, got, wanted, "device read failed permanently");
                return Err(Error::RetriesExhausted {
                    offset,
                    wanted,
                    got,
                    attempts: self.attempts,
                });
            }
            std::thread::sleep(self.backoff);
        }
    }
}
