//! Configuration types for blocksnap
//!
//! This module defines configuration structures used across components.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for a block reader instance
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReaderConfig {
    /// Prefetch allocated blocks on a background thread
    pub readahead: bool,
    /// Bypass the OS page cache (O_DIRECT on Linux, F_NOCACHE on macOS)
    pub direct_io: bool,
    /// Tuning knobs
    pub tuning: ReaderTuning,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            readahead: true,
            direct_io: false,
            tuning: ReaderTuning::default(),
        }
    }
}

/// Tuning knobs for the buffer pool, retry policy and readahead engine
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ReaderTuning {
    /// Released buffers kept for reuse; excess releases are freed
    pub max_idle_buffers: usize,
    /// Prefetching pauses once this many blocks are cached
    pub readahead_high_blocks: usize,
    /// Prefetching resumes once the cache drains to this size
    pub readahead_low_blocks: usize,
    /// Total read attempts before a short read becomes a permanent fault
    pub read_attempts: u32,
    /// Backoff between read attempts
    pub retry_backoff_ms: u64,
}

impl Default for ReaderTuning {
    fn default() -> Self {
        Self {
            max_idle_buffers: 64,
            readahead_high_blocks: 5120,
            readahead_low_blocks: 2560,
            read_attempts: 20,
            retry_backoff_ms: 200,
        }
    }
}

impl ReaderTuning {
    /// Backoff between read attempts as a [`Duration`]
    #[must_use]
    pub const fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    /// Validate watermark and retry invariants
    pub fn validate(&self) -> Result<()> {
        if self.readahead_low_blocks > self.readahead_high_blocks {
            return Err(Error::config(format!(
                "low watermark {} exceeds high watermark {}",
                self.readahead_low_blocks, self.readahead_high_blocks
            )));
        }
        if self.readahead_high_blocks == 0 {
            return Err(Error::config("high watermark must be > 0"));
        }
        if self.read_attempts == 0 {
            return Err(Error::config("read attempts must be > 0"));
        }
        Ok(())
    }
}
