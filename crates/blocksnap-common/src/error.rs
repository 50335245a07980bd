//! Error types for blocksnap
//!
//! This module defines the common error type used throughout the system.

use thiserror::Error;

/// Common result type for blocksnap operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for blocksnap
#[derive(Debug, Error)]
pub enum Error {
    // Device errors
    #[error("device I/O error: {0}")]
    DeviceIo(#[from] std::io::Error),

    #[error("failed to open {path}: {source}")]
    OpenDevice {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(
        "read at offset {offset} still short after {attempts} attempts: \
         got {got} of {wanted} bytes"
    )]
    RetriesExhausted {
        offset: u64,
        wanted: usize,
        got: usize,
        attempts: u32,
    },

    #[error("read of block {block} failed: {reason}")]
    BlockReadFailed { block: u64, reason: String },

    // Construction errors
    #[error("invalid device geometry: {0}")]
    InvalidGeometry(String),

    #[error("bitmap too short: need {expected} bytes, got {actual}")]
    BitmapTooShort { expected: usize, actual: usize },

    // Lifecycle errors
    #[error("readahead engine stopped")]
    EngineStopped,

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl Error {
    /// Create an invalid geometry error
    pub fn geometry(msg: impl Into<String>) -> Self {
        Self::InvalidGeometry(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Check if this error indicates a (now permanent) device fault
    #[must_use]
    pub fn is_device_fault(&self) -> bool {
        matches!(
            self,
            Self::DeviceIo(_)
                | Self::OpenDevice { .. }
                | Self::RetriesExhausted { .. }
                | Self::BlockReadFailed { .. }
        )
    }
}
