//! Blocksnap Common - Shared types and utilities
//!
//! This crate provides the error type, device geometry, and configuration
//! structures used across all blocksnap components.

pub mod config;
pub mod error;
pub mod types;

pub use config::{ReaderConfig, ReaderTuning};
pub use error::{Error, Result};
pub use types::Geometry;
