//! Error handling for the ember storage core.
//!
//! This module provides a unified error type and result alias used
//! across all ember crates.

mod database;

pub use database::{EmberError, ErrorCode};

/// Result type alias for ember operations.
pub type EmberResult<T> = std::result::Result<T, EmberError>;
