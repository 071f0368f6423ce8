//! # ember-common
//!
//! Common types, errors, and utilities for the ember storage core.
//!
//! This crate provides the foundational types shared by the storage and
//! statement-cache crates. It includes:
//!
//! - **Types**: Identifiers (`TableId`, `ConstraintId`, `StatementId`, `DiskKey`) and SQL values
//! - **Errors**: Unified error handling with `EmberError`
//! - **Memory**: The generational slot arena backing row and node graphs
//! - **Config**: Storage and statement cache configuration
//! - **Constants**: Data file layout and default limits
//!
//! ## Example
//!
//! ```rust
//! use ember_common::types::{CompareOptions, Value};
//! use ember_common::error::EmberResult;
//!
//! fn example() -> EmberResult<()> {
//!     let opts = CompareOptions::default();
//!     assert!(Value::Null.compare(&Value::Integer(1), &opts).is_lt());
//!     Ok(())
//! }
//! # example().unwrap();
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod constants;
pub mod error;
pub mod memory;
pub mod types;

// Re-export commonly used items at the crate root
pub use constants::*;
pub use error::{EmberError, EmberResult, ErrorCode};
pub use types::{CompareOptions, ConstraintId, DataType, DiskKey, SessionId, StatementId, TableId, Value};
