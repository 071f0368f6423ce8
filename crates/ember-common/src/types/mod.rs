//! Type definitions for the ember storage core.
//!
//! This module contains the identifiers and value types used across crates.

mod ids;
mod value;

pub use ids::{ConstraintId, DiskKey, SessionId, StatementId, TableId};
pub use value::{CompareOptions, DataType, Value};
