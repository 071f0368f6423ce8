//! Configuration for the ember storage core.
//!
//! This module provides configuration structures for all database components.

mod database;

pub use database::{DatabaseConfig, StatementCacheConfig, StorageConfig};
