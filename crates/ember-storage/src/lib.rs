//! # ember-storage
//!
//! Storage core of the ember embedded database.
//!
//! This crate provides:
//! - A scaled page file with memory-mapped and classic access
//! - Row and node graphs held in a generational arena
//! - AVL indexes with one node per row per index
//! - Tables with identity columns, column limits and constraints
//! - A referential cascade engine for deletes and updates
//! - A buffered data file cache for disk tables
//! - Bounded in-core row values for disk tables, reloaded on demand
//! - Offline defragmentation of the data file

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Data file cache and record layout
pub mod cache;

/// Row format codecs
pub mod codec;

/// Database registry
pub mod database;

/// Data file compaction
pub mod defrag;

/// Scaled page file I/O
pub mod file;

/// AVL indexes
pub mod index;

/// Rows and index nodes
pub mod row;

/// Tables, constraints and cascades
pub mod table;

pub use cache::DataFileCache;
pub use database::{Database, ForeignKeyDef};
pub use index::{Index, IndexDef};
pub use row::{NodeRef, RowRef};
pub use table::{Column, Table, TableDef, TableKind};
