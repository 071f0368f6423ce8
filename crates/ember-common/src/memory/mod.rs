//! Memory management utilities.
//!
//! Provides the generational slot [`Arena`] that backs the row and node
//! graphs of in-core tables.

mod arena;

pub use arena::{Arena, Handle};
