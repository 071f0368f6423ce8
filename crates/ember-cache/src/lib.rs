//! Compiled-statement cache for the ember storage core.
//!
//! Sessions prepare SQL once and then refer to the compiled plan by a
//! [`StatementId`](ember_common::StatementId). The cache owns the plans and
//! counts, per session, how often each statement was prepared, so a
//! statement disappears when the last session releases it.
//!
//! # Example
//!
//! ```rust
//! use ember_cache::StatementCache;
//! use ember_common::config::StatementCacheConfig;
//! use ember_common::SessionId;
//!
//! let cache: StatementCache<Vec<u8>> = StatementCache::new(StatementCacheConfig::default());
//! let id = cache.register_statement(None, "DELETE FROM T", vec![1, 2, 3]).unwrap();
//! cache.link_session(id, SessionId::new(7)).unwrap();
//!
//! // a schema change invalidates plans but keeps their text
//! cache.reset_statements();
//! let plan = cache.compile_or_refresh(id, |_sql| Ok(vec![4])).unwrap();
//! assert_eq!(*plan, vec![4]);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod statement;
pub mod stats;

pub use statement::{normalize_sql, StatementCache};
pub use stats::CacheStats;
