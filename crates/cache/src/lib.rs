//! # Strata Cache
//!
//! A process-local key/value cache with per-entry TTL and category/tag
//! invalidation. Keys encode their category as a stable, colon-delimited
//! prefix (`widget:active:all`, `query:media:find_many:…`), which is what
//! substring invalidation matches against.
//!
//! Multi-instance deployments get eventual consistency only: entries expire
//! after their category TTL and writers invalidate explicitly.

pub mod category;
pub mod error;
pub mod store;

pub use category::{CacheCategory, CategoryTtls};
pub use error::CacheError;
pub use store::{CacheLookup, CacheStats, CacheStore, SetOptions};
