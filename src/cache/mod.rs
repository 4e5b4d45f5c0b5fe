//! Named response stores and the caching strategies built on them.
//!
//! This module provides:
//! - A storage trait for named, versioned stores of request/response pairs
//! - SQLite and in-memory backends
//! - Network-first and cache-first strategies with background write-back
//! - Atomic bulk population and purging of stale stores

mod layer;
mod storage;
mod traits;

pub use layer::CacheLayer;
pub use storage::{CacheStorage, MemoryStorage, SqliteStorage};
pub use traits::{CacheResult, CacheSource};
