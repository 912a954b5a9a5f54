//! Versioned response cache.
//!
//! The store is partitioned into named generations (`{app}-static-v{n}`,
//! `{app}-dynamic-v{n}`). Entries map a normalized request descriptor to an
//! immutable response snapshot. Nothing is evicted per entry; a generation
//! leaves the store as a whole when the lifecycle deletes it.

mod layer;
mod storage;
mod traits;

pub use layer::CacheLayer;
pub use storage::{CacheStorage, SqliteStorage};
pub use traits::{CachedEntry, Generation, RequestKey, ResponseSource, Served};
