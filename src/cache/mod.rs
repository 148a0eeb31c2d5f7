//! Generic query cache.
//!
//! This module provides an in-memory keyed cache of remote reads that:
//! - Serves cached data immediately and refetches stale entries in the background
//! - Coalesces concurrent fetches of one key into a single request
//! - Counts observers so invalidation only refetches what someone is watching
//! - Keeps the last known data when a refetch fails (stale-while-error)

mod admin;
mod entry;
mod key;
mod manager;

pub use admin::{CacheMetrics, KeyPattern, OptimizeReport};
pub use entry::{CacheEntry, CacheEvent, QuerySnapshot, QueryStatus, ReadOptions};
pub use key::CacheKey;
pub use manager::{CacheConfig, InvalidateFilter, QueryCache, QueryObserver};

pub(crate) use manager::SlotSnapshot;
