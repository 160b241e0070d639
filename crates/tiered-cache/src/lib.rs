//! Two-tier get-or-create cache with stampede protection and tag-based
//! invalidation.
//!
//! Lookups go local tier first, then the shared tier, then the supplied
//! factory; a shared-tier hit backfills the local tier. Within a process at
//! most one factory execution runs per key at a time. The shared tier is a
//! black-box key/value store with TTL support; when it is unreachable the
//! cache fails open and the factory runs as if on a miss, so a cache outage
//! never becomes a user-visible failure.

#![deny(missing_docs)]

mod cache;
mod entry;
mod error;
mod tier;

pub use cache::TieredCache;
pub use entry::EntryOptions;
pub use error::CacheError;
pub use tier::{MemoryTier, RedisTier, SharedTier, TierError};
