//! Shared (distributed) tier backends.

use std::time::Duration;

use bytes::Bytes;

mod memory;
mod redis;

pub use memory::MemoryTier;
pub use redis::RedisTier;

/// Errors produced by a shared tier backend.
///
/// These never escape the cache: every operation treats them as a miss and
/// logs the failure.
#[derive(Debug, thiserror::Error)]
pub enum TierError {
    /// Could not reach the backend.
    #[error("Shared tier connection error: {0}")]
    Connection(String),
    /// The backend rejected or failed a command.
    #[error("Shared tier query error: {0}")]
    Query(String),
    /// The backend did not answer within the configured response timeout.
    #[error("Shared tier timed out after {0:?}")]
    Timeout(Duration),
}

/// Shared tier backend, dispatching to the configured implementation.
pub enum SharedTier {
    /// In-process backend, used when no connection is configured and in
    /// tests.
    Memory(MemoryTier),
    /// Redis-backed shared tier.
    Redis(RedisTier),
}

impl SharedTier {
    pub(crate) async fn get(&self, key: &str) -> Result<Option<Bytes>, TierError> {
        match self {
            Self::Memory(tier) => tier.get(key).await,
            Self::Redis(tier) => tier.get(key).await,
        }
    }

    pub(crate) async fn set(&self, key: &str, payload: Bytes, ttl: Duration, tags: &[String]) -> Result<(), TierError> {
        match self {
            Self::Memory(tier) => tier.set(key, payload, ttl, tags).await,
            Self::Redis(tier) => tier.set(key, payload, ttl, tags).await,
        }
    }

    pub(crate) async fn remove(&self, keys: &[String]) -> Result<(), TierError> {
        match self {
            Self::Memory(tier) => tier.remove(keys).await,
            Self::Redis(tier) => tier.remove(keys).await,
        }
    }

    /// Remove every entry carrying the tag, returning the keys removed so
    /// the local tier can drop them as well.
    pub(crate) async fn remove_by_tag(&self, tag: &str) -> Result<Vec<String>, TierError> {
        match self {
            Self::Memory(tier) => tier.remove_by_tag(tag).await,
            Self::Redis(tier) => tier.remove_by_tag(tag).await,
        }
    }
}
