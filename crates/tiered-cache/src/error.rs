//! Error types for the tiered cache.

use crate::tier::TierError;

/// Errors surfaced when constructing a cache.
///
/// Operations themselves never fail because of the cache: backend errors
/// are absorbed internally (fail-open) and only the caller's factory can
/// make `get_or_create` return an error.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The shared tier could not be reached during construction.
    #[error("Shared tier connection failed: {0}")]
    Connection(#[from] TierError),
}
