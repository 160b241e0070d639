//! Cache entry metadata.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;

/// Per-entry overrides for `get_or_create_with` and `set`.
#[derive(Debug, Clone, Default)]
pub struct EntryOptions {
    /// Absolute expiration; falls back to the configured default.
    pub expiration: Option<Duration>,
    /// Local-tier expiration; falls back to the configured default and is
    /// clamped to the absolute expiration.
    pub local_expiration: Option<Duration>,
    /// Tags for bulk invalidation.
    pub tags: Vec<String>,
}

impl EntryOptions {
    /// Options with an absolute expiration override.
    pub fn expires_in(expiration: Duration) -> Self {
        Self {
            expiration: Some(expiration),
            ..Default::default()
        }
    }

    /// Add a tag.
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }
}

/// A local-tier entry: the serialized value plus its expiration metadata.
#[derive(Clone)]
pub(crate) struct LocalEntry {
    pub(crate) payload: Bytes,
    /// Absolute expiration; the entry is gone everywhere after this.
    pub(crate) expires_at: Instant,
    /// Local expiration, at most `expires_at`; after this the local tier
    /// defers to the shared tier.
    pub(crate) local_expires_at: Instant,
    pub(crate) tags: Arc<[String]>,
}

impl LocalEntry {
    pub(crate) fn is_fresh(&self, now: Instant) -> bool {
        now < self.local_expires_at && now < self.expires_at
    }
}
