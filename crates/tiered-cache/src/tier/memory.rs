//! In-process shared tier backend.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::time::Instant;

use super::TierError;

/// In-process key/value store with TTL and tag sets.
///
/// Stands in for the distributed tier when no connection is configured, and
/// doubles as the outage simulator in fail-open tests. Clones share state.
#[derive(Clone, Default)]
pub struct MemoryTier {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    entries: DashMap<String, MemoryEntry>,
    tags: DashMap<String, HashSet<String>>,
    unavailable: AtomicBool,
}

struct MemoryEntry {
    payload: Bytes,
    expires_at: Instant,
}

impl MemoryTier {
    /// Create an empty tier.
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a backend outage: while set, every operation fails.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::Release);
    }

    fn check_available(&self) -> Result<(), TierError> {
        if self.inner.unavailable.load(Ordering::Acquire) {
            return Err(TierError::Connection("simulated outage".to_string()));
        }

        Ok(())
    }

    pub(crate) async fn get(&self, key: &str) -> Result<Option<Bytes>, TierError> {
        self.check_available()?;

        let Some(entry) = self.inner.entries.get(key) else {
            return Ok(None);
        };

        if Instant::now() >= entry.expires_at {
            drop(entry);
            self.inner.entries.remove(key);
            return Ok(None);
        }

        Ok(Some(entry.payload.clone()))
    }

    pub(crate) async fn set(&self, key: &str, payload: Bytes, ttl: Duration, tags: &[String]) -> Result<(), TierError> {
        self.check_available()?;

        self.inner.entries.insert(
            key.to_string(),
            MemoryEntry {
                payload,
                expires_at: Instant::now() + ttl,
            },
        );

        for tag in tags {
            self.inner.tags.entry(tag.clone()).or_default().insert(key.to_string());
        }

        Ok(())
    }

    pub(crate) async fn remove(&self, keys: &[String]) -> Result<(), TierError> {
        self.check_available()?;

        for key in keys {
            self.inner.entries.remove(key);
        }

        Ok(())
    }

    pub(crate) async fn remove_by_tag(&self, tag: &str) -> Result<Vec<String>, TierError> {
        self.check_available()?;

        let Some((_, keys)) = self.inner.tags.remove(tag) else {
            return Ok(Vec::new());
        };

        let keys: Vec<String> = keys.into_iter().collect();

        for key in &keys {
            self.inner.entries.remove(key);
        }

        Ok(keys)
    }
}
