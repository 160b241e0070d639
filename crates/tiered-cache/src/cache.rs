//! The tiered get-or-create cache.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use config::CacheConfig;
use dashmap::DashMap;
use mini_moka::sync::Cache;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::time::Instant;

use crate::entry::{EntryOptions, LocalEntry};
use crate::error::CacheError;
use crate::tier::{RedisTier, SharedTier};

/// Two-tier cache with single-flight miss handling and tag invalidation.
///
/// One instance owns the local tier, the in-flight map and the tag index;
/// construct it once at startup and share it by reference. Values cross the
/// API as serde types and are stored serialized in both tiers.
pub struct TieredCache {
    config: CacheConfig,
    local: Cache<String, LocalEntry>,
    /// Local tag index: tag to the keys this process stored under it.
    tags: DashMap<String, HashSet<String>>,
    /// Per-key locks collapsing concurrent misses into one factory run.
    flights: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    shared: Option<SharedTier>,
}

impl TieredCache {
    /// Create a cache, connecting to the configured shared tier when one is
    /// present. Connection failure fails construction, not later lookups.
    pub async fn connect(config: CacheConfig) -> Result<Self, CacheError> {
        let shared = match &config.shared {
            Some(shared_config) => Some(SharedTier::Redis(RedisTier::connect(shared_config).await?)),
            None => None,
        };

        Ok(Self::build(config, shared))
    }

    /// Create a cache with no shared tier; entries live in this process only.
    pub fn in_process(config: CacheConfig) -> Self {
        Self::build(config, None)
    }

    /// Create a cache over an explicitly supplied shared tier.
    pub fn with_shared_tier(config: CacheConfig, shared: SharedTier) -> Self {
        Self::build(config, Some(shared))
    }

    fn build(config: CacheConfig, shared: Option<SharedTier>) -> Self {
        let local = Cache::builder().max_capacity(config.local_capacity).build();

        Self {
            config,
            local,
            tags: DashMap::new(),
            flights: DashMap::new(),
            shared,
        }
    }

    /// Whether caching is enabled.
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Get the cached value for `key`, or run `factory` and cache its result
    /// with the default expirations and no tags.
    pub async fn get_or_create<T, E, F, Fut>(&self, key: &str, factory: F) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.get_or_create_with(key, EntryOptions::default(), factory).await
    }

    /// Get the cached value for `key`, or run `factory` and cache its result
    /// under the given options.
    ///
    /// Within this process at most one factory runs per key at a time;
    /// concurrent callers for the same key wait for the in-flight run and
    /// observe its cached result. The shared tier gives no such guarantee
    /// across processes. Only the factory's own error can fail this call.
    pub async fn get_or_create_with<T, E, F, Fut>(&self, key: &str, options: EntryOptions, factory: F) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.config.enabled {
            return factory().await;
        }

        if key.len() > self.config.max_key_length {
            log::debug!("Cache key of {} bytes exceeds the maximum, bypassing cache", key.len());
            return factory().await;
        }

        loop {
            if let Some(value) = self.lookup(key).await {
                return Ok(value);
            }

            let flight = self
                .flights
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone();

            let guard = flight.lock().await;

            // A finished flight may have retired this lock while we waited
            // for it; only the lock currently in the map guards the key.
            let current = self
                .flights
                .get(key)
                .is_some_and(|entry| Arc::ptr_eq(entry.value(), &flight));

            if !current {
                drop(guard);
                continue;
            }

            // The flight that held the lock before us has populated the cache.
            if let Some(value) = self.lookup(key).await {
                drop(guard);
                self.retire_flight(key, &flight);
                return Ok(value);
            }

            let result = factory().await;

            if let Ok(value) = &result {
                self.store(key, value, &options).await;
            }

            drop(guard);
            self.retire_flight(key, &flight);

            return result;
        }
    }

    /// Look up a cached value without running a factory.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        if !self.config.enabled || key.len() > self.config.max_key_length {
            return None;
        }

        self.lookup(key).await
    }

    /// Store a value with the default expirations and no tags.
    pub async fn set<T: Serialize>(&self, key: &str, value: &T) {
        self.set_with(key, value, EntryOptions::default()).await;
    }

    /// Store a value under the given options.
    pub async fn set_with<T: Serialize>(&self, key: &str, value: &T, options: EntryOptions) {
        if !self.config.enabled {
            return;
        }

        if key.len() > self.config.max_key_length {
            log::debug!("Cache key of {} bytes exceeds the maximum, not storing", key.len());
            return;
        }

        self.store(key, value, &options).await;
    }

    /// Remove a single entry from both tiers.
    pub async fn remove(&self, key: &str) {
        self.remove_many(std::slice::from_ref(&key.to_string())).await;
    }

    /// Remove several entries from both tiers.
    pub async fn remove_many(&self, keys: &[String]) {
        for key in keys {
            self.forget_local(key);
        }

        if let Some(shared) = &self.shared
            && let Err(e) = shared.remove(keys).await
        {
            log::warn!("Shared tier removal failed: {e}");
        }
    }

    /// Remove every entry carrying the tag, in both tiers.
    pub async fn remove_by_tag(&self, tag: &str) {
        let mut keys: HashSet<String> = self.tags.remove(tag).map(|(_, keys)| keys).unwrap_or_default();

        if let Some(shared) = &self.shared {
            match shared.remove_by_tag(tag).await {
                Ok(shared_keys) => keys.extend(shared_keys),
                Err(e) => log::warn!("Shared tier tag removal failed for tag '{tag}': {e}"),
            }
        }

        for key in &keys {
            self.local.invalidate(key);
        }
    }

    /// Remove every entry carrying any of the tags.
    pub async fn remove_by_tags(&self, tags: &[String]) {
        for tag in tags {
            self.remove_by_tag(tag).await;
        }
    }

    /// Local tier first, then the shared tier; a shared hit backfills the
    /// local tier. Backend failures degrade to a miss.
    async fn lookup<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let now = Instant::now();
        let owned_key = key.to_string();

        if let Some(entry) = self.local.get(&owned_key) {
            if entry.is_fresh(now) {
                match serde_json::from_slice(&entry.payload) {
                    Ok(value) => return Some(value),
                    Err(e) => {
                        log::warn!("Discarding undecodable local cache entry for key '{key}': {e}");
                        self.local.invalidate(&owned_key);
                    }
                }
            } else {
                self.local.invalidate(&owned_key);
            }
        }

        let shared = self.shared.as_ref()?;

        match shared.get(key).await {
            Ok(Some(payload)) => match serde_json::from_slice(&payload) {
                Ok(value) => {
                    self.backfill_local(key, payload, now);
                    Some(value)
                }
                Err(e) => {
                    log::warn!("Discarding undecodable shared cache entry for key '{key}': {e}");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                log::warn!("Shared tier lookup failed for key '{key}', treating as miss: {e}");
                None
            }
        }
    }

    /// Keep a shared-tier hit locally until its local expiration.
    ///
    /// The shared tier does not report an entry's remaining TTL, so the
    /// backfilled copy lives only until the local expiration; after that
    /// every read consults the shared tier again, which enforces the true
    /// absolute expiration.
    fn backfill_local(&self, key: &str, payload: Bytes, now: Instant) {
        let local_expiration = self.config.default_local_expiration.min(self.config.default_expiration);
        let expires_at = now + local_expiration;

        let entry = LocalEntry {
            payload,
            expires_at,
            local_expires_at: expires_at,
            tags: Arc::from(Vec::new()),
        };

        self.local.insert(key.to_string(), entry);
    }

    async fn store<T: Serialize>(&self, key: &str, value: &T, options: &EntryOptions) {
        let payload = match serde_json::to_vec(value) {
            Ok(payload) => payload,
            Err(e) => {
                log::warn!("Failed to serialize cache value for key '{key}', not storing: {e}");
                return;
            }
        };

        if payload.len() > self.config.max_payload_bytes {
            log::debug!(
                "Cache payload of {} bytes for key '{key}' exceeds the maximum, bypassing cache",
                payload.len()
            );
            return;
        }

        let payload = Bytes::from(payload);
        let expiration = options.expiration.unwrap_or(self.config.default_expiration);
        let local_expiration = options
            .local_expiration
            .unwrap_or(self.config.default_local_expiration)
            .min(expiration);

        let now = Instant::now();
        let entry = LocalEntry {
            payload: payload.clone(),
            expires_at: now + expiration,
            local_expires_at: now + local_expiration,
            tags: options.tags.clone().into(),
        };

        self.local.insert(key.to_string(), entry);

        for tag in &options.tags {
            self.tags.entry(tag.clone()).or_default().insert(key.to_string());
        }

        if let Some(shared) = &self.shared
            && let Err(e) = shared.set(key, payload, expiration, &options.tags).await
        {
            log::warn!("Shared tier write failed for key '{key}': {e}");
        }
    }

    /// Drop a key from the local tier and untangle it from the tag index.
    fn forget_local(&self, key: &str) {
        let owned_key = key.to_string();

        if let Some(entry) = self.local.get(&owned_key) {
            for tag in entry.tags.iter() {
                if let Some(mut keys) = self.tags.get_mut(tag) {
                    keys.remove(key);
                }
            }
        }

        self.local.invalidate(&owned_key);
    }

    /// Remove a finished flight's lock from the map, leaving any newer lock
    /// for the same key in place.
    fn retire_flight(&self, key: &str, flight: &Arc<tokio::sync::Mutex<()>>) {
        self.flights.remove_if(key, |_, current| Arc::ptr_eq(current, flight));
    }
}
