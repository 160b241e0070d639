//! Tiered cache configuration structures.

use std::time::Duration;

use duration_str::{deserialize_duration, deserialize_option_duration};
use serde::Deserialize;

/// Tiered cache configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    /// Whether caching is enabled. When disabled, factories always execute
    /// directly and nothing is stored.
    pub enabled: bool,
    /// Default absolute expiration for entries that do not set one.
    #[serde(default = "default_expiration", deserialize_with = "deserialize_duration")]
    pub default_expiration: Duration,
    /// Default local-tier expiration. Must not exceed the absolute default.
    #[serde(
        default = "default_local_expiration",
        deserialize_with = "deserialize_duration"
    )]
    pub default_local_expiration: Duration,
    /// Serialized values larger than this bypass caching entirely.
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
    /// Keys longer than this bypass caching entirely.
    #[serde(default = "default_max_key_length")]
    pub max_key_length: usize,
    /// Maximum number of entries held in the local tier.
    #[serde(default = "default_local_capacity")]
    pub local_capacity: u64,
    /// Shared tier connection. When absent, only the local tier is used.
    pub shared: Option<SharedTierConfig>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            default_expiration: default_expiration(),
            default_local_expiration: default_local_expiration(),
            max_payload_bytes: default_max_payload_bytes(),
            max_key_length: default_max_key_length(),
            local_capacity: default_local_capacity(),
            shared: None,
        }
    }
}

fn default_expiration() -> Duration {
    Duration::from_secs(300)
}

fn default_local_expiration() -> Duration {
    Duration::from_secs(30)
}

fn default_max_payload_bytes() -> usize {
    1024 * 1024
}

fn default_max_key_length() -> usize {
    512
}

fn default_local_capacity() -> u64 {
    100_000
}

/// Shared (distributed) tier connection configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SharedTierConfig {
    /// Connection URL of the shared key/value store (redis:// or rediss://).
    pub url: String,
    /// Key prefix applied to every cache key in the shared tier.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Response timeout for shared tier commands.
    #[serde(
        default = "default_response_timeout",
        deserialize_with = "deserialize_option_duration"
    )]
    pub response_timeout: Option<Duration>,
}

fn default_key_prefix() -> String {
    "parapet:cache:".to_string()
}

fn default_response_timeout() -> Option<Duration> {
    Some(Duration::from_secs(1))
}
