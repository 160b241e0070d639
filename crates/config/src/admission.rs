//! Admission limiter configuration structures.

use std::collections::BTreeMap;
use std::time::Duration;

use duration_str::deserialize_duration;
use serde::Deserialize;

/// Name of the policy applied when the caller does not name one explicitly.
pub const DEFAULT_POLICY: &str = "default";

/// Admission limiter configuration for the service boundary.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct AdmissionConfig {
    /// Whether admission limiting is enabled.
    pub enabled: bool,
    /// Named admission policies. A `default` policy must exist when enabled;
    /// stricter or more permissive policies coexist under their own names.
    #[serde(default)]
    pub policies: BTreeMap<String, PolicyConfig>,
}

impl AdmissionConfig {
    /// Look up a named policy.
    pub fn policy(&self, name: &str) -> Option<&PolicyConfig> {
        self.policies.get(name)
    }
}

/// A single named admission policy.
#[derive(Debug, Clone, Deserialize)]
pub struct PolicyConfig {
    /// How many requests may wait for capacity before overflow rejects
    /// immediately. Zero disables queueing.
    #[serde(default)]
    pub queue_limit: u32,
    /// Upper bound on how long a queued request waits for capacity.
    #[serde(default = "default_max_queue_wait", deserialize_with = "deserialize_duration")]
    pub max_queue_wait: Duration,
    /// The counting algorithm and its parameters.
    #[serde(flatten)]
    pub algorithm: AlgorithmConfig,
}

fn default_max_queue_wait() -> Duration {
    Duration::from_secs(5)
}

/// Algorithm selector with algorithm-specific parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "algorithm", rename_all = "snake_case")]
pub enum AlgorithmConfig {
    /// Counter over a fixed window; resets at the window boundary.
    FixedWindow {
        /// Maximum number of requests admitted within one window.
        permit_limit: u32,
        /// Length of the window.
        #[serde(deserialize_with = "deserialize_duration")]
        window: Duration,
    },
    /// Counter over a trailing window divided into fixed segments, giving
    /// smoother decay than a fixed window with bounded memory.
    SlidingWindow {
        /// Maximum number of requests admitted within the trailing window.
        permit_limit: u32,
        /// Length of the trailing window.
        #[serde(deserialize_with = "deserialize_duration")]
        window: Duration,
        /// Number of segments the window is divided into.
        #[serde(default = "default_segments")]
        segments: u32,
    },
    /// Bucket of tokens replenished on a fixed period; one token per request.
    TokenBucket {
        /// Maximum number of tokens the bucket holds.
        token_limit: u32,
        /// Tokens added per replenishment period.
        tokens_per_period: u32,
        /// Length of the replenishment period.
        #[serde(deserialize_with = "deserialize_duration")]
        replenishment_period: Duration,
    },
    /// Bound on requests currently in flight for the partition.
    Concurrency {
        /// Maximum number of requests in flight at once.
        permit_limit: u32,
    },
}

fn default_segments() -> u32 {
    10
}
