//! Parapet configuration structures to map the parapet.toml configuration.
//!
//! All options are bound once at process start and validated eagerly; an
//! invalid configuration fails startup instead of failing silently during
//! request handling.

#![deny(missing_docs)]

mod admission;
mod cache;
mod loader;
mod resilience;

use std::path::Path;

pub use admission::{AdmissionConfig, AlgorithmConfig, PolicyConfig};
pub use cache::{CacheConfig, SharedTierConfig};
pub use resilience::{CircuitBreakerConfig, ResilienceConfig, TargetConfig};
use serde::Deserialize;

/// Main configuration structure for a Parapet instance.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Admission limiter configuration.
    #[serde(default)]
    pub admission: AdmissionConfig,
    /// Tiered cache configuration.
    #[serde(default)]
    pub cache: CacheConfig,
    /// Outbound resilience configuration.
    #[serde(default)]
    pub resilience: ResilienceConfig,
}

impl Config {
    /// Load configuration from a file path, validating it eagerly.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
        loader::load(path)
    }

    /// Validate the configuration, failing fast on invalid values.
    pub fn validate(&self) -> anyhow::Result<()> {
        loader::validate(self)
    }
}
