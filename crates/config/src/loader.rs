use std::path::Path;

use anyhow::bail;

use crate::{AlgorithmConfig, Config, PolicyConfig, admission::DEFAULT_POLICY};

pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let content = std::fs::read_to_string(path.as_ref())?;
    let config: Config = toml::from_str(&content)?;

    validate(&config)?;

    Ok(config)
}

pub(crate) fn validate(config: &Config) -> anyhow::Result<()> {
    validate_admission(config)?;
    validate_cache(config)?;
    validate_resilience(config)?;

    Ok(())
}

fn validate_admission(config: &Config) -> anyhow::Result<()> {
    let admission = &config.admission;

    if admission.enabled && !admission.policies.contains_key(DEFAULT_POLICY) {
        bail!("Admission limiting is enabled but no `default` policy is defined in [admission.policies]");
    }

    for (name, policy) in &admission.policies {
        validate_policy(name, policy)?;
    }

    Ok(())
}

fn validate_policy(name: &str, policy: &PolicyConfig) -> anyhow::Result<()> {
    if policy.queue_limit > 0 && policy.max_queue_wait.is_zero() {
        bail!("Admission policy '{name}' has a queue but max_queue_wait is zero");
    }

    match &policy.algorithm {
        AlgorithmConfig::FixedWindow { permit_limit, window } => {
            if *permit_limit == 0 {
                bail!("Admission policy '{name}' has a zero permit_limit");
            }
            if window.is_zero() {
                bail!("Admission policy '{name}' has a zero window");
            }
        }
        AlgorithmConfig::SlidingWindow {
            permit_limit,
            window,
            segments,
        } => {
            if *permit_limit == 0 {
                bail!("Admission policy '{name}' has a zero permit_limit");
            }
            if window.is_zero() {
                bail!("Admission policy '{name}' has a zero window");
            }
            if *segments == 0 {
                bail!("Admission policy '{name}' has zero sliding window segments");
            }
        }
        AlgorithmConfig::TokenBucket {
            token_limit,
            tokens_per_period,
            replenishment_period,
        } => {
            if *token_limit == 0 {
                bail!("Admission policy '{name}' has a zero token_limit");
            }
            if *tokens_per_period == 0 {
                bail!("Admission policy '{name}' replenishes zero tokens per period");
            }
            if replenishment_period.is_zero() {
                bail!("Admission policy '{name}' has a zero replenishment_period");
            }
        }
        AlgorithmConfig::Concurrency { permit_limit } => {
            if *permit_limit == 0 {
                bail!("Admission policy '{name}' has a zero permit_limit");
            }
        }
    }

    Ok(())
}

fn validate_cache(config: &Config) -> anyhow::Result<()> {
    let cache = &config.cache;

    if !cache.enabled {
        return Ok(());
    }

    if cache.default_local_expiration > cache.default_expiration {
        bail!(
            "Cache default_local_expiration ({:?}) exceeds default_expiration ({:?})",
            cache.default_local_expiration,
            cache.default_expiration
        );
    }

    if cache.max_payload_bytes == 0 {
        bail!("Cache max_payload_bytes must be greater than zero");
    }

    if cache.max_key_length == 0 {
        bail!("Cache max_key_length must be greater than zero");
    }

    Ok(())
}

fn validate_resilience(config: &Config) -> anyhow::Result<()> {
    for (name, target) in &config.resilience.targets {
        if target.url.scheme() != "https" {
            bail!(
                "Resilience target '{name}' must use secure transport, got scheme '{}'",
                target.url.scheme()
            );
        }

        if target.attempt_timeout > target.total_timeout {
            bail!(
                "Resilience target '{name}' has attempt_timeout ({:?}) exceeding total_timeout ({:?})",
                target.attempt_timeout,
                target.total_timeout
            );
        }

        if target.max_connections == 0 {
            bail!("Resilience target '{name}' has a zero max_connections");
        }

        let breaker = &target.circuit_breaker;

        if !(breaker.failure_ratio > 0.0 && breaker.failure_ratio <= 1.0) {
            bail!(
                "Resilience target '{name}' has a circuit breaker failure_ratio outside (0, 1]: {}",
                breaker.failure_ratio
            );
        }

        if breaker.minimum_throughput == 0 {
            bail!("Resilience target '{name}' has a zero circuit breaker minimum_throughput");
        }

        if breaker.sampling_window.is_zero() {
            bail!("Resilience target '{name}' has a zero circuit breaker sampling_window");
        }

        if breaker.break_duration.is_zero() {
            bail!("Resilience target '{name}' has a zero circuit breaker break_duration");
        }
    }

    Ok(())
}
