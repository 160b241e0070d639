//! Outbound resilience configuration structures.

use std::collections::BTreeMap;
use std::time::Duration;

use duration_str::deserialize_duration;
use serde::Deserialize;
use url::Url;

/// Outbound resilience configuration, one entry per downstream target.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ResilienceConfig {
    /// Downstream targets keyed by name.
    #[serde(default)]
    pub targets: BTreeMap<String, TargetConfig>,
}

/// Resilience options for a single downstream target.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetConfig {
    /// Resolved address of the downstream dependency. Must use secure
    /// transport and must not point at loopback or private networks.
    pub url: Url,
    /// Additional attempts after the first, applied to transient failures only.
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,
    /// Seed delay for exponential retry backoff.
    #[serde(default = "default_retry_base_delay", deserialize_with = "deserialize_duration")]
    pub retry_base_delay: Duration,
    /// Bound on the entire operation including all retries.
    #[serde(default = "default_total_timeout", deserialize_with = "deserialize_duration")]
    pub total_timeout: Duration,
    /// Bound on each individual attempt.
    #[serde(default = "default_attempt_timeout", deserialize_with = "deserialize_duration")]
    pub attempt_timeout: Duration,
    /// Connection cap for the caller's client; validated here, enforced by
    /// the caller-supplied delegate.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Circuit breaker parameters for this target.
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
}

fn default_max_retry_attempts() -> u32 {
    3
}

fn default_retry_base_delay() -> Duration {
    Duration::from_millis(200)
}

fn default_total_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_attempt_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_max_connections() -> u32 {
    64
}

/// Circuit breaker parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CircuitBreakerConfig {
    /// Failure ratio over the sampling window above which the circuit opens.
    #[serde(default = "default_failure_ratio")]
    pub failure_ratio: f64,
    /// Minimum number of measured calls in the sampling window before the
    /// ratio is acted on.
    #[serde(default = "default_minimum_throughput")]
    pub minimum_throughput: u32,
    /// Length of the rolling window failure statistics are measured over.
    #[serde(default = "default_sampling_window", deserialize_with = "deserialize_duration")]
    pub sampling_window: Duration,
    /// How long the circuit stays open before allowing a trial call.
    #[serde(default = "default_break_duration", deserialize_with = "deserialize_duration")]
    pub break_duration: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_ratio: default_failure_ratio(),
            minimum_throughput: default_minimum_throughput(),
            sampling_window: default_sampling_window(),
            break_duration: default_break_duration(),
        }
    }
}

fn default_failure_ratio() -> f64 {
    0.1
}

fn default_minimum_throughput() -> u32 {
    10
}

fn default_sampling_window() -> Duration {
    Duration::from_secs(30)
}

fn default_break_duration() -> Duration {
    Duration::from_secs(15)
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    #[test]
    fn target_config_defaults() {
        let toml = indoc! {r#"
            url = "https://billing.example.com"
        "#};

        let config: TargetConfig = toml::from_str(toml).unwrap();
        insta::assert_debug_snapshot!(config, @r#"
        TargetConfig {
            url: Url {
                scheme: "https",
                cannot_be_a_base: false,
                username: "",
                password: None,
                host: Some(
                    Domain(
                        "billing.example.com",
                    ),
                ),
                port: None,
                path: "/",
                query: None,
                fragment: None,
            },
            max_retry_attempts: 3,
            retry_base_delay: 200ms,
            total_timeout: 30s,
            attempt_timeout: 10s,
            max_connections: 64,
            circuit_breaker: CircuitBreakerConfig {
                failure_ratio: 0.1,
                minimum_throughput: 10,
                sampling_window: 30s,
                break_duration: 15s,
            },
        }
        "#);
    }

    #[test]
    fn resilience_config_with_overrides() {
        let toml = indoc! {r#"
            [targets.billing]
            url = "https://billing.example.com"
            max_retry_attempts = 5
            retry_base_delay = "100ms"
            total_timeout = "10s"
            attempt_timeout = "2s"

            [targets.billing.circuit_breaker]
            failure_ratio = 0.5
            minimum_throughput = 5
            sampling_window = "60s"
            break_duration = "30s"
        "#};

        let config: ResilienceConfig = toml::from_str(toml).unwrap();
        let target = config.targets.get("billing").unwrap();

        assert_eq!(target.max_retry_attempts, 5);
        assert_eq!(target.retry_base_delay, Duration::from_millis(100));
        assert_eq!(target.circuit_breaker.minimum_throughput, 5);
        assert_eq!(target.circuit_breaker.break_duration, Duration::from_secs(30));
    }
}
