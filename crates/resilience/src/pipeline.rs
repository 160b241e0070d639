//! The outbound call pipeline.
//!
//! Layering per call, outermost first: caller cancellation, total timeout,
//! retry loop, circuit breaker, per-attempt timeout. The caller supplies
//! the network operation as an async delegate so the pipeline stays
//! protocol-agnostic.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use config::{ResilienceConfig, TargetConfig};
use rand::Rng;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::breaker::CircuitBreaker;
use crate::error::{AttemptError, PipelineError};
use crate::target::validate_target;

/// Ceiling on the exponential backoff between attempts.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Executes downstream calls with retry, timeout and circuit-breaking
/// applied per named target.
pub struct ResiliencePipeline {
    targets: BTreeMap<String, Arc<Target>>,
}

struct Target {
    name: String,
    config: TargetConfig,
    breaker: CircuitBreaker,
}

impl ResiliencePipeline {
    /// Build the pipeline from configuration, validating every target
    /// address up front.
    pub fn new(config: ResilienceConfig) -> Result<Self, PipelineError> {
        let mut targets = BTreeMap::new();

        for (name, target_config) in config.targets {
            if let Err(e) = validate_target(&target_config.url) {
                log::error!("Downstream target '{name}' failed validation: {e}");
                return Err(e.into());
            }

            let breaker = CircuitBreaker::new(target_config.circuit_breaker.clone());

            targets.insert(
                name.clone(),
                Arc::new(Target {
                    name,
                    config: target_config,
                    breaker,
                }),
            );
        }

        Ok(Self { targets })
    }

    /// Execute `operation` against the named target.
    ///
    /// The delegate is invoked once per attempt; it must be cheap to call
    /// repeatedly and perform the actual network work when awaited.
    pub async fn execute<T, F, Fut>(&self, target: &str, operation: F) -> Result<T, PipelineError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, AttemptError>>,
    {
        self.execute_with_cancellation(target, &CancellationToken::new(), operation)
            .await
    }

    /// Like [`execute`](Self::execute), but abandons the call as soon as
    /// `cancellation` fires. A cancelled call reports neither success nor
    /// failure to the circuit breaker.
    pub async fn execute_with_cancellation<T, F, Fut>(
        &self,
        target: &str,
        cancellation: &CancellationToken,
        operation: F,
    ) -> Result<T, PipelineError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, AttemptError>>,
    {
        let target = self
            .targets
            .get(target)
            .ok_or_else(|| PipelineError::UnknownTarget(target.to_string()))?;

        if cancellation.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let total_timeout = target.config.total_timeout;

        tokio::select! {
            () = cancellation.cancelled() => Err(PipelineError::Cancelled),
            outcome = tokio::time::timeout(total_timeout, target.run_attempts(&operation)) => {
                match outcome {
                    Ok(result) => result,
                    Err(_) => {
                        log::warn!(
                            "Downstream target '{}' exceeded its total timeout of {total_timeout:?}",
                            target.name
                        );
                        Err(PipelineError::TotalTimeout(total_timeout))
                    }
                }
            }
        }
    }
}

impl Target {
    async fn run_attempts<T, F, Fut>(&self, operation: &F) -> Result<T, PipelineError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, AttemptError>>,
    {
        let max_attempts = self.config.max_retry_attempts + 1;
        let mut attempt = 0;

        loop {
            attempt += 1;

            if let Err(retry_after) = self.breaker.try_acquire(Instant::now()) {
                log::debug!("Circuit open for downstream target '{}', failing fast", self.name);
                return Err(PipelineError::CircuitOpen { retry_after });
            }

            let error = match tokio::time::timeout(self.config.attempt_timeout, operation()).await {
                Ok(Ok(value)) => {
                    self.breaker.record_success(Instant::now());
                    return Ok(value);
                }
                Ok(Err(error)) => error,
                Err(_) => AttemptError::Timeout,
            };

            // Permanent rejections mean the dependency answered; only
            // transient failures count against its health.
            if !error.is_transient() {
                self.breaker.record_success(Instant::now());
                return Err(PipelineError::UpstreamPermanent(error));
            }

            self.breaker.record_failure(Instant::now());

            if attempt >= max_attempts {
                log::warn!(
                    "Downstream target '{}' failed after {attempt} attempts: {error}",
                    self.name
                );
                return Err(PipelineError::UpstreamTransient { attempts: attempt, last: error });
            }

            let delay = backoff_delay(self.config.retry_base_delay, attempt);
            log::debug!(
                "Retrying downstream target '{}' in {delay:?} after attempt {attempt}: {error}",
                self.name
            );

            tokio::time::sleep(delay).await;
        }
    }
}

/// Exponential backoff with up to 25% jitter so synchronized callers spread
/// out their retries.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(10);
    let delay = base.saturating_mul(1 << exponent).min(MAX_BACKOFF);

    delay.mul_f64(1.0 + rand::thread_rng().gen_range(0.0..0.25))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use config::CircuitBreakerConfig;
    use url::Url;

    use super::*;

    fn pipeline_with(target: TargetConfig) -> ResiliencePipeline {
        let mut targets = BTreeMap::new();
        targets.insert("billing".to_string(), target);

        ResiliencePipeline::new(ResilienceConfig { targets }).unwrap()
    }

    fn target_config(max_retry_attempts: u32) -> TargetConfig {
        TargetConfig {
            url: Url::parse("https://billing.example.com").unwrap(),
            max_retry_attempts,
            retry_base_delay: Duration::from_millis(200),
            total_timeout: Duration::from_secs(30),
            attempt_timeout: Duration::from_secs(10),
            max_connections: 64,
            circuit_breaker: CircuitBreakerConfig {
                failure_ratio: 0.1,
                minimum_throughput: 5,
                sampling_window: Duration::from_secs(30),
                break_duration: Duration::from_secs(15),
            },
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_target_is_an_error() {
        let pipeline = pipeline_with(target_config(3));

        let result = pipeline
            .execute("shipping", || async { Ok::<_, AttemptError>(42) })
            .await;

        assert!(matches!(result, Err(PipelineError::UnknownTarget(name)) if name == "shipping"));
    }

    #[tokio::test(start_paused = true)]
    async fn unsafe_target_is_rejected_at_construction() {
        let mut targets = BTreeMap::new();
        let mut config = target_config(3);
        config.url = Url::parse("https://10.0.0.1").unwrap();
        targets.insert("internal".to_string(), config);

        let result = ResiliencePipeline::new(ResilienceConfig { targets });

        assert!(matches!(result, Err(PipelineError::TargetValidation(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn successful_call_runs_the_operation_once() {
        let pipeline = pipeline_with(target_config(3));
        let calls = AtomicU32::new(0);

        let result = pipeline
            .execute("billing", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, AttemptError>("invoice")
            })
            .await
            .unwrap();

        assert_eq!(result, "invoice");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried_until_success() {
        let pipeline = pipeline_with(target_config(3));
        let calls = AtomicU32::new(0);

        let result = pipeline
            .execute("billing", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(AttemptError::Status(503))
                } else {
                    Ok("invoice")
                }
            })
            .await
            .unwrap();

        assert_eq!(result, "invoice");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_errors_are_not_retried() {
        let pipeline = pipeline_with(target_config(3));
        let calls = AtomicU32::new(0);

        let result = pipeline
            .execute("billing", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(AttemptError::Status(404))
            })
            .await;

        assert!(matches!(
            result,
            Err(PipelineError::UpstreamPermanent(AttemptError::Status(404)))
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_exhaust_into_a_consolidated_error() {
        let pipeline = pipeline_with(target_config(2));
        let calls = AtomicU32::new(0);

        let result = pipeline
            .execute("billing", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(AttemptError::Connection("reset".into()))
            })
            .await;

        assert!(matches!(
            result,
            Err(PipelineError::UpstreamTransient { attempts: 3, last: AttemptError::Connection(_) })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_timeout_counts_as_transient() {
        let mut config = target_config(1);
        config.attempt_timeout = Duration::from_secs(1);
        let pipeline = pipeline_with(config);
        let calls = AtomicU32::new(0);

        let result = pipeline
            .execute("billing", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                std::future::pending::<Result<(), AttemptError>>().await
            })
            .await;

        assert!(matches!(
            result,
            Err(PipelineError::UpstreamTransient { attempts: 2, last: AttemptError::Timeout })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn total_timeout_bounds_the_whole_operation() {
        let mut config = target_config(3);
        config.total_timeout = Duration::from_secs(5);
        config.attempt_timeout = Duration::from_secs(60);
        let pipeline = pipeline_with(config);

        let started = Instant::now();
        let result = pipeline
            .execute("billing", || std::future::pending::<Result<(), AttemptError>>())
            .await;

        assert!(matches!(result, Err(PipelineError::TotalTimeout(_))));
        assert_eq!(started.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn circuit_opens_and_fails_fast_without_calling_the_operation() {
        let pipeline = pipeline_with(target_config(0));
        let calls = AtomicU32::new(0);

        for _ in 0..5 {
            let result = pipeline
                .execute("billing", || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(AttemptError::Status(500))
                })
                .await;
            assert!(matches!(result, Err(PipelineError::UpstreamTransient { .. })));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 5);

        let result = pipeline
            .execute("billing", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(AttemptError::Status(500))
            })
            .await;

        assert!(matches!(result, Err(PipelineError::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn circuit_recovers_through_a_successful_trial() {
        let pipeline = pipeline_with(target_config(0));

        for _ in 0..5 {
            let _ = pipeline
                .execute("billing", || async { Err::<(), _>(AttemptError::Status(500)) })
                .await;
        }
        assert!(matches!(
            pipeline.execute("billing", || async { Ok::<_, AttemptError>(()) }).await,
            Err(PipelineError::CircuitOpen { .. })
        ));

        tokio::time::advance(Duration::from_secs(15)).await;

        // Trial call is admitted and its success closes the circuit.
        let calls = AtomicU32::new(0);
        let result = pipeline
            .execute("billing", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, AttemptError>("recovered")
            })
            .await
            .unwrap();
        assert_eq!(result, "recovered");

        let result = pipeline
            .execute("billing", || async { Ok::<_, AttemptError>("normal") })
            .await
            .unwrap();
        assert_eq!(result, "normal");
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_before_start_skips_the_operation() {
        let pipeline = pipeline_with(target_config(3));
        let token = CancellationToken::new();
        token.cancel();

        let calls = AtomicU32::new(0);
        let result = pipeline
            .execute_with_cancellation("billing", &token, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, AttemptError>(())
            })
            .await;

        assert!(matches!(result, Err(PipelineError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_an_in_flight_call() {
        let pipeline = pipeline_with(target_config(3));
        let token = CancellationToken::new();

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });

        let result = pipeline
            .execute_with_cancellation("billing", &token, || {
                std::future::pending::<Result<(), AttemptError>>()
            })
            .await;

        assert!(matches!(result, Err(PipelineError::Cancelled)));
    }
}
