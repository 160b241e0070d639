//! Admission limiter over named policies.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use config::{AdmissionConfig, PolicyConfig};
use dashmap::DashMap;
use mini_moka::sync::Cache;
use tokio::sync::TryAcquireError;
use tokio::time::Instant;

use crate::decision::{AdmissionDecision, AdmissionPermit};
use crate::error::AdmissionError;
use crate::partition::Partition;
use crate::request::AdmitRequest;

/// Partitions idle for this long are garbage-collected. Long enough that a
/// concurrency partition is never evicted while requests are in flight.
const PARTITION_IDLE_PERIOD: Duration = Duration::from_secs(3600);

/// Upper bound on live partitions per policy.
const MAX_PARTITIONS: u64 = 100_000;

/// Decides whether inbound requests proceed, wait, or are rejected.
///
/// One instance owns all policy and partition state; construct it once at
/// startup and share it by reference. Contention during checks is local to
/// the partition involved.
pub struct AdmissionLimiter {
    enabled: bool,
    policies: BTreeMap<String, Arc<Policy>>,
}

impl AdmissionLimiter {
    /// Create a limiter from validated configuration.
    pub fn new(config: AdmissionConfig) -> Self {
        let policies = config
            .policies
            .into_iter()
            .map(|(name, policy)| {
                let policy = Policy::new(name.clone(), policy);
                (name, Arc::new(policy))
            })
            .collect();

        Self {
            enabled: config.enabled,
            policies,
        }
    }

    /// Whether admission limiting is enabled.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Check the named policy for the given partition key.
    ///
    /// Suspends only when the policy queues the request while waiting for
    /// capacity. Dropping the returned future while queued releases the
    /// queue slot.
    pub async fn admit(&self, policy_name: &str, partition_key: &str) -> Result<AdmissionDecision, AdmissionError> {
        if !self.enabled {
            return Ok(AdmissionDecision::Allowed(AdmissionPermit::counted()));
        }

        let policy = self
            .policies
            .get(policy_name)
            .ok_or_else(|| AdmissionError::UnknownPolicy(policy_name.to_string()))?;

        Ok(policy.admit(partition_key).await)
    }

    /// Check the named policy for a request's derived partition key.
    pub async fn admit_request(
        &self,
        policy_name: &str,
        request: &AdmitRequest,
    ) -> Result<AdmissionDecision, AdmissionError> {
        self.admit(policy_name, &request.partition_key()).await
    }
}

/// One named policy with its partition registry.
struct Policy {
    name: String,
    config: PolicyConfig,
    /// Partition state keyed by partition key, lazily created and evicted
    /// after an idle period.
    partitions: Cache<String, Arc<Partition>>,
    /// Locks preventing duplicate partition creation for the same key.
    creation_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl Policy {
    fn new(name: String, config: PolicyConfig) -> Self {
        let partitions = Cache::builder()
            .max_capacity(MAX_PARTITIONS)
            .time_to_idle(PARTITION_IDLE_PERIOD)
            .build();

        Self {
            name,
            config,
            partitions,
            creation_locks: DashMap::new(),
        }
    }

    async fn admit(&self, partition_key: &str) -> AdmissionDecision {
        let partition = self.partition(partition_key).await;

        match partition.semaphore() {
            Some(semaphore) => self.admit_concurrency(partition_key, &partition, semaphore).await,
            None => self.admit_counted(partition_key, &partition).await,
        }
    }

    async fn admit_counted(&self, partition_key: &str, partition: &Arc<Partition>) -> AdmissionDecision {
        let outcome = partition.check(Instant::now());

        if outcome.allowed {
            return AdmissionDecision::Allowed(AdmissionPermit::counted());
        }

        if self.config.queue_limit == 0 {
            log::debug!(
                "Request rejected by policy '{}' for partition '{partition_key}', retry after {:?}",
                self.name,
                outcome.retry_after
            );

            return AdmissionDecision::Rejected {
                retry_after: Some(outcome.retry_after),
            };
        }

        // Hold a queue slot, wait out the suggested delay (bounded), then
        // re-check once. Queue overflow rejects immediately.
        let Some(slot) = partition.try_enqueue(self.config.queue_limit) else {
            log::debug!(
                "Queue overflow in policy '{}' for partition '{partition_key}'",
                self.name
            );

            return AdmissionDecision::Rejected {
                retry_after: Some(outcome.retry_after),
            };
        };

        let wait = outcome.retry_after.min(self.config.max_queue_wait);
        tokio::time::sleep(wait).await;
        drop(slot);

        let retry = partition.check(Instant::now());

        if retry.allowed {
            AdmissionDecision::Queued {
                waited: wait,
                permit: AdmissionPermit::counted(),
            }
        } else {
            AdmissionDecision::Rejected {
                retry_after: Some(retry.retry_after),
            }
        }
    }

    async fn admit_concurrency(
        &self,
        partition_key: &str,
        partition: &Arc<Partition>,
        semaphore: Arc<tokio::sync::Semaphore>,
    ) -> AdmissionDecision {
        match semaphore.clone().try_acquire_owned() {
            Ok(slot) => return AdmissionDecision::Allowed(AdmissionPermit::in_flight(slot)),
            Err(TryAcquireError::Closed) => {
                return AdmissionDecision::Rejected { retry_after: None };
            }
            Err(TryAcquireError::NoPermits) => {}
        }

        if self.config.queue_limit == 0 {
            return AdmissionDecision::Rejected { retry_after: None };
        }

        let Some(slot) = partition.try_enqueue(self.config.queue_limit) else {
            log::debug!(
                "Concurrency queue overflow in policy '{}' for partition '{partition_key}'",
                self.name
            );

            return AdmissionDecision::Rejected { retry_after: None };
        };

        // FIFO wait for an in-flight slot to free, bounded by max_queue_wait.
        let started = Instant::now();
        let acquired = tokio::time::timeout(self.config.max_queue_wait, semaphore.acquire_owned()).await;
        drop(slot);

        match acquired {
            Ok(Ok(permit)) => AdmissionDecision::Queued {
                waited: started.elapsed(),
                permit: AdmissionPermit::in_flight(permit),
            },
            Ok(Err(_)) | Err(_) => AdmissionDecision::Rejected {
                retry_after: Some(self.config.max_queue_wait),
            },
        }
    }

    /// Get or lazily create the partition for a key, using a per-key
    /// creation lock so concurrent first checks build one partition.
    async fn partition(&self, partition_key: &str) -> Arc<Partition> {
        if let Some(partition) = self.partitions.get(&partition_key.to_string()) {
            return partition;
        }

        let creation_lock = self
            .creation_locks
            .entry(partition_key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();

        let guard = creation_lock.lock().await;

        // Somebody else created the partition while we waited for the lock.
        if let Some(partition) = self.partitions.get(&partition_key.to_string()) {
            drop(guard);
            self.creation_locks.remove(partition_key);
            return partition;
        }

        let partition = Arc::new(Partition::new(&self.config.algorithm, Instant::now()));
        self.partitions.insert(partition_key.to_string(), partition.clone());

        drop(guard);
        self.creation_locks.remove(partition_key);

        partition
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::AlgorithmConfig;

    fn limiter(policies: Vec<(&str, PolicyConfig)>) -> AdmissionLimiter {
        let config = AdmissionConfig {
            enabled: true,
            policies: policies.into_iter().map(|(name, p)| (name.to_string(), p)).collect(),
        };

        AdmissionLimiter::new(config)
    }

    fn fixed_window(permit_limit: u32, window: Duration) -> PolicyConfig {
        PolicyConfig {
            queue_limit: 0,
            max_queue_wait: Duration::from_secs(5),
            algorithm: AlgorithmConfig::FixedWindow { permit_limit, window },
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fixed_window_rejects_fourth_within_window() {
        let limiter = limiter(vec![("default", fixed_window(3, Duration::from_secs(60)))]);

        for _ in 0..3 {
            let decision = limiter.admit("default", "ip:10.0.0.1").await.unwrap();
            assert!(decision.is_allowed());
        }

        let rejected = limiter.admit("default", "ip:10.0.0.1").await.unwrap();
        assert!(!rejected.is_allowed());
        assert!(rejected.retry_after().unwrap() <= Duration::from_secs(60));

        // A different partition is unaffected.
        let other = limiter.admit("default", "ip:10.0.0.2").await.unwrap();
        assert!(other.is_allowed());

        // After the window elapses, a new call succeeds again.
        tokio::time::advance(Duration::from_secs(61)).await;
        let decision = limiter.admit("default", "ip:10.0.0.1").await.unwrap();
        assert!(decision.is_allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn token_bucket_replenishes_exactly_one_admission() {
        let policy = PolicyConfig {
            queue_limit: 0,
            max_queue_wait: Duration::from_secs(5),
            algorithm: AlgorithmConfig::TokenBucket {
                token_limit: 5,
                tokens_per_period: 1,
                replenishment_period: Duration::from_secs(10),
            },
        };
        let limiter = limiter(vec![("default", policy)]);

        for _ in 0..5 {
            assert!(limiter.admit("default", "id:u1").await.unwrap().is_allowed());
        }
        assert!(!limiter.admit("default", "id:u1").await.unwrap().is_allowed());

        tokio::time::advance(Duration::from_secs(10)).await;

        assert!(limiter.admit("default", "id:u1").await.unwrap().is_allowed());
        assert!(!limiter.admit("default", "id:u1").await.unwrap().is_allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn strict_and_permissive_policies_coexist() {
        let limiter = limiter(vec![
            ("default", fixed_window(100, Duration::from_secs(60))),
            ("strict", fixed_window(10, Duration::from_secs(60))),
            ("permissive", fixed_window(200, Duration::from_secs(60))),
        ]);

        for _ in 0..10 {
            assert!(limiter.admit("strict", "id:writer").await.unwrap().is_allowed());
        }
        assert!(!limiter.admit("strict", "id:writer").await.unwrap().is_allowed());

        // The same partition key under the permissive policy is independent.
        for _ in 0..200 {
            assert!(limiter.admit("permissive", "id:writer").await.unwrap().is_allowed());
        }
        assert!(!limiter.admit("permissive", "id:writer").await.unwrap().is_allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn queued_window_request_is_admitted_when_the_window_turns() {
        let policy = PolicyConfig {
            queue_limit: 1,
            max_queue_wait: Duration::from_secs(5),
            algorithm: AlgorithmConfig::FixedWindow {
                permit_limit: 1,
                window: Duration::from_secs(2),
            },
        };
        let limiter = limiter(vec![("default", policy)]);

        assert!(limiter.admit("default", "id:u1").await.unwrap().is_allowed());

        // Over the limit with queueing: the request waits out the retry
        // hint and is admitted in the next window.
        let decision = limiter.admit("default", "id:u1").await.unwrap();
        assert!(
            matches!(decision, AdmissionDecision::Queued { waited, .. } if waited <= Duration::from_secs(2))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_permits_release_on_drop() {
        let policy = PolicyConfig {
            queue_limit: 0,
            max_queue_wait: Duration::from_secs(5),
            algorithm: AlgorithmConfig::Concurrency { permit_limit: 2 },
        };
        let limiter = limiter(vec![("default", policy)]);

        let first = limiter.admit("default", "id:u1").await.unwrap();
        let second = limiter.admit("default", "id:u1").await.unwrap();
        assert!(first.is_allowed());
        assert!(second.is_allowed());

        let rejected = limiter.admit("default", "id:u1").await.unwrap();
        assert!(!rejected.is_allowed());

        // Completing one request frees its in-flight slot.
        drop(first);
        let decision = limiter.admit("default", "id:u1").await.unwrap();
        assert!(decision.is_allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn queued_request_is_admitted_when_a_slot_frees() {
        let policy = PolicyConfig {
            queue_limit: 1,
            max_queue_wait: Duration::from_secs(5),
            algorithm: AlgorithmConfig::Concurrency { permit_limit: 1 },
        };
        let limiter = Arc::new(limiter(vec![("default", policy)]));

        let holder = limiter.admit("default", "id:u1").await.unwrap();
        assert!(holder.is_allowed());

        // One waiter fits in the queue and is admitted once the holder
        // finishes.
        let queued = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.admit("default", "id:u1").await.unwrap() })
        };
        tokio::task::yield_now().await;

        drop(holder);
        let decision = queued.await.unwrap();
        assert!(matches!(decision, AdmissionDecision::Queued { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn queue_wait_expiry_rejects() {
        let policy = PolicyConfig {
            queue_limit: 1,
            max_queue_wait: Duration::from_secs(1),
            algorithm: AlgorithmConfig::Concurrency { permit_limit: 1 },
        };
        let limiter = limiter(vec![("default", policy)]);

        let holder = limiter.admit("default", "id:u1").await.unwrap();
        assert!(holder.is_allowed());

        let decision = limiter.admit("default", "id:u1").await.unwrap();
        assert!(!decision.is_allowed());
        drop(holder);
    }

    #[tokio::test]
    async fn unknown_policy_is_an_error() {
        let limiter = limiter(vec![("default", fixed_window(1, Duration::from_secs(1)))]);

        let error = limiter.admit("missing", "id:u1").await.unwrap_err();
        assert!(matches!(error, AdmissionError::UnknownPolicy(name) if name == "missing"));
    }

    #[tokio::test]
    async fn disabled_limiter_admits_everything() {
        let limiter = AdmissionLimiter::new(AdmissionConfig::default());
        assert!(!limiter.is_enabled());

        let decision = limiter.admit("default", "id:u1").await.unwrap();
        assert!(decision.is_allowed());
    }
}
