//! Per-partition admission state.
//!
//! A partition owns the counters for one key under one policy. State is
//! mutated only inside `check`, under a mutex held for the duration of the
//! state transition and never across an await point.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use config::AlgorithmConfig;
use tokio::sync::Semaphore;
use tokio::time::Instant;

/// Result of a single counter check against a partition.
pub(crate) struct CheckOutcome {
    pub(crate) allowed: bool,
    /// Time until the next unit of capacity frees up; a retry hint.
    pub(crate) retry_after: Duration,
}

/// Lazily created state for one partition key.
pub(crate) struct Partition {
    /// Requests currently holding a queue slot for this partition.
    queued: AtomicU32,
    state: PartitionState,
}

enum PartitionState {
    FixedWindow(Mutex<FixedWindowState>),
    SlidingWindow(Mutex<SlidingWindowState>),
    TokenBucket(Mutex<TokenBucketState>),
    Concurrency { semaphore: Arc<Semaphore> },
}

impl Partition {
    pub(crate) fn new(algorithm: &AlgorithmConfig, now: Instant) -> Self {
        let state = match algorithm {
            AlgorithmConfig::FixedWindow { permit_limit, window } => {
                PartitionState::FixedWindow(Mutex::new(FixedWindowState {
                    permit_limit: *permit_limit,
                    window: *window,
                    window_start: now,
                    count: 0,
                }))
            }
            AlgorithmConfig::SlidingWindow {
                permit_limit,
                window,
                segments,
            } => PartitionState::SlidingWindow(Mutex::new(SlidingWindowState {
                permit_limit: *permit_limit,
                segment_len: *window / *segments,
                counts: vec![0; *segments as usize],
                head: 0,
                head_start: now,
            })),
            AlgorithmConfig::TokenBucket {
                token_limit,
                tokens_per_period,
                replenishment_period,
            } => PartitionState::TokenBucket(Mutex::new(TokenBucketState {
                token_limit: *token_limit,
                tokens_per_period: *tokens_per_period,
                period: *replenishment_period,
                tokens: *token_limit,
                last_replenish: now,
            })),
            AlgorithmConfig::Concurrency { permit_limit } => PartitionState::Concurrency {
                semaphore: Arc::new(Semaphore::new(*permit_limit as usize)),
            },
        };

        Self {
            queued: AtomicU32::new(0),
            state,
        }
    }

    /// The in-flight semaphore, for concurrency partitions only.
    pub(crate) fn semaphore(&self) -> Option<Arc<Semaphore>> {
        match &self.state {
            PartitionState::Concurrency { semaphore } => Some(semaphore.clone()),
            _ => None,
        }
    }

    /// Run one counter check. Panics never: lock poisoning is impossible
    /// because no code panics while holding the state mutex.
    pub(crate) fn check(&self, now: Instant) -> CheckOutcome {
        match &self.state {
            PartitionState::FixedWindow(state) => recover(state.lock()).check(now),
            PartitionState::SlidingWindow(state) => recover(state.lock()).check(now),
            PartitionState::TokenBucket(state) => recover(state.lock()).check(now),
            PartitionState::Concurrency { .. } => CheckOutcome {
                allowed: false,
                retry_after: Duration::ZERO,
            },
        }
    }

    /// Try to reserve a queue slot, giving up immediately on overflow.
    pub(crate) fn try_enqueue(self: &Arc<Self>, queue_limit: u32) -> Option<QueueSlot> {
        let mut current = self.queued.load(Ordering::Acquire);

        loop {
            if current >= queue_limit {
                return None;
            }

            match self
                .queued
                .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Some(QueueSlot(self.clone())),
                Err(observed) => current = observed,
            }
        }
    }
}

fn recover<'a, T>(result: Result<MutexGuard<'a, T>, std::sync::PoisonError<MutexGuard<'a, T>>>) -> MutexGuard<'a, T> {
    match result {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// RAII queue slot; released even if the waiting caller is cancelled.
pub(crate) struct QueueSlot(Arc<Partition>);

impl Drop for QueueSlot {
    fn drop(&mut self) {
        self.0.queued.fetch_sub(1, Ordering::AcqRel);
    }
}

struct FixedWindowState {
    permit_limit: u32,
    window: Duration,
    window_start: Instant,
    count: u32,
}

impl FixedWindowState {
    fn check(&mut self, now: Instant) -> CheckOutcome {
        let elapsed = now.saturating_duration_since(self.window_start);

        if elapsed >= self.window {
            // Align the new window to the boundary grid seeded by the first
            // request, then reset the counter.
            let into_window = elapsed.as_nanos() % self.window.as_nanos();
            self.window_start = now - Duration::from_nanos(into_window as u64);
            self.count = 0;
        }

        if self.count < self.permit_limit {
            self.count += 1;

            return CheckOutcome {
                allowed: true,
                retry_after: Duration::ZERO,
            };
        }

        CheckOutcome {
            allowed: false,
            retry_after: self.window - now.saturating_duration_since(self.window_start),
        }
    }
}

struct SlidingWindowState {
    permit_limit: u32,
    segment_len: Duration,
    /// Ring of per-segment counts covering the trailing window.
    counts: Vec<u32>,
    /// Index of the segment containing `head_start`.
    head: usize,
    head_start: Instant,
}

impl SlidingWindowState {
    fn check(&mut self, now: Instant) -> CheckOutcome {
        self.advance(now);

        let total: u32 = self.counts.iter().sum();

        if total < self.permit_limit {
            self.counts[self.head] += 1;

            return CheckOutcome {
                allowed: true,
                retry_after: Duration::ZERO,
            };
        }

        // The next segment rotation drops the oldest counts.
        CheckOutcome {
            allowed: false,
            retry_after: self.segment_len - now.saturating_duration_since(self.head_start),
        }
    }

    fn advance(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.head_start);
        let steps = (elapsed.as_nanos() / self.segment_len.as_nanos()) as u64;

        if steps == 0 {
            return;
        }

        if steps >= self.counts.len() as u64 {
            self.counts.fill(0);
        } else {
            for _ in 0..steps {
                self.head = (self.head + 1) % self.counts.len();
                self.counts[self.head] = 0;
            }
        }

        let into_segment = elapsed.as_nanos() % self.segment_len.as_nanos();
        self.head_start = now - Duration::from_nanos(into_segment as u64);
    }
}

struct TokenBucketState {
    token_limit: u32,
    tokens_per_period: u32,
    period: Duration,
    tokens: u32,
    last_replenish: Instant,
}

impl TokenBucketState {
    fn check(&mut self, now: Instant) -> CheckOutcome {
        let elapsed = now.saturating_duration_since(self.last_replenish);
        let periods = (elapsed.as_nanos() / self.period.as_nanos()) as u64;

        if periods > 0 {
            let added = periods
                .saturating_mul(self.tokens_per_period as u64)
                .min(self.token_limit as u64) as u32;
            self.tokens = self.tokens.saturating_add(added).min(self.token_limit);

            let into_period = elapsed.as_nanos() % self.period.as_nanos();
            self.last_replenish = now - Duration::from_nanos(into_period as u64);
        }

        if self.tokens > 0 {
            self.tokens -= 1;

            return CheckOutcome {
                allowed: true,
                retry_after: Duration::ZERO,
            };
        }

        CheckOutcome {
            allowed: false,
            retry_after: self.period - now.saturating_duration_since(self.last_replenish),
        }
    }
}
