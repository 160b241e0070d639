//! Per-target circuit breaker.
//!
//! Closed while the downstream looks healthy, Open while it does not, and
//! HalfOpen for exactly one trial call after the break duration passes.
//! Failure statistics are a rolling window of attempt outcomes over the
//! configured sampling duration.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use config::CircuitBreakerConfig;
use tokio::time::Instant;

/// Hard cap on retained samples, independent of the sampling window.
const MAX_SAMPLES: usize = 10_000;

pub(crate) struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
}

struct BreakerState {
    phase: Phase,
    window: VecDeque<Sample>,
}

struct Sample {
    at: Instant,
    failed: bool,
}

enum Phase {
    Closed,
    Open { until: Instant },
    HalfOpen { trial_started: Instant },
}

impl CircuitBreaker {
    pub(crate) fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BreakerState {
                phase: Phase::Closed,
                window: VecDeque::new(),
            }),
        }
    }

    /// Ask permission to attempt a call. `Err` carries the time until the
    /// breaker will admit a trial.
    pub(crate) fn try_acquire(&self, now: Instant) -> Result<(), Duration> {
        let mut state = lock(&self.state);

        match state.phase {
            Phase::Closed => Ok(()),
            Phase::Open { until } => {
                if now < until {
                    return Err(until - now);
                }

                state.phase = Phase::HalfOpen { trial_started: now };
                Ok(())
            }
            Phase::HalfOpen { trial_started } => {
                // One trial at a time. A trial whose caller vanished without
                // reporting an outcome is abandoned after the break duration.
                let elapsed = now.saturating_duration_since(trial_started);

                if elapsed >= self.config.break_duration {
                    state.phase = Phase::HalfOpen { trial_started: now };
                    return Ok(());
                }

                Err(self.config.break_duration - elapsed)
            }
        }
    }

    pub(crate) fn record_success(&self, now: Instant) {
        let mut state = lock(&self.state);

        match state.phase {
            Phase::HalfOpen { .. } => {
                // Trial succeeded; the downstream has recovered.
                state.phase = Phase::Closed;
                state.window.clear();
            }
            Phase::Closed => {
                push_sample(&mut state, now, false);
                self.evict_stale(&mut state, now);
            }
            Phase::Open { .. } => {}
        }
    }

    pub(crate) fn record_failure(&self, now: Instant) {
        let mut state = lock(&self.state);

        match state.phase {
            Phase::HalfOpen { .. } => {
                // Trial failed; the break timer restarts.
                state.phase = Phase::Open {
                    until: now + self.config.break_duration,
                };
                state.window.clear();
            }
            Phase::Closed => {
                push_sample(&mut state, now, true);
                self.evict_stale(&mut state, now);

                let total = state.window.len() as u32;
                let failures = state.window.iter().filter(|s| s.failed).count();
                let ratio = failures as f64 / total as f64;

                if total >= self.config.minimum_throughput && ratio > self.config.failure_ratio {
                    log::warn!(
                        "Circuit opening: {failures}/{total} measured calls failed over the sampling window"
                    );
                    state.phase = Phase::Open {
                        until: now + self.config.break_duration,
                    };
                    state.window.clear();
                }
            }
            Phase::Open { .. } => {}
        }
    }

    fn evict_stale(&self, state: &mut BreakerState, now: Instant) {
        while let Some(sample) = state.window.front() {
            if now.saturating_duration_since(sample.at) <= self.config.sampling_window {
                break;
            }

            state.window.pop_front();
        }
    }
}

fn push_sample(state: &mut BreakerState, now: Instant, failed: bool) {
    if state.window.len() >= MAX_SAMPLES {
        state.window.pop_front();
    }

    state.window.push_back(Sample { at: now, failed });
}

fn lock(state: &Mutex<BreakerState>) -> MutexGuard<'_, BreakerState> {
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(minimum_throughput: u32) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_ratio: 0.1,
            minimum_throughput,
            sampling_window: Duration::from_secs(30),
            break_duration: Duration::from_secs(15),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_minimum_throughput_of_failures() {
        let breaker = breaker(5);
        let now = Instant::now();

        for _ in 0..4 {
            assert!(breaker.try_acquire(now).is_ok());
            breaker.record_failure(now);
        }

        // Four failures are below the minimum throughput.
        assert!(breaker.try_acquire(now).is_ok());
        breaker.record_failure(now);

        // The fifth trips it.
        let retry_after = breaker.try_acquire(now).unwrap_err();
        assert_eq!(retry_after, Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn failure_ratio_below_threshold_stays_closed() {
        let breaker = breaker(5);
        let now = Instant::now();

        // One failure in fifty calls is 2%, under the 10% threshold.
        breaker.record_failure(now);
        for _ in 0..49 {
            breaker.record_success(now);
        }
        breaker.record_failure(now);

        assert!(breaker.try_acquire(now).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_admits_a_single_trial() {
        let breaker = breaker(5);
        let now = Instant::now();

        for _ in 0..5 {
            breaker.record_failure(now);
        }
        assert!(breaker.try_acquire(now).is_err());

        let after_break = now + Duration::from_secs(15);
        assert!(breaker.try_acquire(after_break).is_ok());
        // A concurrent caller must not get a second trial.
        assert!(breaker.try_acquire(after_break).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn trial_success_closes_and_trial_failure_reopens() {
        let breaker = breaker(5);
        let now = Instant::now();

        for _ in 0..5 {
            breaker.record_failure(now);
        }

        let trial_at = now + Duration::from_secs(15);
        assert!(breaker.try_acquire(trial_at).is_ok());
        breaker.record_failure(trial_at);

        // Failed trial restarts the break timer.
        assert!(breaker.try_acquire(trial_at + Duration::from_secs(14)).is_err());

        let second_trial = trial_at + Duration::from_secs(15);
        assert!(breaker.try_acquire(second_trial).is_ok());
        breaker.record_success(second_trial);

        assert!(breaker.try_acquire(second_trial).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn samples_outside_the_window_are_forgotten() {
        let breaker = breaker(5);
        let now = Instant::now();

        for _ in 0..4 {
            breaker.record_failure(now);
        }

        // The old failures age out before the fifth arrives.
        let later = now + Duration::from_secs(31);
        breaker.record_failure(later);

        assert!(breaker.try_acquire(later).is_ok());
    }
}
