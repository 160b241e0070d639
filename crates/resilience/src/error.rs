//! Error types for the resilience pipeline.

use std::time::Duration;

/// Failure of a single call attempt, as reported by the caller's delegate.
///
/// The classification decides whether the pipeline retries: timeouts,
/// connection failures and 5xx-class statuses are transient; everything
/// else is permanent.
#[derive(Debug, thiserror::Error)]
pub enum AttemptError {
    /// The attempt timed out.
    #[error("Attempt timed out")]
    Timeout,
    /// The connection to the downstream could not be established or broke.
    #[error("Connection failed: {0}")]
    Connection(String),
    /// The downstream answered with a protocol status code.
    #[error("Downstream responded with status {0}")]
    Status(u16),
    /// Any other failure; treated as permanent.
    #[error("{0}")]
    Other(String),
}

impl AttemptError {
    /// Whether retrying this attempt could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout | Self::Connection(_) => true,
            Self::Status(status) => (500..600).contains(status),
            Self::Other(_) => false,
        }
    }
}

/// Consolidated failure of a pipeline execution.
///
/// The caller receives exactly one of these per call, after retry and
/// circuit logic has exhausted its options, never one error per attempt.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The named target does not exist in the configuration.
    #[error("Unknown downstream target '{0}'")]
    UnknownTarget(String),
    /// The target address is unsafe or misconfigured. Fatal; not retried.
    #[error(transparent)]
    TargetValidation(#[from] TargetValidationError),
    /// The circuit for this target is open; no network attempt was made.
    #[error("Circuit open for downstream target, retry in {retry_after:?}")]
    CircuitOpen {
        /// Time until the breaker admits a trial call.
        retry_after: Duration,
    },
    /// All attempts failed with transient errors.
    #[error("Downstream call failed after {attempts} attempts: {last}")]
    UpstreamTransient {
        /// Number of attempts made, including the first.
        attempts: u32,
        /// The final attempt's failure.
        last: AttemptError,
    },
    /// The downstream rejected the call; retrying would not help.
    #[error("Downstream call failed permanently: {0}")]
    UpstreamPermanent(AttemptError),
    /// The operation exceeded its total timeout, retries included.
    #[error("Downstream call exceeded the total timeout of {0:?}")]
    TotalTimeout(Duration),
    /// The caller cancelled before or during the operation.
    #[error("Downstream call cancelled by the caller")]
    Cancelled,
}

impl PipelineError {
    /// Whether the caller should present this as a generic "temporarily
    /// unavailable" outcome. Timeouts, exhausted retries and open circuits
    /// all collapse into the same signal; the internal state-machine detail
    /// is not the caller's business.
    pub fn is_temporarily_unavailable(&self) -> bool {
        matches!(
            self,
            Self::CircuitOpen { .. } | Self::UpstreamTransient { .. } | Self::TotalTimeout(_)
        )
    }
}

/// Reasons a target address fails validation.
#[derive(Debug, thiserror::Error)]
pub enum TargetValidationError {
    /// The target does not use secure transport.
    #[error("Target '{0}' does not use secure transport")]
    InsecureTransport(String),
    /// The target has no host at all.
    #[error("Target '{0}' has no host")]
    MissingHost(String),
    /// The target points at a loopback address.
    #[error("Target '{0}' points at a loopback address")]
    Loopback(String),
    /// The target points into a private or link-local network.
    #[error("Target '{0}' points into a private network")]
    PrivateNetwork(String),
}
