//! Decision values returned by admission checks.

use std::time::Duration;

use tokio::sync::OwnedSemaphorePermit;

/// Outcome of an admission check.
///
/// Rejections propagate to the caller as a value, never as an error from
/// deep inside request processing. Turning a rejection into a protocol-level
/// response (for example a 429 with a retry hint header) is the caller's
/// responsibility.
#[derive(Debug)]
#[must_use]
pub enum AdmissionDecision {
    /// The request may proceed immediately.
    Allowed(AdmissionPermit),
    /// The request waited in the policy's queue and may now proceed.
    Queued {
        /// How long the request waited for capacity.
        waited: Duration,
        /// Permit covering the request while it is in flight.
        permit: AdmissionPermit,
    },
    /// The request exceeded the policy and must not proceed.
    Rejected {
        /// Suggested delay before retrying, when one can be computed.
        retry_after: Option<Duration>,
    },
}

impl AdmissionDecision {
    /// Whether the request may proceed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed(_) | Self::Queued { .. })
    }

    /// The suggested retry delay carried by a rejection.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Rejected { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Permit held for the lifetime of an admitted request.
///
/// For concurrency policies, dropping the permit releases the partition's
/// in-flight slot. For counting policies the permit is empty.
#[derive(Debug)]
pub struct AdmissionPermit {
    _slot: Option<OwnedSemaphorePermit>,
}

impl AdmissionPermit {
    pub(crate) fn counted() -> Self {
        Self { _slot: None }
    }

    pub(crate) fn in_flight(slot: OwnedSemaphorePermit) -> Self {
        Self { _slot: Some(slot) }
    }
}
