//! Admission limiting for the Parapet service boundary.
//!
//! This crate decides whether an inbound request proceeds, waits for
//! capacity, or is rejected, based on named per-partition policies:
//! - Fixed window counting
//! - Sliding window counting (segmented)
//! - Token bucket
//! - Concurrency limiting with FIFO queueing
//!
//! Partition state is created lazily per key, mutated only by admission
//! checks, and garbage-collected after an idle period. Contention is scoped
//! to a single partition's state; there is no global request-processing lock.

#![deny(missing_docs)]

mod decision;
mod error;
mod manager;
mod partition;
mod request;

pub use decision::{AdmissionDecision, AdmissionPermit};
pub use error::AdmissionError;
pub use manager::AdmissionLimiter;
pub use request::{AdmitRequest, AdmitRequestBuilder};
