//! Outbound resilience pipeline for downstream calls.
//!
//! Every call to a downstream dependency passes through, in order: target
//! validation, a total timeout, transient-only retry with exponential
//! backoff, a per-target circuit breaker, and a per-attempt timeout. The
//! caller supplies the actual network operation as an async delegate and
//! receives either its result or one consolidated typed failure.

#![deny(missing_docs)]

mod breaker;
mod error;
mod pipeline;
mod target;

pub use error::{AttemptError, PipelineError, TargetValidationError};
pub use pipeline::ResiliencePipeline;
pub use target::validate_target;
