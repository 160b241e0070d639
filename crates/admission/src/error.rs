//! Error types for admission limiting.

/// Errors that can occur during an admission check.
///
/// Policy rejections are not errors; they are [`crate::AdmissionDecision`]
/// values returned to the caller. An error here means the caller asked for
/// something the configuration does not define.
#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    /// The named policy does not exist in the configuration.
    #[error("Unknown admission policy '{0}'")]
    UnknownPolicy(String),
}
