//! Retry configuration errors.

/// Rejected arguments when constructing a retry or delay policy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RetryError {
    /// Exponential back-off needs a strictly positive base delay.
    #[error("Exponential back-off selected with invalid delay: {0} ms")]
    InvalidExponentialDelay(i64),

    /// A bounded attempt policy needs at least one attempt.
    #[error("Invalid max attempts: {0}")]
    InvalidMaxAttempts(i64),
}
