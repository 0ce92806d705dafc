//! Hive Retry — reconnect pacing for the distributor transport.
//!
//! Two independent capabilities are combined to drive a reconnect sequence:
//!
//! - A [`DelayPolicy`] decides how long to pause before the next attempt
//!   (none, fixed, exponential, bounded exponential).
//! - A [`RetryPolicy`] decides whether another attempt is permitted at all
//!   (once, N times, forever) and invokes its delay policy when it is.
//!
//! [`RetryPolicyBuilder`] selects the concrete variants from the four
//! configuration values the transport exposes.
//!
//! ```rust
//! use hive_retry::{RetryDecision, RetryPolicy, RetryPolicyBuilder};
//!
//! let mut policy = RetryPolicyBuilder::new(2, 0, 0, false).build().unwrap();
//! assert_eq!(policy.retry(), RetryDecision::Proceed);
//! assert_eq!(policy.retry(), RetryDecision::Proceed);
//! assert_eq!(policy.retry(), RetryDecision::Exhausted);
//! ```

pub mod builder;
pub mod delay;
pub mod error;
pub mod policy;

// ── Re-exports for convenience ──────────────────────────────────────────

pub use builder::RetryPolicyBuilder;
pub use delay::{
    BoundedExponentialBackOff, DelayPolicy, DelayStrategy, ExponentialBackOff, FixedDelay,
    MAX_BACKOFF_EXPONENT, NoDelay,
};
pub use error::RetryError;
pub use policy::{
    AttemptForever, AttemptNTimes, AttemptOnce, RetryDecision, RetryPolicy, RetryStrategy,
};
