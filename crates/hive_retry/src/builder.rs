//! Selects concrete retry and delay variants from plain configuration values.

use std::time::Duration;

use crate::delay::{BoundedExponentialBackOff, DelayStrategy, ExponentialBackOff, FixedDelay, NoDelay};
use crate::error::RetryError;
use crate::policy::{AttemptForever, AttemptNTimes, AttemptOnce, RetryStrategy};

/// Builder mirroring the four `net.retry.*` configuration keys.
///
/// - `attempts < 0` retries forever, `0` never retries, `n > 0` retries `n` times.
/// - With exponential back-off, `delay_ms` must be positive; `max_delay_ms > 0`
///   clamps the growth.
/// - Without it, `delay_ms <= 0` means no delay, otherwise a fixed delay that
///   a positive `max_delay_ms` caps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicyBuilder {
    attempts: i64,
    delay_ms: i64,
    max_delay_ms: i64,
    exponential: bool,
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self::new(5, 1_000, 32_000, true)
    }
}

impl RetryPolicyBuilder {
    pub fn new(attempts: i64, delay_ms: i64, max_delay_ms: i64, exponential: bool) -> Self {
        Self {
            attempts,
            delay_ms,
            max_delay_ms,
            exponential,
        }
    }

    pub fn with_attempts(mut self, attempts: i64) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn with_no_retries(self) -> Self {
        self.with_attempts(0)
    }

    pub fn retry_forever(self) -> Self {
        self.with_attempts(-1)
    }

    pub fn with_delay_millis(mut self, delay_ms: i64) -> Self {
        self.delay_ms = delay_ms;
        self
    }

    pub fn with_no_delay(self) -> Self {
        self.with_delay_millis(0)
    }

    pub fn with_max_delay_millis(mut self, max_delay_ms: i64) -> Self {
        self.max_delay_ms = max_delay_ms;
        self
    }

    pub fn with_exponential_back_off(mut self, exponential: bool) -> Self {
        self.exponential = exponential;
        self
    }

    /// Build the retry policy, wrapping the delay policy selected by
    /// [`build_delay_policy`](Self::build_delay_policy).
    pub fn build(&self) -> Result<RetryStrategy, RetryError> {
        let delay = self.build_delay_policy()?;
        let policy = match self.attempts {
            n if n < 0 => RetryStrategy::Forever(AttemptForever::new(delay)),
            0 => RetryStrategy::Once(AttemptOnce::new(delay)),
            n => RetryStrategy::NTimes(AttemptNTimes::new(n, delay)?),
        };
        Ok(policy)
    }

    pub fn build_delay_policy(&self) -> Result<DelayStrategy, RetryError> {
        if self.exponential {
            if self.delay_ms <= 0 {
                return Err(RetryError::InvalidExponentialDelay(self.delay_ms));
            }
            let back_off = ExponentialBackOff::new(millis(self.delay_ms));
            return Ok(if self.max_delay_ms > 0 {
                DelayStrategy::BoundedExponential(BoundedExponentialBackOff::from_back_off(
                    back_off,
                    millis(self.max_delay_ms),
                ))
            } else {
                DelayStrategy::Exponential(back_off)
            });
        }

        if self.delay_ms <= 0 {
            return Ok(DelayStrategy::None(NoDelay));
        }

        let delay = if self.max_delay_ms > 0 {
            self.delay_ms.min(self.max_delay_ms)
        } else {
            self.delay_ms
        };
        Ok(DelayStrategy::Fixed(FixedDelay::new(millis(delay))))
    }
}

fn millis(value: i64) -> Duration {
    Duration::from_millis(u64::try_from(value).unwrap_or(0))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{RetryDecision, RetryPolicy};

    #[test]
    fn test_negative_attempts_retry_forever() {
        let policy = RetryPolicyBuilder::new(-1, 0, 0, false).build().unwrap();
        assert!(matches!(policy, RetryStrategy::Forever(_)));
    }

    #[test]
    fn test_zero_attempts_attempt_once() {
        let mut policy = RetryPolicyBuilder::new(0, 0, 0, false).build().unwrap();
        assert!(matches!(policy, RetryStrategy::Once(_)));
        assert_eq!(policy.retry(), RetryDecision::Exhausted);
    }

    #[test]
    fn test_positive_attempts_attempt_n_times() {
        let policy = RetryPolicyBuilder::new(7, 0, 0, false).build().unwrap();
        match policy {
            RetryStrategy::NTimes(p) => assert_eq!(p.max_attempts(), 7),
            other => panic!("expected NTimes, got {other:?}"),
        }
    }

    #[test]
    fn test_no_delay_when_delay_not_positive() {
        let delay = RetryPolicyBuilder::new(1, 0, 500, false)
            .build_delay_policy()
            .unwrap();
        assert!(matches!(delay, DelayStrategy::None(_)));

        let delay = RetryPolicyBuilder::new(1, -10, 0, false)
            .build_delay_policy()
            .unwrap();
        assert!(matches!(delay, DelayStrategy::None(_)));
    }

    #[test]
    fn test_fixed_delay_capped_by_max() {
        let delay = RetryPolicyBuilder::new(1, 5_000, 2_000, false)
            .build_delay_policy()
            .unwrap();
        match delay {
            DelayStrategy::Fixed(d) => assert_eq!(d.delay(), Duration::from_millis(2_000)),
            other => panic!("expected Fixed, got {other:?}"),
        }

        let delay = RetryPolicyBuilder::new(1, 300, 0, false)
            .build_delay_policy()
            .unwrap();
        match delay {
            DelayStrategy::Fixed(d) => assert_eq!(d.delay(), Duration::from_millis(300)),
            other => panic!("expected Fixed, got {other:?}"),
        }
    }

    #[test]
    fn test_exponential_selection() {
        let delay = RetryPolicyBuilder::new(3, 100, 1_000, true)
            .build_delay_policy()
            .unwrap();
        match delay {
            DelayStrategy::BoundedExponential(d) => {
                assert_eq!(d.base(), Duration::from_millis(100));
                assert_eq!(d.max(), Duration::from_millis(1_000));
            }
            other => panic!("expected BoundedExponential, got {other:?}"),
        }

        let delay = RetryPolicyBuilder::new(3, 100, 0, true)
            .build_delay_policy()
            .unwrap();
        assert!(matches!(delay, DelayStrategy::Exponential(_)));
    }

    #[test]
    fn test_exponential_requires_positive_delay() {
        let err = RetryPolicyBuilder::new(3, 0, 1_000, true).build().unwrap_err();
        assert_eq!(err, RetryError::InvalidExponentialDelay(0));

        let err = RetryPolicyBuilder::new(-1, -5, 0, true).build().unwrap_err();
        assert_eq!(err, RetryError::InvalidExponentialDelay(-5));
    }

    #[test]
    fn test_fluent_setters() {
        let builder = RetryPolicyBuilder::default()
            .retry_forever()
            .with_no_delay()
            .with_max_delay_millis(0)
            .with_exponential_back_off(false);
        assert_eq!(builder, RetryPolicyBuilder::new(-1, 0, 0, false));

        let builder = builder.with_no_retries().with_delay_millis(10);
        assert_eq!(builder, RetryPolicyBuilder::new(0, 10, 0, false));
    }

    #[test]
    fn test_default_matches_configuration_defaults() {
        let policy = RetryPolicyBuilder::default().build().unwrap();
        match policy {
            RetryStrategy::NTimes(p) => assert_eq!(p.max_attempts(), 5),
            other => panic!("expected NTimes, got {other:?}"),
        }
    }
}
