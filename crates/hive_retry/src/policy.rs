//! Retry policies — attempt budgets that drive a reconnect sequence.

use std::fmt;

use tracing::debug;

use crate::delay::{DelayPolicy, DelayStrategy};
use crate::error::RetryError;

/// Outcome of a single [`RetryPolicy::retry`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Another attempt is permitted; the delay has already elapsed.
    Proceed,
    /// The attempt budget is spent.
    Exhausted,
}

impl RetryDecision {
    pub fn should_proceed(self) -> bool {
        matches!(self, Self::Proceed)
    }
}

/// Decides whether another attempt is permitted and paces it.
pub trait RetryPolicy: Send + fmt::Debug {
    /// Consume one attempt from the budget. Returns `false` once exhausted.
    fn should_retry(&mut self) -> bool;

    /// The delay policy used to pace permitted attempts.
    fn delay_policy(&mut self) -> &mut dyn DelayPolicy;

    /// Restore the initial budget and delay state.
    fn reset(&mut self) {
        self.delay_policy().reset();
    }

    /// Consume an attempt and, if permitted, block the calling thread for the
    /// computed delay.
    ///
    /// Run this on a worker thread (e.g. `spawn_blocking`), never on a
    /// reactor thread.
    fn retry(&mut self) -> RetryDecision {
        if !self.should_retry() {
            return RetryDecision::Exhausted;
        }

        let delay = self.delay_policy().next_delay();
        debug!("Retry in {} ms", delay.as_millis());
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        RetryDecision::Proceed
    }
}

/// Permits the initial attempt only; every retry is refused immediately.
#[derive(Debug)]
pub struct AttemptOnce<D = DelayStrategy> {
    delay: D,
}

impl<D: DelayPolicy> AttemptOnce<D> {
    pub fn new(delay: D) -> Self {
        Self { delay }
    }
}

impl<D: DelayPolicy> RetryPolicy for AttemptOnce<D> {
    fn should_retry(&mut self) -> bool {
        false
    }

    fn delay_policy(&mut self) -> &mut dyn DelayPolicy {
        &mut self.delay
    }
}

/// Permits `max_attempts` retries, then refuses until reset.
#[derive(Debug)]
pub struct AttemptNTimes<D = DelayStrategy> {
    max_attempts: u32,
    attempts: u32,
    delay: D,
}

impl<D: DelayPolicy> AttemptNTimes<D> {
    pub fn new(max_attempts: i64, delay: D) -> Result<Self, RetryError> {
        let max_attempts = u32::try_from(max_attempts)
            .ok()
            .filter(|n| *n > 0)
            .ok_or(RetryError::InvalidMaxAttempts(max_attempts))?;
        Ok(Self {
            max_attempts,
            attempts: 0,
            delay,
        })
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

impl<D: DelayPolicy> RetryPolicy for AttemptNTimes<D> {
    fn should_retry(&mut self) -> bool {
        if self.attempts < self.max_attempts {
            self.attempts += 1;
            true
        } else {
            false
        }
    }

    fn delay_policy(&mut self) -> &mut dyn DelayPolicy {
        &mut self.delay
    }

    fn reset(&mut self) {
        self.delay.reset();
        self.attempts = 0;
    }
}

/// Always permits another attempt.
#[derive(Debug)]
pub struct AttemptForever<D = DelayStrategy> {
    delay: D,
}

impl<D: DelayPolicy> AttemptForever<D> {
    pub fn new(delay: D) -> Self {
        Self { delay }
    }
}

impl<D: DelayPolicy> RetryPolicy for AttemptForever<D> {
    fn should_retry(&mut self) -> bool {
        true
    }

    fn delay_policy(&mut self) -> &mut dyn DelayPolicy {
        &mut self.delay
    }
}

/// The attempt variants the builder can select.
#[derive(Debug)]
pub enum RetryStrategy {
    Once(AttemptOnce),
    NTimes(AttemptNTimes),
    Forever(AttemptForever),
}

impl RetryPolicy for RetryStrategy {
    fn should_retry(&mut self) -> bool {
        match self {
            Self::Once(p) => p.should_retry(),
            Self::NTimes(p) => p.should_retry(),
            Self::Forever(p) => p.should_retry(),
        }
    }

    fn delay_policy(&mut self) -> &mut dyn DelayPolicy {
        match self {
            Self::Once(p) => p.delay_policy(),
            Self::NTimes(p) => p.delay_policy(),
            Self::Forever(p) => p.delay_policy(),
        }
    }

    fn reset(&mut self) {
        match self {
            Self::Once(p) => p.reset(),
            Self::NTimes(p) => p.reset(),
            Self::Forever(p) => p.reset(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Zero-length delay that counts how often it was consulted.
    #[derive(Debug, Clone, Default)]
    struct CountingDelay {
        calls: Arc<AtomicUsize>,
        resets: Arc<AtomicUsize>,
    }

    impl DelayPolicy for CountingDelay {
        fn next_delay(&mut self) -> Duration {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Duration::ZERO
        }

        fn reset(&mut self) {
            self.resets.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_attempt_n_times_permits_exactly_n() {
        let delay = CountingDelay::default();
        let mut policy = AttemptNTimes::new(3, delay.clone()).unwrap();

        for _ in 0..3 {
            assert_eq!(policy.retry(), RetryDecision::Proceed);
        }
        assert_eq!(policy.retry(), RetryDecision::Exhausted);
        assert_eq!(policy.retry(), RetryDecision::Exhausted);
        assert_eq!(policy.attempts(), 3);

        // Exhausted calls never delay.
        assert_eq!(delay.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_attempt_n_times_reset_restores_budget() {
        let delay = CountingDelay::default();
        let mut policy = AttemptNTimes::new(2, delay.clone()).unwrap();

        assert!(policy.retry().should_proceed());
        assert!(policy.retry().should_proceed());
        assert!(!policy.retry().should_proceed());

        policy.reset();
        assert_eq!(policy.attempts(), 0);
        assert_eq!(delay.resets.load(Ordering::SeqCst), 1);

        assert!(policy.retry().should_proceed());
        assert!(policy.retry().should_proceed());
        assert!(!policy.retry().should_proceed());
    }

    #[test]
    fn test_attempt_n_times_rejects_non_positive() {
        assert_eq!(
            AttemptNTimes::new(0, CountingDelay::default()).unwrap_err(),
            RetryError::InvalidMaxAttempts(0)
        );
        assert_eq!(
            AttemptNTimes::new(-4, CountingDelay::default()).unwrap_err(),
            RetryError::InvalidMaxAttempts(-4)
        );
    }

    #[test]
    fn test_attempt_once_never_retries() {
        let delay = CountingDelay::default();
        let mut policy = AttemptOnce::new(delay.clone());

        assert_eq!(policy.retry(), RetryDecision::Exhausted);
        assert_eq!(policy.retry(), RetryDecision::Exhausted);
        assert_eq!(delay.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_attempt_forever_always_proceeds() {
        let delay = CountingDelay::default();
        let mut policy = AttemptForever::new(delay.clone());

        for _ in 0..1_000 {
            assert_eq!(policy.retry(), RetryDecision::Proceed);
        }
        assert_eq!(delay.calls.load(Ordering::SeqCst), 1_000);
    }

    #[test]
    fn test_retry_blocks_for_fixed_delay() {
        let mut policy = AttemptForever::new(crate::delay::FixedDelay::from_millis(20));
        let started = std::time::Instant::now();
        assert!(policy.retry().should_proceed());
        assert!(started.elapsed() >= Duration::from_millis(20));
    }
}
