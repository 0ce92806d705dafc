//! Delay policies — the pause inserted before each retry attempt.

use std::fmt;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};

/// Largest exponent used by the exponential policies, so `2^n` fits in a `u64`.
pub const MAX_BACKOFF_EXPONENT: u32 = 32;

/// Computes the pause before the next retry attempt.
pub trait DelayPolicy: Send + fmt::Debug {
    /// Compute the delay for the next attempt, advancing any internal state.
    fn next_delay(&mut self) -> Duration;

    /// Restore the policy to its initial state.
    fn reset(&mut self) {}
}

/// Never pauses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NoDelay;

impl DelayPolicy for NoDelay {
    fn next_delay(&mut self) -> Duration {
        Duration::ZERO
    }
}

/// Pauses for the same duration before every attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedDelay {
    delay: Duration,
}

impl FixedDelay {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    pub fn from_millis(millis: u64) -> Self {
        Self::new(Duration::from_millis(millis))
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }
}

impl DelayPolicy for FixedDelay {
    fn next_delay(&mut self) -> Duration {
        self.delay
    }
}

/// Jittered exponential growth.
///
/// The n-th call (n starting at 1, capped at [`MAX_BACKOFF_EXPONENT`]) yields
/// `base * uniform(1, 2^n)`. [`reset`](DelayPolicy::reset) starts the
/// sequence over at `2^1`.
pub struct ExponentialBackOff {
    base: Duration,
    attempt: u32,
    rng: Box<dyn RngCore + Send>,
}

impl ExponentialBackOff {
    /// Create a back-off seeded from the operating system.
    pub fn new(base: Duration) -> Self {
        Self::with_rng(base, StdRng::from_os_rng())
    }

    /// Create a back-off drawing its jitter from the supplied generator.
    pub fn with_rng(base: Duration, rng: impl RngCore + Send + 'static) -> Self {
        Self {
            base,
            attempt: 0,
            rng: Box::new(rng),
        }
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    /// Number of delays computed since creation or the last reset, capped.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

impl fmt::Debug for ExponentialBackOff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExponentialBackOff")
            .field("base", &self.base)
            .field("attempt", &self.attempt)
            .finish_non_exhaustive()
    }
}

impl DelayPolicy for ExponentialBackOff {
    fn next_delay(&mut self) -> Duration {
        self.attempt = (self.attempt + 1).min(MAX_BACKOFF_EXPONENT);
        let upper = 1u64 << self.attempt;
        let factor = self.rng.random_range(1..=upper);
        scale(self.base, factor)
    }

    fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// [`ExponentialBackOff`] clamped to a maximum delay.
#[derive(Debug)]
pub struct BoundedExponentialBackOff {
    inner: ExponentialBackOff,
    max: Duration,
}

impl BoundedExponentialBackOff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self::from_back_off(ExponentialBackOff::new(base), max)
    }

    pub fn from_back_off(inner: ExponentialBackOff, max: Duration) -> Self {
        Self { inner, max }
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    pub fn base(&self) -> Duration {
        self.inner.base()
    }
}

impl DelayPolicy for BoundedExponentialBackOff {
    fn next_delay(&mut self) -> Duration {
        self.inner.next_delay().min(self.max)
    }

    fn reset(&mut self) {
        self.inner.reset();
    }
}

/// The delay variants the builder can select.
#[derive(Debug)]
pub enum DelayStrategy {
    None(NoDelay),
    Fixed(FixedDelay),
    Exponential(ExponentialBackOff),
    BoundedExponential(BoundedExponentialBackOff),
}

impl DelayPolicy for DelayStrategy {
    fn next_delay(&mut self) -> Duration {
        match self {
            Self::None(p) => p.next_delay(),
            Self::Fixed(p) => p.next_delay(),
            Self::Exponential(p) => p.next_delay(),
            Self::BoundedExponential(p) => p.next_delay(),
        }
    }

    fn reset(&mut self) {
        match self {
            Self::None(p) => p.reset(),
            Self::Fixed(p) => p.reset(),
            Self::Exponential(p) => p.reset(),
            Self::BoundedExponential(p) => p.reset(),
        }
    }
}

fn scale(base: Duration, factor: u64) -> Duration {
    let base_ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
    Duration::from_millis(base_ms.saturating_mul(factor))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
