//! Delays between attempts to reach the queue broker.
//!
//! The default used by [`crate::supervisor::ReconnectPolicy`] is a constant delay, so a broker
//! that is slow to come up is retried at a fixed pace. Linear and exponential growth are
//! available for deployments that prefer to back off harder.
//!
//! All constructors and configuration functions are `const`.
//!
//! # Example
//!
//! ```
//! # use tradutor::backoff::{Backoff, Jitter};
//! # use std::time::Duration;
//! let backoff = Backoff::exponential(Duration::from_secs(1))
//!     .with_max(Duration::from_secs(30))
//!     .with_jitter(Jitter::Relative(0.1));
//!
//! assert!(backoff.delay(1) >= Duration::from_millis(900));
//! assert!(backoff.delay(1) <= Duration::from_millis(1100));
//! assert!(backoff.delay(20) <= Duration::from_secs(33));
//! ```
use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Growth {
    Constant,
    Linear,
    Exponential,
}

/// A random jitter applied on top of a computed delay.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Jitter {
    /// A jitter in the range `-delta..=delta`.
    Absolute(Duration),
    /// A jitter proportional to the computed delay, e.g. `0.1` for ±10%. The sign is ignored.
    Relative(f64),
}

impl Jitter {
    fn apply(&self, value: Duration) -> Duration {
        let millis = match self {
            Self::Absolute(delta) => delta.as_millis() as i64,
            Self::Relative(ratio) => (value.as_millis() as f64 * ratio.abs()).round() as i64,
        };
        if millis <= 0 {
            return value;
        }
        let offset = rand::thread_rng().gen_range(-millis..=millis);
        let jittered = (value.as_millis() as i64).saturating_add(offset);
        Duration::from_millis(jittered.max(0) as u64)
    }
}

/// How long to wait before the next attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    growth: Growth,
    base: Duration,
    max: Option<Duration>,
    jitter: Option<Jitter>,
}

impl Backoff {
    /// The same delay before every attempt.
    ///
    /// ```
    /// # use tradutor::backoff::Backoff;
    /// # use std::time::Duration;
    /// let backoff = Backoff::constant(Duration::from_secs(5));
    ///
    /// assert_eq!(backoff.delay(1), Duration::from_secs(5));
    /// assert_eq!(backoff.delay(9), Duration::from_secs(5));
    /// ```
    pub const fn constant(delay: Duration) -> Self {
        Self::new(Growth::Constant, delay)
    }

    /// `step * attempt`.
    pub const fn linear(step: Duration) -> Self {
        Self::new(Growth::Linear, step)
    }

    /// `base * 2^(attempt - 1)`.
    pub const fn exponential(base: Duration) -> Self {
        Self::new(Growth::Exponential, base)
    }

    const fn new(growth: Growth, base: Duration) -> Self {
        Self {
            growth,
            base,
            max: None,
            jitter: None,
        }
    }

    /// Clamps the computed delay, before jitter, to `max`.
    pub const fn with_max(mut self, max: Duration) -> Self {
        self.max = Some(max);
        self
    }

    pub const fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = Some(jitter);
        self
    }

    /// The delay to wait after the given (1-based) failed attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let mut delay = match self.growth {
            Growth::Constant => self.base,
            Growth::Linear => self.base.saturating_mul(attempt),
            Growth::Exponential => self
                .base
                .saturating_mul(2u32.checked_pow(attempt - 1).unwrap_or(u32::MAX)),
        };
        if let Some(max) = self.max {
            delay = delay.min(max);
        }
        match self.jitter {
            Some(jitter) => jitter.apply(delay),
            None => delay,
        }
    }
}
