//! Capped exponential backoff.
//!
//! Attempt `n` (1-based: the delay slept *after* attempt `n` failed) waits
//! `min(cap, base * 2^(n-1))`. Attempt `0` is the initial call and never waits.
//!
//! ```rust
//! use std::time::Duration;
//! use guildforge::Backoff;
//!
//! let backoff = Backoff::exponential(Duration::from_millis(500))
//!     .with_max(Duration::from_secs(20))
//!     .unwrap();
//! assert_eq!(backoff.delay(1), Duration::from_millis(500));
//! assert_eq!(backoff.delay(3), Duration::from_millis(2000));
//! assert_eq!(backoff.delay(12), Duration::from_secs(20));
//! ```

use std::time::Duration;

/// Ceiling applied when a computation would overflow (1 day).
pub const MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

/// Invalid backoff configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackoffError {
    #[error("backoff base must be greater than zero")]
    BaseMustBePositive,
    #[error("max ({max:?}) must be >= base ({base:?})")]
    MaxLessThanBase { base: Duration, max: Duration },
}

/// Exponential backoff with an optional ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Option<Duration>,
}

impl Backoff {
    pub fn exponential(base: Duration) -> Self {
        Self { base, max: None }
    }

    /// Cap every delay at `max`.
    pub fn with_max(mut self, max: Duration) -> Result<Self, BackoffError> {
        if self.base.is_zero() {
            return Err(BackoffError::BaseMustBePositive);
        }
        if max < self.base {
            return Err(BackoffError::MaxLessThanBase { base: self.base, max });
        }
        self.max = Some(max);
        Ok(self)
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn max(&self) -> Option<Duration> {
        self.max
    }

    /// Delay to wait after `attempt` failed.
    pub fn delay(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = attempt.saturating_sub(1).min(u32::MAX as usize) as u32;
        let multiplier = 2u128.saturating_pow(exponent);
        let nanos = self.base.as_nanos().saturating_mul(multiplier);
        let raw = Duration::from_nanos(nanos.min(MAX_BACKOFF.as_nanos()) as u64);
        self.max.map_or(raw, |m| raw.min(m)).min(MAX_BACKOFF)
    }
}
