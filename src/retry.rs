//! Deadline-bounded retry loop used by the operation queue.
//!
//! Semantics:
//! - An [`OperationBudget`] carries an absolute deadline and a total attempt count
//!   (initial try + retries).
//! - Before every attempt the deadline is checked; once it has passed the operation fails with
//!   `TRANSIENT_FAILURE` without another attempt, whatever attempt budget remains.
//! - Only retryable codes (`RATE_LIMITED`, `TRANSIENT_FAILURE`) are retried. Any other error is
//!   returned unchanged.
//! - A retryable error on the final attempt becomes `TRANSIENT_FAILURE` "failed after N
//!   attempts", with the last error as detail.
//! - Between attempts the policy sleeps `jitter(backoff(attempt))`.
//!
//! ```rust
//! use std::time::Duration;
//! use guildforge::{Backoff, DeployError, InstantSleeper, Jitter, OperationBudget, RetryPolicy};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let policy = RetryPolicy::builder()
//!     .backoff(Backoff::exponential(Duration::from_millis(500)))
//!     .with_jitter(Jitter::None)
//!     .with_sleeper(InstantSleeper)
//!     .build()
//!     .unwrap();
//! let budget = OperationBudget::within(Duration::from_secs(60), 3);
//! let result: Result<(), DeployError> =
//!     policy.execute(&budget, || async { Err(DeployError::transient("503")) }).await;
//! assert_eq!(result.unwrap_err().message, "operation failed after 3 attempts");
//! # });
//! ```

use crate::error::DeployError;
use crate::{Backoff, Jitter, Sleeper, TokioSleeper};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Per-operation limits: absolute deadline and total attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationBudget {
    pub deadline: Instant,
    pub max_attempts: u32,
}

impl OperationBudget {
    pub fn new(deadline: Instant, max_attempts: u32) -> Self {
        Self { deadline, max_attempts }
    }

    /// Budget whose deadline is `timeout` from now. Timeouts past the clock's range mean
    /// roughly thirty years.
    pub fn within(timeout: Duration, max_attempts: u32) -> Self {
        let now = Instant::now();
        let deadline = now.checked_add(timeout).unwrap_or_else(|| now + FAR_FUTURE);
        Self { deadline, max_attempts }
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() > self.deadline
    }
}

/// Backoff, jitter and sleeper for retryable remote calls.
#[derive(Clone)]
pub struct RetryPolicy {
    backoff: Backoff,
    jitter: Jitter,
    sleeper: Arc<dyn Sleeper>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("backoff", &self.backoff)
            .field("jitter", &self.jitter)
            .field("sleeper", &self.sleeper)
            .finish()
    }
}

impl RetryPolicy {
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder::new()
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    pub fn jitter(&self) -> &Jitter {
        &self.jitter
    }

    /// Run `operation` until it succeeds, fails permanently, or the budget runs out.
    pub async fn execute<T, Fut, Op>(
        &self,
        budget: &OperationBudget,
        mut operation: Op,
    ) -> Result<T, DeployError>
    where
        Fut: Future<Output = Result<T, DeployError>>,
        Op: FnMut() -> Fut,
    {
        let max_attempts = budget.max_attempts.max(1);
        let mut last_error: Option<DeployError> = None;

        for attempt in 1..=max_attempts {
            if budget.is_expired() {
                let err = DeployError::transient("operation deadline exceeded");
                return Err(match last_error {
                    Some(last) => err.with_detail(last.to_string()),
                    None => err,
                });
            }

            let err = match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !err.is_retryable() {
                return Err(err);
            }
            if attempt == max_attempts {
                return Err(DeployError::transient(format!(
                    "operation failed after {} attempts",
                    max_attempts
                ))
                .with_detail(err.to_string()));
            }

            let delay = self.jitter.apply(self.backoff.delay(attempt as usize));
            tracing::debug!(
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                code = %err.code,
                "retrying after backoff"
            );
            last_error = Some(err);
            self.sleeper.sleep(delay).await;
        }

        // max_attempts >= 1, so the loop always returns.
        Err(DeployError::transient("operation failed after retries"))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicyBuilder::new().into_policy()
    }
}

/// Errors produced while building a retry policy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BuildError {
    #[error(transparent)]
    Backoff(#[from] crate::backoff::BackoffError),
}

/// Builder for [`RetryPolicy`].
pub struct RetryPolicyBuilder {
    base: Duration,
    cap: Option<Duration>,
    backoff: Option<Backoff>,
    jitter: Jitter,
    sleeper: Arc<dyn Sleeper>,
}

impl RetryPolicyBuilder {
    /// Defaults: 500ms base, 20s cap, ±30% jitter, tokio sleeping.
    pub fn new() -> Self {
        Self {
            base: Duration::from_millis(500),
            cap: Some(Duration::from_secs(20)),
            backoff: None,
            jitter: Jitter::default(),
            sleeper: Arc::new(TokioSleeper),
        }
    }

    /// Use an already-configured backoff (its own cap, if any, applies).
    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = Some(backoff);
        self
    }

    /// Exponential backoff from `base`, capped at `cap`.
    pub fn exponential(mut self, base: Duration, cap: Duration) -> Self {
        self.backoff = None;
        self.base = base;
        self.cap = Some(cap);
        self
    }

    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_sleeper<S>(mut self, sleeper: S) -> Self
    where
        S: Sleeper + 'static,
    {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn build(self) -> Result<RetryPolicy, BuildError> {
        let backoff = match (self.backoff, self.cap) {
            (Some(backoff), _) => backoff,
            (None, Some(cap)) => Backoff::exponential(self.base).with_max(cap)?,
            (None, None) => Backoff::exponential(self.base),
        };
        Ok(RetryPolicy { backoff, jitter: self.jitter, sleeper: self.sleeper })
    }

    fn into_policy(self) -> RetryPolicy {
        let backoff = self.backoff.unwrap_or_else(|| Backoff::exponential(self.base));
        let backoff = match self.cap {
            Some(cap) => backoff.with_max(cap).unwrap_or(backoff),
            None => backoff,
        };
        RetryPolicy { backoff, jitter: self.jitter, sleeper: self.sleeper }
    }
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::{InstantSleeper, TrackingSleeper};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy_with(sleeper: TrackingSleeper, jitter: Jitter) -> RetryPolicy {
        RetryPolicy::builder().with_jitter(jitter).with_sleeper(sleeper).build().unwrap()
    }

    #[tokio::test]
    async fn succeeds_first_try_without_sleeping() {
        let sleeper = TrackingSleeper::new();
        let policy = policy_with(sleeper.clone(), Jitter::default());
        let budget = OperationBudget::within(Duration::from_secs(60), 8);

        let out = policy.execute(&budget, || async { Ok::<_, DeployError>(7) }).await;
        assert_eq!(out.unwrap(), 7);
        assert_eq!(sleeper.count(), 0);
    }

    #[tokio::test]
    async fn retries_transient_until_success() {
        let sleeper = TrackingSleeper::new();
        let policy = policy_with(sleeper.clone(), Jitter::None);
        let budget = OperationBudget::within(Duration::from_secs(60), 8);
        let calls = AtomicU32::new(0);

        let out = policy
            .execute(&budget, || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(DeployError::rate_limited("429"))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;

        assert_eq!(out.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(sleeper.delays(), vec![Duration::from_millis(500), Duration::from_millis(1000)]);
    }

    #[tokio::test]
    async fn non_retryable_returns_unchanged_after_one_call() {
        let sleeper = TrackingSleeper::new();
        let policy = policy_with(sleeper.clone(), Jitter::default());
        let budget = OperationBudget::within(Duration::from_secs(60), 8);
        let calls = AtomicU32::new(0);

        let err = policy
            .execute(&budget, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(DeployError::forbidden("Missing Permissions")) }
            })
            .await
            .unwrap_err();

        assert_eq!(err, DeployError::forbidden("Missing Permissions"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(sleeper.count(), 0);
    }

    #[tokio::test]
    async fn exhaustion_reports_transient_with_last_error() {
        let sleeper = TrackingSleeper::new();
        let policy = policy_with(sleeper.clone(), Jitter::default());
        let budget = OperationBudget::within(Duration::from_secs(600), 4);
        let calls = AtomicU32::new(0);

        let err = policy
            .execute(&budget, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(DeployError::rate_limited("429 Too Many Requests")) }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(err.code, ErrorCode::TransientFailure);
        assert_eq!(err.message, "operation failed after 4 attempts");
        assert!(err.detail.as_deref().unwrap_or_default().contains("429"));

        // maxAttempts - 1 sleeps, each within ±30% of the capped exponential delay
        let delays = sleeper.delays();
        assert_eq!(delays.len(), 3);
        for (i, d) in delays.iter().enumerate() {
            let nominal = policy.backoff().delay(i + 1);
            let (low, high) = policy.jitter().bounds(nominal);
            assert!(*d >= low && *d <= high, "retry {} slept {:?}", i + 1, d);
        }
    }

    #[tokio::test]
    async fn delays_never_exceed_jittered_cap() {
        let sleeper = TrackingSleeper::new();
        let policy = RetryPolicy::builder()
            .exponential(Duration::from_millis(500), Duration::from_secs(20))
            .with_sleeper(sleeper.clone())
            .build()
            .unwrap();
        let budget = OperationBudget::within(Duration::from_secs(3600), 12);

        let _ = policy
            .execute(&budget, || async { Err::<(), _>(DeployError::transient("flaky")) })
            .await;

        assert_eq!(sleeper.count(), 11);
        assert!(sleeper.delays().iter().all(|d| *d <= Duration::from_millis(26_000)));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_deadline_fails_without_attempt() {
        let policy = RetryPolicy::builder().with_sleeper(InstantSleeper).build().unwrap();
        let budget = OperationBudget::within(Duration::from_millis(10), 8);
        tokio::time::advance(Duration::from_millis(50)).await;
        let calls = AtomicU32::new(0);

        let err = policy
            .execute(&budget, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, DeployError>(()) }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(err.code, ErrorCode::TransientFailure);
        assert_eq!(err.message, "operation deadline exceeded");
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_stops_retries_despite_remaining_attempts() {
        // Real (paused) sleeping: 500ms + 1000ms of backoff crosses the 1.2s deadline.
        let policy = RetryPolicy::builder().with_jitter(Jitter::None).build().unwrap();
        let budget = OperationBudget::within(Duration::from_millis(1200), 8);
        let calls = AtomicU32::new(0);

        let err = policy
            .execute(&budget, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(DeployError::transient("502 Bad Gateway")) }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(err.message, "operation deadline exceeded");
        assert!(err.detail.unwrap_or_default().contains("502"));
    }

    #[test]
    fn oversized_timeout_saturates() {
        let budget = OperationBudget::within(Duration::MAX, 3);
        assert!(!budget.is_expired());
        assert!(budget.deadline > Instant::now() + Duration::from_secs(86_400 * 365));
    }

    #[test]
    fn builder_rejects_cap_below_base() {
        let err = RetryPolicy::builder()
            .exponential(Duration::from_secs(5), Duration::from_secs(1))
            .build()
            .unwrap_err();
        assert!(matches!(err, BuildError::Backoff(_)));
    }
}
