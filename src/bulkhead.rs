//! Global concurrency limit for remote calls.
//!
//! Unlike a rejecting bulkhead, callers over capacity wait for a permit. The queue holds one
//! permit for the whole retry loop of an operation, so backoff sleeps count against the limit.

use crate::error::DeployError;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug, Clone)]
pub struct Bulkhead {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
}

impl Bulkhead {
    /// `max_concurrent` is clamped to at least one permit.
    pub fn new(max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.clamp(1, Semaphore::MAX_PERMITS);
        Self { semaphore: Arc::new(Semaphore::new(max_concurrent)), max_concurrent }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Operations currently holding a permit.
    pub fn in_flight(&self) -> usize {
        self.max_concurrent.saturating_sub(self.semaphore.available_permits())
    }

    /// Wait for a permit. Fails only if the semaphore was closed.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, DeployError> {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| DeployError::transient("concurrency limiter closed"))
    }

    /// Stop handing out permits; pending and future `acquire` calls fail.
    pub fn close(&self) {
        self.semaphore.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn waits_instead_of_rejecting() {
        let bulkhead = Bulkhead::new(2);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let bulkhead = bulkhead.clone();
            let active = active.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let _permit = bulkhead.acquire().await.unwrap();
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert_eq!(bulkhead.in_flight(), 0);
    }

    #[tokio::test]
    async fn in_flight_tracks_held_permits() {
        let bulkhead = Bulkhead::new(3);
        let a = bulkhead.acquire().await.unwrap();
        let _b = bulkhead.acquire().await.unwrap();
        assert_eq!(bulkhead.in_flight(), 2);
        drop(a);
        assert_eq!(bulkhead.in_flight(), 1);
    }

    #[tokio::test]
    async fn zero_capacity_is_clamped() {
        let bulkhead = Bulkhead::new(0);
        assert_eq!(bulkhead.max_concurrent(), 1);
        assert!(bulkhead.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn closed_limiter_fails_acquire() {
        let bulkhead = Bulkhead::new(1);
        bulkhead.close();
        let err = bulkhead.acquire().await.unwrap_err();
        assert!(err.is_retryable());
    }
}
