//! Concurrency and retry queue for remote operations.
//!
//! Three guarantees compose here:
//!
//! 1. **Idempotency-key dedup.** While an operation with key `K` is in flight, another
//!    submission with `K` joins the same outcome instead of calling the platform again. The
//!    entry is removed exactly when the outcome settles.
//! 2. **Per-tenant FIFO.** Each tenant has one lane (an unbounded channel drained by a single
//!    spawned consumer). Jobs in a lane run one at a time in submission order. A lane whose
//!    channel drains is retired; the next submission for that tenant opens a fresh one.
//! 3. **Global cap.** A [`Bulkhead`] bounds how many operations across all tenants are executing
//!    at once. The permit is held for the whole retry loop.
//!
//! Each job runs its operation through [`RetryPolicy::execute`] under the operation's
//! [`OperationBudget`].

use crate::bulkhead::Bulkhead;
use crate::error::DeployError;
use crate::retry::{OperationBudget, RetryPolicy};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};

/// Remote operation categories, used in idempotency keys and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    RoleEnsure,
    CategoryEnsure,
    ChannelEnsure,
    OverwritesReplace,
    MessageEnsure,
    /// Existence check for a skip step.
    Read,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::RoleEnsure => "RoleEnsure",
            OperationKind::CategoryEnsure => "CategoryEnsure",
            OperationKind::ChannelEnsure => "ChannelEnsure",
            OperationKind::OverwritesReplace => "OverwritesReplace",
            OperationKind::MessageEnsure => "MessageEnsure",
            OperationKind::Read => "Read",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of remote work. `run` is called once per attempt.
pub struct Operation<F> {
    pub tenant_id: String,
    pub kind: OperationKind,
    pub idempotency_key: String,
    pub budget: OperationBudget,
    pub run: F,
}

impl<F> Operation<F> {
    pub fn new(
        tenant_id: impl Into<String>,
        kind: OperationKind,
        idempotency_key: impl Into<String>,
        budget: OperationBudget,
        run: F,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            kind,
            idempotency_key: idempotency_key.into(),
            budget,
            run,
        }
    }
}

type Outcome = Result<Arc<dyn Any + Send + Sync>, DeployError>;
type SharedOutcome = Shared<BoxFuture<'static, Outcome>>;
type Job = BoxFuture<'static, ()>;
type Lanes = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<Job>>>>;

/// Bounded, tenant-serialized, deduplicating task runner.
///
/// Cloning is cheap; clones share lanes, limiter and the in-flight table.
#[derive(Clone)]
pub struct OperationQueue {
    bulkhead: Bulkhead,
    retry: RetryPolicy,
    in_flight: Arc<Mutex<HashMap<String, SharedOutcome>>>,
    lanes: Lanes,
}

impl fmt::Debug for OperationQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationQueue")
            .field("max_concurrent", &self.bulkhead.max_concurrent())
            .field("retry", &self.retry)
            .field("in_flight", &self.in_flight_count())
            .finish()
    }
}

impl OperationQueue {
    pub fn new(max_concurrent: usize, retry: RetryPolicy) -> Self {
        Self {
            bulkhead: Bulkhead::new(max_concurrent),
            retry,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            lanes: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.bulkhead.max_concurrent()
    }

    /// Operations currently holding a global permit.
    pub fn executing(&self) -> usize {
        self.bulkhead.in_flight()
    }

    /// Distinct idempotency keys whose outcome has not settled.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().map(|m| m.len()).unwrap_or(0)
    }

    /// Tenants with a live lane consumer.
    pub fn lane_count(&self) -> usize {
        self.lanes.lock().map(|m| m.len()).unwrap_or(0)
    }

    /// Fail queued and future operations. Operations already holding a permit finish.
    pub fn shutdown(&self) {
        self.bulkhead.close();
    }

    /// Submit `op` and wait for its outcome.
    ///
    /// A submission whose idempotency key is already in flight does not run `op.run`; it
    /// observes the outcome of the first submission. Joining with a different result type
    /// is a `CONFLICT`.
    pub async fn submit<T, F, Fut>(&self, op: Operation<F>) -> Result<T, DeployError>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, DeployError>> + Send + 'static,
    {
        let key = op.idempotency_key.clone();
        let outcome = {
            let mut in_flight = self
                .in_flight
                .lock()
                .map_err(|_| DeployError::transient("in-flight table poisoned"))?;
            match in_flight.get(&key) {
                Some(existing) => {
                    tracing::debug!(
                        tenant = %op.tenant_id,
                        kind = %op.kind,
                        key = %key,
                        "joining in-flight operation"
                    );
                    existing.clone()
                }
                None => {
                    let (job, outcome) = self.job(op);
                    in_flight.insert(key.clone(), outcome.clone());
                    self.enqueue(&job.0, job.1);
                    outcome
                }
            }
        };

        let value = outcome.await?;
        value.downcast::<T>().map(|v| (*v).clone()).map_err(|_| {
            DeployError::conflict(format!("idempotency key {} joined with a different result type", key))
        })
    }

    /// Build the lane job for `op` and the shared outcome callers wait on.
    fn job<T, F, Fut>(&self, op: Operation<F>) -> ((String, Job), SharedOutcome)
    where
        T: Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, DeployError>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel::<Outcome>();
        let outcome: SharedOutcome = async move {
            rx.await.unwrap_or_else(|_| Err(DeployError::transient("operation dropped before completion")))
        }
        .boxed()
        .shared();

        let Operation { tenant_id, kind, idempotency_key, budget, run } = op;
        let bulkhead = self.bulkhead.clone();
        let retry = self.retry.clone();
        let in_flight = Arc::clone(&self.in_flight);
        let lane = tenant_id.clone();

        let job = async move {
            tracing::debug!(tenant = %tenant_id, kind = %kind, key = %idempotency_key, "operation started");
            let result: Outcome = match bulkhead.acquire().await {
                Err(err) => Err(err),
                Ok(_permit) => {
                    let attempt = retry.execute(&budget, || run());
                    match AssertUnwindSafe(attempt).catch_unwind().await {
                        Ok(Ok(value)) => Ok(Arc::new(value) as Arc<dyn Any + Send + Sync>),
                        Ok(Err(err)) => Err(err),
                        Err(_) => Err(DeployError::transient(format!("operation {} panicked", kind))),
                    }
                }
            };
            match &result {
                Ok(_) => tracing::debug!(tenant = %tenant_id, key = %idempotency_key, "operation succeeded"),
                Err(err) => tracing::warn!(
                    tenant = %tenant_id,
                    key = %idempotency_key,
                    code = %err.code,
                    error = %err.message,
                    "operation failed"
                ),
            }
            if let Ok(mut table) = in_flight.lock() {
                table.remove(&idempotency_key);
            }
            let _ = tx.send(result);
        }
        .boxed();

        ((lane, job), outcome)
    }

    /// Append `job` to the tenant's lane, starting a consumer if the lane has none.
    fn enqueue(&self, tenant_id: &str, job: Job) {
        let mut lanes = self.lanes.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let job = match lanes.get(tenant_id) {
            Some(tx) => match tx.send(job) {
                Ok(()) => return,
                Err(mpsc::error::SendError(job)) => job,
            },
            None => job,
        };

        let (tx, rx) = mpsc::unbounded_channel::<Job>();
        // The receiver is alive until the consumer exits.
        let _ = tx.send(job);
        tokio::spawn(drain_lane(Arc::clone(&self.lanes), tenant_id.to_string(), rx));
        lanes.insert(tenant_id.to_string(), tx);
    }
}

/// Run `rx` dry, then remove the lane. The final emptiness check happens under the lanes lock,
/// the same lock `enqueue` sends under, so no job is stranded.
async fn drain_lane(lanes: Lanes, tenant_id: String, mut rx: mpsc::UnboundedReceiver<Job>) {
    loop {
        while let Ok(job) = rx.try_recv() {
            job.await;
        }
        let next = {
            let mut table = lanes.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            match rx.try_recv() {
                Ok(job) => Some(job),
                Err(_) => {
                    table.remove(&tenant_id);
                    None
                }
            }
        };
        match next {
            Some(job) => job.await,
            None => {
                tracing::trace!(tenant = %tenant_id, "lane retired");
                return;
            }
        }
    }
}
