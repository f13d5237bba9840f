//! Deployment audit events and the sinks that receive them.
//!
//! Sinks are `tower::Service<AuditEvent>`s, so they compose with ordinary tower combinators.
//! The deployer emits through [`emit_best_effort`]: a sink that is not ready, fails, or takes
//! longer than the configured bound simply loses the event. Audit never fails a deployment.
//!
//! ```rust
//! use guildforge::audit::{AuditEvent, AuditEventKind, MemorySink};
//! use tower::Service;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let mut sink = MemorySink::new();
//! let event = AuditEvent::new("g1", None, "u1", AuditEventKind::DeploymentCompleted, serde_json::json!({}));
//! sink.call(event.clone()).await.unwrap();
//! assert_eq!(sink.events(), vec![event]);
//! # });
//! ```

use crate::store::{AuditStore, NewAuditRecord, StoreError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::convert::Infallible;
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tower::{Service, ServiceExt};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuditEventKind {
    DeploymentCompleted,
    DeploymentFailed,
}

impl AuditEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventKind::DeploymentCompleted => "DeploymentCompleted",
            AuditEventKind::DeploymentFailed => "DeploymentFailed",
        }
    }
}

/// One audit record as produced by the deployer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub tenant_id: String,
    pub deployment_id: Option<Uuid>,
    pub actor_id: String,
    pub kind: AuditEventKind,
    pub payload: Value,
    pub at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(
        tenant_id: impl Into<String>,
        deployment_id: Option<Uuid>,
        actor_id: impl Into<String>,
        kind: AuditEventKind,
        payload: Value,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            deployment_id,
            actor_id: actor_id.into(),
            kind,
            payload,
            at: Utc::now(),
        }
    }
}

impl fmt::Display for AuditEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} tenant={}", self.kind.as_str(), self.tenant_id)?;
        if let Some(id) = self.deployment_id {
            write!(f, " deployment={}", id)?;
        }
        write!(f, " actor={}", self.actor_id)
    }
}

/// A sink that consumes audit events.
pub trait AuditSink:
    Service<AuditEvent, Response = (), Error = Self::SinkError> + Clone + Send + 'static
{
    type SinkError: std::error::Error + Send + Sync + 'static;
}

/// Type-erased sink error.
#[derive(Debug)]
pub struct AuditSinkError(Box<dyn std::error::Error + Send + Sync>);

impl fmt::Display for AuditSinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "audit sink error: {}", self.0)
    }
}

impl std::error::Error for AuditSinkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&*self.0)
    }
}

/// Object-safe sink held by the deployer.
pub type BoxAuditSink = tower::util::BoxCloneService<AuditEvent, (), AuditSinkError>;

/// Erase a sink's concrete type.
pub fn boxed<S>(sink: S) -> BoxAuditSink
where
    S: Service<AuditEvent, Response = ()> + Clone + Send + 'static,
    S::Error: std::error::Error + Send + Sync + 'static,
    S::Future: Send + 'static,
{
    tower::util::BoxCloneService::new(sink.map_err(|e| AuditSinkError(Box::new(e))))
}

/// Deliver `event` if the sink becomes ready and answers within `bound`. Returns whether it
/// was delivered.
pub async fn emit_best_effort<S>(sink: S, event: AuditEvent, bound: Duration) -> bool
where
    S: Service<AuditEvent, Response = ()> + Send + 'static,
    S::Error: std::error::Error + Send + 'static,
    S::Future: Send + 'static,
{
    let kind = event.kind;
    let delivery = async move {
        match sink.ready_oneshot().await {
            Ok(mut ready) => ready.call(event).await.map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        }
    };
    match tokio::time::timeout(bound, delivery).await {
        Ok(Ok(())) => true,
        Ok(Err(error)) => {
            tracing::warn!(kind = kind.as_str(), %error, "audit emission failed");
            false
        }
        Err(_) => {
            tracing::warn!(kind = kind.as_str(), bound_ms = bound.as_millis() as u64, "audit emission timed out");
            false
        }
    }
}

type Ready<E> = Pin<Box<dyn std::future::Future<Output = Result<(), E>> + Send>>;

/// Discards every event.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl Service<AuditEvent> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = Ready<Infallible>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: AuditEvent) -> Self::Future {
        Box::pin(async { Ok(()) })
    }
}

impl AuditSink for NullSink {
    type SinkError = Infallible;
}

/// Logs every event at INFO through `tracing`.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl Service<AuditEvent> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = Ready<Infallible>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: AuditEvent) -> Self::Future {
        tracing::info!(event = %event, payload = %event.payload, "audit_event");
        Box::pin(async { Ok(()) })
    }
}

impl AuditSink for LogSink {
    type SinkError = Infallible;
}

/// Keeps the most recent events in memory; the oldest are evicted past capacity.
#[derive(Clone, Debug)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<AuditEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    /// Bounded at 1,000 events.
    pub fn new() -> Self {
        Self::with_capacity(1_000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().map(|g| g.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.events.lock().map(|g| g.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<AuditEvent> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = Ready<Infallible>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: AuditEvent) -> Self::Future {
        let mut guard = self.events.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if guard.len() >= self.capacity {
            guard.remove(0);
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        guard.push(event);
        Box::pin(async { Ok(()) })
    }
}

impl AuditSink for MemorySink {
    type SinkError = Infallible;
}

/// Appends events to the persistent audit table.
#[derive(Clone)]
pub struct StoreSink {
    store: Arc<dyn AuditStore>,
}

impl StoreSink {
    pub fn new(store: Arc<dyn AuditStore>) -> Self {
        Self { store }
    }
}

impl fmt::Debug for StoreSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreSink").finish_non_exhaustive()
    }
}

impl Service<AuditEvent> for StoreSink {
    type Response = ();
    type Error = StoreError;
    type Future = Ready<StoreError>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: AuditEvent) -> Self::Future {
        let store = Arc::clone(&self.store);
        Box::pin(async move {
            store
                .append_audit(NewAuditRecord {
                    tenant_id: event.tenant_id,
                    deployment_id: event.deployment_id,
                    actor_id: event.actor_id,
                    event_type: event.kind.as_str().to_string(),
                    payload: event.payload,
                })
                .await
                .map(|_| ())
        })
    }
}

impl AuditSink for StoreSink {
    type SinkError = StoreError;
}

/// Sends every event to two sinks concurrently. Fails if either fails.
#[derive(Clone, Debug)]
pub struct MulticastSink<A, B> {
    first: A,
    second: B,
}

impl<A, B> MulticastSink<A, B> {
    pub fn new(first: A, second: B) -> Self {
        Self { first, second }
    }
}

impl<A, B> Service<AuditEvent> for MulticastSink<A, B>
where
    A: Service<AuditEvent, Response = ()> + Clone + Send + 'static,
    A::Error: std::error::Error + Send + Sync + 'static,
    A::Future: Send + 'static,
    B: Service<AuditEvent, Response = ()> + Clone + Send + 'static,
    B::Error: std::error::Error + Send + Sync + 'static,
    B::Future: Send + 'static,
{
    type Response = ();
    type Error = AuditSinkError;
    type Future = Ready<AuditSinkError>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: AuditEvent) -> Self::Future {
        let first = self.first.clone();
        let second = self.second.clone();
        let copy = event.clone();
        Box::pin(async move {
            let (a, b) = tokio::join!(first.oneshot(event), second.oneshot(copy));
            a.map_err(|e| AuditSinkError(Box::new(e)))?;
            b.map_err(|e| AuditSinkError(Box::new(e)))?;
            Ok::<(), AuditSinkError>(())
        })
    }
}

impl<A, B> AuditSink for MulticastSink<A, B>
where
    A: Service<AuditEvent, Response = ()> + Clone + Send + 'static,
    A::Error: std::error::Error + Send + Sync + 'static,
    A::Future: Send + 'static,
    B: Service<AuditEvent, Response = ()> + Clone + Send + 'static,
    B::Error: std::error::Error + Send + Sync + 'static,
    B::Future: Send + 'static,
{
    type SinkError = AuditSinkError;
}
