//! Convenient re-exports for common guildforge types.
pub use crate::{
    audit::{AuditEvent, AuditEventKind, LogSink, MemorySink, MulticastSink, NullSink, StoreSink},
    backoff::{Backoff, BackoffError},
    config::{EngineConfig, RateLimitConfig},
    error::{DeployError, DeployFailure, ErrorCode},
    executor::{ApplyRequest, Deployer},
    jitter::Jitter,
    planner::DeploymentPreview,
    platform::{Platform, PlatformError, RequestContext},
    queue::{Operation, OperationKind, OperationQueue},
    retry::{BuildError, OperationBudget, RetryPolicy, RetryPolicyBuilder},
    store::{
        AuditStore, DeploymentLedger, DeploymentStatus, MappingStore, ResourceKind, StepAction, StepLedger,
        StepReason, StepScope, StepStatus, Storage, TenantStateStore,
    },
    template::{Template, TemplateRegistry},
};
