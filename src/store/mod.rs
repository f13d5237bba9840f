//! Persistence contract: resource mappings, the deployment/step ledger, tenant state and audit.
//!
//! Storage engines implement the five traits; [`Storage`] is blanket-implemented for anything
//! that implements all of them. [`InMemoryStore`] is the reference engine.

mod memory;

pub use memory::InMemoryStore;

use crate::error::{DeployError, ErrorCode};
use crate::fingerprint::Fingerprint;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Persistence failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
    /// Attempt to mutate a row already in a terminal state.
    #[error("{entity} {id} is already terminal ({status})")]
    Terminal { entity: &'static str, id: String, status: String },
    #[error("storage error: {0}")]
    Backend(String),
}

impl From<StoreError> for DeployError {
    fn from(err: StoreError) -> Self {
        let code = match &err {
            StoreError::NotFound { .. } => ErrorCode::NotFound,
            StoreError::Terminal { .. } => ErrorCode::Conflict,
            StoreError::Backend(_) => ErrorCode::TransientFailure,
        };
        DeployError::new(code, err.to_string())
    }
}

/// Kinds of platform object a mapping can point to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Role,
    Category,
    Channel,
    Message,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Role => "role",
            ResourceKind::Category => "category",
            ResourceKind::Channel => "channel",
            ResourceKind::Message => "message",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `(tenant, kind, key) -> platform object` as of the last successful apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceMapping {
    pub tenant_id: String,
    pub kind: ResourceKind,
    pub key: String,
    pub platform_id: String,
    pub fingerprint: Fingerprint,
    pub display_name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for [`MappingStore::upsert_mapping`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingUpsert {
    pub tenant_id: String,
    pub kind: ResourceKind,
    pub key: String,
    pub platform_id: String,
    pub fingerprint: Fingerprint,
    pub display_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    Started,
    Completed,
    Failed,
}

impl DeploymentStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DeploymentStatus::Started)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::Started => "started",
            DeploymentStatus::Completed => "completed",
            DeploymentStatus::Failed => "failed",
        }
    }
}

/// One reconciliation run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deployment {
    pub id: Uuid,
    pub tenant_id: String,
    pub template_id: String,
    pub template_version: String,
    pub schema_version: String,
    pub config_hash: Fingerprint,
    pub actor_id: String,
    pub status: DeploymentStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<DeployError>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewDeployment {
    pub tenant_id: String,
    pub template_id: String,
    pub template_version: String,
    pub schema_version: String,
    pub config_hash: Fingerprint,
    pub actor_id: String,
}

/// What a step acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepScope {
    Role,
    Category,
    Channel,
    Overwrites,
    Message,
}

impl StepScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepScope::Role => "role",
            StepScope::Category => "category",
            StepScope::Channel => "channel",
            StepScope::Overwrites => "overwrites",
            StepScope::Message => "message",
        }
    }

    /// Mapping kind written when a step of this scope applies. Overwrites have none.
    pub fn resource_kind(&self) -> Option<ResourceKind> {
        match self {
            StepScope::Role => Some(ResourceKind::Role),
            StepScope::Category => Some(ResourceKind::Category),
            StepScope::Channel => Some(ResourceKind::Channel),
            StepScope::Message => Some(ResourceKind::Message),
            StepScope::Overwrites => None,
        }
    }
}

impl fmt::Display for StepScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepAction {
    Create,
    Update,
    Skip,
}

impl StepAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepAction::Create => "create",
            StepAction::Update => "update",
            StepAction::Skip => "skip",
        }
    }
}

impl fmt::Display for StepAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the planner chose an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepReason {
    MissingMapping,
    MissingInDiscord,
    FingerprintChanged,
    Unchanged,
    Replace,
}

impl StepReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepReason::MissingMapping => "missing_mapping",
            StepReason::MissingInDiscord => "missing_in_discord",
            StepReason::FingerprintChanged => "fingerprint_changed",
            StepReason::Unchanged => "unchanged",
            StepReason::Replace => "replace",
        }
    }
}

impl fmt::Display for StepReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Planned,
    Applied,
    Skipped,
    Failed,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StepStatus::Planned)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Planned => "planned",
            StepStatus::Applied => "applied",
            StepStatus::Skipped => "skipped",
            StepStatus::Failed => "failed",
        }
    }
}

/// Ledger row for one planned action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentStep {
    pub id: Uuid,
    pub deployment_id: Uuid,
    pub tenant_id: String,
    pub seq: u32,
    pub scope: StepScope,
    pub key: String,
    pub fingerprint: Fingerprint,
    pub idempotency_key: String,
    pub action: StepAction,
    pub reason: StepReason,
    pub status: StepStatus,
    pub platform_id: Option<String>,
    pub result: Option<Value>,
    pub error: Option<DeployError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewStep {
    pub deployment_id: Uuid,
    pub tenant_id: String,
    pub seq: u32,
    pub scope: StepScope,
    pub key: String,
    pub fingerprint: Fingerprint,
    pub idempotency_key: String,
    pub action: StepAction,
    pub reason: StepReason,
}

/// The template currently installed on a tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantState {
    pub tenant_id: String,
    pub active_template_id: String,
    pub active_template_version: String,
    pub active_schema_version: String,
    pub config_hash: Fingerprint,
    pub installed_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub id: Uuid,
    pub tenant_id: String,
    pub deployment_id: Option<Uuid>,
    pub actor_id: String,
    pub event_type: String,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewAuditRecord {
    pub tenant_id: String,
    pub deployment_id: Option<Uuid>,
    pub actor_id: String,
    pub event_type: String,
    pub payload: Value,
}

#[async_trait]
pub trait MappingStore: Send + Sync {
    async fn get_mapping(
        &self,
        tenant_id: &str,
        kind: ResourceKind,
        key: &str,
    ) -> Result<Option<ResourceMapping>, StoreError>;

    /// All mappings for a tenant, optionally restricted to one kind, ordered by `(kind, key)`.
    async fn list_mappings(
        &self,
        tenant_id: &str,
        kind: Option<ResourceKind>,
    ) -> Result<Vec<ResourceMapping>, StoreError>;

    /// Insert or replace; `created_at` survives replacement.
    async fn upsert_mapping(&self, mapping: MappingUpsert) -> Result<ResourceMapping, StoreError>;
}

#[async_trait]
pub trait DeploymentLedger: Send + Sync {
    /// Record a run in status `started`.
    async fn begin_deployment(&self, deployment: NewDeployment) -> Result<Uuid, StoreError>;

    /// Move a started run to a terminal status.
    async fn finish_deployment(
        &self,
        id: Uuid,
        status: DeploymentStatus,
        error: Option<DeployError>,
    ) -> Result<(), StoreError>;

    async fn get_deployment(&self, id: Uuid) -> Result<Option<Deployment>, StoreError>;

    /// Runs for a tenant, oldest first.
    async fn list_deployments(&self, tenant_id: &str) -> Result<Vec<Deployment>, StoreError>;
}

#[async_trait]
pub trait StepLedger: Send + Sync {
    async fn insert_planned(&self, step: NewStep) -> Result<Uuid, StoreError>;

    /// Terminal success: `status` is `Applied` or `Skipped`.
    async fn mark_applied(
        &self,
        id: Uuid,
        status: StepStatus,
        platform_id: Option<String>,
        result: Option<Value>,
    ) -> Result<(), StoreError>;

    async fn mark_failed(&self, id: Uuid, error: DeployError) -> Result<(), StoreError>;

    /// Steps of one deployment ordered by `seq`.
    async fn list_steps(&self, deployment_id: Uuid) -> Result<Vec<DeploymentStep>, StoreError>;

    /// Most recent `applied` step for `(tenant, scope, key)`.
    async fn last_applied(
        &self,
        tenant_id: &str,
        scope: StepScope,
        key: &str,
    ) -> Result<Option<DeploymentStep>, StoreError>;
}

#[async_trait]
pub trait TenantStateStore: Send + Sync {
    async fn get_tenant_state(&self, tenant_id: &str) -> Result<Option<TenantState>, StoreError>;

    async fn upsert_tenant_state(&self, state: TenantState) -> Result<(), StoreError>;
}

#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn append_audit(&self, record: NewAuditRecord) -> Result<Uuid, StoreError>;

    async fn list_audit(&self, tenant_id: &str) -> Result<Vec<AuditRecord>, StoreError>;
}

/// Everything the deployer persists.
pub trait Storage: MappingStore + DeploymentLedger + StepLedger + TenantStateStore + AuditStore {}

impl<T> Storage for T where
    T: MappingStore + DeploymentLedger + StepLedger + TenantStateStore + AuditStore
{
}
