use super::*;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Default)]
struct Tables {
    mappings: BTreeMap<(String, ResourceKind, String), ResourceMapping>,
    deployments: HashMap<Uuid, Deployment>,
    deployment_order: Vec<Uuid>,
    steps: HashMap<Uuid, DeploymentStep>,
    step_order: Vec<Uuid>,
    tenants: HashMap<String, TenantState>,
    audit: Vec<AuditRecord>,
}

/// Process-local storage engine. All tables live behind one lock.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    tables: Mutex<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>, StoreError> {
        self.tables.lock().map_err(|_| StoreError::Backend("store lock poisoned".to_string()))
    }
}

#[async_trait]
impl MappingStore for InMemoryStore {
    async fn get_mapping(
        &self,
        tenant_id: &str,
        kind: ResourceKind,
        key: &str,
    ) -> Result<Option<ResourceMapping>, StoreError> {
        let tables = self.lock()?;
        Ok(tables.mappings.get(&(tenant_id.to_string(), kind, key.to_string())).cloned())
    }

    async fn list_mappings(
        &self,
        tenant_id: &str,
        kind: Option<ResourceKind>,
    ) -> Result<Vec<ResourceMapping>, StoreError> {
        let tables = self.lock()?;
        Ok(tables
            .mappings
            .values()
            .filter(|m| m.tenant_id == tenant_id && kind.map_or(true, |k| m.kind == k))
            .cloned()
            .collect())
    }

    async fn upsert_mapping(&self, mapping: MappingUpsert) -> Result<ResourceMapping, StoreError> {
        let mut tables = self.lock()?;
        let now = Utc::now();
        let slot = (mapping.tenant_id.clone(), mapping.kind, mapping.key.clone());
        let created_at = tables.mappings.get(&slot).map_or(now, |m| m.created_at);
        let row = ResourceMapping {
            tenant_id: mapping.tenant_id,
            kind: mapping.kind,
            key: mapping.key,
            platform_id: mapping.platform_id,
            fingerprint: mapping.fingerprint,
            display_name: mapping.display_name,
            created_at,
            updated_at: now,
        };
        tables.mappings.insert(slot, row.clone());
        Ok(row)
    }
}

#[async_trait]
impl DeploymentLedger for InMemoryStore {
    async fn begin_deployment(&self, deployment: NewDeployment) -> Result<Uuid, StoreError> {
        let mut tables = self.lock()?;
        let id = Uuid::new_v4();
        tables.deployments.insert(
            id,
            Deployment {
                id,
                tenant_id: deployment.tenant_id,
                template_id: deployment.template_id,
                template_version: deployment.template_version,
                schema_version: deployment.schema_version,
                config_hash: deployment.config_hash,
                actor_id: deployment.actor_id,
                status: DeploymentStatus::Started,
                started_at: Utc::now(),
                finished_at: None,
                error: None,
            },
        );
        tables.deployment_order.push(id);
        Ok(id)
    }

    async fn finish_deployment(
        &self,
        id: Uuid,
        status: DeploymentStatus,
        error: Option<DeployError>,
    ) -> Result<(), StoreError> {
        let mut tables = self.lock()?;
        let row = tables
            .deployments
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound { entity: "deployment", id: id.to_string() })?;
        if row.status.is_terminal() {
            return Err(StoreError::Terminal {
                entity: "deployment",
                id: id.to_string(),
                status: row.status.as_str().to_string(),
            });
        }
        row.status = status;
        row.error = error;
        row.finished_at = Some(Utc::now());
        Ok(())
    }

    async fn get_deployment(&self, id: Uuid) -> Result<Option<Deployment>, StoreError> {
        Ok(self.lock()?.deployments.get(&id).cloned())
    }

    async fn list_deployments(&self, tenant_id: &str) -> Result<Vec<Deployment>, StoreError> {
        let tables = self.lock()?;
        Ok(tables
            .deployment_order
            .iter()
            .filter_map(|id| tables.deployments.get(id))
            .filter(|d| d.tenant_id == tenant_id)
            .cloned()
            .collect())
    }
}

fn step_mut<'a>(tables: &'a mut Tables, id: Uuid) -> Result<&'a mut DeploymentStep, StoreError> {
    let step = tables
        .steps
        .get_mut(&id)
        .ok_or_else(|| StoreError::NotFound { entity: "step", id: id.to_string() })?;
    if step.status.is_terminal() {
        return Err(StoreError::Terminal {
            entity: "step",
            id: id.to_string(),
            status: step.status.as_str().to_string(),
        });
    }
    Ok(step)
}

#[async_trait]
impl StepLedger for InMemoryStore {
    async fn insert_planned(&self, step: NewStep) -> Result<Uuid, StoreError> {
        let mut tables = self.lock()?;
        if !tables.deployments.contains_key(&step.deployment_id) {
            return Err(StoreError::NotFound {
                entity: "deployment",
                id: step.deployment_id.to_string(),
            });
        }
        let id = Uuid::new_v4();
        let now = Utc::now();
        tables.steps.insert(
            id,
            DeploymentStep {
                id,
                deployment_id: step.deployment_id,
                tenant_id: step.tenant_id,
                seq: step.seq,
                scope: step.scope,
                key: step.key,
                fingerprint: step.fingerprint,
                idempotency_key: step.idempotency_key,
                action: step.action,
                reason: step.reason,
                status: StepStatus::Planned,
                platform_id: None,
                result: None,
                error: None,
                created_at: now,
                updated_at: now,
            },
        );
        tables.step_order.push(id);
        Ok(id)
    }

    async fn mark_applied(
        &self,
        id: Uuid,
        status: StepStatus,
        platform_id: Option<String>,
        result: Option<Value>,
    ) -> Result<(), StoreError> {
        if !matches!(status, StepStatus::Applied | StepStatus::Skipped) {
            return Err(StoreError::Backend(format!(
                "mark_applied expects applied or skipped, got {}",
                status.as_str()
            )));
        }
        let mut tables = self.lock()?;
        let step = step_mut(&mut tables, id)?;
        step.status = status;
        step.platform_id = platform_id;
        step.result = result;
        step.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, error: DeployError) -> Result<(), StoreError> {
        let mut tables = self.lock()?;
        let step = step_mut(&mut tables, id)?;
        step.status = StepStatus::Failed;
        step.error = Some(error);
        step.updated_at = Utc::now();
        Ok(())
    }

    async fn list_steps(&self, deployment_id: Uuid) -> Result<Vec<DeploymentStep>, StoreError> {
        let tables = self.lock()?;
        let mut steps: Vec<DeploymentStep> = tables
            .steps
            .values()
            .filter(|s| s.deployment_id == deployment_id)
            .cloned()
            .collect();
        steps.sort_by_key(|s| s.seq);
        Ok(steps)
    }

    async fn last_applied(
        &self,
        tenant_id: &str,
        scope: StepScope,
        key: &str,
    ) -> Result<Option<DeploymentStep>, StoreError> {
        let tables = self.lock()?;
        Ok(tables
            .step_order
            .iter()
            .rev()
            .filter_map(|id| tables.steps.get(id))
            .find(|s| {
                s.tenant_id == tenant_id
                    && s.scope == scope
                    && s.key == key
                    && s.status == StepStatus::Applied
            })
            .cloned())
    }
}

#[async_trait]
impl TenantStateStore for InMemoryStore {
    async fn get_tenant_state(&self, tenant_id: &str) -> Result<Option<TenantState>, StoreError> {
        Ok(self.lock()?.tenants.get(tenant_id).cloned())
    }

    async fn upsert_tenant_state(&self, state: TenantState) -> Result<(), StoreError> {
        self.lock()?.tenants.insert(state.tenant_id.clone(), state);
        Ok(())
    }
}

#[async_trait]
impl AuditStore for InMemoryStore {
    async fn append_audit(&self, record: NewAuditRecord) -> Result<Uuid, StoreError> {
        let id = Uuid::new_v4();
        self.lock()?.audit.push(AuditRecord {
            id,
            tenant_id: record.tenant_id,
            deployment_id: record.deployment_id,
            actor_id: record.actor_id,
            event_type: record.event_type,
            payload: record.payload,
            created_at: Utc::now(),
        });
        Ok(id)
    }

    async fn list_audit(&self, tenant_id: &str) -> Result<Vec<AuditRecord>, StoreError> {
        let tables = self.lock()?;
        Ok(tables.audit.iter().filter(|r| r.tenant_id == tenant_id).cloned().collect())
    }
}
