//! Applying plans.
//!
//! [`Deployer::apply`] re-derives the plan against current state, gates on lockout risk,
//! records the deployment and every step as `planned`, then executes the steps in plan order
//! through the [`OperationQueue`]. The first step that fails is marked `failed` and the run
//! stops; steps already applied keep their mappings, so re-running apply resumes where it left
//! off.

use crate::audit::{self, AuditEvent, AuditEventKind, BoxAuditSink, StoreSink};
use crate::config::{ConfigError, EngineConfig};
use crate::error::{DeployError, DeployFailure};
use crate::fingerprint::Fingerprint;
use crate::planner::{compute_warnings, idempotency_key, DeploymentPreview, Plan, PlannedStep, Planner, StepPayload};
use crate::platform::{
    classify, CategoryRequest, MessageRequest, Platform, RequestContext, RoleRequest, TextChannelRequest,
};
use crate::policy;
use crate::queue::{Operation, OperationKind, OperationQueue};
use crate::store::{
    DeploymentStatus, MappingUpsert, NewDeployment, NewStep, ResourceKind, StepAction, StepScope, StepStatus,
    Storage, TenantState,
};
use crate::template::Template;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Input to [`Deployer::apply`].
#[derive(Debug, Clone)]
pub struct ApplyRequest {
    pub tenant_id: String,
    pub template: Arc<Template>,
    pub config_hash: Fingerprint,
    pub actor_id: String,
    /// Correlates platform-side audit entries with this run.
    pub request_id: String,
}

impl ApplyRequest {
    /// Request with a config hash over the template alone and a fresh request id.
    pub fn new(tenant_id: impl Into<String>, template: Arc<Template>, actor_id: impl Into<String>) -> Self {
        let config_hash = template.config_hash(None);
        Self {
            tenant_id: tenant_id.into(),
            template,
            config_hash,
            actor_id: actor_id.into(),
            request_id: Uuid::new_v4().to_string(),
        }
    }
}

/// Ids resolved so far in this run. Consulted before the mapping store.
#[derive(Debug, Default)]
struct RunIds {
    roles: HashMap<String, String>,
    categories: HashMap<String, String>,
    channels: HashMap<String, String>,
    everyone: Option<String>,
    /// Objects that came back under a new id after their mapped id vanished.
    replaced: HashSet<(ResourceKind, String)>,
}

impl RunIds {
    fn settle(&mut self, kind: ResourceKind, key: &str, previous: Option<&str>, id: &str) {
        if matches!(previous, Some(prev) if prev != id) {
            tracing::info!(kind = %kind, key, previous = previous.unwrap_or_default(), id, "resource re-created");
            self.replaced.insert((kind, key.to_string()));
        }
    }

    fn was_replaced(&self, kind: ResourceKind, key: &str) -> bool {
        self.replaced.contains(&(kind, key.to_string()))
    }
}

#[derive(Debug)]
struct StepOutcome {
    platform_id: Option<String>,
    changed: bool,
    status: StepStatus,
}

impl StepOutcome {
    fn skipped(platform_id: Option<String>) -> Self {
        Self { platform_id, changed: false, status: StepStatus::Skipped }
    }

    fn applied(platform_id: String, changed: bool) -> Self {
        Self { platform_id: Some(platform_id), changed, status: StepStatus::Applied }
    }
}

/// Plans and applies templates for any number of tenants.
pub struct Deployer {
    platform: Arc<dyn Platform>,
    store: Arc<dyn Storage>,
    queue: OperationQueue,
    config: EngineConfig,
    audit: Mutex<BoxAuditSink>,
}

impl std::fmt::Debug for Deployer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deployer").field("queue", &self.queue).field("config", &self.config).finish()
    }
}

impl Deployer {
    /// Deployer whose queue is built from `config.rate_limit` and whose audit events are
    /// appended to `store`.
    pub fn new<S>(platform: Arc<dyn Platform>, store: Arc<S>, config: EngineConfig) -> Result<Self, ConfigError>
    where
        S: Storage + 'static,
    {
        config.validate()?;
        let queue = config.rate_limit.queue()?;
        let audit = audit::boxed(StoreSink::new(store.clone()));
        Ok(Self { platform, store, queue, config, audit: Mutex::new(audit) })
    }

    /// Replace the queue (shared limits across deployers, or a test sleeper).
    pub fn with_queue(mut self, queue: OperationQueue) -> Self {
        self.queue = queue;
        self
    }

    pub fn with_audit_sink(self, sink: BoxAuditSink) -> Self {
        Self { audit: Mutex::new(sink), ..self }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn queue(&self) -> &OperationQueue {
        &self.queue
    }

    fn planner(&self) -> Planner<'_> {
        Planner::new(&self.platform, self.store.as_ref(), &self.queue, &self.config)
    }

    /// What `apply` would do right now. Reads only.
    #[tracing::instrument(skip_all, fields(tenant = tenant_id, template = %template.template_id))]
    pub async fn preview(
        &self,
        tenant_id: &str,
        template: &Template,
        config_hash: &Fingerprint,
    ) -> Result<DeploymentPreview, DeployError> {
        let plan = self.planner().build_plan(tenant_id, template, config_hash).await?;
        Ok(DeploymentPreview::new(template, &plan, compute_warnings(template, &self.config)))
    }

    /// Reconcile a tenant with `request.template`. Returns the deployment id on success.
    #[tracing::instrument(
        skip_all,
        fields(tenant = %request.tenant_id, template = %request.template.template_id, actor = %request.actor_id)
    )]
    pub async fn apply(&self, request: ApplyRequest) -> Result<Uuid, DeployFailure> {
        let template = Arc::clone(&request.template);
        let plan = self
            .planner()
            .build_plan(&request.tenant_id, &template, &request.config_hash)
            .await
            .map_err(DeployFailure::refused)?;

        self.lockout_gate(&request, &template).await.map_err(DeployFailure::refused)?;

        let started_at = Utc::now();
        let deployment_id = self
            .store
            .begin_deployment(NewDeployment {
                tenant_id: request.tenant_id.clone(),
                template_id: template.template_id.clone(),
                template_version: template.template_version.clone(),
                schema_version: template.schema_version.clone(),
                config_hash: request.config_hash.clone(),
                actor_id: request.actor_id.clone(),
            })
            .await
            .map_err(|e| DeployFailure::refused(e.into()))?;
        tracing::info!(deployment = %deployment_id, steps = plan.steps.len(), "deployment started");

        let result = match self.record_plan(deployment_id, &plan).await {
            Ok(step_ids) => self.run_steps(&request, deployment_id, &plan, &step_ids).await,
            Err(err) => Err(err),
        };

        match result {
            Ok(()) => self.complete(&request, deployment_id, started_at).await,
            Err(error) => Err(self.fail(&request, deployment_id, error).await),
        }
    }

    /// Refuse with `SAFETY_LOCKOUT_RISK` when the run risks lockout and the actor is not the owner.
    async fn lockout_gate(&self, request: &ApplyRequest, template: &Template) -> Result<(), DeployError> {
        let warnings = compute_warnings(template, &self.config);
        if warnings.is_empty() {
            return Ok(());
        }
        let platform = Arc::clone(&self.platform);
        let tenant = request.tenant_id.clone();
        let owner: String = self
            .remote(&request.tenant_id, OperationKind::Read, format!("tenant:{}/owner", tenant), move || {
                let (platform, tenant) = (Arc::clone(&platform), tenant.clone());
                async move { platform.owner_id(&tenant).await.map_err(classify) }
            })
            .await?;
        if owner == request.actor_id {
            tracing::warn!(warnings = warnings.len(), "lockout risk overridden by tenant owner");
            return Ok(());
        }
        let reasons: Vec<&str> = warnings.iter().map(|w| w.message.as_str()).collect();
        tracing::warn!(reasons = ?reasons, "apply refused: lockout risk");
        Err(DeployError::lockout("apply blocked: the run could lock the bot out of administration")
            .with_detail(reasons.join("; ")))
    }

    /// Persist every step as `planned` before any remote call.
    async fn record_plan(&self, deployment_id: Uuid, plan: &Plan) -> Result<Vec<Uuid>, DeployError> {
        let mut ids = Vec::with_capacity(plan.steps.len());
        for step in &plan.steps {
            let id = self
                .store
                .insert_planned(NewStep {
                    deployment_id,
                    tenant_id: plan.tenant_id.clone(),
                    seq: step.seq,
                    scope: step.scope,
                    key: step.key.clone(),
                    fingerprint: step.fingerprint.clone(),
                    idempotency_key: step.idempotency_key.clone(),
                    action: step.action,
                    reason: step.reason,
                })
                .await?;
            ids.push(id);
        }
        Ok(ids)
    }

    async fn run_steps(
        &self,
        request: &ApplyRequest,
        deployment_id: Uuid,
        plan: &Plan,
        step_ids: &[Uuid],
    ) -> Result<(), DeployError> {
        let ctx = RequestContext::for_deployment(deployment_id, &request.request_id, &request.actor_id);
        let mut run = RunIds::default();

        for (step, &step_id) in plan.steps.iter().zip(step_ids) {
            let outcome = match self.execute_step(request, &ctx, step, &mut run).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    tracing::warn!(
                        seq = step.seq,
                        scope = %step.scope,
                        key = %step.key,
                        code = %err.code,
                        error = %err.message,
                        "step failed"
                    );
                    if let Err(store_err) = self.store.mark_failed(step_id, err.clone()).await {
                        tracing::error!(step = %step_id, error = %store_err, "could not record step failure");
                    }
                    return Err(err);
                }
            };

            if let (Some(kind), Some(platform_id)) = (step.scope.resource_kind(), outcome.platform_id.clone()) {
                self.store
                    .upsert_mapping(MappingUpsert {
                        tenant_id: request.tenant_id.clone(),
                        kind,
                        key: step.key.clone(),
                        platform_id,
                        fingerprint: step.fingerprint.clone(),
                        display_name: step.managed_name.clone(),
                    })
                    .await?;
            }
            self.store
                .mark_applied(
                    step_id,
                    outcome.status,
                    outcome.platform_id.clone(),
                    Some(json!({ "changed": outcome.changed })),
                )
                .await?;
            tracing::info!(
                seq = step.seq,
                scope = %step.scope,
                key = %step.key,
                action = %step.action,
                status = outcome.status.as_str(),
                changed = outcome.changed,
                "step settled"
            );
        }
        Ok(())
    }

    async fn execute_step(
        &self,
        request: &ApplyRequest,
        ctx: &RequestContext,
        step: &PlannedStep,
        run: &mut RunIds,
    ) -> Result<StepOutcome, DeployError> {
        let tenant = request.tenant_id.as_str();
        match &step.payload {
            StepPayload::Role(role) => {
                let existing = self.mapped_id(tenant, ResourceKind::Role, &role.key).await?;
                if let Some(outcome) = self.confirm_skip(request, step, ResourceKind::Role, existing.as_deref()).await? {
                    run.roles.insert(role.key.clone(), existing.unwrap_or_default());
                    return Ok(outcome);
                }
                let req = RoleRequest {
                    managed_name: step.managed_name.clone(),
                    color: role.color,
                    hoist: role.hoist,
                    mentionable: role.mentionable,
                    existing_id: existing.clone(),
                };
                let (platform, ctx, t) = (Arc::clone(&self.platform), ctx.clone(), tenant.to_string());
                let res = self
                    .remote(tenant, step.kind, step.idempotency_key.clone(), move || {
                        let (platform, ctx, t, req) = (Arc::clone(&platform), ctx.clone(), t.clone(), req.clone());
                        async move { platform.ensure_role(&t, &req, &ctx).await.map_err(classify) }
                    })
                    .await?;
                run.settle(ResourceKind::Role, &role.key, existing.as_deref(), &res.id);
                run.roles.insert(role.key.clone(), res.id.clone());
                Ok(StepOutcome::applied(res.id, res.changed))
            }

            StepPayload::Category(category) => {
                let existing = self.mapped_id(tenant, ResourceKind::Category, &category.key).await?;
                if let Some(outcome) =
                    self.confirm_skip(request, step, ResourceKind::Category, existing.as_deref()).await?
                {
                    run.categories.insert(category.key.clone(), existing.unwrap_or_default());
                    return Ok(outcome);
                }
                let req = CategoryRequest { managed_name: step.managed_name.clone(), existing_id: existing.clone() };
                let (platform, ctx, t) = (Arc::clone(&self.platform), ctx.clone(), tenant.to_string());
                let res = self
                    .remote(tenant, step.kind, step.idempotency_key.clone(), move || {
                        let (platform, ctx, t, req) = (Arc::clone(&platform), ctx.clone(), t.clone(), req.clone());
                        async move { platform.ensure_category(&t, &req, &ctx).await.map_err(classify) }
                    })
                    .await?;
                run.settle(ResourceKind::Category, &category.key, existing.as_deref(), &res.id);
                run.categories.insert(category.key.clone(), res.id.clone());
                Ok(StepOutcome::applied(res.id, res.changed))
            }

            StepPayload::Channel(channel) => {
                let existing = self.mapped_id(tenant, ResourceKind::Channel, &channel.key).await?;
                let parent_replaced =
                    channel.parent_key.as_deref().is_some_and(|p| run.was_replaced(ResourceKind::Category, p));
                // A re-created parent means re-pointing, never a skip.
                let confirmed = if parent_replaced {
                    None
                } else {
                    self.confirm_skip(request, step, ResourceKind::Channel, existing.as_deref()).await?
                };
                if let Some(outcome) = confirmed {
                    run.channels.insert(channel.key.clone(), existing.unwrap_or_default());
                    return Ok(outcome);
                }
                let parent_id = match &channel.parent_key {
                    Some(parent) => Some(
                        self.resolve(tenant, &run.categories, ResourceKind::Category, parent)
                            .await?
                            .ok_or_else(|| {
                                DeployError::not_found(format!("parent category {} is not provisioned", parent))
                            })?,
                    ),
                    None => None,
                };
                let req = TextChannelRequest {
                    managed_name: step.managed_name.clone(),
                    topic: channel.topic.clone(),
                    parent_id,
                    existing_id: existing.clone(),
                };
                let (platform, ctx, t) = (Arc::clone(&self.platform), ctx.clone(), tenant.to_string());
                let res = self
                    .remote(tenant, step.kind, step.idempotency_key.clone(), move || {
                        let (platform, ctx, t, req) = (Arc::clone(&platform), ctx.clone(), t.clone(), req.clone());
                        async move { platform.ensure_text_channel(&t, &req, &ctx).await.map_err(classify) }
                    })
                    .await?;
                run.settle(ResourceKind::Channel, &channel.key, existing.as_deref(), &res.id);
                run.channels.insert(channel.key.clone(), res.id.clone());
                Ok(StepOutcome::applied(res.id, res.changed))
            }

            StepPayload::Overwrites { target, policy_key } => {
                let (ids, kind) = match target {
                    StepScope::Category => (&run.categories, ResourceKind::Category),
                    _ => (&run.channels, ResourceKind::Channel),
                };
                let target_id = self.resolve(tenant, ids, kind, &step.key).await?;
                let stale = run.was_replaced(kind, &step.key)
                    || request
                        .template
                        .policy(policy_key)
                        .is_some_and(|p| p.role_keys().into_iter().any(|k| run.was_replaced(ResourceKind::Role, k)));
                if step.action == StepAction::Skip && !stale {
                    return Ok(StepOutcome::skipped(target_id));
                }
                let target_id = target_id.ok_or_else(|| {
                    DeployError::not_found(format!("overwrite target {} is not provisioned", step.key))
                })?;
                let everyone = self.everyone_id(tenant, run).await?;
                let overwrites = policy::compile(policy_key, &request.template, &everyone, &run.roles)?;

                let (platform, ctx, t, id) =
                    (Arc::clone(&self.platform), ctx.clone(), tenant.to_string(), target_id.clone());
                let res = self
                    .remote(tenant, step.kind, step.idempotency_key.clone(), move || {
                        let (platform, ctx, t, id, overwrites) =
                            (Arc::clone(&platform), ctx.clone(), t.clone(), id.clone(), overwrites.clone());
                        async move { platform.replace_overwrites(&t, &id, &overwrites, &ctx).await.map_err(classify) }
                    })
                    .await?;
                Ok(StepOutcome::applied(res.id, res.changed))
            }

            StepPayload::Message { channel_key, marker, content } => {
                let existing = self.mapped_id(tenant, ResourceKind::Message, &step.key).await?;
                let channel_replaced = run.was_replaced(ResourceKind::Channel, channel_key);
                if step.action == StepAction::Skip && !channel_replaced {
                    return Ok(StepOutcome::skipped(existing));
                }
                let channel_id = self
                    .resolve(tenant, &run.channels, ResourceKind::Channel, channel_key)
                    .await?
                    .ok_or_else(|| DeployError::not_found(format!("message channel {} is not provisioned", channel_key)))?;
                let req = MessageRequest {
                    channel_id,
                    marker: marker.clone(),
                    content: content.clone(),
                    existing_id: existing.filter(|_| !channel_replaced),
                };
                let (platform, ctx, t) = (Arc::clone(&self.platform), ctx.clone(), tenant.to_string());
                let res = self
                    .remote(tenant, step.kind, step.idempotency_key.clone(), move || {
                        let (platform, ctx, t, req) = (Arc::clone(&platform), ctx.clone(), t.clone(), req.clone());
                        async move { platform.ensure_message_by_marker(&t, &req, &ctx).await.map_err(classify) }
                    })
                    .await?;
                Ok(StepOutcome::applied(res.id, res.changed))
            }
        }
    }

    /// For a skip step, confirm the mapped object still exists. `None` means fall through to
    /// the ensure call.
    async fn confirm_skip(
        &self,
        request: &ApplyRequest,
        step: &PlannedStep,
        kind: ResourceKind,
        existing: Option<&str>,
    ) -> Result<Option<StepOutcome>, DeployError> {
        let id = match (step.action, existing) {
            (StepAction::Skip, Some(id)) => id.to_string(),
            _ => return Ok(None),
        };
        let platform = Arc::clone(&self.platform);
        let (t, object_id) = (request.tenant_id.clone(), id.clone());
        let key = idempotency_key(
            &request.tenant_id,
            &request.config_hash,
            OperationKind::Read,
            &format!("{}:{}", step.scope, step.key),
            &step.fingerprint,
        );
        let found: bool = self
            .remote(&request.tenant_id, OperationKind::Read, key, move || {
                let (platform, t, object_id) = (Arc::clone(&platform), t.clone(), object_id.clone());
                async move {
                    let found = match kind {
                        ResourceKind::Role => platform.role_by_id(&t, &object_id).await.map_err(classify)?.is_some(),
                        _ => platform.channel_by_id(&t, &object_id).await.map_err(classify)?.is_some(),
                    };
                    Ok::<_, DeployError>(found)
                }
            })
            .await?;
        if found {
            Ok(Some(StepOutcome::skipped(Some(id))))
        } else {
            tracing::info!(scope = %step.scope, key = %step.key, "skipped resource vanished; ensuring");
            Ok(None)
        }
    }

    async fn mapped_id(&self, tenant: &str, kind: ResourceKind, key: &str) -> Result<Option<String>, DeployError> {
        Ok(self.store.get_mapping(tenant, kind, key).await?.map(|m| m.platform_id))
    }

    /// Id resolved earlier in this run, else the recorded mapping.
    async fn resolve(
        &self,
        tenant: &str,
        run: &HashMap<String, String>,
        kind: ResourceKind,
        key: &str,
    ) -> Result<Option<String>, DeployError> {
        match run.get(key) {
            Some(id) => Ok(Some(id.clone())),
            None => self.mapped_id(tenant, kind, key).await,
        }
    }

    async fn everyone_id(&self, tenant: &str, run: &mut RunIds) -> Result<String, DeployError> {
        if let Some(id) = &run.everyone {
            return Ok(id.clone());
        }
        let platform = Arc::clone(&self.platform);
        let t = tenant.to_string();
        let id: String = self
            .remote(tenant, OperationKind::Read, format!("tenant:{}/everyone", tenant), move || {
                let (platform, t) = (Arc::clone(&platform), t.clone());
                async move { platform.everyone_id(&t).await.map_err(classify) }
            })
            .await?;
        run.everyone = Some(id.clone());
        Ok(id)
    }

    async fn remote<T, F, Fut>(&self, tenant: &str, kind: OperationKind, key: String, run: F) -> Result<T, DeployError>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, DeployError>> + Send + 'static,
    {
        self.queue.submit(Operation::new(tenant, kind, key, self.config.rate_limit.budget(), run)).await
    }

    async fn complete(
        &self,
        request: &ApplyRequest,
        deployment_id: Uuid,
        started_at: DateTime<Utc>,
    ) -> Result<Uuid, DeployFailure> {
        let template = &request.template;
        let recorded = async {
            self.store.finish_deployment(deployment_id, DeploymentStatus::Completed, None).await?;
            self.store
                .upsert_tenant_state(TenantState {
                    tenant_id: request.tenant_id.clone(),
                    active_template_id: template.template_id.clone(),
                    active_template_version: template.template_version.clone(),
                    active_schema_version: template.schema_version.clone(),
                    config_hash: request.config_hash.clone(),
                    installed_at: started_at,
                    updated_at: Utc::now(),
                })
                .await
        };
        if let Err(err) = recorded.await {
            return Err(DeployFailure::recorded(deployment_id, err.into()));
        }
        tracing::info!(deployment = %deployment_id, "deployment completed");

        self.emit(AuditEvent::new(
            request.tenant_id.clone(),
            Some(deployment_id),
            request.actor_id.clone(),
            AuditEventKind::DeploymentCompleted,
            json!({
                "templateId": template.template_id,
                "templateVersion": template.template_version,
                "schemaVersion": template.schema_version,
                "configHash": request.config_hash,
            }),
        ))
        .await;
        Ok(deployment_id)
    }

    async fn fail(&self, request: &ApplyRequest, deployment_id: Uuid, error: DeployError) -> DeployFailure {
        if let Err(store_err) =
            self.store.finish_deployment(deployment_id, DeploymentStatus::Failed, Some(error.clone())).await
        {
            tracing::error!(deployment = %deployment_id, error = %store_err, "could not record deployment failure");
        }
        tracing::warn!(deployment = %deployment_id, code = %error.code, error = %error.message, "deployment failed");

        self.emit(AuditEvent::new(
            request.tenant_id.clone(),
            Some(deployment_id),
            request.actor_id.clone(),
            AuditEventKind::DeploymentFailed,
            json!({
                "templateId": request.template.template_id,
                "templateVersion": request.template.template_version,
                "error": error,
            }),
        ))
        .await;
        DeployFailure::recorded(deployment_id, error)
    }

    async fn emit(&self, event: AuditEvent) {
        let sink = match self.audit.lock() {
            Ok(sink) => sink.clone(),
            Err(_) => return,
        };
        audit::emit_best_effort(sink, event, self.config.audit_timeout()).await;
    }
}
