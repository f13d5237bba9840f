//! Deployment planning: diff a template against recorded mappings and the live platform.
//!
//! Step order is fixed and load-bearing:
//!
//! 1. roles, in declaration order;
//! 2. each category, immediately followed by its overwrites;
//! 3. each text channel, immediately followed by its overwrites;
//! 4. marker messages.
//!
//! Categories exist before the channels parented under them, and overwrites are only written
//! once their target exists. Building a plan is all-or-nothing: any validation error aborts it.

use crate::config::{EngineConfig, MarkerMessage};
use crate::error::DeployError;
use crate::fingerprint::{fingerprint, Fingerprint};
use crate::names;
use crate::platform::Platform;
use crate::policy;
use crate::queue::{Operation, OperationKind, OperationQueue};
use crate::store::{ResourceKind, StepAction, StepReason, StepScope, Storage};
use crate::template::{ChannelSpec, Principal, RoleSpec, Template};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;

/// What a step needs at execution time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum StepPayload {
    Role(RoleSpec),
    Category(ChannelSpec),
    Channel(ChannelSpec),
    #[serde(rename_all = "camelCase")]
    Overwrites { target: StepScope, policy_key: String },
    #[serde(rename_all = "camelCase")]
    Message { channel_key: String, marker: String, content: String },
}

/// One planned action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedStep {
    pub seq: u32,
    pub scope: StepScope,
    pub kind: OperationKind,
    pub key: String,
    pub fingerprint: Fingerprint,
    pub idempotency_key: String,
    pub action: StepAction,
    pub reason: StepReason,
    pub managed_name: String,
    pub payload: StepPayload,
}

/// An ordered plan for one tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    pub tenant_id: String,
    pub config_hash: Fingerprint,
    pub steps: Vec<PlannedStep>,
}

impl Plan {
    pub fn step(&self, scope: StepScope, key: &str) -> Option<&PlannedStep> {
        self.steps.iter().find(|s| s.scope == scope && s.key == key)
    }

    /// True when every step is a skip.
    pub fn is_noop(&self) -> bool {
        self.steps.iter().all(|s| s.action == StepAction::Skip)
    }

    pub fn count(&self, action: StepAction) -> usize {
        self.steps.iter().filter(|s| s.action == action).count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WarningCode {
    RiskLockout,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Warning {
    pub code: WarningCode,
    pub message: String,
}

impl Warning {
    fn lockout(message: impl Into<String>) -> Self {
        Self { code: WarningCode::RiskLockout, message: message.into() }
    }
}

/// Read-only lockout analysis.
///
/// Warns `RISK_LOCKOUT` unless a bot admin role is configured, declared in the template, and
/// explicitly allowed `ViewChannel` by the audit channel's policy.
pub fn compute_warnings(template: &Template, config: &EngineConfig) -> Vec<Warning> {
    let admin_key = match config.bot_admin_role_key.as_deref() {
        Some(key) => key,
        None => return vec![Warning::lockout("no botAdminRoleKey configured")],
    };
    if template.role(admin_key).is_none() {
        return vec![Warning::lockout(format!(
            "bot admin role {} is not declared in template {}",
            admin_key, template.template_id
        ))];
    }
    let audit = match template.channel(&config.audit_channel_key) {
        Some(channel) => channel,
        None => {
            return vec![Warning::lockout(format!(
                "audit channel {} is not declared in template {}",
                config.audit_channel_key, template.template_id
            ))]
        }
    };
    let visible = template
        .policy(&audit.policy_key)
        .map(|p| p.allows(&Principal::role(admin_key), crate::permissions::VIEW_CHANNEL))
        .unwrap_or(false);
    if visible {
        Vec::new()
    } else {
        vec![Warning::lockout(format!(
            "policy {} does not allow ViewChannel for role:{}",
            audit.policy_key, admin_key
        ))]
    }
}

/// Desired-state digest of a role.
pub fn role_fingerprint(role: &RoleSpec, managed_name: &str) -> Fingerprint {
    fingerprint(&json!({
        "name": managed_name,
        "color": role.color,
        "hoist": role.hoist,
        "mentionable": role.mentionable,
    }))
}

/// Desired-state digest of a category or text channel.
pub fn channel_fingerprint(channel: &ChannelSpec, managed_name: &str) -> Fingerprint {
    fingerprint(&json!({
        "name": managed_name,
        "type": channel.channel_type.as_str(),
        "topic": channel.topic,
        "parentKey": channel.parent_key,
        "policyKey": channel.policy_key,
    }))
}

/// Digest of a policy's rule set, independent of platform ids. Permission order within a rule
/// does not matter.
pub fn overwrites_fingerprint(policy_key: &str, template: &Template) -> Result<Fingerprint, DeployError> {
    policy::check_vocabulary(policy_key, template)?;
    let policy = template
        .policy(policy_key)
        .ok_or_else(|| DeployError::validation(format!("unknown policyKey: {}", policy_key)))?;
    let rules: Vec<_> = policy
        .rules
        .iter()
        .map(|rule| {
            let mut permissions = rule.permissions.clone();
            permissions.sort();
            json!({
                "principal": rule.principal.to_string(),
                "effect": rule.effect,
                "permissions": permissions,
            })
        })
        .collect();
    Ok(fingerprint(&json!({ "policyKey": policy_key, "rules": rules })))
}

pub fn message_fingerprint(content: &str) -> Fingerprint {
    fingerprint(&json!({ "content": content }))
}

/// `tenant:{t}/deploy:{hash8}/{kind}/{key}/{fingerprint}`
pub fn idempotency_key(
    tenant_id: &str,
    config_hash: &Fingerprint,
    kind: OperationKind,
    key: &str,
    fp: &Fingerprint,
) -> String {
    format!("tenant:{}/deploy:{}/{}/{}/{}", tenant_id, config_hash.short(8), kind, key, fp)
}

/// Builds plans. Borrowed per call by the deployer.
pub struct Planner<'a> {
    pub platform: &'a Arc<dyn Platform>,
    pub store: &'a dyn Storage,
    pub queue: &'a OperationQueue,
    pub config: &'a EngineConfig,
}

impl<'a> Planner<'a> {
    pub fn new(
        platform: &'a Arc<dyn Platform>,
        store: &'a dyn Storage,
        queue: &'a OperationQueue,
        config: &'a EngineConfig,
    ) -> Self {
        Self { platform, store, queue, config }
    }

    pub async fn build_plan(
        &self,
        tenant_id: &str,
        template: &Template,
        config_hash: &Fingerprint,
    ) -> Result<Plan, DeployError> {
        let prefix = self.config.managed_prefix.as_str();
        let mut plan = Plan { tenant_id: tenant_id.to_string(), config_hash: config_hash.clone(), steps: Vec::new() };

        for role in &template.roles {
            let name = names::role_name(prefix, &role.name, &role.key);
            let fp = role_fingerprint(role, &name);
            let (action, reason) = self.decide(tenant_id, ResourceKind::Role, &role.key, &fp, config_hash).await?;
            self.push(&mut plan, StepScope::Role, OperationKind::RoleEnsure, &role.key, fp, (action, reason), name, StepPayload::Role(role.clone()));
        }

        let created_roles: HashSet<String> = plan
            .steps
            .iter()
            .filter(|s| s.scope == StepScope::Role && s.action == StepAction::Create)
            .map(|s| s.key.clone())
            .collect();

        for (scope, kind, channels) in [
            (StepScope::Category, OperationKind::CategoryEnsure, template.categories().collect::<Vec<_>>()),
            (StepScope::Channel, OperationKind::ChannelEnsure, template.text_channels().collect::<Vec<_>>()),
        ] {
            let resource = match scope {
                StepScope::Category => ResourceKind::Category,
                _ => ResourceKind::Channel,
            };
            for channel in channels {
                let name = names::channel_name(prefix, channel);
                let fp = channel_fingerprint(channel, &name);
                let mut decision = self.decide(tenant_id, resource, &channel.key, &fp, config_hash).await?;
                let parent_recreated = channel
                    .parent_key
                    .as_deref()
                    .and_then(|parent| plan.step(StepScope::Category, parent))
                    .map(|step| step.action == StepAction::Create)
                    .unwrap_or(false);
                if decision.0 == StepAction::Skip && parent_recreated {
                    // Re-point at the new parent.
                    decision = (StepAction::Update, StepReason::Replace);
                }
                let payload = match scope {
                    StepScope::Category => StepPayload::Category(channel.clone()),
                    _ => StepPayload::Channel(channel.clone()),
                };
                self.push(&mut plan, scope, kind, &channel.key, fp, decision, name.clone(), payload);

                let ofp = overwrites_fingerprint(&channel.policy_key, template)?;
                let decision = self
                    .overwrites_decision(tenant_id, template, channel, decision.0, &ofp, &created_roles)
                    .await?;
                self.push(
                    &mut plan,
                    StepScope::Overwrites,
                    OperationKind::OverwritesReplace,
                    &channel.key,
                    ofp,
                    decision,
                    name,
                    StepPayload::Overwrites { target: scope, policy_key: channel.policy_key.clone() },
                );
            }
        }

        for marker in &self.config.markers {
            let channel_action = match plan.step(StepScope::Channel, &marker.channel_key) {
                Some(step) => step.action,
                None => {
                    tracing::debug!(
                        tenant = tenant_id,
                        message = %marker.key,
                        channel = %marker.channel_key,
                        "marker channel not declared; message not planned"
                    );
                    continue;
                }
            };
            let (fp, payload) = marker_payload(marker, template);
            let decision = self.decide_message(tenant_id, &marker.key, &fp, channel_action).await?;
            self.push(
                &mut plan,
                StepScope::Message,
                OperationKind::MessageEnsure,
                &marker.key,
                fp,
                decision,
                names::message_marker(&marker.key),
                payload,
            );
        }

        tracing::debug!(
            tenant = tenant_id,
            template = %template.template_id,
            steps = plan.steps.len(),
            create = plan.count(StepAction::Create),
            update = plan.count(StepAction::Update),
            skip = plan.count(StepAction::Skip),
            "plan built"
        );
        Ok(plan)
    }

    #[allow(clippy::too_many_arguments)]
    fn push(
        &self,
        plan: &mut Plan,
        scope: StepScope,
        kind: OperationKind,
        key: &str,
        fp: Fingerprint,
        (action, reason): (StepAction, StepReason),
        managed_name: String,
        payload: StepPayload,
    ) {
        let idempotency_key = idempotency_key(&plan.tenant_id, &plan.config_hash, kind, key, &fp);
        plan.steps.push(PlannedStep {
            seq: plan.steps.len() as u32 + 1,
            scope,
            kind,
            key: key.to_string(),
            fingerprint: fp,
            idempotency_key,
            action,
            reason,
            managed_name,
            payload,
        });
    }

    /// Mapping → remote existence → fingerprint.
    async fn decide(
        &self,
        tenant_id: &str,
        kind: ResourceKind,
        key: &str,
        fp: &Fingerprint,
        config_hash: &Fingerprint,
    ) -> Result<(StepAction, StepReason), DeployError> {
        let mapping = match self.store.get_mapping(tenant_id, kind, key).await? {
            Some(mapping) => mapping,
            None => return Ok((StepAction::Create, StepReason::MissingMapping)),
        };
        if !self.exists(tenant_id, kind, &mapping.platform_id, config_hash).await? {
            return Ok((StepAction::Create, StepReason::MissingInDiscord));
        }
        if mapping.fingerprint != *fp {
            return Ok((StepAction::Update, StepReason::FingerprintChanged));
        }
        Ok((StepAction::Skip, StepReason::Unchanged))
    }

    /// Existence read through the queue, so planning honors the same limits as applying.
    async fn exists(
        &self,
        tenant_id: &str,
        kind: ResourceKind,
        platform_id: &str,
        config_hash: &Fingerprint,
    ) -> Result<bool, DeployError> {
        let platform = Arc::clone(self.platform);
        let (tenant, id) = (tenant_id.to_string(), platform_id.to_string());
        let key = format!(
            "tenant:{}/plan:{}/{}/{}/{}",
            tenant_id,
            config_hash.short(8),
            OperationKind::Read,
            kind,
            platform_id
        );
        let op = Operation::new(tenant_id, OperationKind::Read, key, self.config.rate_limit.budget(), move || {
            let platform = Arc::clone(&platform);
            let (tenant, id) = (tenant.clone(), id.clone());
            async move {
                let found = match kind {
                    ResourceKind::Role => platform.role_by_id(&tenant, &id).await?.is_some(),
                    _ => platform.channel_by_id(&tenant, &id).await?.is_some(),
                };
                Ok::<_, DeployError>(found)
            }
        });
        self.queue.submit(op).await
    }

    /// Overwrites are replaced whenever their target or a referenced role may have a new id,
    /// or the compiled rule set differs from the last one applied.
    async fn overwrites_decision(
        &self,
        tenant_id: &str,
        template: &Template,
        target: &ChannelSpec,
        target_action: StepAction,
        fp: &Fingerprint,
        created_roles: &HashSet<String>,
    ) -> Result<(StepAction, StepReason), DeployError> {
        let replace = Ok((StepAction::Update, StepReason::Replace));
        if target_action != StepAction::Skip {
            return replace;
        }
        let references_new_role = template
            .policy(&target.policy_key)
            .map(|p| p.role_keys().into_iter().any(|k| created_roles.contains(k)))
            .unwrap_or(false);
        if references_new_role {
            return replace;
        }
        match self.store.last_applied(tenant_id, StepScope::Overwrites, &target.key).await? {
            Some(step) if step.fingerprint == *fp => Ok((StepAction::Skip, StepReason::Unchanged)),
            _ => replace,
        }
    }

    /// Messages have no cheap read; the mapping and the channel's own action decide.
    async fn decide_message(
        &self,
        tenant_id: &str,
        key: &str,
        fp: &Fingerprint,
        channel_action: StepAction,
    ) -> Result<(StepAction, StepReason), DeployError> {
        match self.store.get_mapping(tenant_id, ResourceKind::Message, key).await? {
            None => Ok((StepAction::Create, StepReason::MissingMapping)),
            Some(_) if channel_action == StepAction::Create => {
                Ok((StepAction::Create, StepReason::MissingInDiscord))
            }
            Some(mapping) if mapping.fingerprint != *fp => {
                Ok((StepAction::Update, StepReason::FingerprintChanged))
            }
            Some(_) => Ok((StepAction::Skip, StepReason::Unchanged)),
        }
    }
}

fn marker_payload(marker: &MarkerMessage, template: &Template) -> (Fingerprint, StepPayload) {
    let content = marker.render(template);
    let fp = message_fingerprint(&content);
    let payload = StepPayload::Message {
        channel_key: marker.channel_key.clone(),
        marker: names::message_marker(&marker.key),
        content,
    };
    (fp, payload)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionCounts {
    pub create: usize,
    pub update: usize,
    pub skip: usize,
}

impl ActionCounts {
    fn record(&mut self, action: StepAction) {
        match action {
            StepAction::Create => self.create += 1,
            StepAction::Update => self.update += 1,
            StepAction::Skip => self.skip += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreviewSummary {
    pub roles: ActionCounts,
    pub categories: ActionCounts,
    pub channels: ActionCounts,
    pub overwrites: ActionCounts,
    pub messages: ActionCounts,
}

pub fn summarize(plan: &Plan) -> PreviewSummary {
    let mut summary = PreviewSummary::default();
    for step in &plan.steps {
        let bucket = match step.scope {
            StepScope::Role => &mut summary.roles,
            StepScope::Category => &mut summary.categories,
            StepScope::Channel => &mut summary.channels,
            StepScope::Overwrites => &mut summary.overwrites,
            StepScope::Message => &mut summary.messages,
        };
        bucket.record(step.action);
    }
    summary
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewItem {
    pub seq: u32,
    pub scope: StepScope,
    pub key: String,
    pub action: StepAction,
    pub reason: StepReason,
    pub managed_name: String,
}

/// What an apply would do, without doing it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentPreview {
    pub template_id: String,
    pub template_version: String,
    pub schema_version: String,
    pub config_hash: Fingerprint,
    pub summary: PreviewSummary,
    pub warnings: Vec<Warning>,
    pub items: Vec<PreviewItem>,
}

impl DeploymentPreview {
    pub fn new(template: &Template, plan: &Plan, warnings: Vec<Warning>) -> Self {
        Self {
            template_id: template.template_id.clone(),
            template_version: template.template_version.clone(),
            schema_version: template.schema_version.clone(),
            config_hash: plan.config_hash.clone(),
            summary: summarize(plan),
            warnings,
            items: plan
                .steps
                .iter()
                .map(|s| PreviewItem {
                    seq: s.seq,
                    scope: s.scope,
                    key: s.key.clone(),
                    action: s.action,
                    reason: s.reason,
                    managed_name: s.managed_name.clone(),
                })
                .collect(),
        }
    }

    pub fn has_lockout_risk(&self) -> bool {
        self.warnings.iter().any(|w| w.code == WarningCode::RiskLockout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::platform::InMemoryPlatform;
    use crate::store::{InMemoryStore, MappingStore, MappingUpsert};
    use crate::template::tests::sample_json;
    use crate::{InstantSleeper, Jitter, RetryPolicy};
    use serde_json::json;

    struct Fixture {
        platform: Arc<InMemoryPlatform>,
        dyn_platform: Arc<dyn Platform>,
        store: InMemoryStore,
        queue: OperationQueue,
        config: EngineConfig,
        template: Template,
    }

    impl Fixture {
        fn new() -> Self {
            let platform = Arc::new(InMemoryPlatform::new());
            platform.add_guild("g1", "owner");
            let retry = RetryPolicy::builder().with_jitter(Jitter::None).with_sleeper(InstantSleeper).build().unwrap();
            Self {
                dyn_platform: platform.clone(),
                platform,
                store: InMemoryStore::new(),
                queue: OperationQueue::new(3, retry),
                config: EngineConfig::default(),
                template: Template::from_value(sample_json()).unwrap(),
            }
        }

        async fn plan(&self) -> Result<Plan, DeployError> {
            let hash = self.template.config_hash(None);
            Planner::new(&self.dyn_platform, &self.store, &self.queue, &self.config)
                .build_plan("g1", &self.template, &hash)
                .await
        }

        async fn map(&self, kind: ResourceKind, key: &str, platform_id: &str, fp: Fingerprint) {
            self.store
                .upsert_mapping(MappingUpsert {
                    tenant_id: "g1".into(),
                    kind,
                    key: key.into(),
                    platform_id: platform_id.into(),
                    fingerprint: fp,
                    display_name: key.into(),
                })
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn fresh_tenant_plans_creates_in_order() {
        let f = Fixture::new();
        let plan = f.plan().await.unwrap();
        let shape: Vec<_> = plan.steps.iter().map(|s| (s.scope, s.key.as_str(), s.action)).collect();
        assert_eq!(
            shape,
            vec![
                (StepScope::Role, "R1", StepAction::Create),
                (StepScope::Category, "CAT1", StepAction::Create),
                (StepScope::Overwrites, "CAT1", StepAction::Update),
                (StepScope::Channel, "C1", StepAction::Create),
                (StepScope::Overwrites, "C1", StepAction::Update),
            ]
        );
        assert!(plan.steps.iter().all(|s| s.idempotency_key.starts_with("tenant:g1/deploy:")));
        assert_eq!(plan.steps[0].reason, StepReason::MissingMapping);
        assert_eq!(plan.steps[2].reason, StepReason::Replace);
        assert_eq!(plan.steps.iter().map(|s| s.seq).collect::<Vec<_>>(), vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn decision_table_for_roles() {
        let f = Fixture::new();
        let role = &f.template.roles[0];
        let name = names::role_name("", &role.name, &role.key);
        let fp = role_fingerprint(role, &name);

        // Mapped to an id the platform no longer has.
        f.map(ResourceKind::Role, "R1", "42", fp.clone()).await;
        assert_eq!(f.plan().await.unwrap().steps[0].reason, StepReason::MissingInDiscord);

        let live = f.platform.seed_role("g1", &name).unwrap();
        f.map(ResourceKind::Role, "R1", &live, fp).await;
        let step = f.plan().await.unwrap().steps[0].clone();
        assert_eq!((step.action, step.reason), (StepAction::Skip, StepReason::Unchanged));

        f.map(ResourceKind::Role, "R1", &live, fingerprint(&json!({"stale": true}))).await;
        let step = f.plan().await.unwrap().steps[0].clone();
        assert_eq!((step.action, step.reason), (StepAction::Update, StepReason::FingerprintChanged));
        assert!(f.platform.call_count("role_by_id") >= 3);
    }

    #[tokio::test]
    async fn unknown_permission_aborts_plan() {
        let mut f = Fixture::new();
        let mut doc = sample_json();
        doc["policies"]["P1"]["rules"][1]["permissions"] = json!(["ViewChannel", "Teleport"]);
        f.template = serde_json::from_value(doc).unwrap();
        let err = f.plan().await.unwrap_err();
        assert_eq!(err.code, ErrorCode::ValidationFailed);
        assert!(err.message.contains("Teleport"));
    }

    #[tokio::test]
    async fn markers_need_a_declared_channel() {
        let mut f = Fixture::new();
        f.config.markers = vec![
            MarkerMessage::new("MSG_HELLO", "C1", "hi {templateId}"),
            MarkerMessage::new("MSG_NOWHERE", "CH_MISSING", "x"),
        ];
        let plan = f.plan().await.unwrap();
        let last = plan.steps.last().unwrap();
        assert_eq!(last.scope, StepScope::Message);
        assert_eq!(last.key, "MSG_HELLO");
        assert_eq!(last.managed_name, "〔MSG_HELLO〕");
        assert_eq!(last.fingerprint, message_fingerprint("hi T1\n〔MSG_HELLO〕"));
        assert!(plan.step(StepScope::Message, "MSG_NOWHERE").is_none());
    }

    #[test]
    fn overwrite_fingerprint_ignores_permission_order() {
        let t = Template::from_value(sample_json()).unwrap();
        let mut doc = sample_json();
        doc["policies"]["P1"]["rules"][1]["permissions"] = json!(["SendMessages", "ViewChannel"]);
        let swapped = Template::from_value(doc).unwrap();
        assert_eq!(
            overwrites_fingerprint("P1", &t).unwrap(),
            overwrites_fingerprint("P1", &swapped).unwrap()
        );
    }

    #[test]
    fn color_is_not_part_of_overwrites() {
        let t = Template::from_value(sample_json()).unwrap();
        let mut doc = sample_json();
        doc["roles"][0]["color"] = json!(1);
        let recolored = Template::from_value(doc).unwrap();
        assert_eq!(
            overwrites_fingerprint("P1", &t).unwrap(),
            overwrites_fingerprint("P1", &recolored).unwrap()
        );
        let name = names::role_name("", "Member", "R1");
        assert_ne!(role_fingerprint(&t.roles[0], &name), role_fingerprint(&recolored.roles[0], &name));
    }

    #[test]
    fn warnings_cover_each_lockout_path() {
        let t = Template::from_value(sample_json()).unwrap();
        let mut cfg = EngineConfig::default();
        assert_eq!(compute_warnings(&t, &cfg)[0].code, WarningCode::RiskLockout);

        cfg.bot_admin_role_key = Some("R_MISSING".into());
        assert!(compute_warnings(&t, &cfg)[0].message.contains("not declared"));

        cfg.bot_admin_role_key = Some("R1".into());
        assert!(compute_warnings(&t, &cfg)[0].message.contains("audit channel"));

        cfg.audit_channel_key = "C1".into();
        assert!(compute_warnings(&t, &cfg).is_empty(), "P1 allows R1 ViewChannel");

        let mut doc = sample_json();
        doc["policies"]["P1"]["rules"][1]["permissions"] = json!(["SendMessages"]);
        let blind = Template::from_value(doc).unwrap();
        assert!(compute_warnings(&blind, &cfg)[0].message.contains("ViewChannel"));
    }

    #[tokio::test]
    async fn preview_summarizes_buckets() {
        let f = Fixture::new();
        let plan = f.plan().await.unwrap();
        let preview = DeploymentPreview::new(&f.template, &plan, compute_warnings(&f.template, &f.config));
        assert_eq!(preview.summary.roles, ActionCounts { create: 1, update: 0, skip: 0 });
        assert_eq!(preview.summary.overwrites, ActionCounts { create: 0, update: 2, skip: 0 });
        assert_eq!(preview.items.len(), 5);
        assert!(preview.has_lockout_risk());
        assert_eq!(serde_json::to_value(&preview.warnings[0]).unwrap()["code"], "RISK_LOCKOUT");
    }
}
