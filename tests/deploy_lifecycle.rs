mod common;

use common::{env, template, template_with, ADMIN, OWNER, TENANT};
use guildforge::names;
use guildforge::prelude::*;
use guildforge::{InMemoryPlatform, InMemoryStore};
use serde_json::json;
use std::sync::Arc;

#[tokio::test]
async fn preview_before_first_apply_creates_everything() {
    let env = env();
    let template = template();

    let preview = env.deployer.preview(TENANT, &template, &template.config_hash(None)).await.unwrap();
    assert!(!preview.has_lockout_risk());
    assert_eq!(preview.items.len(), 10);
    assert_eq!(preview.summary.roles.create, 2);
    assert_eq!(preview.summary.categories.create, 1);
    assert_eq!(preview.summary.channels.create, 2);
    assert_eq!(preview.summary.overwrites.update, 3);
    assert_eq!(preview.summary.messages.create, 2);

    let seqs: Vec<u32> = preview.items.iter().map(|i| i.seq).collect();
    assert_eq!(seqs, (1..=10).collect::<Vec<_>>());
    assert_eq!(env.platform.mutation_count(), 0);
}

#[tokio::test]
async fn first_apply_provisions_the_template() {
    let env = env();
    let id = env.deployer.apply(ApplyRequest::new(TENANT, template(), ADMIN)).await.unwrap();

    let steps = env.store.list_steps(id).await.unwrap();
    let scopes: Vec<StepScope> = steps.iter().map(|s| s.scope).collect();
    assert_eq!(
        scopes,
        vec![
            StepScope::Role,
            StepScope::Role,
            StepScope::Category,
            StepScope::Overwrites,
            StepScope::Channel,
            StepScope::Overwrites,
            StepScope::Channel,
            StepScope::Overwrites,
            StepScope::Message,
            StepScope::Message,
        ]
    );
    assert!(steps.iter().all(|s| s.status == StepStatus::Applied));

    assert_eq!(env.platform.roles(TENANT).len(), 2);
    assert_eq!(env.platform.channels(TENANT).len(), 3);
    let category = env.store.get_mapping(TENANT, ResourceKind::Category, "CAT_SERVICE").await.unwrap().unwrap();
    for key in ["CH_AUDIT", "CH_INTAKE"] {
        let mapping = env.store.get_mapping(TENANT, ResourceKind::Channel, key).await.unwrap().unwrap();
        let channel = env.platform.channels(TENANT).into_iter().find(|c| c.id == mapping.platform_id).unwrap();
        assert_eq!(channel.parent_id.as_deref(), Some(category.platform_id.as_str()));
        assert!(env.platform.overwrites(TENANT, &mapping.platform_id).is_some());
    }

    let messages = env.platform.messages(TENANT);
    assert_eq!(messages.len(), 2);
    let summary = messages.iter().find(|m| m.content.contains("〔MSG_AUDIT_DEPLOY_SUMMARY〕")).unwrap();
    assert!(summary.content.contains("Template: starter@1.0.0"));

    let state = env.store.get_tenant_state(TENANT).await.unwrap().unwrap();
    assert_eq!(state.active_template_id, "starter");
    assert_eq!(state.active_template_version, "1.0.0");
    assert_eq!(env.audit.len(), 1);
    assert_eq!(env.audit.events()[0].payload["templateId"], "starter");
}

#[tokio::test]
async fn replanning_after_apply_is_a_no_op() {
    let env = env();
    let template = template();
    env.deployer.apply(ApplyRequest::new(TENANT, template.clone(), ADMIN)).await.unwrap();
    let mutations = env.platform.mutation_count();

    let preview = env.deployer.preview(TENANT, &template, &template.config_hash(None)).await.unwrap();
    assert!(preview.items.iter().all(|i| i.action == StepAction::Skip));

    let id = env.deployer.apply(ApplyRequest::new(TENANT, template, ADMIN)).await.unwrap();
    let steps = env.store.list_steps(id).await.unwrap();
    assert!(steps.iter().all(|s| s.status == StepStatus::Skipped));
    assert_eq!(env.platform.mutation_count(), mutations);
    assert_eq!(env.store.list_deployments(TENANT).await.unwrap().len(), 2);
}

#[tokio::test]
async fn color_change_updates_exactly_one_role() {
    let env = env();
    env.deployer.apply(ApplyRequest::new(TENANT, template(), ADMIN)).await.unwrap();
    let mutations = env.platform.mutation_count();

    let recolored = template_with(|doc| doc["roles"][1]["color"] = json!(0x2ecc71));
    let preview = env.deployer.preview(TENANT, &recolored, &recolored.config_hash(None)).await.unwrap();
    let changed: Vec<_> = preview.items.iter().filter(|i| i.action != StepAction::Skip).collect();
    assert_eq!(changed.len(), 1);
    assert_eq!(changed[0].scope, StepScope::Role);
    assert_eq!(changed[0].key, "R_MEMBER");
    assert_eq!(changed[0].reason, StepReason::FingerprintChanged);

    env.deployer.apply(ApplyRequest::new(TENANT, recolored, ADMIN)).await.unwrap();
    assert_eq!(env.platform.mutation_count(), mutations + 1);
    let member = env.platform.roles(TENANT).into_iter().find(|r| r.name.contains("R_MEMBER")).unwrap();
    assert_eq!(member.color, 0x2ecc71);
}

#[tokio::test]
async fn version_bump_edits_the_summary_message_in_place() {
    let env = env();
    env.deployer.apply(ApplyRequest::new(TENANT, template(), ADMIN)).await.unwrap();

    let bumped = template_with(|doc| doc["templateVersion"] = json!("1.1.0"));
    let id = env.deployer.apply(ApplyRequest::new(TENANT, bumped, ADMIN)).await.unwrap();

    let steps = env.store.list_steps(id).await.unwrap();
    let summary = steps.iter().find(|s| s.key == "MSG_AUDIT_DEPLOY_SUMMARY").unwrap();
    assert_eq!(summary.action, StepAction::Update);
    let intake = steps.iter().find(|s| s.key == "MSG_INTAKE_INSTRUCTIONS").unwrap();
    assert_eq!(intake.action, StepAction::Skip);

    let messages = env.platform.messages(TENANT);
    assert_eq!(messages.len(), 2);
    assert!(messages.iter().any(|m| m.content.contains("Template: starter@1.1.0")));
    let state = env.store.get_tenant_state(TENANT).await.unwrap().unwrap();
    assert_eq!(state.active_template_version, "1.1.0");
}

#[tokio::test]
async fn lockout_risk_blocks_everyone_but_the_owner() {
    let env = env();
    let risky = template_with(|doc| {
        doc["policies"]["P_ADMIN_ONLY"]["rules"][1]["permissions"] = json!(["SendMessages"]);
    });
    let preview = env.deployer.preview(TENANT, &risky, &risky.config_hash(None)).await.unwrap();
    assert!(preview.has_lockout_risk());

    let failure = env.deployer.apply(ApplyRequest::new(TENANT, risky.clone(), ADMIN)).await.unwrap_err();
    assert_eq!(failure.code(), ErrorCode::SafetyLockoutRisk);
    assert!(failure.deployment_id.is_none());
    assert_eq!(env.platform.mutation_count(), 0);
    assert!(env.store.list_deployments(TENANT).await.unwrap().is_empty());
    assert!(env.audit.is_empty());

    env.deployer.apply(ApplyRequest::new(TENANT, risky, OWNER)).await.unwrap();
    assert_eq!(env.platform.roles(TENANT).len(), 2);
}

#[tokio::test]
async fn failed_step_aborts_and_rerun_resumes() {
    let env = env();
    env.platform.fail_next("replace_overwrites", PlatformError::http(403, "Missing Permissions"), 1);

    let failure = env.deployer.apply(ApplyRequest::new(TENANT, template(), ADMIN)).await.unwrap_err();
    assert_eq!(failure.code(), ErrorCode::Forbidden);
    let failed_id = failure.deployment_id.unwrap();

    let statuses: Vec<StepStatus> = env.store.list_steps(failed_id).await.unwrap().iter().map(|s| s.status).collect();
    assert_eq!(&statuses[..3], &[StepStatus::Applied; 3]);
    assert_eq!(statuses[3], StepStatus::Failed);
    assert!(statuses[4..].iter().all(|s| *s == StepStatus::Planned));
    let deployment = env.store.get_deployment(failed_id).await.unwrap().unwrap();
    assert_eq!(deployment.status, DeploymentStatus::Failed);
    assert_eq!(deployment.error.unwrap().code, ErrorCode::Forbidden);
    assert!(env.store.get_tenant_state(TENANT).await.unwrap().is_none());

    let id = env.deployer.apply(ApplyRequest::new(TENANT, template(), ADMIN)).await.unwrap();
    let steps = env.store.list_steps(id).await.unwrap();
    assert!(steps[..3].iter().all(|s| s.action == StepAction::Skip));
    assert_eq!(steps[3].action, StepAction::Update);
    assert_eq!(steps[4].action, StepAction::Create);
    assert_eq!(env.platform.roles(TENANT).len(), 2);
    assert_eq!(env.platform.channels(TENANT).len(), 3);
    assert!(env.store.get_tenant_state(TENANT).await.unwrap().is_some());
}

#[tokio::test]
async fn exhausted_retries_fail_as_transient() {
    let env = env();
    env.platform.fail_next("ensure_role", PlatformError::http(429, "rate limited"), 100);

    let failure = env.deployer.apply(ApplyRequest::new(TENANT, template(), ADMIN)).await.unwrap_err();
    assert_eq!(failure.code(), ErrorCode::TransientFailure);
    assert_eq!(env.platform.call_count("ensure_role"), env.deployer.config().rate_limit.max_attempts as usize);
}

#[tokio::test]
async fn existing_objects_are_adopted_by_name() {
    let env = env();
    let seeded = env.platform.seed_role(TENANT, &names::role_name("", "Member", "R_MEMBER")).unwrap();

    env.deployer.apply(ApplyRequest::new(TENANT, template(), ADMIN)).await.unwrap();
    let mapping = env.store.get_mapping(TENANT, ResourceKind::Role, "R_MEMBER").await.unwrap().unwrap();
    assert_eq!(mapping.platform_id, seeded);
    assert_eq!(env.platform.roles(TENANT).len(), 2);
}

#[tokio::test]
async fn ambiguous_adoption_is_a_conflict() {
    let env = env();
    let name = names::role_name("", "Member", "R_MEMBER");
    env.platform.seed_role(TENANT, &name).unwrap();
    env.platform.seed_role(TENANT, &name).unwrap();

    let failure = env.deployer.apply(ApplyRequest::new(TENANT, template(), ADMIN)).await.unwrap_err();
    assert_eq!(failure.code(), ErrorCode::Conflict);
    assert!(failure.deployment_id.is_some());
    assert_eq!(env.audit.events()[0].kind, AuditEventKind::DeploymentFailed);
}

#[tokio::test]
async fn unsupported_permission_is_rejected_at_planning() {
    let env = env();
    let bad = template_with(|doc| {
        doc["policies"]["P_PUBLIC"]["rules"][1]["permissions"] = json!(["Administrator"]);
    });
    let err = env.deployer.preview(TENANT, &bad, &bad.config_hash(None)).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::ValidationFailed);

    let failure = env.deployer.apply(ApplyRequest::new(TENANT, bad, ADMIN)).await.unwrap_err();
    assert!(failure.deployment_id.is_none());
    assert_eq!(env.platform.mutation_count(), 0);
}

#[tokio::test]
async fn unknown_tenant_is_not_found() {
    let env = env();
    let failure = env.deployer.apply(ApplyRequest::new("guild-404", template(), ADMIN)).await.unwrap_err();
    assert_eq!(failure.code(), ErrorCode::NotFound);
}

#[tokio::test]
async fn default_audit_sink_writes_to_the_store() {
    let platform = Arc::new(InMemoryPlatform::new());
    platform.add_guild(TENANT, OWNER);
    let store = Arc::new(InMemoryStore::new());
    let deployer = Deployer::new(platform, store.clone(), common::config())
        .unwrap()
        .with_queue(common::fast_queue(2));

    let id = deployer.apply(ApplyRequest::new(TENANT, template(), ADMIN)).await.unwrap();
    let records = store.list_audit(TENANT).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].event_type, "DeploymentCompleted");
    assert_eq!(records[0].deployment_id, Some(id));
    assert_eq!(records[0].actor_id, ADMIN);
}

#[tokio::test]
async fn tenants_deploy_concurrently_on_one_queue() {
    let env = env();
    env.platform.add_guild("guild-2", "owner-2");

    let (a, b) = tokio::join!(
        env.deployer.apply(ApplyRequest::new(TENANT, template(), ADMIN)),
        env.deployer.apply(ApplyRequest::new("guild-2", template(), ADMIN)),
    );
    a.unwrap();
    b.unwrap();
    assert_eq!(env.platform.channels(TENANT).len(), 3);
    assert_eq!(env.platform.channels("guild-2").len(), 3);
    assert_eq!(env.audit.len(), 2);
}
