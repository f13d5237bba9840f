#![allow(dead_code)]

use guildforge::audit::{self, MemorySink};
use guildforge::{
    Deployer, EngineConfig, InMemoryPlatform, InMemoryStore, InstantSleeper, Jitter, OperationQueue, RetryPolicy,
    Template,
};
use serde_json::{json, Value};
use std::sync::Arc;

pub const TENANT: &str = "guild-1";
pub const OWNER: &str = "owner-1";
pub const ADMIN: &str = "admin-7";

/// A small community template: an admin-only audit channel and a public intake channel.
pub fn template_json() -> Value {
    json!({
        "templateId": "starter",
        "schemaVersion": "1",
        "templateVersion": "1.0.0",
        "meta": {"displayName": "Starter community", "language": "en"},
        "roles": [
            {"key": "R_BOT_ADMIN", "type": "system", "name": "Bot Admin", "color": 15158332, "hoist": true},
            {"key": "R_MEMBER", "type": "base", "name": "Member", "color": 3447003, "mentionable": true}
        ],
        "channels": [
            {"key": "CAT_SERVICE", "type": "category", "name": "Service", "policyKey": "P_SERVICE"},
            {"key": "CH_AUDIT", "type": "text", "name": "Audit log", "parentKey": "CAT_SERVICE",
             "topic": "Deployment history", "policyKey": "P_ADMIN_ONLY"},
            {"key": "CH_INTAKE", "type": "text", "name": "Intake", "parentKey": "CAT_SERVICE",
             "policyKey": "P_PUBLIC"}
        ],
        "policies": {
            "P_SERVICE": {"rules": [
                {"principal": {"type": "everyone"}, "effect": "allow", "permissions": ["ViewChannel"]}
            ]},
            "P_ADMIN_ONLY": {"rules": [
                {"principal": {"type": "everyone"}, "effect": "deny", "permissions": ["ViewChannel"]},
                {"principal": {"type": "role", "roleKey": "R_BOT_ADMIN"}, "effect": "allow",
                 "permissions": ["ViewChannel", "SendMessages", "ReadMessageHistory"]}
            ]},
            "P_PUBLIC": {"rules": [
                {"principal": {"type": "everyone"}, "effect": "allow", "permissions": ["ViewChannel", "ReadMessageHistory"]},
                {"principal": {"type": "role", "roleKey": "R_MEMBER"}, "effect": "allow", "permissions": ["SendMessages"]}
            ]}
        }
    })
}

pub fn template() -> Arc<Template> {
    Arc::new(Template::from_value(template_json()).expect("fixture template is valid"))
}

pub fn template_with(edit: impl FnOnce(&mut Value)) -> Arc<Template> {
    let mut doc = template_json();
    edit(&mut doc);
    Arc::new(Template::from_value(doc).expect("edited template is valid"))
}

pub fn config() -> EngineConfig {
    EngineConfig::default().with_bot_admin_role("R_BOT_ADMIN")
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy::builder().with_jitter(Jitter::None).with_sleeper(InstantSleeper).build().expect("valid policy")
}

pub fn fast_queue(max_concurrent: usize) -> OperationQueue {
    OperationQueue::new(max_concurrent, fast_retry())
}

pub struct Env {
    pub platform: Arc<InMemoryPlatform>,
    pub store: Arc<InMemoryStore>,
    pub audit: MemorySink,
    pub deployer: Deployer,
}

/// One registered guild, in-memory store, instant retries and a memory audit sink.
pub fn env() -> Env {
    let platform = Arc::new(InMemoryPlatform::new());
    platform.add_guild(TENANT, OWNER);
    let store = Arc::new(InMemoryStore::new());
    let audit = MemorySink::new();
    let deployer = Deployer::new(platform.clone(), store.clone(), config())
        .expect("valid config")
        .with_queue(fast_queue(3))
        .with_audit_sink(audit::boxed(audit.clone()));
    Env { platform, store, audit, deployer }
}
