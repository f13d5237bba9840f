//! Policy compilation: abstract allow/deny rules to concrete per-principal overwrites.
//!
//! ```rust
//! use guildforge::policy::compile;
//! use guildforge::Template;
//! use std::collections::HashMap;
//!
//! let template = Template::from_json_str(r#"{
//!   "templateId": "T1", "schemaVersion": "1", "templateVersion": "1",
//!   "meta": {"displayName": "Demo"},
//!   "roles": [{"key": "R1", "type": "base", "name": "Member"}],
//!   "channels": [{"key": "C1", "type": "text", "name": "lobby", "policyKey": "P1"}],
//!   "policies": {"P1": {"rules": [
//!     {"principal": {"type": "role", "roleKey": "R1"}, "effect": "allow",
//!      "permissions": ["ViewChannel", "SendMessages"]}
//!   ]}}
//! }"#).unwrap();
//!
//! let roles = HashMap::from([("R1".to_string(), "900".to_string())]);
//! let overwrites = compile("P1", &template, "100", &roles).unwrap();
//! assert_eq!(overwrites[0].principal_id, "900");
//! assert_eq!(overwrites[0].allow, (1 << 10) | (1 << 11));
//! ```

use crate::error::DeployError;
use crate::permissions::{self, PermissionBits};
use crate::template::{Effect, Principal, Template};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// One compiled permission overwrite.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Overwrite {
    pub principal_id: String,
    pub allow: PermissionBits,
    pub deny: PermissionBits,
}

/// Compile `policy_key` against resolved platform ids.
///
/// Output is sorted by principal id so repeated compilations serialize identically.
pub fn compile(
    policy_key: &str,
    template: &Template,
    everyone_id: &str,
    role_ids: &HashMap<String, String>,
) -> Result<Vec<Overwrite>, DeployError> {
    let policy = template
        .policy(policy_key)
        .ok_or_else(|| DeployError::validation(format!("unknown policyKey: {}", policy_key)))?;

    let mut by_principal: BTreeMap<&str, (PermissionBits, PermissionBits)> = BTreeMap::new();
    for rule in &policy.rules {
        let id = match &rule.principal {
            Principal::Everyone => everyone_id,
            Principal::Role { role_key } => role_ids.get(role_key).map(String::as_str).ok_or_else(
                || DeployError::validation(format!("role id not resolved for roleKey {}", role_key)),
            )?,
        };

        let entry = by_principal.entry(id).or_insert((0, 0));
        for name in &rule.permissions {
            let bit = permissions::bit(name).ok_or_else(|| {
                DeployError::validation(format!(
                    "unknown permission in policy {}: {}",
                    policy_key, name
                ))
            })?;
            match rule.effect {
                Effect::Allow => entry.0 |= bit,
                Effect::Deny => entry.1 |= bit,
            }
        }
    }

    Ok(by_principal
        .into_iter()
        .map(|(id, (allow, deny))| Overwrite { principal_id: id.to_string(), allow, deny })
        .collect())
}

/// Fail with `VALIDATION_FAILED` if `policy_key` is unknown or names an unsupported permission.
///
/// Used by the planner, which must reject a bad policy before any role id is known.
pub fn check_vocabulary(policy_key: &str, template: &Template) -> Result<(), DeployError> {
    let policy = template
        .policy(policy_key)
        .ok_or_else(|| DeployError::validation(format!("unknown policyKey: {}", policy_key)))?;
    match policy.rules.iter().flat_map(|r| &r.permissions).find(|p| !permissions::is_known(p)) {
        Some(name) => Err(DeployError::validation(format!(
            "unknown permission in policy {}: {}",
            policy_key, name
        ))),
        None => Ok(()),
    }
}
