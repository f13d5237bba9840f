//! Cross-reference invariants a schema cannot express.

use super::{Effect, Template, TemplateError};
use std::collections::{HashMap, HashSet};

/// Check every load-time invariant, reporting the first violation.
///
/// - role keys are unique, channel/category keys are unique
/// - every `parentKey` names a declared category
/// - every `policyKey` names a declared policy
/// - every role principal names a declared role
/// - no principal+permission pair is both allowed and denied within one policy
pub fn validate(template: &Template) -> Result<(), TemplateError> {
    let mut role_keys = HashSet::new();
    for role in &template.roles {
        if !role_keys.insert(role.key.as_str()) {
            return Err(TemplateError::Invalid(format!("duplicate role key {}", role.key)));
        }
    }

    let mut channel_keys = HashSet::new();
    for channel in &template.channels {
        if !channel_keys.insert(channel.key.as_str()) {
            return Err(TemplateError::Invalid(format!("duplicate channel key {}", channel.key)));
        }
    }

    for channel in &template.channels {
        if let Some(parent) = &channel.parent_key {
            match template.channel(parent) {
                Some(p) if p.is_category() => {}
                Some(_) => {
                    return Err(TemplateError::Invalid(format!(
                        "channel {} has parentKey {} which is not a category",
                        channel.key, parent
                    )))
                }
                None => {
                    return Err(TemplateError::Invalid(format!(
                        "channel {} refers missing parentKey {}",
                        channel.key, parent
                    )))
                }
            }
        }
        if !template.policies.contains_key(&channel.policy_key) {
            return Err(TemplateError::Invalid(format!(
                "channel {} refers missing policyKey {}",
                channel.key, channel.policy_key
            )));
        }
    }

    for (policy_key, policy) in &template.policies {
        let mut effects: HashMap<(String, &str), Effect> = HashMap::new();
        for rule in &policy.rules {
            if let Some(role_key) = rule.principal.role_key() {
                if !role_keys.contains(role_key) {
                    return Err(TemplateError::Invalid(format!(
                        "policy {} refers missing roleKey {}",
                        policy_key, role_key
                    )));
                }
            }
            let principal = rule.principal.to_string();
            for permission in &rule.permissions {
                let prev = effects.insert((principal.clone(), permission.as_str()), rule.effect);
                if matches!(prev, Some(p) if p != rule.effect) {
                    return Err(TemplateError::Invalid(format!(
                        "policy {} has both allow and deny for {}:{}",
                        policy_key, principal, permission
                    )));
                }
            }
        }
    }

    Ok(())
}
