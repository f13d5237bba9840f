//! Declarative guild templates.
//!
//! A [`Template`] is immutable once loaded. Loading runs three gates in order: JSON parse,
//! conformance to the bundled `schemas/template.schema.json`, and the cross-reference invariants
//! in [`validate`]. Any failure is fatal at load time; a template that loads is safe to plan.

mod registry;
pub mod validate;

pub use registry::{TemplateMeta, TemplateRegistry};

use crate::error::DeployError;
use crate::fingerprint::{fingerprint, Fingerprint};
use jsonschema::JSONSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// JSON Schema every template document must satisfy.
pub const TEMPLATE_SCHEMA: &str = include_str!("../../schemas/template.schema.json");

/// Template load failures.
#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{origin} is not valid JSON: {source}")]
    Parse {
        origin: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("{origin} violates the template schema: {}", .errors.join("; "))]
    Schema { origin: String, errors: Vec<String> },
    #[error("template validation failed: {0}")]
    Invalid(String),
    #[error("template not found: {0}")]
    NotFound(String),
}

impl From<TemplateError> for DeployError {
    fn from(err: TemplateError) -> Self {
        match err {
            TemplateError::NotFound(_) => DeployError::not_found(err.to_string()),
            other => DeployError::validation(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleType {
    Base,
    Rank,
    Position,
    Clearance,
    System,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleSpec {
    pub key: String,
    #[serde(rename = "type")]
    pub role_type: RoleType,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hoist: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mentionable: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelType {
    Category,
    Text,
}

impl ChannelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelType::Category => "category",
            ChannelType::Text => "text",
        }
    }
}

/// A category or text channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelSpec {
    pub key: String,
    #[serde(rename = "type")]
    pub channel_type: ChannelType,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    pub policy_key: String,
}

impl ChannelSpec {
    pub fn is_category(&self) -> bool {
        self.channel_type == ChannelType::Category
    }
}

/// Who a policy rule applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Principal {
    Everyone,
    Role {
        #[serde(rename = "roleKey")]
        role_key: String,
    },
}

impl Principal {
    pub fn role(key: impl Into<String>) -> Self {
        Principal::Role { role_key: key.into() }
    }

    pub fn role_key(&self) -> Option<&str> {
        match self {
            Principal::Everyone => None,
            Principal::Role { role_key } => Some(role_key),
        }
    }
}

impl std::fmt::Display for Principal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Principal::Everyone => f.write_str("everyone"),
            Principal::Role { role_key } => write!(f, "role:{}", role_key),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Effect {
    Allow,
    Deny,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRule {
    pub principal: Principal,
    pub effect: Effect,
    pub permissions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    pub rules: Vec<PolicyRule>,
}

impl Policy {
    /// Role keys referenced by any rule, in first-seen order.
    pub fn role_keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = Vec::new();
        for key in self.rules.iter().filter_map(|r| r.principal.role_key()) {
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        keys
    }

    /// Whether `principal` is explicitly allowed `permission`.
    pub fn allows(&self, principal: &Principal, permission: &str) -> bool {
        self.rules.iter().any(|r| {
            r.effect == Effect::Allow
                && &r.principal == principal
                && r.permissions.iter().any(|p| p == permission)
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateInfo {
    pub display_name: String,
    #[serde(default = "default_language")]
    pub language: String,
}

fn default_language() -> String {
    "en".to_string()
}

/// A versioned desired-state declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Template {
    pub template_id: String,
    pub schema_version: String,
    pub template_version: String,
    pub meta: TemplateInfo,
    pub roles: Vec<RoleSpec>,
    pub channels: Vec<ChannelSpec>,
    pub policies: BTreeMap<String, Policy>,
}

impl Template {
    /// Parse, schema-check and validate a template document.
    pub fn from_json_str(raw: &str) -> Result<Self, TemplateError> {
        Self::parse_named(raw, "template")
    }

    pub(crate) fn parse_named(raw: &str, origin: &str) -> Result<Self, TemplateError> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|source| TemplateError::Parse { origin: origin.to_string(), source })?;
        Self::from_value_named(value, origin)
    }

    /// Schema-check and validate an already-parsed document.
    pub fn from_value(value: Value) -> Result<Self, TemplateError> {
        Self::from_value_named(value, "template")
    }

    fn from_value_named(value: Value, origin: &str) -> Result<Self, TemplateError> {
        check_schema(&value, origin)?;
        let template: Template = serde_json::from_value(value)
            .map_err(|source| TemplateError::Parse { origin: origin.to_string(), source })?;
        validate::validate(&template)?;
        Ok(template)
    }

    pub fn role(&self, key: &str) -> Option<&RoleSpec> {
        self.roles.iter().find(|r| r.key == key)
    }

    pub fn channel(&self, key: &str) -> Option<&ChannelSpec> {
        self.channels.iter().find(|c| c.key == key)
    }

    pub fn policy(&self, key: &str) -> Option<&Policy> {
        self.policies.get(key)
    }

    pub fn categories(&self) -> impl Iterator<Item = &ChannelSpec> {
        self.channels.iter().filter(|c| c.is_category())
    }

    pub fn text_channels(&self) -> impl Iterator<Item = &ChannelSpec> {
        self.channels.iter().filter(|c| !c.is_category())
    }

    /// Content hash of the effective deployment input: template identity, the resource
    /// declarations and the tenant's unit configuration (if any).
    pub fn config_hash(&self, unit_config: Option<&Value>) -> Fingerprint {
        fingerprint(&json!({
            "templateId": self.template_id,
            "templateVersion": self.template_version,
            "schemaVersion": self.schema_version,
            "roles": self.roles,
            "channels": self.channels,
            "policies": self.policies,
            "unitConfig": unit_config.cloned().unwrap_or(Value::Null),
        }))
    }
}

fn check_schema(value: &Value, origin: &str) -> Result<(), TemplateError> {
    let schema: Value = serde_json::from_str(TEMPLATE_SCHEMA)
        .map_err(|source| TemplateError::Parse { origin: "template schema".to_string(), source })?;
    let compiled = JSONSchema::compile(&schema).map_err(|e| TemplateError::Schema {
        origin: "template schema".to_string(),
        errors: vec![e.to_string()],
    })?;
    if let Err(errors) = compiled.validate(value) {
        let errors: Vec<String> =
            errors.map(|e| format!("{}: {}", e.instance_path, e)).collect();
        return Err(TemplateError::Schema { origin: origin.to_string(), errors });
    }
    Ok(())
}
