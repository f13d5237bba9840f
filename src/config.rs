//! Engine configuration.
//!
//! JSON, camelCase keys, every field defaulted:
//!
//! ```json
//! {
//!   "templatesPath": "templates",
//!   "botAdminRoleKey": "R_BOT_ADMIN",
//!   "auditChannelKey": "CH_AUDIT",
//!   "managedPrefix": "",
//!   "rateLimit": { "maxGlobalConcurrency": 3, "maxAttempts": 8 },
//!   "auditTimeoutMs": 2000
//! }
//! ```

use crate::queue::OperationQueue;
use crate::retry::{OperationBudget, RetryPolicy};
use crate::template::Template;
use crate::{Backoff, Jitter};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Longest accepted `rateLimit.operationDeadlineSeconds` (one day).
pub const MAX_OPERATION_DEADLINE_SECONDS: u64 = 24 * 60 * 60;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RateLimitConfig {
    pub max_global_concurrency: usize,
    pub operation_deadline_seconds: u64,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    /// Proportional jitter in `[0, 1]`.
    pub jitter: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_global_concurrency: 3,
            operation_deadline_seconds: 600,
            max_attempts: 8,
            backoff_base_ms: 500,
            backoff_cap_ms: 20_000,
            jitter: 0.3,
        }
    }
}

impl RateLimitConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_global_concurrency == 0 {
            return Err(ConfigError::Invalid("rateLimit.maxGlobalConcurrency must be > 0".into()));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid("rateLimit.maxAttempts must be > 0".into()));
        }
        if self.operation_deadline_seconds == 0 {
            return Err(ConfigError::Invalid("rateLimit.operationDeadlineSeconds must be > 0".into()));
        }
        if self.operation_deadline_seconds > MAX_OPERATION_DEADLINE_SECONDS {
            return Err(ConfigError::Invalid(format!(
                "rateLimit.operationDeadlineSeconds must be <= {}",
                MAX_OPERATION_DEADLINE_SECONDS
            )));
        }
        self.backoff()?;
        Jitter::proportional(self.jitter)
            .map_err(|e| ConfigError::Invalid(format!("rateLimit.jitter: {}", e)))?;
        Ok(())
    }

    fn backoff(&self) -> Result<Backoff, ConfigError> {
        Backoff::exponential(Duration::from_millis(self.backoff_base_ms))
            .with_max(Duration::from_millis(self.backoff_cap_ms))
            .map_err(|e| ConfigError::Invalid(format!("rateLimit backoff: {}", e)))
    }

    pub fn retry_policy(&self) -> Result<RetryPolicy, ConfigError> {
        let jitter = Jitter::proportional(self.jitter)
            .map_err(|e| ConfigError::Invalid(format!("rateLimit.jitter: {}", e)))?;
        RetryPolicy::builder()
            .backoff(self.backoff()?)
            .with_jitter(jitter)
            .build()
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    /// Fresh budget for one operation, deadline counted from now.
    pub fn budget(&self) -> OperationBudget {
        OperationBudget::within(Duration::from_secs(self.operation_deadline_seconds), self.max_attempts)
    }

    /// Queue with this limit and the default (tokio) sleeper.
    pub fn queue(&self) -> Result<OperationQueue, ConfigError> {
        self.validate()?;
        Ok(OperationQueue::new(self.max_global_concurrency, self.retry_policy()?))
    }
}

/// A message posted after all resources are in place.
///
/// `body` may use `{templateId}`, `{templateVersion}` and `{schemaVersion}` placeholders. The
/// rendered content ends with the key's marker so the message can be adopted later.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkerMessage {
    pub key: String,
    pub channel_key: String,
    pub body: String,
}

impl MarkerMessage {
    pub fn new(key: impl Into<String>, channel_key: impl Into<String>, body: impl Into<String>) -> Self {
        Self { key: key.into(), channel_key: channel_key.into(), body: body.into() }
    }

    pub fn render(&self, template: &Template) -> String {
        let body = self
            .body
            .replace("{templateId}", &template.template_id)
            .replace("{templateVersion}", &template.template_version)
            .replace("{schemaVersion}", &template.schema_version);
        format!("{}\n{}", body, crate::names::message_marker(&self.key))
    }
}

fn default_markers() -> Vec<MarkerMessage> {
    vec![
        MarkerMessage::new(
            "MSG_AUDIT_DEPLOY_SUMMARY",
            "CH_AUDIT",
            "Deployment complete.\nTemplate: {templateId}@{templateVersion}\nSchema: {schemaVersion}",
        ),
        MarkerMessage::new(
            "MSG_INTAKE_INSTRUCTIONS",
            "CH_INTAKE",
            "To apply for membership, use `/intake apply`.\nIf commands are not enabled yet, wait for the deployment to finish.",
        ),
    ]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    pub templates_path: PathBuf,
    pub bot_admin_role_key: Option<String>,
    pub audit_channel_key: String,
    pub managed_prefix: String,
    pub rate_limit: RateLimitConfig,
    pub audit_timeout_ms: u64,
    pub markers: Vec<MarkerMessage>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            templates_path: PathBuf::from("templates"),
            bot_admin_role_key: None,
            audit_channel_key: "CH_AUDIT".to_string(),
            managed_prefix: String::new(),
            rate_limit: RateLimitConfig::default(),
            audit_timeout_ms: 2_000,
            markers: default_markers(),
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.rate_limit.validate()?;
        if self.audit_channel_key.is_empty() {
            return Err(ConfigError::Invalid("auditChannelKey must not be empty".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for marker in &self.markers {
            if !seen.insert(marker.key.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate marker key: {}", marker.key)));
            }
        }
        Ok(())
    }

    pub fn with_bot_admin_role(mut self, key: impl Into<String>) -> Self {
        self.bot_admin_role_key = Some(key.into());
        self
    }

    pub fn audit_timeout(&self) -> Duration {
        Duration::from_millis(self.audit_timeout_ms)
    }
}
