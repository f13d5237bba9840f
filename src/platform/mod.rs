//! Remote platform contract.
//!
//! Every `ensure_*` call is idempotent with respect to desired end state: look up the recorded
//! id, else adopt a single existing object by managed name (or content marker), else create.
//! More than one adoption candidate is a `CONFLICT`. Raw failures surface as [`PlatformError`]
//! and are turned into the engine taxonomy only by [`classify`].

mod memory;

pub use memory::{InMemoryPlatform, MessageSnapshot, PlatformCall};

use crate::error::{DeployError, ErrorCode};
use crate::policy::Overwrite;
use crate::template::ChannelType;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Raw remote failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlatformError {
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },
    #[error("transport error: {0}")]
    Transport(String),
    /// Failure the collaborator already classified (ambiguous adoption, wrong object type).
    #[error(transparent)]
    Domain(DeployError),
}

impl PlatformError {
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        PlatformError::Http { status, message: message.into() }
    }
}

const FORBIDDEN_MARKERS: &[&str] = &["Missing Permissions", "Missing Access"];
const NOT_FOUND_MARKERS: &[&str] = &["Unknown", "404"];
const RATE_LIMIT_MARKERS: &[&str] = &["rate limit", "429"];

/// Map a remote failure onto the error taxonomy.
///
/// HTTP status wins when it is decisive (403/404/429); otherwise the message is scanned for
/// known markers. Anything unrecognized is `TRANSIENT_FAILURE` so it stays retryable.
pub fn classify(err: PlatformError) -> DeployError {
    let text = match err {
        PlatformError::Domain(inner) => return inner,
        PlatformError::Http { status: 403, .. } => {
            return DeployError::forbidden(err.to_string());
        }
        PlatformError::Http { status: 404, .. } => {
            return DeployError::not_found(err.to_string());
        }
        PlatformError::Http { status: 429, .. } => {
            return DeployError::rate_limited(err.to_string());
        }
        other => other.to_string(),
    };

    let has = |markers: &[&str]| markers.iter().any(|m| text.contains(m));
    let code = if has(FORBIDDEN_MARKERS) {
        ErrorCode::Forbidden
    } else if has(NOT_FOUND_MARKERS) {
        ErrorCode::NotFound
    } else if has(RATE_LIMIT_MARKERS) {
        ErrorCode::RateLimited
    } else {
        ErrorCode::TransientFailure
    };
    DeployError::new(code, text)
}

impl From<PlatformError> for DeployError {
    fn from(err: PlatformError) -> Self {
        classify(err)
    }
}

/// Attribution attached to every mutating call, surfaced in the platform's own audit log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestContext {
    pub request_id: String,
    pub actor_id: String,
    pub reason: String,
}

impl RequestContext {
    pub fn for_deployment(deployment_id: uuid::Uuid, request_id: &str, actor_id: &str) -> Self {
        Self {
            request_id: request_id.to_string(),
            actor_id: actor_id.to_string(),
            reason: format!("deploy={} requestId={}", deployment_id, request_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleSnapshot {
    pub id: String,
    pub name: String,
    pub color: u32,
    pub hoist: bool,
    pub mentionable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSnapshot {
    pub id: String,
    pub name: String,
    pub channel_type: ChannelType,
    pub parent_id: Option<String>,
    pub topic: Option<String>,
}

/// Outcome of an ensure call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnsureResult {
    pub id: String,
    /// Whether the call created or modified anything.
    pub changed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleRequest {
    pub managed_name: String,
    pub color: Option<u32>,
    pub hoist: Option<bool>,
    pub mentionable: Option<bool>,
    pub existing_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryRequest {
    pub managed_name: String,
    pub existing_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChannelRequest {
    pub managed_name: String,
    pub topic: Option<String>,
    pub parent_id: Option<String>,
    pub existing_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRequest {
    pub channel_id: String,
    /// Text that identifies the message among others in the channel.
    pub marker: String,
    /// Full desired content; contains `marker`.
    pub content: String,
    pub existing_id: Option<String>,
}

/// Operations the engine consumes from the remote platform.
#[async_trait]
pub trait Platform: Send + Sync {
    async fn owner_id(&self, tenant_id: &str) -> Result<String, PlatformError>;

    /// Id of the implicit role every member has.
    async fn everyone_id(&self, tenant_id: &str) -> Result<String, PlatformError>;

    async fn role_by_id(
        &self,
        tenant_id: &str,
        role_id: &str,
    ) -> Result<Option<RoleSnapshot>, PlatformError>;

    async fn ensure_role(
        &self,
        tenant_id: &str,
        request: &RoleRequest,
        ctx: &RequestContext,
    ) -> Result<EnsureResult, PlatformError>;

    async fn channel_by_id(
        &self,
        tenant_id: &str,
        channel_id: &str,
    ) -> Result<Option<ChannelSnapshot>, PlatformError>;

    async fn ensure_category(
        &self,
        tenant_id: &str,
        request: &CategoryRequest,
        ctx: &RequestContext,
    ) -> Result<EnsureResult, PlatformError>;

    async fn ensure_text_channel(
        &self,
        tenant_id: &str,
        request: &TextChannelRequest,
        ctx: &RequestContext,
    ) -> Result<EnsureResult, PlatformError>;

    /// Replace the whole overwrite set of a category or channel.
    async fn replace_overwrites(
        &self,
        tenant_id: &str,
        channel_id: &str,
        overwrites: &[Overwrite],
        ctx: &RequestContext,
    ) -> Result<EnsureResult, PlatformError>;

    async fn ensure_message_by_marker(
        &self,
        tenant_id: &str,
        request: &MessageRequest,
        ctx: &RequestContext,
    ) -> Result<EnsureResult, PlatformError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_are_decisive() {
        assert_eq!(classify(PlatformError::http(403, "nope")).code, ErrorCode::Forbidden);
        assert_eq!(classify(PlatformError::http(404, "gone")).code, ErrorCode::NotFound);
        assert_eq!(classify(PlatformError::http(429, "slow down")).code, ErrorCode::RateLimited);
    }

    #[test]
    fn markers_classify_other_failures() {
        let c = |msg: &str| classify(PlatformError::Transport(msg.to_string())).code;
        assert_eq!(c("DiscordAPIError: Missing Permissions"), ErrorCode::Forbidden);
        assert_eq!(c("Missing Access"), ErrorCode::Forbidden);
        assert_eq!(c("Unknown Channel"), ErrorCode::NotFound);
        assert_eq!(c("hit rate limit on /roles"), ErrorCode::RateLimited);
        assert_eq!(c("socket hang up"), ErrorCode::TransientFailure);
        assert_eq!(
            classify(PlatformError::http(400, "Missing Permissions")).code,
            ErrorCode::Forbidden
        );
        assert_eq!(classify(PlatformError::http(502, "Bad Gateway")).code, ErrorCode::TransientFailure);
    }

    #[test]
    fn domain_errors_pass_through() {
        let inner = DeployError::conflict("multiple roles match managed name");
        assert_eq!(classify(PlatformError::Domain(inner.clone())), inner);
        let via_from: DeployError = PlatformError::Domain(inner.clone()).into();
        assert_eq!(via_from, inner);
    }

    #[test]
    fn request_context_reason() {
        let id = uuid::Uuid::nil();
        let ctx = RequestContext::for_deployment(id, "req-1", "u1");
        assert_eq!(ctx.reason, format!("deploy={} requestId=req-1", id));
    }
}
