//! Error taxonomy shared by the planner, the queue and the executor.
//!
//! Every failure that reaches a caller or a ledger row is a [`DeployError`] carrying one
//! [`ErrorCode`]. Raw remote failures ([`crate::platform::PlatformError`]) are converted only
//! through [`crate::platform::classify`], so the ledger never stores an unclassified error.
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Classified failure codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Bad input or a template reference that does not resolve.
    ValidationFailed,
    /// Permission denied by the remote platform or an authorization gate.
    Forbidden,
    /// Referenced tenant or resource is absent.
    NotFound,
    /// Ambiguous adoption or concurrent state change.
    Conflict,
    /// Remote platform throttled the call.
    RateLimited,
    /// Anything transient or unrecognized, including deadline expiry.
    TransientFailure,
    /// Apply refused because it could lock the bot out of the tenant.
    SafetyLockoutRisk,
}

impl ErrorCode {
    /// Stable wire name, e.g. `VALIDATION_FAILED`.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ValidationFailed => "VALIDATION_FAILED",
            ErrorCode::Forbidden => "FORBIDDEN",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::Conflict => "CONFLICT",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::TransientFailure => "TRANSIENT_FAILURE",
            ErrorCode::SafetyLockoutRisk => "SAFETY_LOCKOUT_RISK",
        }
    }

    /// Only throttling and transient failures are retried by the queue.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorCode::RateLimited | ErrorCode::TransientFailure)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified engine error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct DeployError {
    /// Taxonomy bucket.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
    /// Optional extra context (last remote error, offending key, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl DeployError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), detail: None }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ValidationFailed, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Forbidden, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Conflict, message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::RateLimited, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::TransientFailure, message)
    }

    pub fn lockout(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::SafetyLockoutRisk, message)
    }

    /// Attach extra context.
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Whether the queue may retry this failure.
    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    /// Check if this error came from the lockout gate.
    pub fn is_lockout(&self) -> bool {
        self.code == ErrorCode::SafetyLockoutRisk
    }
}

/// Result of a failed `apply`: the classified error plus the deployment it was recorded under.
///
/// `deployment_id` is `None` when the run was refused before a Deployment row was written
/// (lockout gate, plan construction failure).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployFailure {
    pub deployment_id: Option<Uuid>,
    pub error: DeployError,
}

impl fmt::Display for DeployFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.deployment_id {
            Some(id) => write!(f, "deployment {} failed: {}", id, self.error),
            None => write!(f, "deployment refused: {}", self.error),
        }
    }
}

impl std::error::Error for DeployFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

impl DeployFailure {
    pub fn refused(error: DeployError) -> Self {
        Self { deployment_id: None, error }
    }

    pub fn recorded(deployment_id: Uuid, error: DeployError) -> Self {
        Self { deployment_id: Some(deployment_id), error }
    }

    pub fn code(&self) -> ErrorCode {
        self.error.code
    }
}
