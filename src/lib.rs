#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # guildforge
//!
//! Provisioning and reconciliation of guild templates across many tenants.
//!
//! A [`Template`] declares roles, categories, text channels and permission policies. The
//! [`Deployer`] plans the difference between that template and what a tenant already has
//! (through the mapping store and cheap remote reads), then applies the plan step by step
//! through a rate-limited [`OperationQueue`], recording every step so that a failed run can be
//! resumed by running it again.
//!
//! ## Features
//!
//! - **Deterministic fingerprints** of canonical JSON for change detection
//! - **Policy compilation** from principal rules to permission overwrites
//! - **Idempotent steps** keyed by tenant, config hash, kind, key and fingerprint
//! - **Per-tenant FIFO lanes** under a global concurrency cap, with in-flight de-duplication
//! - **Retry** with capped exponential backoff and jitter, classified by error code
//! - **Lockout protection** before any mutation
//!
//! ## Quick Start
//!
//! ```rust
//! use guildforge::{Backoff, DeployError, InstantSleeper, Jitter, OperationBudget, RetryPolicy};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let policy = RetryPolicy::builder()
//!         .backoff(Backoff::exponential(Duration::from_millis(500)).with_max(Duration::from_secs(20)).unwrap())
//!         .with_jitter(Jitter::proportional(0.3).unwrap())
//!         .with_sleeper(InstantSleeper)
//!         .build()
//!         .unwrap();
//!
//!     let budget = OperationBudget::within(Duration::from_secs(600), 8);
//!     let result = policy
//!         .execute(&budget, || async { Ok::<_, DeployError>("role-1") })
//!         .await;
//!     assert_eq!(result.unwrap(), "role-1");
//! }
//! ```

pub mod audit;
pub mod backoff;
pub mod bulkhead;
pub mod config;
pub mod error;
pub mod executor;
pub mod fingerprint;
pub mod jitter;
pub mod names;
pub mod permissions;
pub mod planner;
pub mod platform;
pub mod policy;
pub mod prelude;
pub mod queue;
pub mod retry;
pub mod sleeper;
pub mod store;
pub mod template;

// Re-exports
pub use audit::{AuditEvent, AuditEventKind, AuditSink, BoxAuditSink};
pub use backoff::Backoff;
pub use bulkhead::Bulkhead;
pub use config::{ConfigError, EngineConfig, MarkerMessage, RateLimitConfig};
pub use error::{DeployError, DeployFailure, ErrorCode};
pub use executor::{ApplyRequest, Deployer};
pub use fingerprint::Fingerprint;
pub use jitter::Jitter;
pub use planner::{DeploymentPreview, Plan, PlannedStep, Planner, Warning, WarningCode};
pub use platform::{InMemoryPlatform, Platform, PlatformError, RequestContext};
pub use queue::{Operation, OperationKind, OperationQueue};
pub use retry::{OperationBudget, RetryPolicy, RetryPolicyBuilder};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use store::{InMemoryStore, Storage, StoreError};
pub use template::{Template, TemplateError, TemplateRegistry};
