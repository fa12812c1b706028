//! Domain layer — pure types, state rules, and validation.
//!
//! This module has zero imports from `crate::infra`, `crate::api`, or
//! `crate::application`, and nothing here performs I/O or spawns tasks.
//! All functions take data in and return data out.

pub mod agent;
pub mod audit;
pub mod credential;
pub mod error;
pub mod platform;
pub mod template;

pub use agent::{AgentRecord, validate_agent_name};
pub use audit::{AuditEntry, AuditOutcome};
pub use credential::{CredentialGrant, CredentialKind, CredentialRecord};
pub use error::OrchestratorError;
pub use template::{ConfigSnapshot, TemplateRecord};
