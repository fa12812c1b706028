//! Audit ledger entry types.
//!
//! Entries are immutable facts; the storage layer enforces append-only (see
//! `infra::store`). Detail documents must never contain secret plaintext —
//! builders here take names and identifiers only.

use chrono::{DateTime, Utc};
use roost_common::ErrorKind;
use serde::{Deserialize, Serialize};

/// Outcome recorded for a completed or failed action.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum AuditOutcome {
    Success,
    Failure { kind: ErrorKind, message: String },
}

/// One append-only audit fact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: String,
    pub owner_id: String,
    /// Dotted action tag, e.g. `agent.create` or `credential.delete`.
    pub action: String,
    pub target_type: Option<String>,
    pub target_id: Option<String>,
    /// Structured detail: workflow parameters, per-resource teardown results,
    /// normalized failure info. Free-form JSON document.
    pub detail: serde_json::Value,
    pub origin_addr: Option<String>,
    pub at: DateTime<Utc>,
}

impl AuditEntry {
    /// Build an entry for a workflow outcome against an agent.
    #[must_use]
    pub fn for_action(
        id: String,
        owner_id: &str,
        action: &str,
        target_type: &str,
        target_id: Option<&str>,
        outcome: &AuditOutcome,
        mut detail: serde_json::Map<String, serde_json::Value>,
        origin_addr: Option<String>,
    ) -> Self {
        match outcome {
            AuditOutcome::Success => {
                detail.insert("outcome".into(), "success".into());
            }
            AuditOutcome::Failure { kind, message } => {
                detail.insert("outcome".into(), "failure".into());
                detail.insert("error_kind".into(), kind.as_str().into());
                detail.insert("error".into(), message.clone().into());
            }
        }
        Self {
            id,
            owner_id: owner_id.to_owned(),
            action: action.to_owned(),
            target_type: Some(target_type.to_owned()),
            target_id: target_id.map(str::to_owned),
            detail: serde_json::Value::Object(detail),
            origin_addr,
            at: Utc::now(),
        }
    }
}
