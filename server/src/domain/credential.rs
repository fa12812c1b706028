//! Credential metadata records. Secret values live in the secret backend
//! only; these rows carry an opaque reference.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::error::OrchestratorError;

/// What a credential is for. Drives grouping in listings, nothing else.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CredentialKind {
    Llm,
    Cloud,
    Utility,
}

impl CredentialKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Llm => "llm",
            Self::Cloud => "cloud",
            Self::Utility => "utility",
        }
    }

    /// Parse the wire form.
    ///
    /// # Errors
    ///
    /// Returns a validation error on unknown kinds.
    pub fn parse(s: &str) -> Result<Self, OrchestratorError> {
        match s {
            "llm" => Ok(Self::Llm),
            "cloud" => Ok(Self::Cloud),
            "utility" => Ok(Self::Utility),
            other => Err(OrchestratorError::Validation(format!(
                "unknown credential kind '{other}' (expected llm, cloud, or utility)"
            ))),
        }
    }
}

impl std::fmt::Display for CredentialKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Credential metadata row. `secret_ref` is the opaque handle returned by
/// the secret backend; the plaintext never appears here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub kind: CredentialKind,
    pub description: Option<String>,
    #[serde(skip_serializing, default)]
    pub secret_ref: String,
    pub created_at: DateTime<Utc>,
}

/// Grant relation between an agent and a credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialGrant {
    pub agent_id: String,
    pub credential_id: String,
    pub granted_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_parse() {
        assert_eq!(
            CredentialKind::parse("llm").expect("parse"),
            CredentialKind::Llm
        );
        assert!(CredentialKind::parse("ssh").is_err());
    }

    #[test]
    fn secret_ref_never_serialized() {
        let rec = CredentialRecord {
            id: "c1".into(),
            owner_id: "u1".into(),
            name: "anthropic key".into(),
            kind: CredentialKind::Llm,
            description: None,
            secret_ref: "secrets/u1/c1".into(),
            created_at: Utc::now(),
        };
        let json = serde_json::to_value(&rec).expect("serialize");
        assert!(json.get("secret_ref").is_none());
        assert_eq!(json["kind"], "llm");
    }
}
