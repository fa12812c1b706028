//! Agent record and pure validation rules.

use chrono::{DateTime, Utc};
use roost_common::{AgentSnapshot, AgentStatus, PlatformKind};

use crate::domain::error::OrchestratorError;

/// Full agent row as persisted in the state store.
///
/// `scoped_secret_ref` points at the secret-backend copy of the agent's
/// bucket-scoped credentials; it is internal bookkeeping and deliberately
/// absent from [`AgentSnapshot`].
#[derive(Debug, Clone)]
pub struct AgentRecord {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub size: String,
    pub status: AgentStatus,
    pub instance_id: Option<String>,
    pub internal_addr: Option<String>,
    pub bucket_id: Option<String>,
    pub scoped_secret_ref: Option<String>,
    pub current_task: Option<String>,
    pub platform: PlatformKind,
    pub platform_version: Option<String>,
    pub template_id: Option<String>,
    pub service_port: u16,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AgentRecord {
    /// Externally visible view of this record.
    #[must_use]
    pub fn snapshot(&self) -> AgentSnapshot {
        AgentSnapshot {
            id: self.id.clone(),
            owner_id: self.owner_id.clone(),
            name: self.name.clone(),
            size: self.size.clone(),
            status: self.status,
            instance_id: self.instance_id.clone(),
            internal_addr: self.internal_addr.clone(),
            bucket_id: self.bucket_id.clone(),
            current_task: self.current_task.clone(),
            platform: self.platform,
            platform_version: self.platform_version.clone(),
            template_id: self.template_id.clone(),
            service_port: self.service_port,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    /// Reject the workflow unless the agent is in `expected` status.
    ///
    /// # Errors
    ///
    /// Returns a validation error naming the actual status.
    pub fn require_status(
        &self,
        expected: AgentStatus,
        action: &str,
    ) -> Result<(), OrchestratorError> {
        if self.status == expected {
            Ok(())
        } else {
            Err(OrchestratorError::Validation(format!(
                "agent cannot be {action} from status '{}'",
                self.status
            )))
        }
    }
}

/// Validate a user-supplied agent (or template) display name.
///
/// # Errors
///
/// Returns a validation error if the name is empty, longer than 255
/// characters, or contains control characters.
pub fn validate_agent_name(name: &str) -> Result<(), OrchestratorError> {
    if name.is_empty() {
        return Err(OrchestratorError::Validation(
            "name must not be empty".into(),
        ));
    }
    if name.chars().count() > 255 {
        return Err(OrchestratorError::Validation(
            "name must be at most 255 characters".into(),
        ));
    }
    if name.chars().any(char::is_control) {
        return Err(OrchestratorError::Validation(
            "name must not contain control characters".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(status: AgentStatus) -> AgentRecord {
        AgentRecord {
            id: "a1".into(),
            owner_id: "u1".into(),
            name: "research assistant".into(),
            size: "small".into(),
            status,
            instance_id: Some("i-123".into()),
            internal_addr: Some("10.0.0.4".into()),
            bucket_id: Some("b-123".into()),
            scoped_secret_ref: None,
            current_task: None,
            platform: PlatformKind::Openhands,
            platform_version: None,
            template_id: None,
            service_port: 18789,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn snapshot_hides_scoped_secret_ref() {
        let mut rec = record(AgentStatus::Running);
        rec.scoped_secret_ref = Some("secrets/agent-a1/bucket".into());
        let json = serde_json::to_value(rec.snapshot()).expect("serialize");
        assert!(json.get("scoped_secret_ref").is_none());
        assert_eq!(json["status"], "running");
    }

    #[test]
    fn require_status_names_actual_state() {
        let rec = record(AgentStatus::Running);
        let err = rec
            .require_status(AgentStatus::Stopped, "started")
            .expect_err("should reject");
        assert!(err.to_string().contains("'running'"));
    }

    #[test]
    fn name_validation() {
        assert!(validate_agent_name("ok").is_ok());
        assert!(validate_agent_name("").is_err());
        assert!(validate_agent_name(&"x".repeat(256)).is_err());
        assert!(validate_agent_name("bad\nname").is_err());
    }
}
