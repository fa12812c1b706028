//! Agent lifecycle types shared between the server and its clients.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of an agent sandbox.
///
/// Transient states (`creating`, `starting`, `stopping`, `deleting`) are only
/// ever held while the orchestrator owns the agent's operation lock; readers
/// must tolerate observing them.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Creating,
    Running,
    Stopping,
    Stopped,
    Starting,
    Deleting,
    Deleted,
    Error,
}

impl AgentStatus {
    /// True while a workflow is mid-transition.
    #[must_use]
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            Self::Creating | Self::Starting | Self::Stopping | Self::Deleting
        )
    }

    /// Stable string form, identical to the serde wire form.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Deleting => "deleting",
            Self::Deleted => "deleted",
            Self::Error => "error",
        }
    }

    /// Parse the wire form back into a status.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "creating" => Self::Creating,
            "running" => Self::Running,
            "stopping" => Self::Stopping,
            "stopped" => Self::Stopped,
            "starting" => Self::Starting,
            "deleting" => Self::Deleting,
            "deleted" => Self::Deleted,
            "error" => Self::Error,
            _ => return None,
        })
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Agent platform installed on the sandbox VM.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PlatformKind {
    Openhands,
    Goose,
}

impl PlatformKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Openhands => "openhands",
            Self::Goose => "goose",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "openhands" => Self::Openhands,
            "goose" => Self::Goose,
            _ => return None,
        })
    }
}

impl std::fmt::Display for PlatformKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named orchestration workflows.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowKind {
    Create,
    Start,
    Stop,
    Delete,
    Archive,
    Restore,
}

impl WorkflowKind {
    /// Audit action tag for this workflow, e.g. `agent.create`.
    #[must_use]
    pub fn action(self) -> &'static str {
        match self {
            Self::Create => "agent.create",
            Self::Start => "agent.start",
            Self::Stop => "agent.stop",
            Self::Delete => "agent.delete",
            Self::Archive => "agent.archive",
            Self::Restore => "agent.restore",
        }
    }
}

impl std::fmt::Display for WorkflowKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.action())
    }
}

/// Externally visible view of an agent record.
///
/// This is what list/get endpoints return and what the terminal `complete`
/// progress event carries. Internal bookkeeping (e.g. the secret-backend
/// reference for the agent's scoped bucket credentials) never appears here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSnapshot {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub size: String,
    pub status: AgentStatus,
    pub instance_id: Option<String>,
    pub internal_addr: Option<String>,
    pub bucket_id: Option<String>,
    pub current_task: Option<String>,
    pub platform: PlatformKind,
    pub platform_version: Option<String>,
    pub template_id: Option<String>,
    pub service_port: u16,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
