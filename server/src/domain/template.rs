//! Template (saved agent) record and its config snapshot document.

use chrono::{DateTime, Utc};
use roost_common::PlatformKind;
use serde::{Deserialize, Serialize};

/// Opaque configuration captured from a live agent by the archive workflow.
///
/// Once attached to a template the snapshot is only ever replaced wholesale;
/// nothing a running agent does mutates it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    /// Compute size class the source agent ran with.
    pub size: Option<String>,
    /// Platform version captured at archive time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform_version: Option<String>,
    /// Raw platform config file contents read off the instance, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<String>,
}

/// Saved agent template, usable to found new agents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateRecord {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub platform: PlatformKind,
    pub setup_script_ref: Option<String>,
    pub snapshot: ConfigSnapshot,
    pub starred: bool,
    pub source_agent_id: Option<String>,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TemplateRecord {
    /// Duplicate this template under a new identity and name.
    #[must_use]
    pub fn copied(&self, new_id: String, name: String, now: DateTime<Utc>) -> Self {
        Self {
            id: new_id,
            name,
            starred: false,
            created_at: now,
            ..self.clone()
        }
    }
}
