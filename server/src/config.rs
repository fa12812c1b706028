//! Server configuration loaded from environment variables via `envy`.
//!
//! Each field maps to `ROOST_<FIELD>`:
//!   - `ROOST_LISTEN_ADDR`          (default `0.0.0.0:8080`)
//!   - `ROOST_DATABASE_PATH`        (default `roost.db`)
//!   - `ROOST_BACKEND`              (default `local`)
//!   - `ROOST_SEALING_KEY`          (required, >= 32 bytes)
//!   - `ROOST_STEP_TIMEOUT_SECS`    (default `300`)
//!   - `ROOST_PROBE_TIMEOUT_SECS`   (default `900`)
//!   - `ROOST_SCOPED_TTL_SECS`      (default `3600`)
//!   - `ROOST_EVENT_BUFFER`         (default `256`)
//!   - `ROOST_DEFAULT_SIZE`         (default `small`)
//!   - `ROOST_SERVICE_PORT`         (default `18789`)

use std::time::Duration;

use serde::Deserialize;

use crate::application::services::OrchestratorSettings;
use crate::infra::backends::BackendKind;

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind the HTTP server to.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Sqlite database file path.
    #[serde(default = "default_database_path")]
    pub database_path: String,

    /// Capability backend vendor.
    #[serde(default)]
    pub backend: BackendKind,

    /// Master key for sealing secret material at rest (>= 32 bytes).
    pub sealing_key: String,

    /// Per-step deadline inside workflows.
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,

    /// Deadline for bootstrap waits and health probes.
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,

    /// Lifetime of minted bucket-scoped credentials.
    #[serde(default = "default_scoped_ttl_secs")]
    pub scoped_ttl_secs: u64,

    /// Progress channel capacity per workflow.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,

    /// Size class used when a create request does not name one.
    #[serde(default = "default_size")]
    pub default_size: String,

    /// Port the agent's service process listens on inside the VM.
    #[serde(default = "default_service_port")]
    pub service_port: u16,
}

impl ServerConfig {
    /// Load from `ROOST_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error when a required variable is missing or malformed.
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::prefixed("ROOST_").from_env()
    }

    #[must_use]
    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            step_timeout: Duration::from_secs(self.step_timeout_secs),
            probe_timeout: Duration::from_secs(self.probe_timeout_secs),
            event_buffer: self.event_buffer,
            default_size: self.default_size.clone(),
            service_port: self.service_port,
        }
    }

    #[must_use]
    pub fn scoped_ttl(&self) -> Duration {
        Duration::from_secs(self.scoped_ttl_secs)
    }
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_owned()
}

fn default_database_path() -> String {
    "roost.db".to_owned()
}

fn default_step_timeout_secs() -> u64 {
    300
}

fn default_probe_timeout_secs() -> u64 {
    900
}

fn default_scoped_ttl_secs() -> u64 {
    3600
}

fn default_event_buffer() -> usize {
    256
}

fn default_size() -> String {
    "small".to_owned()
}

fn default_service_port() -> u16 {
    18789
}
