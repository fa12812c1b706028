//! Port trait definitions for the Application layer.
//!
//! Ports are the contracts infrastructure must fulfill. This file imports
//! only from `crate::domain` — never from `crate::infra` or `crate::api`.
//! One implementation of each capability trait exists per cloud vendor; the
//! orchestrator holds `Arc<dyn ...>` and is selected once at process start.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::SecretString;

use crate::domain::{AgentRecord, AuditEntry, CredentialRecord, TemplateRecord};

// ── Value Types ───────────────────────────────────────────────────────────────

/// Launch parameters for a new compute instance.
#[derive(Debug, Clone)]
pub struct InstanceSpec {
    /// Backend-visible instance name, e.g. `roost-agent-1a2b3c4d`.
    pub name: String,
    /// Size class, e.g. `"small"`.
    pub size: String,
    /// OS image selector; `"default"` lets the vendor pick.
    pub image: String,
    /// Owner identifier, for tagging.
    pub owner_id: String,
    /// Agent identifier, for tagging.
    pub agent_id: String,
    /// Bootstrap script executed on first boot.
    pub user_data: Option<String>,
    /// Extra vendor tags.
    pub labels: HashMap<String, String>,
}

/// Coarse instance state as reported by the compute vendor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Provisioning,
    Running,
    Stopping,
    Stopped,
    Terminated,
    Unknown,
}

impl InstanceState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Provisioning => "provisioning",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Terminated => "terminated",
            Self::Unknown => "unknown",
        }
    }
}

/// A compute instance as seen through the backend.
#[derive(Debug, Clone)]
pub struct Instance {
    /// Opaque vendor reference; every other call is keyed by it.
    pub instance_id: String,
    pub state: InstanceState,
    pub internal_addr: Option<String>,
    pub external_addr: Option<String>,
}

/// Captured output of a remote command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Time-bounded credentials restricted to exactly one bucket.
#[derive(Debug, Clone)]
pub struct ScopedCredentials {
    pub bucket_id: String,
    /// Vendor credential document, ready to write to the instance.
    pub credentials_json: String,
    pub expires_at: DateTime<Utc>,
}

/// Listing entry for a stored object.
#[derive(Debug, Clone)]
pub struct ObjectMeta {
    pub key: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

/// Listing entry for a stored secret. Never carries the value.
#[derive(Debug, Clone)]
pub struct SecretMetadata {
    pub secret_ref: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// Authenticated caller resolved from a bearer credential.
#[derive(Debug, Clone)]
pub struct Identity {
    pub subject: String,
    pub email: String,
    pub display_name: String,
}

/// Token material returned by an auth-code exchange.
#[derive(Debug, Clone)]
pub struct TokenGrant {
    pub access_token: SecretString,
    pub refresh_token: Option<SecretString>,
    pub expires_in: u64,
}

// ── Capability Ports ──────────────────────────────────────────────────────────

/// Compute instance lifecycle and in-instance access.
///
/// Teardown must be idempotent: deleting an instance that no longer exists
/// is success, not an error.
#[async_trait]
pub trait ComputeBackend: Send + Sync {
    /// Launch a new instance; the returned reference keys all other calls.
    async fn create_instance(&self, spec: &InstanceSpec) -> Result<Instance>;
    /// Destroy an instance. Absent instances are treated as already deleted.
    async fn delete_instance(&self, instance_id: &str) -> Result<()>;
    /// Start a stopped instance.
    async fn start_instance(&self, instance_id: &str) -> Result<()>;
    /// Stop a running instance.
    async fn stop_instance(&self, instance_id: &str) -> Result<()>;
    /// Current vendor-reported state and addresses.
    async fn get_status(&self, instance_id: &str) -> Result<Instance>;
    /// Run a shell command inside the instance and capture its output.
    async fn run_command(&self, instance_id: &str, command: &str) -> Result<CommandOutput>;
    /// Write a file inside the instance.
    async fn upload_file(&self, instance_id: &str, remote_path: &str, contents: &[u8])
    -> Result<()>;
    /// Read a file from the instance.
    async fn download_file(&self, instance_id: &str, remote_path: &str) -> Result<Vec<u8>>;
}

/// Object storage buckets scoped to one owner.
///
/// Bucket teardown must tolerate "already deleted".
#[async_trait]
pub trait ObjectStoreBackend: Send + Sync {
    /// Create a bucket for `owner_id`; returns the bucket reference.
    async fn create_bucket(&self, owner_id: &str, name: &str) -> Result<String>;
    /// Delete a bucket and all contents. Absent buckets are success.
    async fn delete_bucket(&self, bucket_id: &str) -> Result<()>;
    async fn list_objects(&self, bucket_id: &str, prefix: &str) -> Result<Vec<ObjectMeta>>;
    async fn put_object(&self, bucket_id: &str, key: &str, data: &[u8]) -> Result<()>;
    async fn get_object(&self, bucket_id: &str, key: &str) -> Result<Vec<u8>>;
    /// Issue credentials restricted to `bucket_id`, valid for `ttl`.
    async fn issue_scoped_credentials(
        &self,
        bucket_id: &str,
        ttl: Duration,
    ) -> Result<ScopedCredentials>;
}

/// Secret material storage. List calls return metadata only.
///
/// Secret teardown must tolerate "already deleted".
#[async_trait]
pub trait SecretBackend: Send + Sync {
    /// Store a secret; returns an opaque reference for later retrieval.
    async fn store_secret(&self, owner_id: &str, name: &str, value: SecretString)
    -> Result<String>;
    /// Retrieve secret plaintext for one-time use.
    async fn get_secret(&self, secret_ref: &str) -> Result<SecretString>;
    /// Delete a secret. Absent secrets are success.
    async fn delete_secret(&self, secret_ref: &str) -> Result<()>;
    async fn list_secrets(&self, owner_id: &str) -> Result<Vec<SecretMetadata>>;
}

/// Identity provider used to authorize callers before workflows run.
#[async_trait]
pub trait IdentityBackend: Send + Sync {
    /// Verify a bearer credential and resolve the caller.
    async fn verify_token(&self, bearer: &str) -> Result<Identity>;
    /// Login redirect target for the excluded auth flow.
    fn auth_url(&self, redirect_uri: &str, state: &str) -> String;
    /// Exchange an auth code for tokens.
    async fn exchange_code(&self, code: &str, redirect_uri: &str) -> Result<TokenGrant>;
}

// ── Store Ports ───────────────────────────────────────────────────────────────

/// Durable agent records. Lifecycle-status writes happen only inside a
/// locked workflow; readers tolerate transient states.
#[async_trait]
pub trait AgentStore: Send + Sync {
    async fn insert_agent(&self, agent: &AgentRecord) -> Result<()>;
    async fn get_agent(&self, owner_id: &str, agent_id: &str) -> Result<Option<AgentRecord>>;
    /// Non-deleted agents for one owner, newest first.
    async fn list_agents(&self, owner_id: &str) -> Result<Vec<AgentRecord>>;
    /// Full-row update; the caller owns the agent's operation lock.
    async fn update_agent(&self, agent: &AgentRecord) -> Result<()>;
}

/// Durable template records.
#[async_trait]
pub trait TemplateStore: Send + Sync {
    async fn insert_template(&self, template: &TemplateRecord) -> Result<()>;
    async fn get_template(
        &self,
        owner_id: &str,
        template_id: &str,
    ) -> Result<Option<TemplateRecord>>;
    async fn list_templates(&self, owner_id: &str) -> Result<Vec<TemplateRecord>>;
    /// Update name/starred/description; the snapshot is replaced wholesale
    /// only by archive.
    async fn update_template(&self, template: &TemplateRecord) -> Result<()>;
    async fn delete_template(&self, owner_id: &str, template_id: &str) -> Result<bool>;
}

/// Durable credential metadata and agent grants.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn insert_credential(&self, credential: &CredentialRecord) -> Result<()>;
    async fn get_credential(
        &self,
        owner_id: &str,
        credential_id: &str,
    ) -> Result<Option<CredentialRecord>>;
    async fn list_credentials(&self, owner_id: &str) -> Result<Vec<CredentialRecord>>;
    /// Remove the row and all grant relations referencing it.
    async fn delete_credential(&self, owner_id: &str, credential_id: &str) -> Result<bool>;
    async fn grant(&self, agent_id: &str, credential_id: &str) -> Result<()>;
    /// Credentials granted to one agent.
    async fn grants_for_agent(&self, agent_id: &str) -> Result<Vec<CredentialRecord>>;
    /// Drop all grants for a deleted agent.
    async fn clear_grants_for_agent(&self, agent_id: &str) -> Result<()>;
}

/// Append-only audit sink. There is deliberately no update or delete here;
/// the storage layer additionally rejects both.
#[async_trait]
pub trait AuditLedger: Send + Sync {
    async fn append(&self, entry: &AuditEntry) -> Result<()>;
    /// Most recent entries for one owner.
    async fn list_entries(&self, owner_id: &str, limit: u32) -> Result<Vec<AuditEntry>>;
}
