//! In-process backend vendor.
//!
//! Implements the four capability ports against process memory: instances
//! are records with a state field and a tiny in-memory filesystem, buckets
//! are maps, secrets are sealed blobs (the same at-rest sealing a cloud
//! vendor's KMS would provide sits here in [`SecretSealer`]). Useful for
//! local development and as the fixture vendor in tests — the orchestrator
//! cannot tell the difference, which is the point of the ports.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use uuid::Uuid;

use crate::application::ports::{
    CommandOutput, ComputeBackend, Identity, IdentityBackend, Instance, InstanceSpec,
    InstanceState, ObjectMeta, ObjectStoreBackend, ScopedCredentials, SecretBackend,
    SecretMetadata, TokenGrant,
};
use crate::infra::crypto::SecretSealer;

// ── Compute ──────────────────────────────────────────────────────────────────

struct LocalInstance {
    state: InstanceState,
    internal_addr: String,
    files: HashMap<String, Vec<u8>>,
}

/// In-memory compute vendor. Instances boot instantly and every command
/// succeeds, so provisioning flows run end-to-end without a hypervisor.
#[derive(Default)]
pub struct LocalCompute {
    instances: Mutex<HashMap<String, LocalInstance>>,
    next_addr: AtomicU32,
}

impl LocalCompute {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ComputeBackend for LocalCompute {
    async fn create_instance(&self, spec: &InstanceSpec) -> Result<Instance> {
        let instance_id = format!("lvm-{}", Uuid::new_v4().simple());
        let octet = self.next_addr.fetch_add(1, Ordering::SeqCst) % 250 + 2;
        let internal_addr = format!("10.88.0.{octet}");
        let mut files = HashMap::new();
        if let Some(user_data) = &spec.user_data {
            files.insert("/var/lib/cloud/user-data".to_owned(), user_data.clone().into_bytes());
            // The bootstrap script "ran": surface its sentinel and the
            // default config a platform writes on first boot.
            files.insert("/var/run/roost/setup-complete".to_owned(), Vec::new());
            files.insert(
                "/home/agent/.openhands/settings.json".to_owned(),
                b"{}".to_vec(),
            );
            files.insert(
                "/home/agent/.config/goose/config.yaml".to_owned(),
                b"# goose defaults\n".to_vec(),
            );
        }
        self.instances.lock().unwrap_or_else(std::sync::PoisonError::into_inner).insert(
            instance_id.clone(),
            LocalInstance {
                state: InstanceState::Running,
                internal_addr: internal_addr.clone(),
                files,
            },
        );
        Ok(Instance {
            instance_id,
            state: InstanceState::Running,
            internal_addr: Some(internal_addr),
            external_addr: None,
        })
    }

    async fn delete_instance(&self, instance_id: &str) -> Result<()> {
        // Absent instances count as already deleted.
        self.instances
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(instance_id);
        Ok(())
    }

    async fn start_instance(&self, instance_id: &str) -> Result<()> {
        self.with_instance(instance_id, |instance| {
            instance.state = InstanceState::Running;
            Ok(())
        })
    }

    async fn stop_instance(&self, instance_id: &str) -> Result<()> {
        self.with_instance(instance_id, |instance| {
            instance.state = InstanceState::Stopped;
            Ok(())
        })
    }

    async fn get_status(&self, instance_id: &str) -> Result<Instance> {
        self.with_instance(instance_id, |instance| {
            Ok(Instance {
                instance_id: instance_id.to_owned(),
                state: instance.state,
                internal_addr: Some(instance.internal_addr.clone()),
                external_addr: None,
            })
        })
    }

    async fn run_command(&self, instance_id: &str, command: &str) -> Result<CommandOutput> {
        self.with_instance(instance_id, |instance| {
            let exit_code = match instance.state {
                InstanceState::Running => {
                    // `test -f <path>` consults the in-memory filesystem so
                    // bootstrap polling behaves like the real thing.
                    if let Some(path) = command.strip_prefix("test -f ") {
                        i32::from(!instance.files.contains_key(path.trim()))
                    } else {
                        0
                    }
                }
                _ => 1,
            };
            Ok(CommandOutput {
                exit_code,
                stdout: String::new(),
                stderr: if exit_code == 0 {
                    String::new()
                } else {
                    "instance not running".to_owned()
                },
            })
        })
    }

    async fn upload_file(
        &self,
        instance_id: &str,
        remote_path: &str,
        contents: &[u8],
    ) -> Result<()> {
        self.with_instance(instance_id, |instance| {
            instance.files.insert(remote_path.to_owned(), contents.to_vec());
            Ok(())
        })
    }

    async fn download_file(&self, instance_id: &str, remote_path: &str) -> Result<Vec<u8>> {
        self.with_instance(instance_id, |instance| {
            instance
                .files
                .get(remote_path)
                .cloned()
                .ok_or_else(|| anyhow!("{remote_path}: no such file"))
        })
    }
}

impl LocalCompute {
    fn with_instance<T>(
        &self,
        instance_id: &str,
        f: impl FnOnce(&mut LocalInstance) -> Result<T>,
    ) -> Result<T> {
        let mut instances = self
            .instances
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let instance = instances
            .get_mut(instance_id)
            .ok_or_else(|| anyhow!("instance {instance_id} not found"))?;
        f(instance)
    }
}

// ── Object store ─────────────────────────────────────────────────────────────

struct LocalObject {
    data: Vec<u8>,
    last_modified: DateTime<Utc>,
}

/// In-memory bucket vendor.
#[derive(Default)]
pub struct LocalObjectStore {
    buckets: Mutex<HashMap<String, HashMap<String, LocalObject>>>,
}

impl LocalObjectStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ObjectStoreBackend for LocalObjectStore {
    async fn create_bucket(&self, owner_id: &str, name: &str) -> Result<String> {
        let bucket_id = format!("{name}-{}", &Uuid::new_v4().simple().to_string()[..8]);
        tracing::debug!(owner_id, bucket_id = %bucket_id, "creating local bucket");
        self.buckets
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(bucket_id.clone(), HashMap::new());
        Ok(bucket_id)
    }

    async fn delete_bucket(&self, bucket_id: &str) -> Result<()> {
        // Absent buckets count as already deleted.
        self.buckets
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(bucket_id);
        Ok(())
    }

    async fn list_objects(&self, bucket_id: &str, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let buckets = self
            .buckets
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let bucket = buckets
            .get(bucket_id)
            .ok_or_else(|| anyhow!("bucket {bucket_id} not found"))?;
        let mut objects: Vec<ObjectMeta> = bucket
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, obj)| ObjectMeta {
                key: key.clone(),
                size: obj.data.len() as u64,
                last_modified: obj.last_modified,
            })
            .collect();
        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }

    async fn put_object(&self, bucket_id: &str, key: &str, data: &[u8]) -> Result<()> {
        let mut buckets = self
            .buckets
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let bucket = buckets
            .get_mut(bucket_id)
            .ok_or_else(|| anyhow!("bucket {bucket_id} not found"))?;
        bucket.insert(
            key.to_owned(),
            LocalObject {
                data: data.to_vec(),
                last_modified: Utc::now(),
            },
        );
        Ok(())
    }

    async fn get_object(&self, bucket_id: &str, key: &str) -> Result<Vec<u8>> {
        let buckets = self
            .buckets
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        buckets
            .get(bucket_id)
            .ok_or_else(|| anyhow!("bucket {bucket_id} not found"))?
            .get(key)
            .map(|obj| obj.data.clone())
            .ok_or_else(|| anyhow!("object {key} not found in {bucket_id}"))
    }

    async fn issue_scoped_credentials(
        &self,
        bucket_id: &str,
        ttl: Duration,
    ) -> Result<ScopedCredentials> {
        anyhow::ensure!(
            self.buckets
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .contains_key(bucket_id),
            "bucket {bucket_id} not found"
        );
        let expires_at = Utc::now()
            + chrono::Duration::from_std(ttl).context("credential TTL out of range")?;
        let token = Uuid::new_v4().simple().to_string();
        let credentials_json = serde_json::json!({
            "bucket": bucket_id,
            "token": token,
            "expires_at": expires_at.to_rfc3339(),
        })
        .to_string();
        Ok(ScopedCredentials {
            bucket_id: bucket_id.to_owned(),
            credentials_json,
            expires_at,
        })
    }
}

// ── Secrets ──────────────────────────────────────────────────────────────────

struct SealedSecret {
    owner_id: String,
    name: String,
    blob: Vec<u8>,
    created_at: DateTime<Utc>,
}

/// In-memory secret vendor. Values are sealed at the storage boundary, so
/// plaintext never sits in the map.
pub struct LocalSecrets {
    sealer: SecretSealer,
    entries: Mutex<HashMap<String, SealedSecret>>,
}

impl LocalSecrets {
    #[must_use]
    pub fn new(sealer: SecretSealer) -> Self {
        Self {
            sealer,
            entries: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl SecretBackend for LocalSecrets {
    async fn store_secret(
        &self,
        owner_id: &str,
        name: &str,
        value: SecretString,
    ) -> Result<String> {
        let blob = self
            .sealer
            .seal(value.expose_secret().as_bytes())
            .context("sealing secret")?;
        let secret_ref = format!("local/{owner_id}/{}", Uuid::new_v4().simple());
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(
                secret_ref.clone(),
                SealedSecret {
                    owner_id: owner_id.to_owned(),
                    name: name.to_owned(),
                    blob,
                    created_at: Utc::now(),
                },
            );
        Ok(secret_ref)
    }

    async fn get_secret(&self, secret_ref: &str) -> Result<SecretString> {
        let blob = {
            let entries = self
                .entries
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            entries
                .get(secret_ref)
                .map(|entry| entry.blob.clone())
                .ok_or_else(|| anyhow!("secret {secret_ref} not found"))?
        };
        self.sealer.open(&blob).context("opening sealed secret")
    }

    async fn delete_secret(&self, secret_ref: &str) -> Result<()> {
        // Absent secrets count as already deleted.
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(secret_ref);
        Ok(())
    }

    async fn list_secrets(&self, owner_id: &str) -> Result<Vec<SecretMetadata>> {
        let entries = self
            .entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut metadata: Vec<SecretMetadata> = entries
            .iter()
            .filter(|(_, entry)| entry.owner_id == owner_id)
            .map(|(secret_ref, entry)| SecretMetadata {
                secret_ref: secret_ref.clone(),
                name: entry.name.clone(),
                created_at: entry.created_at,
            })
            .collect();
        metadata.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(metadata)
    }
}

// ── Identity ─────────────────────────────────────────────────────────────────

/// Development identity vendor: bearer tokens of the form `dev:<user>` are
/// accepted and resolve to that user. Anything else is rejected.
pub struct LocalIdentity;

#[async_trait]
impl IdentityBackend for LocalIdentity {
    async fn verify_token(&self, bearer: &str) -> Result<Identity> {
        let subject = bearer
            .strip_prefix("dev:")
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow!("invalid bearer token"))?;
        Ok(Identity {
            subject: subject.to_owned(),
            email: format!("{subject}@localhost"),
            display_name: subject.to_owned(),
        })
    }

    fn auth_url(&self, redirect_uri: &str, state: &str) -> String {
        format!("http://localhost/dev-login?redirect_uri={redirect_uri}&state={state}")
    }

    async fn exchange_code(&self, code: &str, _redirect_uri: &str) -> Result<TokenGrant> {
        anyhow::ensure!(!code.is_empty(), "empty auth code");
        Ok(TokenGrant {
            access_token: SecretString::from(format!("dev:{code}")),
            refresh_token: None,
            expires_in: 3600,
        })
    }
}
