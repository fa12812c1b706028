//! Credential scoping service.
//!
//! Two jobs: mint minimally-scoped, time-limited credentials for exactly one
//! bucket (never project- or account-wide), and broker secret material in
//! and out of the secret backend. Plaintext only ever travels as
//! [`SecretString`] and is dropped as soon as injection completes; it is
//! never logged, never serialized into audit or progress payloads.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use secrecy::SecretString;

use crate::application::ports::{ObjectStoreBackend, ScopedCredentials, SecretBackend};

/// Scoping service handle; cheap to clone.
#[derive(Clone)]
pub struct CredentialScopingService {
    objects: Arc<dyn ObjectStoreBackend>,
    secrets: Arc<dyn SecretBackend>,
    credential_ttl: Duration,
}

impl CredentialScopingService {
    #[must_use]
    pub fn new(
        objects: Arc<dyn ObjectStoreBackend>,
        secrets: Arc<dyn SecretBackend>,
        credential_ttl: Duration,
    ) -> Self {
        Self {
            objects,
            secrets,
            credential_ttl,
        }
    }

    /// Mint credentials restricted to `bucket_id`, valid for the configured
    /// TTL.
    ///
    /// # Errors
    ///
    /// Returns an error if the object store refuses to issue credentials.
    pub async fn mint_bucket_credentials(&self, bucket_id: &str) -> Result<ScopedCredentials> {
        self.objects
            .issue_scoped_credentials(bucket_id, self.credential_ttl)
            .await
    }

    /// Store new secret material; returns the opaque reference to persist.
    ///
    /// # Errors
    ///
    /// Returns an error if the secret backend write fails.
    pub async fn store(&self, owner_id: &str, name: &str, value: SecretString) -> Result<String> {
        self.secrets.store_secret(owner_id, name, value).await
    }

    /// Retrieve plaintext for one-time injection. Callers must drop the
    /// returned value as soon as it has been delivered.
    ///
    /// # Errors
    ///
    /// Returns an error if the reference is unknown or the backend fails.
    pub async fn reveal(&self, secret_ref: &str) -> Result<SecretString> {
        self.secrets.get_secret(secret_ref).await
    }

    /// Delete the underlying secret-backend entry. Absent entries count as
    /// already deleted.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    pub async fn discard(&self, secret_ref: &str) -> Result<()> {
        self.secrets.delete_secret(secret_ref).await
    }
}
