//! Credential record management.
//!
//! The credential row and its secret-backend entry move together: a row is
//! never stored when the secret write failed, and the row is only removed
//! once the secret delete succeeded (or reported already-gone).

use std::sync::Arc;

use chrono::Utc;
use secrecy::SecretString;
use uuid::Uuid;

use crate::application::ports::CredentialStore;
use crate::application::services::scoping::CredentialScopingService;
use crate::domain::{CredentialKind, CredentialRecord, OrchestratorError, validate_agent_name};

/// Couples `CredentialStore` rows with secret-backend entries.
#[derive(Clone)]
pub struct CredentialService {
    store: Arc<dyn CredentialStore>,
    scoping: CredentialScopingService,
}

impl CredentialService {
    #[must_use]
    pub fn new(store: Arc<dyn CredentialStore>, scoping: CredentialScopingService) -> Self {
        Self { store, scoping }
    }

    /// Store the secret and insert the metadata row.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a bad name, or a backend error if
    /// either write fails; a failed row insert rolls the secret back.
    pub async fn create(
        &self,
        owner_id: &str,
        name: &str,
        kind: CredentialKind,
        description: Option<String>,
        value: SecretString,
    ) -> Result<CredentialRecord, OrchestratorError> {
        validate_agent_name(name)?;

        let id = Uuid::new_v4().to_string();
        let secret_name = format!("credential-{id}");
        let secret_ref = self
            .scoping
            .store(owner_id, &secret_name, value)
            .await
            .map_err(|e| OrchestratorError::Backend {
                step: "store secret".into(),
                message: format!("{e:#}"),
            })?;

        let record = CredentialRecord {
            id,
            owner_id: owner_id.to_owned(),
            name: name.to_owned(),
            kind,
            description,
            secret_ref: secret_ref.clone(),
            created_at: Utc::now(),
        };

        if let Err(insert_err) = self.store.insert_credential(&record).await {
            // The row never landed; take the secret back out so no orphaned
            // plaintext lingers in the backend.
            if let Err(rollback_err) = self.scoping.discard(&secret_ref).await {
                tracing::warn!(
                    secret_ref = %secret_ref,
                    error = %format!("{rollback_err:#}"),
                    "failed to roll back secret after credential insert failure"
                );
            }
            return Err(OrchestratorError::store(&insert_err));
        }
        Ok(record)
    }

    /// Delete the secret-backend entry, then the row (and its grants).
    ///
    /// # Errors
    ///
    /// Returns not-found for unknown ids, or a backend error if the secret
    /// delete fails — in that case the row is kept so the delete can be
    /// retried.
    pub async fn delete(&self, owner_id: &str, credential_id: &str) -> Result<(), OrchestratorError> {
        let record = self
            .store
            .get_credential(owner_id, credential_id)
            .await
            .map_err(|e| OrchestratorError::store(&e))?
            .ok_or(OrchestratorError::NotFound("credential"))?;

        self.scoping
            .discard(&record.secret_ref)
            .await
            .map_err(|e| OrchestratorError::Backend {
                step: "delete secret".into(),
                message: format!("{e:#}"),
            })?;

        self.store
            .delete_credential(owner_id, credential_id)
            .await
            .map_err(|e| OrchestratorError::store(&e))?;
        Ok(())
    }
}
