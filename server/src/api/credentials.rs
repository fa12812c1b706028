//! Credential routes.
//!
//! Secret values arrive in the create body, go straight into a
//! [`SecretString`], and leave this module only toward the secret backend.
//! Responses and audit entries carry metadata exclusively.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use secrecy::SecretString;
use serde::Deserialize;
use serde_json::Map;

use super::auth::Owner;
use super::{ApiError, AppState, record_action};
use crate::domain::{AuditOutcome, CredentialKind, CredentialRecord, OrchestratorError};

#[derive(Debug, Deserialize)]
pub struct CreateCredentialRequest {
    pub name: String,
    pub kind: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Secret plaintext; never echoed back.
    pub value: String,
}

pub async fn list(
    State(state): State<AppState>,
    owner: Owner,
) -> Result<Json<Vec<CredentialRecord>>, ApiError> {
    let credentials = state
        .credentials
        .list_credentials(&owner.id)
        .await
        .map_err(|e| ApiError(OrchestratorError::store(&e)))?;
    Ok(Json(credentials))
}

pub async fn create(
    State(state): State<AppState>,
    owner: Owner,
    Json(body): Json<CreateCredentialRequest>,
) -> Result<(StatusCode, Json<CredentialRecord>), ApiError> {
    let kind = CredentialKind::parse(&body.kind)?;
    let value = SecretString::from(body.value);

    let record = state
        .credential_service
        .create(&owner.id, &body.name, kind, body.description, value)
        .await?;

    let mut detail = Map::new();
    detail.insert("name".into(), record.name.clone().into());
    detail.insert("kind".into(), record.kind.as_str().into());
    record_action(
        &state,
        &owner,
        "credential.create",
        "credential",
        Some(&record.id),
        &AuditOutcome::Success,
        detail,
    )
    .await;
    Ok((StatusCode::CREATED, Json(record)))
}

pub async fn remove(
    State(state): State<AppState>,
    owner: Owner,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.credential_service.delete(&owner.id, &id).await?;
    record_action(
        &state,
        &owner,
        "credential.delete",
        "credential",
        Some(&id),
        &AuditOutcome::Success,
        Map::new(),
    )
    .await;
    Ok(StatusCode::NO_CONTENT)
}
