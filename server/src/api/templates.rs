//! Template routes: list/get, star/rename, copy, delete.
//!
//! Templates are only ever *created* by the archive workflow; these handlers
//! edit metadata or duplicate existing rows, and replace nothing inside a
//! snapshot.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use chrono::Utc;
use serde::Deserialize;
use serde_json::Map;
use uuid::Uuid;

use super::auth::Owner;
use super::{ApiError, AppState, record_action};
use crate::domain::{AuditOutcome, OrchestratorError, TemplateRecord, validate_agent_name};

#[derive(Debug, Deserialize)]
pub struct UpdateTemplateRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub starred: Option<bool>,
    #[serde(default)]
    pub description: Option<String>,
}

pub async fn list(
    State(state): State<AppState>,
    owner: Owner,
) -> Result<Json<Vec<TemplateRecord>>, ApiError> {
    let templates = state
        .templates
        .list_templates(&owner.id)
        .await
        .map_err(|e| ApiError(OrchestratorError::store(&e)))?;
    Ok(Json(templates))
}

pub async fn get(
    State(state): State<AppState>,
    owner: Owner,
    Path(id): Path<String>,
) -> Result<Json<TemplateRecord>, ApiError> {
    let template = load(&state, &owner, &id).await?;
    Ok(Json(template))
}

pub async fn update(
    State(state): State<AppState>,
    owner: Owner,
    Path(id): Path<String>,
    Json(body): Json<UpdateTemplateRequest>,
) -> Result<Json<TemplateRecord>, ApiError> {
    let mut template = load(&state, &owner, &id).await?;
    if let Some(name) = body.name {
        validate_agent_name(&name)?;
        template.name = name;
    }
    if let Some(starred) = body.starred {
        template.starred = starred;
    }
    if let Some(description) = body.description {
        template.description = Some(description);
    }
    state
        .templates
        .update_template(&template)
        .await
        .map_err(|e| ApiError(OrchestratorError::store(&e)))?;

    record_action(
        &state,
        &owner,
        "template.update",
        "template",
        Some(&id),
        &AuditOutcome::Success,
        Map::new(),
    )
    .await;
    Ok(Json(template))
}

pub async fn copy(
    State(state): State<AppState>,
    owner: Owner,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<TemplateRecord>), ApiError> {
    let template = load(&state, &owner, &id).await?;
    let name = format!("{} (copy)", template.name);
    validate_agent_name(&name)?;

    let copy = template.copied(Uuid::new_v4().to_string(), name, Utc::now());
    state
        .templates
        .insert_template(&copy)
        .await
        .map_err(|e| ApiError(OrchestratorError::store(&e)))?;

    let mut detail = Map::new();
    detail.insert("source_template_id".into(), id.into());
    record_action(
        &state,
        &owner,
        "template.copy",
        "template",
        Some(&copy.id),
        &AuditOutcome::Success,
        detail,
    )
    .await;
    Ok((StatusCode::CREATED, Json(copy)))
}

pub async fn remove(
    State(state): State<AppState>,
    owner: Owner,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let deleted = state
        .templates
        .delete_template(&owner.id, &id)
        .await
        .map_err(|e| ApiError(OrchestratorError::store(&e)))?;
    if !deleted {
        return Err(ApiError(OrchestratorError::NotFound("template")));
    }
    record_action(
        &state,
        &owner,
        "template.delete",
        "template",
        Some(&id),
        &AuditOutcome::Success,
        Map::new(),
    )
    .await;
    Ok(StatusCode::NO_CONTENT)
}

async fn load(state: &AppState, owner: &Owner, id: &str) -> Result<TemplateRecord, ApiError> {
    state
        .templates
        .get_template(&owner.id, id)
        .await
        .map_err(|e| ApiError(OrchestratorError::store(&e)))?
        .ok_or(ApiError(OrchestratorError::NotFound("template")))
}
