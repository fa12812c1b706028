//! HTTP surface: workflow invocation (with SSE progress streaming), thin
//! list/get reads over the state store, and template/credential/audit CRUD.
//!
//! Handlers never mutate agent lifecycle status themselves — every mutation
//! goes through the orchestrator. Reads tolerate transient states.

pub mod agents;
pub mod auth;
pub mod credentials;
pub mod templates;

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use roost_common::WorkflowError;
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::application::ports::{
    AgentStore, AuditLedger, ComputeBackend, CredentialStore, IdentityBackend, TemplateStore,
};
use crate::application::services::{CredentialService, Orchestrator};
use crate::domain::{AuditEntry, AuditOutcome, OrchestratorError};

use self::auth::Owner;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub agents: Arc<dyn AgentStore>,
    pub templates: Arc<dyn TemplateStore>,
    pub credentials: Arc<dyn CredentialStore>,
    pub audit: Arc<dyn AuditLedger>,
    pub identity: Arc<dyn IdentityBackend>,
    pub compute: Arc<dyn ComputeBackend>,
    pub credential_service: CredentialService,
}

/// Build the full router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/agents", get(agents::list).post(agents::create))
        .route("/api/agents/{id}", get(agents::get).delete(agents::remove))
        .route("/api/agents/{id}/status", get(agents::status))
        .route("/api/agents/{id}/start", post(agents::start))
        .route("/api/agents/{id}/stop", post(agents::stop))
        .route("/api/agents/{id}/archive", post(agents::archive))
        .route("/api/agents/{id}/restore", post(agents::restore))
        .route("/api/templates", get(templates::list))
        .route(
            "/api/templates/{id}",
            get(templates::get)
                .patch(templates::update)
                .delete(templates::remove),
        )
        .route("/api/templates/{id}/copy", post(templates::copy))
        .route(
            "/api/credentials",
            get(credentials::list).post(credentials::create),
        )
        .route("/api/credentials/{id}", delete(credentials::remove))
        .route("/api/audit", get(list_audit))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Minimal liveness probe for deployment health checks.
async fn health() -> StatusCode {
    StatusCode::OK
}

#[derive(Debug, Deserialize)]
pub struct AuditQuery {
    #[serde(default = "default_audit_limit")]
    pub limit: u32,
}

fn default_audit_limit() -> u32 {
    50
}

async fn list_audit(
    State(state): State<AppState>,
    owner: Owner,
    Query(query): Query<AuditQuery>,
) -> Result<Json<Vec<AuditEntry>>, ApiError> {
    let entries = state
        .audit
        .list_entries(&owner.id, query.limit.min(500))
        .await
        .map_err(|e| ApiError(OrchestratorError::store(&e)))?;
    Ok(Json(entries))
}

/// Append a CRUD-layer audit entry; failures are logged, not surfaced.
pub(crate) async fn record_action(
    state: &AppState,
    owner: &Owner,
    action: &str,
    target_type: &str,
    target_id: Option<&str>,
    outcome: &AuditOutcome,
    detail: serde_json::Map<String, serde_json::Value>,
) {
    let entry = AuditEntry::for_action(
        Uuid::new_v4().to_string(),
        &owner.id,
        action,
        target_type,
        target_id,
        outcome,
        detail,
        owner.origin_addr.clone(),
    );
    if let Err(err) = state.audit.append(&entry).await {
        tracing::error!(action, error = %format!("{err:#}"), "failed to append audit entry");
    }
}

/// Orchestration failure as an HTTP response.
pub struct ApiError(pub OrchestratorError);

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            OrchestratorError::Validation(_) => StatusCode::BAD_REQUEST,
            OrchestratorError::NotFound(_) => StatusCode::NOT_FOUND,
            OrchestratorError::Conflict => StatusCode::CONFLICT,
            OrchestratorError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            OrchestratorError::Backend { .. }
            | OrchestratorError::Partial { .. }
            | OrchestratorError::Store(_) => StatusCode::BAD_GATEWAY,
        };
        let body = Json(serde_json::json!({
            "error": WorkflowError {
                kind: self.0.kind(),
                message: self.0.to_string(),
            }
        }));
        (status, body).into_response()
    }
}
