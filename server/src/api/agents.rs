//! Agent routes: workflow invocation plus read-only listings.
//!
//! Workflow responses come in two shapes. With `Accept: text/event-stream`
//! the handler returns the live progress sequence as SSE, terminated by the
//! workflow's single `complete` or `error` event; disconnecting consumers
//! never cancel the underlying workflow. Otherwise the handler awaits the
//! terminal event and returns the final snapshot (or mapped error).

use std::convert::Infallible;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures::Stream;
use roost_common::{AgentSnapshot, PlatformKind};
use serde::{Deserialize, Serialize};

use super::auth::Owner;
use super::{ApiError, AppState};
use crate::application::services::{CreateAgent, WorkflowHandle, WorkflowRequest};
use crate::domain::OrchestratorError;

#[derive(Debug, Deserialize)]
pub struct CreateAgentRequest {
    pub name: String,
    pub platform: PlatformKind,
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub template_id: Option<String>,
    #[serde(default)]
    pub credential_ids: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct AgentListResponse {
    pub agents: Vec<AgentSnapshot>,
    pub total: usize,
}

#[derive(Debug, Serialize)]
pub struct AgentStatusResponse {
    pub agent: AgentSnapshot,
    /// Live vendor-reported instance state, when the instance exists and
    /// answers. Reading it never writes back to the record.
    pub live_state: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ArchiveParams {
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RestoreRequest {
    pub template_id: String,
}

pub async fn list(
    State(state): State<AppState>,
    owner: Owner,
) -> Result<Json<AgentListResponse>, ApiError> {
    let records = state
        .agents
        .list_agents(&owner.id)
        .await
        .map_err(|e| ApiError(OrchestratorError::store(&e)))?;
    let agents: Vec<AgentSnapshot> = records.iter().map(|r| r.snapshot()).collect();
    let total = agents.len();
    Ok(Json(AgentListResponse { agents, total }))
}

pub async fn get(
    State(state): State<AppState>,
    owner: Owner,
    Path(id): Path<String>,
) -> Result<Json<AgentSnapshot>, ApiError> {
    let record = state
        .agents
        .get_agent(&owner.id, &id)
        .await
        .map_err(|e| ApiError(OrchestratorError::store(&e)))?
        .ok_or(ApiError(OrchestratorError::NotFound("agent")))?;
    Ok(Json(record.snapshot()))
}

pub async fn status(
    State(state): State<AppState>,
    owner: Owner,
    Path(id): Path<String>,
) -> Result<Json<AgentStatusResponse>, ApiError> {
    let record = state
        .agents
        .get_agent(&owner.id, &id)
        .await
        .map_err(|e| ApiError(OrchestratorError::store(&e)))?
        .ok_or(ApiError(OrchestratorError::NotFound("agent")))?;

    let live_state = match &record.instance_id {
        Some(instance_id) => state
            .compute
            .get_status(instance_id)
            .await
            .ok()
            .map(|i| i.state.as_str().to_owned()),
        None => None,
    };
    Ok(Json(AgentStatusResponse {
        agent: record.snapshot(),
        live_state,
    }))
}

pub async fn create(
    State(state): State<AppState>,
    owner: Owner,
    headers: HeaderMap,
    Json(body): Json<CreateAgentRequest>,
) -> Response {
    let request = WorkflowRequest::Create(CreateAgent {
        name: body.name,
        platform: body.platform,
        size: body.size,
        template_id: body.template_id,
        credential_ids: body.credential_ids,
    });
    submit(state, owner, headers, request, StatusCode::CREATED).await
}

pub async fn start(
    State(state): State<AppState>,
    owner: Owner,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    submit(
        state,
        owner,
        headers,
        WorkflowRequest::Start { agent_id: id },
        StatusCode::OK,
    )
    .await
}

pub async fn stop(
    State(state): State<AppState>,
    owner: Owner,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    submit(
        state,
        owner,
        headers,
        WorkflowRequest::Stop { agent_id: id },
        StatusCode::OK,
    )
    .await
}

pub async fn archive(
    State(state): State<AppState>,
    owner: Owner,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(params): Query<ArchiveParams>,
) -> Response {
    submit(
        state,
        owner,
        headers,
        WorkflowRequest::Archive {
            agent_id: id,
            name: params.name,
        },
        StatusCode::CREATED,
    )
    .await
}

pub async fn restore(
    State(state): State<AppState>,
    owner: Owner,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<RestoreRequest>,
) -> Response {
    submit(
        state,
        owner,
        headers,
        WorkflowRequest::Restore {
            template_id: body.template_id,
            agent_id: Some(id),
        },
        StatusCode::OK,
    )
    .await
}

pub async fn remove(
    State(state): State<AppState>,
    owner: Owner,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    submit(
        state,
        owner,
        headers,
        WorkflowRequest::Delete { agent_id: id },
        StatusCode::OK,
    )
    .await
}

async fn submit(
    state: AppState,
    owner: Owner,
    headers: HeaderMap,
    request: WorkflowRequest,
    success_status: StatusCode,
) -> Response {
    match state.orchestrator.submit(owner.caller(), request).await {
        Ok(handle) => respond(&headers, handle, success_status).await,
        Err(err) => ApiError(err).into_response(),
    }
}

fn wants_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|accept| accept.contains("text/event-stream"))
}

/// Stream progress as SSE, or await the terminal event and answer once.
async fn respond(headers: &HeaderMap, handle: WorkflowHandle, success_status: StatusCode) -> Response {
    if wants_event_stream(headers) {
        return sse_response(handle).into_response();
    }

    let WorkflowHandle { events, done, .. } = handle;
    // Nobody consumes the stream on this path; the emitter just drops
    // events once the receiver is gone.
    drop(events);
    match done.await {
        Ok(Ok(snapshot)) => (success_status, Json(snapshot)).into_response(),
        Ok(Err(err)) => ApiError(err).into_response(),
        Err(join_err) => {
            tracing::error!(error = %join_err, "workflow task panicked");
            ApiError(OrchestratorError::Store("workflow task failed".into())).into_response()
        }
    }
}

fn sse_response(handle: WorkflowHandle) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let WorkflowHandle { mut events, .. } = handle;
    // Dropping `done` detaches the workflow task; it always runs to its
    // terminal state regardless of this response's lifetime.
    let stream = async_stream::stream! {
        while let Some(event) = events.recv().await {
            match Event::default().event(event.name()).json_data(&event) {
                Ok(sse_event) => yield Ok::<_, Infallible>(sse_event),
                Err(err) => {
                    tracing::error!(error = %err, "failed to encode progress event");
                }
            }
        }
    };
    Sse::new(stream).keep_alive(KeepAlive::default())
}
