//! Bearer authentication.
//!
//! Every `/api` handler takes an [`Owner`] extractor: the bearer token from
//! the `Authorization` header is verified through the configured
//! `IdentityBackend` and the resolved subject scopes all queries. Login flow
//! mechanics (redirects, code exchange) live with the identity vendor.

use axum::extract::FromRequestParts;
use axum::http::StatusCode;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::response::{IntoResponse, Response};
use axum::Json;

use super::AppState;

/// Authenticated request owner.
#[derive(Debug, Clone)]
pub struct Owner {
    pub id: String,
    pub email: String,
    pub origin_addr: Option<String>,
}

impl Owner {
    /// Caller identity handed to the orchestrator.
    #[must_use]
    pub fn caller(&self) -> crate::application::services::Caller {
        crate::application::services::Caller {
            owner_id: self.id.clone(),
            origin_addr: self.origin_addr.clone(),
        }
    }
}

fn unauthorized(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({
            "error": { "kind": "unauthorized", "message": message }
        })),
    )
        .into_response()
}

impl FromRequestParts<AppState> for Owner {
    type Rejection = Response;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let bearer = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or_else(|| unauthorized("missing bearer token"))?;

        let identity = state
            .identity
            .verify_token(bearer)
            .await
            .map_err(|_| unauthorized("invalid bearer token"))?;

        let origin_addr = parts
            .headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(|v| v.trim().to_owned());

        Ok(Self {
            id: identity.subject,
            email: identity.email,
            origin_addr,
        })
    }
}
