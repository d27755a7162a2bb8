use axum::{
    async_trait,
    extract::{FromRequestParts, Path, Query, State},
    http::{request::Parts, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::access::AccessDenied;
use crate::alerts::RuleStatusView;
use crate::engine::{AlertEngine, EngineStats};
use crate::model::{Alert, AlertStatus, Identity, InvalidRole};
use crate::rules::RuleStoreError;

/// Application state shared across handlers
pub struct AppState {
    pub engine: Arc<AlertEngine>,
}

// ============================================================================
// Caller identity
// ============================================================================

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_ROLE_HEADER: &str = "x-user-role";

/// Identity resolved by the upstream authentication layer and passed as headers
pub struct Caller(pub Identity);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        };

        let id = header(USER_ID_HEADER)
            .ok_or_else(|| ApiError::Unauthorized(format!("missing {} header", USER_ID_HEADER)))?;
        let role = header(USER_ROLE_HEADER)
            .ok_or_else(|| ApiError::Unauthorized(format!("missing {} header", USER_ROLE_HEADER)))?;

        Ok(Caller(Identity::parse(id, role)?))
    }
}

// ============================================================================
// Health Check
// ============================================================================

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

// ============================================================================
// Stats
// ============================================================================

pub async fn stats(State(state): State<Arc<AppState>>) -> Json<EngineStats> {
    Json(state.engine.stats())
}

// ============================================================================
// Alerts
// ============================================================================

#[derive(Deserialize)]
pub struct AlertsQuery {
    #[serde(default)]
    pub owner: Option<String>,
    /// `open` or `cleared`
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Serialize)]
pub struct AlertsResponse {
    pub alerts: Vec<Alert>,
    pub count: usize,
}

fn parse_status(raw: &str) -> Result<AlertStatus, ApiError> {
    match raw.to_ascii_lowercase().as_str() {
        "open" => Ok(AlertStatus::Open),
        "cleared" => Ok(AlertStatus::Cleared),
        other => Err(ApiError::BadRequest(format!("Unknown alert status: {}", other))),
    }
}

pub async fn list_alerts(
    State(state): State<Arc<AppState>>,
    Caller(identity): Caller,
    Query(query): Query<AlertsQuery>,
) -> Result<Json<AlertsResponse>, ApiError> {
    let status = query.status.as_deref().map(parse_status).transpose()?;
    let alerts = state
        .engine
        .list_alerts(&identity, query.owner.as_deref(), status)?;

    Ok(Json(AlertsResponse {
        count: alerts.len(),
        alerts,
    }))
}

pub async fn rule_status(
    State(state): State<Arc<AppState>>,
    Caller(identity): Caller,
    Path(rule_id): Path<String>,
) -> Result<Json<RuleStatusView>, ApiError> {
    Ok(Json(state.engine.rule_status(&identity, &rule_id)?))
}

// ============================================================================
// Error Handling
// ============================================================================

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized(String),
    Forbidden(String),
    NotFound(String),
    Internal(String),
}

impl From<InvalidRole> for ApiError {
    fn from(err: InvalidRole) -> Self {
        ApiError::BadRequest(err.to_string())
    }
}

impl From<AccessDenied> for ApiError {
    fn from(err: AccessDenied) -> Self {
        ApiError::Forbidden(err.to_string())
    }
}

impl From<RuleStoreError> for ApiError {
    fn from(err: RuleStoreError) -> Self {
        match err {
            RuleStoreError::AccessDenied(e) => e.into(),
            RuleStoreError::NotFound(id) => ApiError::NotFound(format!("Rule '{}' not found", id)),
            RuleStoreError::Validation(e) => ApiError::BadRequest(e.to_string()),
            RuleStoreError::Load(msg) => ApiError::Internal(msg),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = serde_json::json!({
            "error": message
        });

        (status, Json(body)).into_response()
    }
}
