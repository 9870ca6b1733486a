//! HTTP surface.
//!
//! ```text
//! GET    /health                    process liveness
//! GET    /webhooks/{provider}       webhook liveness
//! POST   /webhooks/{provider}       webhook intake (200, or 401 on bad signature)
//! GET    /admin/dlq                 list dead letters          ┐
//! POST   /admin/dlq/{id}/retry      force one retry            │ bearer admin_token
//! DELETE /admin/dlq/{id}            drop a dead letter         │
//! POST   /admin/reconcile           manual reconciliation      │
//! GET    /admin/health              sync health report         ┘
//! POST   /cron/reconcile            scheduled reconciliation   ┐ bearer cron_secret
//! POST   /cron/retry                DLQ retry sweep            ┘
//! ```
//!
//! Admin and cron routes fail closed: with no token configured they answer 401.

use axum::{
    body::Bytes,
    extract::{Path, Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
    Router,
};
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{error, warn};

use crate::context::SyncContext;
use crate::dlq::DlqError;
use crate::health::{self, HealthReport};
use crate::ingest::IngestRejection;
use crate::reconcile::ReconcileError;
use crate::retry::{RetryError, RetryOutcome, RetrySummary};
use crate::shipment::{ReconciliationRun, RunTrigger};
use crate::signature::SIGNATURE_HEADER;

type AppState = Arc<SyncContext>;

/// Errors surfaced by admin and cron handlers.
#[derive(Debug)]
enum ApiError {
    NotFound(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            ApiError::Conflict(m) => (StatusCode::CONFLICT, m),
            ApiError::Internal(m) => {
                error!(error = %m, "Request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, m)
            }
        };
        (status, Json(json!({ "success": false, "error": message }))).into_response()
    }
}

impl From<DlqError> for ApiError {
    fn from(err: DlqError) -> Self {
        match err {
            DlqError::NotFound(id) => ApiError::NotFound(format!("dead letter item not found: {id}")),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<RetryError> for ApiError {
    fn from(err: RetryError) -> Self {
        match err {
            RetryError::Dlq(e) => e.into(),
        }
    }
}

impl From<ReconcileError> for ApiError {
    fn from(err: ReconcileError) -> Self {
        match err {
            ReconcileError::AlreadyRunning => {
                ApiError::Conflict("a reconciliation run is already in progress".to_string())
            }
            other => ApiError::Internal(other.to_string()),
        }
    }
}

/// Build the application router.
pub fn build_app(ctx: Arc<SyncContext>) -> Router {
    let admin = Router::new()
        .route("/admin/dlq", get(list_dead_letters))
        .route("/admin/dlq/{id}/retry", post(retry_dead_letter))
        .route("/admin/dlq/{id}", delete(delete_dead_letter))
        .route("/admin/reconcile", post(manual_reconcile))
        .route("/admin/health", get(sync_health))
        .route_layer(middleware::from_fn_with_state(ctx.clone(), admin_auth));

    let cron = Router::new()
        .route("/cron/reconcile", post(scheduled_reconcile))
        .route("/cron/retry", post(retry_sweep))
        .route_layer(middleware::from_fn_with_state(ctx.clone(), cron_auth));

    Router::new()
        .route("/health", get(liveness))
        .route("/webhooks/{provider}", get(liveness).post(receive_webhook))
        .merge(admin)
        .merge(cron)
        .with_state(ctx)
}

async fn admin_auth(State(ctx): State<AppState>, req: Request, next: Next) -> Response {
    authorize(ctx.config.server.admin_token.as_deref(), req, next).await
}

async fn cron_auth(State(ctx): State<AppState>, req: Request, next: Next) -> Response {
    authorize(ctx.config.server.cron_secret.as_deref(), req, next).await
}

async fn authorize(expected: Option<&str>, req: Request, next: Next) -> Response {
    let Some(expected) = expected.filter(|t| !t.is_empty()) else {
        warn!(path = %req.uri().path(), "No token configured, rejecting");
        return StatusCode::UNAUTHORIZED.into_response();
    };

    if bearer_matches(req.headers(), expected) {
        next.run(req).await
    } else {
        warn!(path = %req.uri().path(), "Missing or invalid bearer token");
        StatusCode::UNAUTHORIZED.into_response()
    }
}

fn bearer_matches(headers: &HeaderMap, expected: &str) -> bool {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .is_some_and(|token| {
            token.len() == expected.len()
                && bool::from(token.as_bytes().ct_eq(expected.as_bytes()))
        })
}

async fn liveness() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn receive_webhook(
    State(ctx): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());

    match ctx.receiver.receive(&provider, &body, signature).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(IngestRejection::InvalidSignature) => (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "success": false, "error": "invalid signature" })),
        )
            .into_response(),
    }
}

async fn list_dead_letters(State(ctx): State<AppState>) -> Result<Json<Value>, ApiError> {
    let items = ctx.dlq.list().await?;
    Ok(Json(json!({ "count": items.len(), "items": items })))
}

async fn retry_dead_letter(
    State(ctx): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    match ctx.retry.retry_one(&id, Utc::now()).await? {
        RetryOutcome::Resolved => Ok(Json(json!({ "success": true, "resolved": true }))),
        RetryOutcome::Failed(item) => Ok(Json(json!({
            "success": false,
            "resolved": false,
            "item": item,
        }))),
    }
}

async fn delete_dead_letter(
    State(ctx): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    ctx.dlq.delete(&id).await?;
    Ok(Json(json!({ "success": true, "deleted": id })))
}

async fn manual_reconcile(
    State(ctx): State<AppState>,
) -> Result<Json<ReconciliationRun>, ApiError> {
    Ok(Json(ctx.reconciler.run(RunTrigger::Manual).await?))
}

async fn scheduled_reconcile(
    State(ctx): State<AppState>,
) -> Result<Json<ReconciliationRun>, ApiError> {
    Ok(Json(ctx.reconciler.run(RunTrigger::Scheduled).await?))
}

async fn retry_sweep(State(ctx): State<AppState>) -> Result<Json<RetrySummary>, ApiError> {
    Ok(Json(ctx.retry.run_due(Utc::now()).await?))
}

async fn sync_health(State(ctx): State<AppState>) -> Result<Json<HealthReport>, ApiError> {
    let report = health::collect(ctx.store.as_ref(), &ctx.dlq, Utc::now())
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_bearer_matches() {
        let mut headers = HeaderMap::new();
        assert!(!bearer_matches(&headers, "token"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer token"));
        assert!(bearer_matches(&headers, "token"));
        assert!(!bearer_matches(&headers, "other"));
        assert!(!bearer_matches(&headers, "token-longer"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic token"));
        assert!(!bearer_matches(&headers, "token"));
    }
}
