// VaultStream API — HTTP surface over the engine.
//
// axum 0.7 routers, bearer-token auth (`X-API-Token` or `Authorization:
// Bearer`; SSE clients may pass `?token=`), JSON error bodies mapping the
// engine's error taxonomy onto status codes:
//   Validation → 400, Auth → 401, NotFound → 404, Conflict → 409,
//   Transient → 503, Fatal → 500.

mod bots;
mod contents;
mod events;
mod queue;
mod rules;
mod settings;

use std::sync::Arc;

use axum::extract::{Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::CorsLayer;

use crate::atoms::error::{EngineError, ErrorKind};
use crate::engine::settings::keys;
use crate::engine::state::EngineState;

// ── Error mapping ──────────────────────────────────────────────────────────

pub struct ApiError(pub EngineError);

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let status = match kind {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::Auth => StatusCode::UNAUTHORIZED,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::Transient => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Fatal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = json!({ "error": self.0.to_string(), "kind": kind.as_str() });
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

// ── Pagination envelope ────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct PageEnvelope<T> {
    pub items: Vec<T>,
    pub total: u32,
    pub page: u32,
    pub size: u32,
    pub has_more: bool,
}

impl<T> PageEnvelope<T> {
    pub fn new(items: Vec<T>, total: u32, page: u32, size: u32) -> Self {
        let has_more = (page * size) < total;
        PageEnvelope { items, total, page, size, has_more }
    }
}

// ── Auth ───────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

async fn require_token(
    State(state): State<Arc<EngineState>>,
    Query(query): Query<TokenQuery>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = state.settings.get(keys::API_TOKEN) else {
        // No token configured: open instance (local deployments).
        return next.run(request).await;
    };

    let headers = request.headers();
    let presented = headers
        .get("x-api-token")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| {
            headers
                .get(axum::http::header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
                .map(str::to_string)
        })
        .or(query.token);

    match presented {
        Some(token) if token == expected => next.run(request).await,
        _ => ApiError(EngineError::Auth("missing or invalid API token".into())).into_response(),
    }
}

// ── Router ─────────────────────────────────────────────────────────────────

pub fn router(state: Arc<EngineState>) -> Router {
    let api = Router::new()
        .route("/health", get(health))
        // Shares & contents
        .route("/shares", post(contents::submit_share))
        .route("/contents", get(contents::list_contents))
        .route("/contents/batch-update", post(contents::batch_update))
        .route("/contents/batch-delete", post(contents::batch_delete))
        .route("/contents/batch-re-parse", post(contents::batch_reparse))
        .route(
            "/contents/:id",
            get(contents::get_content)
                .patch(contents::patch_content)
                .delete(contents::delete_content),
        )
        .route("/contents/:id/re-parse", post(contents::reparse_content))
        .route("/contents/:id/review", post(contents::review_content))
        // Distribution queue
        .route("/distribution-queue/stats", get(queue::stats))
        .route("/distribution-queue/items", get(queue::list_items))
        .route("/distribution-queue/items/:id/push-now", post(queue::push_now_item))
        .route("/distribution-queue/items/:id/retry", post(queue::retry_item))
        .route("/distribution-queue/items/:id/cancel", post(queue::cancel_item))
        .route("/distribution-queue/batch-retry", post(queue::batch_retry))
        .route("/distribution-queue/content/:id/status", get(queue::content_status))
        .route("/distribution-queue/content/:id/reorder", post(queue::reorder_content))
        .route("/distribution-queue/content/:id/push-now", post(queue::push_now_content))
        .route("/distribution-queue/content/:id/schedule", post(queue::schedule_content))
        .route("/distribution-queue/content/batch-push-now", post(queue::batch_push_now))
        .route("/distribution-queue/content/batch-reschedule", post(queue::batch_reschedule))
        .route("/distribution-queue/content/merge-group", post(queue::merge_group))
        // Rules
        .route("/distribution-rules", get(rules::list_rules).post(rules::create_rule))
        .route(
            "/distribution-rules/:id",
            get(rules::get_rule).patch(rules::update_rule).delete(rules::delete_rule),
        )
        // Bots
        .route("/bots", get(bots::list_bots).post(bots::create_bot))
        .route("/bots/:id", patch(bots::update_bot).delete(bots::delete_bot))
        .route("/bots/:id/activate", post(bots::activate_bot))
        .route("/bots/:id/sync-chats", post(bots::sync_chats))
        .route("/bots/:id/chats", get(bots::list_chats))
        .route("/bots/:id/qr", get(bots::get_qr))
        // Settings
        .route("/settings", get(settings::list_settings).post(settings::put_setting))
        // Events (SSE)
        .route("/events/subscribe", get(events::subscribe));

    Router::new()
        .nest("/api/v1", api)
        .layer(middleware::from_fn_with_state(Arc::clone(&state), require_token))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}
