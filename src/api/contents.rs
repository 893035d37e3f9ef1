// VaultStream API — Shares & Contents
//
// Submission, listing with filters/projection, PATCH, deletion, re-parse
// and review. Batch endpoints enforce their documented caps strictly.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::atoms::constants::{BATCH_DELETE_LIMIT, BATCH_REPARSE_LIMIT, BATCH_UPDATE_LIMIT};
use crate::atoms::error::EngineError;
use crate::atoms::types::{Content, EventKind};
use crate::engine::state::{EngineState, ShareRequest};
use crate::engine::store::{ContentListFilter, ContentPatch};

use super::{ApiResult, PageEnvelope};

// ── Submission ─────────────────────────────────────────────────────────────

pub async fn submit_share(
    State(state): State<Arc<EngineState>>,
    Json(request): Json<ShareRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    if request.url.trim().is_empty() {
        return Err(EngineError::Validation("url is required".into()).into());
    }
    let (content, created) = state.submit_share(&request).await?;
    let status = if created { StatusCode::CREATED } else { StatusCode::OK };
    Ok((
        status,
        Json(json!({
            "id": content.id,
            "platform": content.platform,
            "status": content.status,
        })),
    ))
}

// ── Listing & single reads ─────────────────────────────────────────────────

pub async fn list_contents(
    State(state): State<Arc<EngineState>>,
    Query(filter): Query<ContentListFilter>,
) -> ApiResult<Json<PageEnvelope<Content>>> {
    let page = filter.page.unwrap_or(1).max(1);
    let size = filter.size.unwrap_or(20).clamp(1, 100);
    let (items, total) = state.store.list_contents(&filter)?;
    Ok(Json(PageEnvelope::new(items, total, page, size)))
}

pub async fn get_content(
    State(state): State<Arc<EngineState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    let content = state.store.get_content(id)?;
    let sources = state.store.list_sources(id)?;
    let mut body = serde_json::to_value(&content).map_err(EngineError::from)?;
    body["sources"] = serde_json::to_value(&sources).map_err(EngineError::from)?;
    Ok(Json(body))
}

pub async fn patch_content(
    State(state): State<Arc<EngineState>>,
    Path(id): Path<i64>,
    Json(patch): Json<ContentPatch>,
) -> ApiResult<Json<Content>> {
    let updated = state.store.patch_content(id, &patch)?;
    state
        .bus
        .publish(EventKind::ContentUpdated, json!({ "content_id": id, "op": "patch" }));
    Ok(Json(updated))
}

pub async fn delete_content(
    State(state): State<Arc<EngineState>>,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    state.store.delete_content(id)?;
    state.bus.publish(EventKind::ContentDeleted, json!({ "content_id": id }));
    Ok(StatusCode::NO_CONTENT)
}

pub async fn reparse_content(
    State(state): State<Arc<EngineState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    state.request_reparse(id)?;
    Ok(Json(json!({ "queued": true, "content_id": id })))
}

// ── Review ─────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct ReviewRequest {
    pub action: String,
    pub note: Option<String>,
    pub by: Option<String>,
}

pub async fn review_content(
    State(state): State<Arc<EngineState>>,
    Path(id): Path<i64>,
    Json(request): Json<ReviewRequest>,
) -> ApiResult<Json<Content>> {
    let approve = match request.action.as_str() {
        "approve" => true,
        "reject" => false,
        other => {
            return Err(EngineError::Validation(format!(
                "action must be approve or reject, got '{other}'"
            ))
            .into())
        }
    };
    let content = state.review_content(id, approve, request.by.as_deref(), request.note.as_deref())?;
    Ok(Json(content))
}

// ── Batch endpoints ────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct BatchUpdateRequest {
    pub ids: Vec<i64>,
    pub patch: ContentPatch,
}

pub async fn batch_update(
    State(state): State<Arc<EngineState>>,
    Json(request): Json<BatchUpdateRequest>,
) -> ApiResult<Json<Value>> {
    enforce_batch_limit(request.ids.len(), BATCH_UPDATE_LIMIT, "batch-update")?;
    let mut updated = 0;
    let mut missing = Vec::new();
    for id in &request.ids {
        match state.store.patch_content(*id, &request.patch) {
            Ok(_) => updated += 1,
            Err(_) => missing.push(*id),
        }
    }
    if updated > 0 {
        state
            .bus
            .publish(EventKind::ContentUpdated, json!({ "op": "batch_update", "updated": updated }));
    }
    Ok(Json(json!({ "updated": updated, "missing": missing })))
}

#[derive(Deserialize)]
pub struct BatchIdsRequest {
    pub ids: Vec<i64>,
}

pub async fn batch_delete(
    State(state): State<Arc<EngineState>>,
    Json(request): Json<BatchIdsRequest>,
) -> ApiResult<Json<Value>> {
    enforce_batch_limit(request.ids.len(), BATCH_DELETE_LIMIT, "batch-delete")?;
    let mut deleted = 0;
    let mut missing = Vec::new();
    for id in &request.ids {
        match state.store.delete_content(*id) {
            Ok(()) => {
                deleted += 1;
                state.bus.publish(EventKind::ContentDeleted, json!({ "content_id": id }));
            }
            Err(_) => missing.push(*id),
        }
    }
    Ok(Json(json!({ "deleted": deleted, "missing": missing })))
}

pub async fn batch_reparse(
    State(state): State<Arc<EngineState>>,
    Json(request): Json<BatchIdsRequest>,
) -> ApiResult<Json<Value>> {
    enforce_batch_limit(request.ids.len(), BATCH_REPARSE_LIMIT, "batch-re-parse")?;
    let mut queued = 0;
    let mut missing = Vec::new();
    for id in &request.ids {
        match state.request_reparse(*id) {
            Ok(()) => queued += 1,
            Err(_) => missing.push(*id),
        }
    }
    Ok(Json(json!({ "queued": queued, "missing": missing })))
}

fn enforce_batch_limit(len: usize, limit: usize, what: &str) -> Result<(), EngineError> {
    if len == 0 {
        return Err(EngineError::Validation(format!("{what} needs at least one id")));
    }
    if len > limit {
        return Err(EngineError::Validation(format!("{what} accepts at most {limit} ids, got {len}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_limits_are_strict() {
        assert!(enforce_batch_limit(100, BATCH_UPDATE_LIMIT, "batch-update").is_ok());
        assert!(enforce_batch_limit(101, BATCH_UPDATE_LIMIT, "batch-update").is_err());
        assert!(enforce_batch_limit(20, BATCH_REPARSE_LIMIT, "batch-re-parse").is_ok());
        assert!(enforce_batch_limit(21, BATCH_REPARSE_LIMIT, "batch-re-parse").is_err());
        assert!(enforce_batch_limit(0, BATCH_DELETE_LIMIT, "batch-delete").is_err());
    }
}
