// VaultStream API — Distribution Queue
//
// Queue listing and stats plus the user operations: push-now, retry,
// cancel, reorder, schedule, merge-group, and their batch forms.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::atoms::error::EngineError;
use crate::atoms::types::ContentQueueItem;
use crate::engine::state::EngineState;
use crate::engine::store::{QueueListFilter, QueueStats};

use super::{ApiResult, PageEnvelope};

#[derive(Deserialize)]
pub struct StatsQuery {
    pub rule_id: Option<i64>,
}

pub async fn stats(
    State(state): State<Arc<EngineState>>,
    Query(query): Query<StatsQuery>,
) -> ApiResult<Json<QueueStats>> {
    Ok(Json(state.queue_ops.stats(query.rule_id)?))
}

pub async fn list_items(
    State(state): State<Arc<EngineState>>,
    Query(filter): Query<QueueListFilter>,
) -> ApiResult<Json<PageEnvelope<ContentQueueItem>>> {
    let page = filter.page.unwrap_or(1).max(1);
    let size = filter.size.unwrap_or(50).clamp(1, 200);
    let (items, total) = state.queue_ops.list(&filter)?;
    Ok(Json(PageEnvelope::new(items, total, page, size)))
}

// ── Item operations ────────────────────────────────────────────────────────

pub async fn push_now_item(
    State(state): State<Arc<EngineState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    state.queue_ops.push_now_item(id)?;
    Ok(Json(json!({ "item_id": id, "op": "push_now" })))
}

pub async fn retry_item(
    State(state): State<Arc<EngineState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    state.queue_ops.retry_item(id)?;
    Ok(Json(json!({ "item_id": id, "op": "retry" })))
}

pub async fn cancel_item(
    State(state): State<Arc<EngineState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    state.queue_ops.cancel_item(id)?;
    Ok(Json(json!({ "item_id": id, "op": "cancel" })))
}

#[derive(Deserialize)]
pub struct BatchRetryRequest {
    pub ids: Vec<i64>,
}

pub async fn batch_retry(
    State(state): State<Arc<EngineState>>,
    Json(request): Json<BatchRetryRequest>,
) -> ApiResult<Json<Value>> {
    if request.ids.is_empty() {
        return Err(EngineError::Validation("batch-retry needs at least one id".into()).into());
    }
    let (retried, rejected) = state.queue_ops.batch_retry(&request.ids)?;
    Ok(Json(json!({ "retried": retried, "rejected": rejected })))
}

// ── Content-level operations ───────────────────────────────────────────────

pub async fn content_status(
    State(state): State<Arc<EngineState>>,
    Path(content_id): Path<i64>,
) -> ApiResult<Json<Value>> {
    let items = state.store.items_for_content(content_id)?;
    let records = state.store.list_pushed_for_content(content_id)?;
    Ok(Json(json!({ "content_id": content_id, "items": items, "pushed": records })))
}

#[derive(Deserialize)]
pub struct ReorderRequest {
    pub index: usize,
    pub rule_id: Option<i64>,
}

pub async fn reorder_content(
    State(state): State<Arc<EngineState>>,
    Path(content_id): Path<i64>,
    Json(request): Json<ReorderRequest>,
) -> ApiResult<Json<Value>> {
    state.queue_ops.reorder_content(content_id, request.index, request.rule_id)?;
    let order = state.store.queue_view_order(request.rule_id)?;
    Ok(Json(json!({ "content_id": content_id, "index": request.index, "order": order })))
}

pub async fn push_now_content(
    State(state): State<Arc<EngineState>>,
    Path(content_id): Path<i64>,
) -> ApiResult<Json<Value>> {
    let items = state.queue_ops.push_now_content(content_id)?;
    Ok(Json(json!({ "content_id": content_id, "items": items })))
}

#[derive(Deserialize)]
pub struct ScheduleRequest {
    pub at: String,
}

pub async fn schedule_content(
    State(state): State<Arc<EngineState>>,
    Path(content_id): Path<i64>,
    Json(request): Json<ScheduleRequest>,
) -> ApiResult<Json<Value>> {
    let items = state.queue_ops.schedule_content(content_id, &request.at)?;
    Ok(Json(json!({ "content_id": content_id, "items": items, "at": request.at })))
}

#[derive(Deserialize)]
pub struct BatchContentIdsRequest {
    pub content_ids: Vec<i64>,
}

pub async fn batch_push_now(
    State(state): State<Arc<EngineState>>,
    Json(request): Json<BatchContentIdsRequest>,
) -> ApiResult<Json<Value>> {
    if request.content_ids.is_empty() {
        return Err(EngineError::Validation("batch-push-now needs at least one content id".into()).into());
    }
    let mut items = 0;
    for content_id in &request.content_ids {
        items += state.queue_ops.push_now_content(*content_id)?;
    }
    Ok(Json(json!({ "contents": request.content_ids.len(), "items": items })))
}

#[derive(Deserialize)]
pub struct BatchRescheduleRequest {
    pub content_ids: Vec<i64>,
    pub at: String,
}

pub async fn batch_reschedule(
    State(state): State<Arc<EngineState>>,
    Json(request): Json<BatchRescheduleRequest>,
) -> ApiResult<Json<Value>> {
    if request.content_ids.is_empty() {
        return Err(EngineError::Validation("batch-reschedule needs at least one content id".into()).into());
    }
    let mut items = 0;
    for content_id in &request.content_ids {
        items += state.queue_ops.schedule_content(*content_id, &request.at)?;
    }
    Ok(Json(json!({ "contents": request.content_ids.len(), "items": items, "at": request.at })))
}

#[derive(Deserialize)]
pub struct MergeGroupRequest {
    pub content_ids: Vec<i64>,
    pub at: Option<String>,
}

pub async fn merge_group(
    State(state): State<Arc<EngineState>>,
    Json(request): Json<MergeGroupRequest>,
) -> ApiResult<Json<Value>> {
    let aligned = state.queue_ops.merge_group(&request.content_ids, request.at.as_deref())?;
    Ok(Json(json!({ "content_ids": request.content_ids, "at": aligned })))
}
