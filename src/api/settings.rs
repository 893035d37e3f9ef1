// VaultStream API — Settings
//
// Enumeration (secrets masked) and writes into the DB-backed key/value
// store. Environment fallback and compile-time defaults are read-through
// only; the API never echoes a raw secret back.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::atoms::error::EngineError;
use crate::engine::state::EngineState;

use super::ApiResult;

pub async fn list_settings(State(state): State<Arc<EngineState>>) -> ApiResult<Json<Value>> {
    let entries = state.settings.enumerate()?;
    let items: Vec<Value> = entries
        .into_iter()
        .map(|(key, value)| json!({ "key": key, "value": value }))
        .collect();
    Ok(Json(json!({ "items": items })))
}

#[derive(Deserialize)]
pub struct PutSettingRequest {
    pub key: String,
    pub value: String,
}

pub async fn put_setting(
    State(state): State<Arc<EngineState>>,
    Json(request): Json<PutSettingRequest>,
) -> ApiResult<Json<Value>> {
    if request.key.trim().is_empty() {
        return Err(EngineError::Validation("setting key is required".into()).into());
    }
    state.settings.set(&request.key, &request.value)?;
    Ok(Json(json!({ "key": request.key, "saved": true })))
}
