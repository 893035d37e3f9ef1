// VaultStream API — Bot Accounts & Chats
//
// Bot CRUD, primary activation, chat registry reads, the sync job trigger
// and the QR login payload. Bot tokens are masked in every response.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::atoms::error::EngineError;
use crate::atoms::types::{BotChat, BotConfig, BotPlatform};
use crate::engine::settings::mask_secret;
use crate::engine::state::EngineState;

use super::ApiResult;

fn masked(bot: &BotConfig) -> Value {
    let mut body = serde_json::to_value(bot).unwrap_or_default();
    if let Some(token) = bot.bot_token.as_deref() {
        body["bot_token"] = json!(mask_secret(token));
    }
    body
}

#[derive(Debug, Deserialize)]
pub struct BotBody {
    pub platform: String,
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub is_primary: bool,
    pub bot_token: Option<String>,
    pub napcat_http_url: Option<String>,
    pub napcat_ws_url: Option<String>,
}

fn default_true() -> bool {
    true
}

impl BotBody {
    fn into_config(self, id: i64) -> Result<BotConfig, EngineError> {
        let platform = BotPlatform::parse(&self.platform)
            .ok_or_else(|| EngineError::Validation(format!("invalid platform '{}'", self.platform)))?;
        match platform {
            BotPlatform::Telegram if self.bot_token.as_deref().unwrap_or("").is_empty() => {
                return Err(EngineError::Validation("telegram bots need a bot_token".into()));
            }
            BotPlatform::Qq if self.napcat_http_url.as_deref().unwrap_or("").is_empty() => {
                return Err(EngineError::Validation("qq bots need a napcat_http_url".into()));
            }
            _ => {}
        }
        Ok(BotConfig {
            id,
            platform,
            name: self.name,
            enabled: self.enabled,
            is_primary: self.is_primary,
            bot_token: self.bot_token,
            napcat_http_url: self.napcat_http_url,
            napcat_ws_url: self.napcat_ws_url,
            bot_id: None,
            bot_username: None,
            created_at: String::new(),
            updated_at: String::new(),
        })
    }
}

pub async fn list_bots(State(state): State<Arc<EngineState>>) -> ApiResult<Json<Value>> {
    let bots = state.store.list_bots()?;
    Ok(Json(json!({ "items": bots.iter().map(masked).collect::<Vec<_>>() })))
}

pub async fn create_bot(
    State(state): State<Arc<EngineState>>,
    Json(body): Json<BotBody>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let config = body.into_config(0)?;
    let created = state.bot_ops.create(&config)?;
    Ok((StatusCode::CREATED, Json(masked(&created))))
}

pub async fn update_bot(
    State(state): State<Arc<EngineState>>,
    Path(id): Path<i64>,
    Json(body): Json<BotBody>,
) -> ApiResult<Json<Value>> {
    // Keep the discovered identity across credential edits.
    let existing = state.store.get_bot(id)?;
    let mut config = body.into_config(id)?;
    config.bot_id = existing.bot_id;
    config.bot_username = existing.bot_username;
    let updated = state.bot_ops.update(&config)?;
    Ok(Json(masked(&updated)))
}

pub async fn delete_bot(
    State(state): State<Arc<EngineState>>,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    state.bot_ops.delete(id)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn activate_bot(
    State(state): State<Arc<EngineState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    let activated = state.bot_ops.activate(id)?;
    Ok(Json(masked(&activated)))
}

pub async fn sync_chats(
    State(state): State<Arc<EngineState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    let report = state.bot_ops.sync_chats(id).await?;
    Ok(Json(serde_json::to_value(report).map_err(EngineError::from)?))
}

pub async fn list_chats(
    State(state): State<Arc<EngineState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    let chats: Vec<BotChat> = state.store.list_chats(id)?;
    Ok(Json(json!({ "items": chats })))
}

pub async fn get_qr(
    State(state): State<Arc<EngineState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    let payload = state.bot_ops.get_qr(id).await?;
    Ok(Json(json!({ "bot_id": id, "qr": payload })))
}
