// VaultStream API — Distribution Rules
//
// CRUD over rules with targets nested in create/update bodies. Render
// configs are canonicalized on ingress: the legacy nested
// `{structure: {...}}` shape is accepted and flattened.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::atoms::error::EngineError;
use crate::atoms::types::{AutoApproveConditions, MatchConditions, NsfwPolicy, RenderConfig};
use crate::engine::state::EngineState;
use crate::engine::store::{RuleDraft, TargetDraft};

use super::ApiResult;

// ── Request shapes ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct RuleBody {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub match_conditions: MatchConditions,
    #[serde(default = "default_nsfw_policy")]
    pub nsfw_policy: String,
    #[serde(default)]
    pub approval_required: bool,
    pub auto_approve_conditions: Option<AutoApproveConditions>,
    pub rate_limit: Option<u32>,
    pub time_window: Option<u32>,
    /// Accepted in either the flat or legacy nested shape.
    pub render_config: Option<Value>,
    #[serde(default)]
    pub targets: Option<Vec<TargetBody>>,
}

#[derive(Debug, Deserialize)]
pub struct TargetBody {
    pub bot_chat_id: i64,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub merge_forward: bool,
    #[serde(default)]
    pub use_author_name: bool,
    pub summary: Option<String>,
    pub render_config_override: Option<Value>,
}

fn default_true() -> bool {
    true
}

fn default_nsfw_policy() -> String {
    "block".into()
}

impl RuleBody {
    fn into_draft(self) -> Result<(RuleDraft, Option<Vec<TargetDraft>>), EngineError> {
        if self.name.trim().is_empty() {
            return Err(EngineError::Validation("rule name is required".into()));
        }
        let nsfw_policy = NsfwPolicy::parse(&self.nsfw_policy)
            .ok_or_else(|| EngineError::Validation(format!("invalid nsfw_policy '{}'", self.nsfw_policy)))?;
        if self.rate_limit.is_some() != self.time_window.is_some() {
            return Err(EngineError::Validation(
                "rate_limit and time_window must be set together".into(),
            ));
        }

        let draft = RuleDraft {
            name: self.name,
            description: self.description,
            enabled: self.enabled,
            priority: self.priority,
            match_conditions: self.match_conditions,
            nsfw_policy,
            approval_required: self.approval_required,
            auto_approve_conditions: self.auto_approve_conditions,
            rate_limit: self.rate_limit,
            time_window_secs: self.time_window,
            render_config: self
                .render_config
                .as_ref()
                .map(RenderConfig::normalize)
                .unwrap_or_default(),
        };
        let targets = self.targets.map(|targets| {
            targets
                .into_iter()
                .map(|t| TargetDraft {
                    bot_chat_id: t.bot_chat_id,
                    enabled: t.enabled,
                    merge_forward: t.merge_forward,
                    use_author_name: t.use_author_name,
                    summary: t.summary,
                    render_config_override: t.render_config_override.as_ref().map(RenderConfig::normalize),
                })
                .collect()
        });
        Ok((draft, targets))
    }
}

// ── Handlers ───────────────────────────────────────────────────────────────

pub async fn list_rules(State(state): State<Arc<EngineState>>) -> ApiResult<Json<Value>> {
    let rules = state.store.list_rules(false)?;
    let mut bodies = Vec::with_capacity(rules.len());
    for rule in rules {
        let targets = state.store.list_targets(rule.id)?;
        let mut body = serde_json::to_value(&rule).map_err(EngineError::from)?;
        body["targets"] = serde_json::to_value(&targets).map_err(EngineError::from)?;
        bodies.push(body);
    }
    Ok(Json(json!({ "items": bodies })))
}

pub async fn get_rule(
    State(state): State<Arc<EngineState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    let rule = state.store.get_rule(id)?;
    let targets = state.store.list_targets(id)?;
    let mut body = serde_json::to_value(&rule).map_err(EngineError::from)?;
    body["targets"] = serde_json::to_value(&targets).map_err(EngineError::from)?;
    Ok(Json(body))
}

pub async fn create_rule(
    State(state): State<Arc<EngineState>>,
    Json(body): Json<RuleBody>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let (draft, targets) = body.into_draft()?;
    let id = state.store.create_rule(&draft, &targets.unwrap_or_default())?;
    Ok((StatusCode::CREATED, Json(json!({ "id": id }))))
}

pub async fn update_rule(
    State(state): State<Arc<EngineState>>,
    Path(id): Path<i64>,
    Json(body): Json<RuleBody>,
) -> ApiResult<Json<Value>> {
    let (draft, targets) = body.into_draft()?;
    state.store.update_rule(id, &draft, targets.as_deref())?;
    Ok(Json(json!({ "id": id })))
}

pub async fn delete_rule(
    State(state): State<Arc<EngineState>>,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    state.store.delete_rule(id)?;
    Ok(StatusCode::NO_CONTENT)
}
