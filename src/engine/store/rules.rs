use rusqlite::{params, OptionalExtension};
use serde_json::Value;

use super::Store;
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{
    AutoApproveConditions, DistributionRule, DistributionTarget, MatchConditions, NsfwPolicy, RenderConfig,
};
use crate::engine::clock::now_iso;

const RULE_COLS: &str = "id, name, description, enabled, priority, match_conditions, nsfw_policy, \
     approval_required, auto_approve_conditions, rate_limit, time_window_secs, render_config, \
     created_at, updated_at";

const TARGET_COLS: &str =
    "id, rule_id, bot_chat_id, enabled, merge_forward, use_author_name, summary, render_config_override";

impl DistributionRule {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        let conditions: String = row.get(5)?;
        let auto: Option<String> = row.get(8)?;
        let render: String = row.get(11)?;
        Ok(DistributionRule {
            id: row.get(0)?,
            name: row.get(1)?,
            description: row.get(2)?,
            enabled: row.get::<_, i64>(3)? != 0,
            priority: row.get(4)?,
            match_conditions: serde_json::from_str(&conditions).unwrap_or_default(),
            nsfw_policy: NsfwPolicy::parse(&row.get::<_, String>(6)?).unwrap_or(NsfwPolicy::Block),
            approval_required: row.get::<_, i64>(7)? != 0,
            auto_approve_conditions: auto.and_then(|s| serde_json::from_str(&s).ok()),
            rate_limit: row.get::<_, Option<i64>>(9)?.map(|v| v as u32),
            time_window_secs: row.get::<_, Option<i64>>(10)?.map(|v| v as u32),
            render_config: serde_json::from_str::<Value>(&render)
                .map(|v| RenderConfig::normalize(&v))
                .unwrap_or_default(),
            created_at: row.get(12)?,
            updated_at: row.get(13)?,
        })
    }
}

impl DistributionTarget {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        let render: Option<String> = row.get(7)?;
        Ok(DistributionTarget {
            id: row.get(0)?,
            rule_id: row.get(1)?,
            bot_chat_id: row.get(2)?,
            enabled: row.get::<_, i64>(3)? != 0,
            merge_forward: row.get::<_, i64>(4)? != 0,
            use_author_name: row.get::<_, i64>(5)? != 0,
            summary: row.get(6)?,
            render_config_override: render
                .and_then(|s| serde_json::from_str::<Value>(&s).ok())
                .map(|v| RenderConfig::normalize(&v)),
        })
    }
}

/// Rule fields as accepted by the create/update endpoints. Targets ride
/// along and replace the rule's target set wholesale.
#[derive(Debug, Clone)]
pub struct RuleDraft {
    pub name: String,
    pub description: String,
    pub enabled: bool,
    pub priority: i64,
    pub match_conditions: MatchConditions,
    pub nsfw_policy: NsfwPolicy,
    pub approval_required: bool,
    pub auto_approve_conditions: Option<AutoApproveConditions>,
    pub rate_limit: Option<u32>,
    pub time_window_secs: Option<u32>,
    pub render_config: RenderConfig,
}

/// Target fields nested under a rule create/update.
#[derive(Debug, Clone)]
pub struct TargetDraft {
    pub bot_chat_id: i64,
    pub enabled: bool,
    pub merge_forward: bool,
    pub use_author_name: bool,
    pub summary: Option<String>,
    pub render_config_override: Option<RenderConfig>,
}

impl Store {
    // ── Rules ──────────────────────────────────────────────────────────

    pub fn create_rule(&self, draft: &RuleDraft, targets: &[TargetDraft]) -> EngineResult<i64> {
        let conn = self.conn.lock();
        let now = now_iso();
        conn.execute(
            "INSERT INTO distribution_rules
                (name, description, enabled, priority, match_conditions, nsfw_policy,
                 approval_required, auto_approve_conditions, rate_limit, time_window_secs,
                 render_config, created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?12)",
            params![
                draft.name,
                draft.description,
                draft.enabled as i64,
                draft.priority,
                serde_json::to_string(&draft.match_conditions)?,
                draft.nsfw_policy.as_str(),
                draft.approval_required as i64,
                draft
                    .auto_approve_conditions
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                draft.rate_limit,
                draft.time_window_secs,
                serde_json::to_string(&draft.render_config)?,
                now,
            ],
        )?;
        let rule_id = conn.last_insert_rowid();
        replace_targets_locked(&conn, rule_id, targets)?;
        Ok(rule_id)
    }

    pub fn update_rule(&self, id: i64, draft: &RuleDraft, targets: Option<&[TargetDraft]>) -> EngineResult<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE distribution_rules SET
                name=?2, description=?3, enabled=?4, priority=?5, match_conditions=?6,
                nsfw_policy=?7, approval_required=?8, auto_approve_conditions=?9,
                rate_limit=?10, time_window_secs=?11, render_config=?12, updated_at=?13
             WHERE id=?1",
            params![
                id,
                draft.name,
                draft.description,
                draft.enabled as i64,
                draft.priority,
                serde_json::to_string(&draft.match_conditions)?,
                draft.nsfw_policy.as_str(),
                draft.approval_required as i64,
                draft
                    .auto_approve_conditions
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                draft.rate_limit,
                draft.time_window_secs,
                serde_json::to_string(&draft.render_config)?,
                now_iso(),
            ],
        )?;
        if changed == 0 {
            return Err(EngineError::NotFound(format!("rule {id}")));
        }
        if let Some(targets) = targets {
            replace_targets_locked(&conn, id, targets)?;
        }
        Ok(())
    }

    /// Deleting a rule cancels the live queue items that reference it (the
    /// queue item is owned by no entity; cascade only kills the targets).
    pub fn delete_rule(&self, id: i64) -> EngineResult<()> {
        let conn = self.conn.lock();
        let now = now_iso();
        conn.execute(
            "UPDATE content_queue SET status='canceled', completed_at=?2, updated_at=?2
             WHERE rule_id=?1 AND status IN ('pending','scheduled','processing')",
            params![id, now],
        )?;
        let deleted = conn.execute("DELETE FROM distribution_rules WHERE id=?1", params![id])?;
        if deleted == 0 {
            return Err(EngineError::NotFound(format!("rule {id}")));
        }
        Ok(())
    }

    pub fn get_rule(&self, id: i64) -> EngineResult<DistributionRule> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {RULE_COLS} FROM distribution_rules WHERE id=?1"),
            params![id],
            DistributionRule::from_row,
        )
        .optional()?
        .ok_or_else(|| EngineError::NotFound(format!("rule {id}")))
    }

    pub fn list_rules(&self, enabled_only: bool) -> EngineResult<Vec<DistributionRule>> {
        let conn = self.conn.lock();
        let sql = if enabled_only {
            format!("SELECT {RULE_COLS} FROM distribution_rules WHERE enabled=1 ORDER BY priority DESC, id ASC")
        } else {
            format!("SELECT {RULE_COLS} FROM distribution_rules ORDER BY priority DESC, id ASC")
        };
        let mut stmt = conn.prepare(&sql)?;
        let rules = stmt
            .query_map([], DistributionRule::from_row)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rules)
    }

    // ── Targets ────────────────────────────────────────────────────────

    pub fn list_targets(&self, rule_id: i64) -> EngineResult<Vec<DistributionTarget>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {TARGET_COLS} FROM distribution_targets WHERE rule_id=?1 ORDER BY id ASC"
        ))?;
        let targets = stmt
            .query_map(params![rule_id], DistributionTarget::from_row)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(targets)
    }

    pub fn get_target(&self, id: i64) -> EngineResult<DistributionTarget> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {TARGET_COLS} FROM distribution_targets WHERE id=?1"),
            params![id],
            DistributionTarget::from_row,
        )
        .optional()?
        .ok_or_else(|| EngineError::NotFound(format!("target {id}")))
    }

    /// The target row for a `(rule, chat)` pair, used when the push worker
    /// resolves a claimed queue item back to its delivery config.
    pub fn get_target_for_pair(&self, rule_id: i64, bot_chat_id: i64) -> EngineResult<DistributionTarget> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {TARGET_COLS} FROM distribution_targets WHERE rule_id=?1 AND bot_chat_id=?2"),
            params![rule_id, bot_chat_id],
            DistributionTarget::from_row,
        )
        .optional()?
        .ok_or_else(|| EngineError::NotFound(format!("target for rule {rule_id} chat {bot_chat_id}")))
    }
}

fn replace_targets_locked(
    conn: &rusqlite::Connection,
    rule_id: i64,
    targets: &[TargetDraft],
) -> EngineResult<()> {
    conn.execute("DELETE FROM distribution_targets WHERE rule_id=?1", params![rule_id])?;
    for t in targets {
        conn.execute(
            "INSERT INTO distribution_targets
                (rule_id, bot_chat_id, enabled, merge_forward, use_author_name, summary, render_config_override)
             VALUES (?1,?2,?3,?4,?5,?6,?7)",
            params![
                rule_id,
                t.bot_chat_id,
                t.enabled as i64,
                t.merge_forward as i64,
                t.use_author_name as i64,
                t.summary,
                t.render_config_override
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
            ],
        )?;
    }
    Ok(())
}
