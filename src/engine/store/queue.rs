use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

use super::Store;
use crate::atoms::constants::{DEFAULT_MAX_ATTEMPTS, PRIORITY_GAP, PUSH_NOW_PRIORITY, PUSH_NOW_REWIND_HOURS};
use crate::atoms::error::{EngineError, EngineResult, ErrorKind};
use crate::atoms::types::{ContentQueueItem, QueueStatus};
use crate::engine::clock::{iso_in_secs, now_iso};

const ITEM_COLS: &str = "id, content_id, rule_id, bot_chat_id, status, scheduled_at, priority, \
     next_attempt_at, attempt_count, max_attempts, locked_at, locked_by, message_id, \
     rendered_payload, last_error, last_error_type, last_error_at, started_at, completed_at, \
     needs_approval, approved_at, approved_by, nsfw_routing_result, passed_rate_limit, \
     rate_limit_reason, created_at, updated_at";

/// External ordering contract: soonest first, higher priority breaking ties,
/// insertion order last. Worker claim order matches.
const VIEW_ORDER: &str = "scheduled_at IS NULL, scheduled_at ASC, priority DESC, created_at ASC, id ASC";

impl ContentQueueItem {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(ContentQueueItem {
            id: row.get(0)?,
            content_id: row.get(1)?,
            rule_id: row.get(2)?,
            bot_chat_id: row.get(3)?,
            status: QueueStatus::parse(&row.get::<_, String>(4)?).unwrap_or(QueueStatus::Pending),
            scheduled_at: row.get(5)?,
            priority: row.get(6)?,
            next_attempt_at: row.get(7)?,
            attempt_count: row.get::<_, i64>(8)? as u32,
            max_attempts: row.get::<_, i64>(9)? as u32,
            locked_at: row.get(10)?,
            locked_by: row.get(11)?,
            message_id: row.get(12)?,
            rendered_payload: row.get(13)?,
            last_error: row.get(14)?,
            last_error_type: row.get(15)?,
            last_error_at: row.get(16)?,
            started_at: row.get(17)?,
            completed_at: row.get(18)?,
            needs_approval: row.get::<_, i64>(19)? != 0,
            approved_at: row.get(20)?,
            approved_by: row.get(21)?,
            nsfw_routing_result: row.get(22)?,
            passed_rate_limit: row.get::<_, i64>(23)? != 0,
            rate_limit_reason: row.get(24)?,
            created_at: row.get(25)?,
            updated_at: row.get(26)?,
        })
    }
}

/// Input of the match engine's expansion step.
#[derive(Debug, Clone)]
pub struct QueueUpsert {
    pub content_id: i64,
    pub rule_id: i64,
    pub bot_chat_id: i64,
    pub needs_approval: bool,
    pub scheduled_at: String,
    pub priority: i64,
    pub nsfw_routing_result: Option<String>,
    pub passed_rate_limit: bool,
    pub rate_limit_reason: Option<String>,
    /// Set by the matcher when re-approval reopened a pushed target: a
    /// terminal row on the triple is reset to a fresh attempt instead of
    /// being left untouched.
    pub reopen_terminal: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created(i64),
    Refreshed(i64),
    /// Row exists in a terminal or in-flight state; left untouched.
    Untouched(i64),
}

impl UpsertOutcome {
    pub fn id(&self) -> i64 {
        match self {
            UpsertOutcome::Created(id) | UpsertOutcome::Refreshed(id) | UpsertOutcome::Untouched(id) => *id,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueueListFilter {
    pub rule_id: Option<i64>,
    pub bot_chat_id: Option<i64>,
    pub content_id: Option<i64>,
    pub status: Option<String>,
    /// Inclusive `scheduled_at` window bounds (RFC 3339).
    pub from: Option<String>,
    pub to: Option<String>,
    pub page: Option<u32>,
    pub size: Option<u32>,
}

/// Counts grouped by the logical buckets the dashboard shows.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct QueueStats {
    pub will_push: u32,
    pub filtered: u32,
    pub pending_review: u32,
    pub pushed: u32,
}

impl Store {
    // ── Upsert (match engine) ──────────────────────────────────────────

    /// Idempotent on `(content_id, rule_id, bot_chat_id)`: re-matching only
    /// refreshes scheduling fields on items still in `pending|scheduled`,
    /// never duplicates and never resurrects terminal rows.
    pub fn upsert_queue_item(&self, upsert: &QueueUpsert) -> EngineResult<UpsertOutcome> {
        let conn = self.conn.lock();
        let now = now_iso();
        let status = if upsert.needs_approval { QueueStatus::Pending } else { QueueStatus::Scheduled };

        let existing: Option<(i64, String)> = conn
            .query_row(
                "SELECT id, status FROM content_queue
                 WHERE content_id=?1 AND rule_id=?2 AND bot_chat_id=?3",
                params![upsert.content_id, upsert.rule_id, upsert.bot_chat_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;

        match existing {
            None => {
                conn.execute(
                    "INSERT INTO content_queue
                        (content_id, rule_id, bot_chat_id, status, scheduled_at, priority,
                         max_attempts, needs_approval, nsfw_routing_result, passed_rate_limit,
                         rate_limit_reason, created_at, updated_at)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?12)",
                    params![
                        upsert.content_id,
                        upsert.rule_id,
                        upsert.bot_chat_id,
                        status.as_str(),
                        upsert.scheduled_at,
                        upsert.priority,
                        DEFAULT_MAX_ATTEMPTS,
                        upsert.needs_approval as i64,
                        upsert.nsfw_routing_result,
                        upsert.passed_rate_limit as i64,
                        upsert.rate_limit_reason,
                        now,
                    ],
                )?;
                Ok(UpsertOutcome::Created(conn.last_insert_rowid()))
            }
            Some((id, current)) if current == "pending" || current == "scheduled" => {
                conn.execute(
                    "UPDATE content_queue SET status=?2, scheduled_at=?3, priority=?4,
                            needs_approval=?5, nsfw_routing_result=?6, passed_rate_limit=?7,
                            rate_limit_reason=?8, updated_at=?9
                     WHERE id=?1",
                    params![
                        id,
                        status.as_str(),
                        upsert.scheduled_at,
                        upsert.priority,
                        upsert.needs_approval as i64,
                        upsert.nsfw_routing_result,
                        upsert.passed_rate_limit as i64,
                        upsert.rate_limit_reason,
                        now,
                    ],
                )?;
                Ok(UpsertOutcome::Refreshed(id))
            }
            Some((id, _)) if upsert.reopen_terminal => {
                // Fresh attempt on a reopened target: counters, errors and
                // the previous delivery stamp are cleared.
                conn.execute(
                    "UPDATE content_queue SET status=?2, scheduled_at=?3, priority=?4,
                            needs_approval=?5, nsfw_routing_result=?6, passed_rate_limit=?7,
                            rate_limit_reason=?8, attempt_count=0, next_attempt_at=NULL,
                            locked_at=NULL, locked_by=NULL, message_id=NULL, completed_at=NULL,
                            started_at=NULL, last_error=NULL, last_error_type=NULL,
                            last_error_at=NULL, updated_at=?9
                     WHERE id=?1",
                    params![
                        id,
                        status.as_str(),
                        upsert.scheduled_at,
                        upsert.priority,
                        upsert.needs_approval as i64,
                        upsert.nsfw_routing_result,
                        upsert.passed_rate_limit as i64,
                        upsert.rate_limit_reason,
                        now,
                    ],
                )?;
                Ok(UpsertOutcome::Refreshed(id))
            }
            Some((id, _)) => Ok(UpsertOutcome::Untouched(id)),
        }
    }

    // ── Reads ──────────────────────────────────────────────────────────

    pub fn get_queue_item(&self, id: i64) -> EngineResult<ContentQueueItem> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {ITEM_COLS} FROM content_queue WHERE id=?1"),
            params![id],
            ContentQueueItem::from_row,
        )
        .optional()?
        .ok_or_else(|| EngineError::NotFound(format!("queue item {id}")))
    }

    pub fn list_queue_items(&self, filter: &QueueListFilter) -> EngineResult<(Vec<ContentQueueItem>, u32)> {
        let conn = self.conn.lock();

        let mut clauses: Vec<String> = Vec::new();
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(rule) = filter.rule_id {
            args.push(Box::new(rule));
            clauses.push(format!("rule_id = ?{}", args.len()));
        }
        if let Some(chat) = filter.bot_chat_id {
            args.push(Box::new(chat));
            clauses.push(format!("bot_chat_id = ?{}", args.len()));
        }
        if let Some(content) = filter.content_id {
            args.push(Box::new(content));
            clauses.push(format!("content_id = ?{}", args.len()));
        }
        if let Some(status) = &filter.status {
            args.push(Box::new(status.clone()));
            clauses.push(format!("status = ?{}", args.len()));
        }
        if let Some(from) = &filter.from {
            args.push(Box::new(from.clone()));
            clauses.push(format!("scheduled_at >= ?{}", args.len()));
        }
        if let Some(to) = &filter.to {
            args.push(Box::new(to.clone()));
            clauses.push(format!("scheduled_at <= ?{}", args.len()));
        }
        let where_sql =
            if clauses.is_empty() { String::new() } else { format!("WHERE {}", clauses.join(" AND ")) };
        let arg_refs: Vec<&dyn rusqlite::ToSql> = args.iter().map(|a| a.as_ref()).collect();

        let total: u32 = conn.query_row(
            &format!("SELECT COUNT(*) FROM content_queue {where_sql}"),
            arg_refs.as_slice(),
            |row| row.get::<_, i64>(0),
        )? as u32;

        let size = filter.size.unwrap_or(50).clamp(1, 200);
        let page = filter.page.unwrap_or(1).max(1);
        let offset = (page - 1) * size;

        let mut stmt = conn.prepare(&format!(
            "SELECT {ITEM_COLS} FROM content_queue {where_sql}
             ORDER BY {VIEW_ORDER} LIMIT {size} OFFSET {offset}"
        ))?;
        let items = stmt
            .query_map(arg_refs.as_slice(), ContentQueueItem::from_row)?
            .filter_map(|r| r.ok())
            .collect();
        Ok((items, total))
    }

    pub fn items_for_content(&self, content_id: i64) -> EngineResult<Vec<ContentQueueItem>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {ITEM_COLS} FROM content_queue WHERE content_id=?1 ORDER BY {VIEW_ORDER}"
        ))?;
        let items = stmt
            .query_map(params![content_id], ContentQueueItem::from_row)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(items)
    }

    pub fn queue_stats(&self, rule_id: Option<i64>) -> EngineResult<QueueStats> {
        let conn = self.conn.lock();
        let (sql, args): (String, Vec<i64>) = match rule_id {
            Some(id) => (
                "SELECT status, COUNT(*) FROM content_queue WHERE rule_id=?1 GROUP BY status".into(),
                vec![id],
            ),
            None => ("SELECT status, COUNT(*) FROM content_queue GROUP BY status".into(), vec![]),
        };
        let mut stmt = conn.prepare(&sql)?;
        let arg_refs: Vec<&dyn rusqlite::ToSql> = args.iter().map(|a| a as &dyn rusqlite::ToSql).collect();
        let rows: Vec<(String, i64)> = stmt
            .query_map(arg_refs.as_slice(), |r| Ok((r.get(0)?, r.get(1)?)))?
            .filter_map(|r| r.ok())
            .collect();

        let mut stats = QueueStats::default();
        for (status, count) in rows {
            let count = count as u32;
            match QueueStatus::parse(&status).map(|s| s.bucket()) {
                Some("will_push") => stats.will_push += count,
                Some("pending_review") => stats.pending_review += count,
                Some("pushed") => stats.pushed += count,
                Some(_) => stats.filtered += count,
                None => {}
            }
        }
        Ok(stats)
    }

    /// Live (scheduled|processing) items for a `(content, chat)` pair, for
    /// the single-live-item invariant.
    pub fn count_live_for_pair(&self, content_id: i64, bot_chat_id: i64) -> EngineResult<u32> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM content_queue
             WHERE content_id=?1 AND bot_chat_id=?2 AND status IN ('scheduled','processing')",
            params![content_id, bot_chat_id],
            |r| r.get(0),
        )?;
        Ok(count as u32)
    }

    // ── Claim (push worker) ────────────────────────────────────────────

    /// Atomically claim up to `batch` due items for `worker_id`. The claim
    /// is a conditional update keyed on `(status, scheduled_at, lease)`;
    /// claimed rows are then read back by the unique `(locked_by,
    /// locked_at)` token. Expired leases from crashed workers re-qualify.
    pub fn claim_due_items(
        &self,
        worker_id: &str,
        batch: u32,
        lease_secs: i64,
    ) -> EngineResult<Vec<ContentQueueItem>> {
        let conn = self.conn.lock();
        let now = now_iso();
        let lease_floor = iso_in_secs(-lease_secs);

        conn.execute(
            "UPDATE content_queue
                SET status='processing', locked_at=?1, locked_by=?2, started_at=?1,
                    attempt_count = attempt_count + 1, updated_at=?1
              WHERE id IN (
                SELECT id FROM content_queue
                 WHERE status='scheduled' AND scheduled_at <= ?1
                   AND (locked_at IS NULL OR locked_at < ?3)
                 ORDER BY scheduled_at ASC, priority DESC, id ASC
                 LIMIT ?4
              )",
            params![now, worker_id, lease_floor, batch],
        )?;

        let mut stmt = conn.prepare(&format!(
            "SELECT {ITEM_COLS} FROM content_queue WHERE locked_by=?1 AND locked_at=?2
             ORDER BY scheduled_at ASC, priority DESC, id ASC"
        ))?;
        let items = stmt
            .query_map(params![worker_id, now], ContentQueueItem::from_row)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(items)
    }

    /// Startup housekeeping: items stuck in `processing` under an expired
    /// lease go back to `scheduled` for the next claim.
    pub fn recover_expired_leases(&self, lease_secs: i64) -> EngineResult<usize> {
        let conn = self.conn.lock();
        let lease_floor = iso_in_secs(-lease_secs);
        let changed = conn.execute(
            "UPDATE content_queue
                SET status='scheduled', locked_at=NULL, locked_by=NULL, updated_at=?2
              WHERE status='processing' AND (locked_at IS NULL OR locked_at < ?1)",
            params![lease_floor, now_iso()],
        )?;
        Ok(changed)
    }

    // ── Transitions (push worker outcomes) ─────────────────────────────

    pub fn queue_item_success(&self, id: i64, message_id: &str) -> EngineResult<()> {
        let conn = self.conn.lock();
        let now = now_iso();
        conn.execute(
            "UPDATE content_queue
                SET status='success', message_id=?2, completed_at=?3, locked_at=NULL,
                    locked_by=NULL, last_error=NULL, last_error_type=NULL, updated_at=?3
              WHERE id=?1",
            params![id, message_id, now],
        )?;
        Ok(())
    }

    /// Retryable failure with attempts remaining: back to `scheduled` at
    /// `next_attempt_at`, lease released.
    pub fn queue_item_reschedule(
        &self,
        id: i64,
        next_attempt_at: &str,
        error: &str,
        kind: ErrorKind,
    ) -> EngineResult<()> {
        let conn = self.conn.lock();
        let now = now_iso();
        conn.execute(
            "UPDATE content_queue
                SET status='scheduled', scheduled_at=?2, next_attempt_at=?2,
                    locked_at=NULL, locked_by=NULL,
                    last_error=?3, last_error_type=?4, last_error_at=?5, updated_at=?5
              WHERE id=?1",
            params![id, next_attempt_at, error, kind.as_str(), now],
        )?;
        Ok(())
    }

    /// Terminal failure: `completed_at` set, lease released.
    pub fn queue_item_failed(&self, id: i64, error: &str, kind: ErrorKind) -> EngineResult<()> {
        let conn = self.conn.lock();
        let now = now_iso();
        conn.execute(
            "UPDATE content_queue
                SET status='failed', completed_at=?4, locked_at=NULL, locked_by=NULL,
                    last_error=?2, last_error_type=?3, last_error_at=?4, updated_at=?4
              WHERE id=?1",
            params![id, error, kind.as_str(), now],
        )?;
        Ok(())
    }

    /// Push back a claimed item because the target's window is full right
    /// now. The claim's attempt increment is rolled back: a rate deferral
    /// is not a delivery attempt.
    pub fn defer_for_rate_limit(&self, id: i64, at: &str, reason: &str) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE content_queue
                SET status='scheduled', scheduled_at=?2, locked_at=NULL, locked_by=NULL,
                    attempt_count = CASE WHEN attempt_count > 0 THEN attempt_count - 1 ELSE 0 END,
                    passed_rate_limit=0, rate_limit_reason=?3, updated_at=?4
              WHERE id=?1",
            params![id, at, reason, now_iso()],
        )?;
        Ok(())
    }

    pub fn cache_rendered_payload(&self, id: i64, payload: &str) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE content_queue SET rendered_payload=?2, updated_at=?3 WHERE id=?1",
            params![id, payload, now_iso()],
        )?;
        Ok(())
    }

    // ── User operations ────────────────────────────────────────────────

    /// Rewind the clock and pin max priority so the item sorts first.
    pub fn push_now_item(&self, id: i64) -> EngineResult<()> {
        let conn = self.conn.lock();
        let rewound = iso_in_secs(-PUSH_NOW_REWIND_HOURS * 3600);
        let changed = conn.execute(
            "UPDATE content_queue SET scheduled_at=?2, priority=?3, updated_at=?4
              WHERE id=?1 AND status IN ('pending','scheduled')",
            params![id, rewound, PUSH_NOW_PRIORITY, now_iso()],
        )?;
        if changed == 0 {
            return Err(EngineError::Validation(format!(
                "queue item {id} is not in a pushable state"
            )));
        }
        Ok(())
    }

    pub fn push_now_content(&self, content_id: i64) -> EngineResult<usize> {
        let conn = self.conn.lock();
        let rewound = iso_in_secs(-PUSH_NOW_REWIND_HOURS * 3600);
        let changed = conn.execute(
            "UPDATE content_queue SET scheduled_at=?2, priority=?3, updated_at=?4
              WHERE content_id=?1 AND status IN ('pending','scheduled')",
            params![content_id, rewound, PUSH_NOW_PRIORITY, now_iso()],
        )?;
        Ok(changed)
    }

    /// Reschedule every live item of a content.
    pub fn schedule_content(&self, content_id: i64, at: &str) -> EngineResult<usize> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE content_queue SET scheduled_at=?2, updated_at=?3
              WHERE content_id=?1 AND status IN ('pending','scheduled')",
            params![content_id, at, now_iso()],
        )?;
        Ok(changed)
    }

    /// Align `scheduled_at` across contents for later merge-forward
    /// delivery. With no explicit time, the earliest existing wins.
    /// Returns the aligned timestamp.
    pub fn merge_group(&self, content_ids: &[i64], at: Option<&str>) -> EngineResult<String> {
        let conn = self.conn.lock();
        let aligned = match at {
            Some(at) => at.to_string(),
            None => {
                let mut earliest: Option<String> = None;
                let mut stmt = conn.prepare(
                    "SELECT MIN(scheduled_at) FROM content_queue
                     WHERE content_id=?1 AND status IN ('pending','scheduled') AND scheduled_at IS NOT NULL",
                )?;
                for id in content_ids {
                    let min: Option<String> = stmt.query_row(params![id], |r| r.get(0)).optional()?.flatten();
                    if let Some(min) = min {
                        earliest = match earliest {
                            Some(cur) if cur <= min => Some(cur),
                            _ => Some(min),
                        };
                    }
                }
                earliest.unwrap_or_else(now_iso)
            }
        };
        let now = now_iso();
        for id in content_ids {
            conn.execute(
                "UPDATE content_queue SET scheduled_at=?2, updated_at=?3
                  WHERE content_id=?1 AND status IN ('pending','scheduled')",
                params![id, aligned, now],
            )?;
        }
        Ok(aligned)
    }

    pub fn cancel_item(&self, id: i64) -> EngineResult<()> {
        let conn = self.conn.lock();
        let now = now_iso();
        let changed = conn.execute(
            "UPDATE content_queue SET status='canceled', completed_at=?2, locked_at=NULL,
                    locked_by=NULL, updated_at=?2
              WHERE id=?1 AND status NOT IN ('success','failed','skipped','canceled')",
            params![id, now],
        )?;
        if changed == 0 {
            return Err(EngineError::Validation(format!("queue item {id} is already terminal")));
        }
        Ok(())
    }

    /// Explicit retry of a terminal item creates a fresh attempt: counters
    /// and errors reset, lease cleared, back to `scheduled` now.
    pub fn retry_item(&self, id: i64) -> EngineResult<()> {
        let conn = self.conn.lock();
        let now = now_iso();
        let changed = conn.execute(
            "UPDATE content_queue
                SET status='scheduled', attempt_count=0, scheduled_at=?2, next_attempt_at=NULL,
                    locked_at=NULL, locked_by=NULL, message_id=NULL, completed_at=NULL,
                    last_error=NULL, last_error_type=NULL, last_error_at=NULL, updated_at=?2
              WHERE id=?1 AND status IN ('failed','canceled','skipped')",
            params![id, now],
        )?;
        if changed == 0 {
            return Err(EngineError::Validation(format!("queue item {id} is not retryable")));
        }
        Ok(())
    }

    /// Release a content's approval-gated items after review approval.
    pub fn release_approved_items(&self, content_id: i64, by: Option<&str>) -> EngineResult<usize> {
        let conn = self.conn.lock();
        let now = now_iso();
        let changed = conn.execute(
            "UPDATE content_queue
                SET status='scheduled', approved_at=?2, approved_by=?3,
                    scheduled_at = COALESCE(scheduled_at, ?2), updated_at=?2
              WHERE content_id=?1 AND status='pending'",
            params![content_id, now, by],
        )?;
        Ok(changed)
    }

    /// Rejection turns a content's pending items into `skipped`.
    pub fn skip_pending_items(&self, content_id: i64) -> EngineResult<usize> {
        let conn = self.conn.lock();
        let now = now_iso();
        let changed = conn.execute(
            "UPDATE content_queue SET status='skipped', completed_at=?2, updated_at=?2
              WHERE content_id=?1 AND status='pending'",
            params![content_id, now],
        )?;
        Ok(changed)
    }

    // ── Reorder ────────────────────────────────────────────────────────

    /// Place `content_id` at `index` within the view's content ordering
    /// (optionally scoped to one rule). Priorities are allocated in gaps;
    /// when the gap between neighbours is exhausted the destination time
    /// bucket is renormalized to `PRIORITY_GAP` strides. No global
    /// re-numbering.
    pub fn reorder_content(&self, content_id: i64, index: usize, rule_id: Option<i64>) -> EngineResult<()> {
        let conn = self.conn.lock();

        // The view: one representative row per content, live items only.
        let (scope_sql, scope_args): (&str, Vec<i64>) = match rule_id {
            Some(id) => ("AND rule_id = ?1", vec![id]),
            None => ("", vec![]),
        };
        let sql = format!(
            "SELECT content_id, MIN(scheduled_at) AS bucket_at, MAX(priority) AS top_priority
               FROM content_queue
              WHERE status IN ('pending','scheduled') {scope_sql}
              GROUP BY content_id
              ORDER BY (MIN(scheduled_at) IS NULL), MIN(scheduled_at) ASC, MAX(priority) DESC,
                       MIN(created_at) ASC"
        );
        let arg_refs: Vec<&dyn rusqlite::ToSql> =
            scope_args.iter().map(|a| a as &dyn rusqlite::ToSql).collect();
        let mut stmt = conn.prepare(&sql)?;
        let view: Vec<(i64, Option<String>, i64)> = stmt
            .query_map(arg_refs.as_slice(), |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))?
            .filter_map(|r| r.ok())
            .collect();

        if !view.iter().any(|(id, _, _)| *id == content_id) {
            return Err(EngineError::NotFound(format!("content {content_id} has no live queue items")));
        }

        let others: Vec<&(i64, Option<String>, i64)> =
            view.iter().filter(|(id, _, _)| *id != content_id).collect();
        let index = index.min(others.len());
        let prev = if index > 0 { others.get(index - 1) } else { None };
        let next = others.get(index);

        // Land in a neighbour's time bucket so priority alone decides the
        // position; prefer the successor's bucket.
        let bucket: Option<String> = match (prev, next) {
            (_, Some((_, at, _))) => at.clone(),
            (Some((_, at, _)), None) => at.clone(),
            (None, None) => view.iter().find(|(id, _, _)| *id == content_id).and_then(|(_, at, _)| at.clone()),
        };

        let prev_in_bucket = prev.filter(|(_, at, _)| *at == bucket).map(|(_, _, p)| *p);
        let next_in_bucket = next.filter(|(_, at, _)| *at == bucket).map(|(_, _, p)| *p);

        let new_priority = match (prev_in_bucket, next_in_bucket) {
            (Some(hi), Some(lo)) if hi - lo > 1 => lo + (hi - lo) / 2,
            (Some(hi), Some(lo)) => {
                // Gap exhausted: renormalize the bucket, then recompute.
                renormalize_bucket(&conn, bucket.as_deref(), rule_id)?;
                let hi = refresh_priority(&conn, prev.map(|(id, _, _)| *id), rule_id)?.unwrap_or(hi);
                let lo = refresh_priority(&conn, next.map(|(id, _, _)| *id), rule_id)?.unwrap_or(lo);
                lo + (hi - lo).max(2) / 2
            }
            (Some(hi), None) => hi - PRIORITY_GAP,
            (None, Some(lo)) => lo + PRIORITY_GAP,
            (None, None) => 0,
        };

        let now = now_iso();
        match &bucket {
            Some(at) => conn.execute(
                "UPDATE content_queue SET scheduled_at=?2, priority=?3, updated_at=?4
                  WHERE content_id=?1 AND status IN ('pending','scheduled')",
                params![content_id, at, new_priority, now],
            )?,
            None => conn.execute(
                "UPDATE content_queue SET scheduled_at=NULL, priority=?2, updated_at=?3
                  WHERE content_id=?1 AND status IN ('pending','scheduled')",
                params![content_id, new_priority, now],
            )?,
        };
        Ok(())
    }

    /// Content ids in view order, for reorder verification and the
    /// content-level queue listing.
    pub fn queue_view_order(&self, rule_id: Option<i64>) -> EngineResult<Vec<i64>> {
        let conn = self.conn.lock();
        let (scope_sql, scope_args): (&str, Vec<i64>) = match rule_id {
            Some(id) => ("AND rule_id = ?1", vec![id]),
            None => ("", vec![]),
        };
        let sql = format!(
            "SELECT content_id FROM content_queue
              WHERE status IN ('pending','scheduled') {scope_sql}
              GROUP BY content_id
              ORDER BY (MIN(scheduled_at) IS NULL), MIN(scheduled_at) ASC, MAX(priority) DESC,
                       MIN(created_at) ASC"
        );
        let arg_refs: Vec<&dyn rusqlite::ToSql> =
            scope_args.iter().map(|a| a as &dyn rusqlite::ToSql).collect();
        let mut stmt = conn.prepare(&sql)?;
        let ids = stmt
            .query_map(arg_refs.as_slice(), |r| r.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(ids)
    }
}

/// Re-stride one time bucket's priorities to multiples of `PRIORITY_GAP`,
/// preserving the current order.
fn renormalize_bucket(
    conn: &rusqlite::Connection,
    bucket: Option<&str>,
    rule_id: Option<i64>,
) -> EngineResult<()> {
    let mut clauses = vec!["status IN ('pending','scheduled')".to_string()];
    let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
    match bucket {
        Some(at) => {
            args.push(Box::new(at.to_string()));
            clauses.push(format!("scheduled_at = ?{}", args.len()));
        }
        None => clauses.push("scheduled_at IS NULL".into()),
    }
    if let Some(id) = rule_id {
        args.push(Box::new(id));
        clauses.push(format!("rule_id = ?{}", args.len()));
    }
    let where_sql = clauses.join(" AND ");
    let arg_refs: Vec<&dyn rusqlite::ToSql> = args.iter().map(|a| a.as_ref()).collect();

    let mut stmt = conn.prepare(&format!(
        "SELECT content_id FROM content_queue WHERE {where_sql}
         GROUP BY content_id ORDER BY MAX(priority) DESC, MIN(created_at) ASC"
    ))?;
    let contents: Vec<i64> = stmt
        .query_map(arg_refs.as_slice(), |r| r.get(0))?
        .filter_map(|r| r.ok())
        .collect();

    let now = now_iso();
    for (pos, cid) in contents.iter().enumerate() {
        let stride = ((contents.len() - pos) as i64) * PRIORITY_GAP;
        match bucket {
            Some(at) => conn.execute(
                "UPDATE content_queue SET priority=?2, updated_at=?3
                  WHERE content_id=?1 AND scheduled_at=?4 AND status IN ('pending','scheduled')",
                params![cid, stride, now, at],
            )?,
            None => conn.execute(
                "UPDATE content_queue SET priority=?2, updated_at=?3
                  WHERE content_id=?1 AND scheduled_at IS NULL AND status IN ('pending','scheduled')",
                params![cid, stride, now],
            )?,
        };
    }
    Ok(())
}

fn refresh_priority(
    conn: &rusqlite::Connection,
    content_id: Option<i64>,
    rule_id: Option<i64>,
) -> EngineResult<Option<i64>> {
    let Some(cid) = content_id else { return Ok(None) };
    let result = match rule_id {
        Some(rid) => conn
            .query_row(
                "SELECT MAX(priority) FROM content_queue
                  WHERE content_id=?1 AND rule_id=?2 AND status IN ('pending','scheduled')",
                params![cid, rid],
                |r| r.get::<_, Option<i64>>(0),
            )
            .optional()?
            .flatten(),
        None => conn
            .query_row(
                "SELECT MAX(priority) FROM content_queue
                  WHERE content_id=?1 AND status IN ('pending','scheduled')",
                params![cid],
                |r| r.get::<_, Option<i64>>(0),
            )
            .optional()?
            .flatten(),
    };
    Ok(result)
}
