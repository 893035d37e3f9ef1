use rusqlite::{params, OptionalExtension};
use serde_json::Value;

use super::Store;
use crate::atoms::constants::DEFAULT_MAX_ATTEMPTS;
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{Task, TaskKind, TaskStatus};
use crate::engine::clock::{iso_in_secs, now_iso};

const TASK_COLS: &str = "id, kind, payload, status, priority, retry_count, max_attempts, \
     scheduled_for, claimed_by, claimed_at, error, created_at, updated_at";

impl Task {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        let payload: String = row.get(2)?;
        Ok(Task {
            id: row.get(0)?,
            kind: TaskKind::parse(&row.get::<_, String>(1)?).unwrap_or(TaskKind::Parse),
            payload: serde_json::from_str(&payload).unwrap_or(Value::Null),
            status: TaskStatus::parse(&row.get::<_, String>(3)?).unwrap_or(TaskStatus::Pending),
            priority: row.get(4)?,
            retry_count: row.get::<_, i64>(5)? as u32,
            max_attempts: row.get::<_, i64>(6)? as u32,
            scheduled_for: row.get(7)?,
            claimed_by: row.get(8)?,
            claimed_at: row.get(9)?,
            error: row.get(10)?,
            created_at: row.get(11)?,
            updated_at: row.get(12)?,
        })
    }
}

impl Store {
    // ── Enqueue ────────────────────────────────────────────────────────

    pub fn enqueue_task(&self, kind: TaskKind, payload: &Value, priority: i64) -> EngineResult<i64> {
        let conn = self.conn.lock();
        let now = now_iso();
        conn.execute(
            "INSERT INTO tasks (kind, payload, status, priority, max_attempts, scheduled_for,
                                created_at, updated_at)
             VALUES (?1, ?2, 'pending', ?3, ?4, ?5, ?6, ?6)",
            params![kind.as_str(), serde_json::to_string(payload)?, priority, DEFAULT_MAX_ATTEMPTS, now, now],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Enqueue a parse task unless an identical one is already pending or
    /// running, so a re-submitted URL never double-parses.
    pub fn enqueue_parse_if_absent(&self, content_id: i64) -> EngineResult<Option<i64>> {
        let payload = serde_json::json!({ "content_id": content_id });
        let payload_str = serde_json::to_string(&payload)?;
        let conn = self.conn.lock();
        let existing: Option<i64> = conn
            .query_row(
                "SELECT id FROM tasks
                 WHERE kind='parse' AND payload=?1 AND status IN ('pending','running')",
                params![payload_str],
                |r| r.get(0),
            )
            .optional()?;
        if existing.is_some() {
            return Ok(None);
        }
        let now = now_iso();
        conn.execute(
            "INSERT INTO tasks (kind, payload, status, priority, max_attempts, scheduled_for,
                                created_at, updated_at)
             VALUES ('parse', ?1, 'pending', 0, ?2, ?3, ?4, ?4)",
            params![payload_str, DEFAULT_MAX_ATTEMPTS, now, now],
        )?;
        Ok(Some(conn.last_insert_rowid()))
    }

    // ── Claim ──────────────────────────────────────────────────────────

    /// Atomic claim: a conditional update flips due `pending` rows (or
    /// `running` rows whose lease expired) to `running` under this worker,
    /// then the claimed rows are read back by the claim token.
    pub fn claim_tasks(
        &self,
        worker_id: &str,
        kinds: &[TaskKind],
        max: u32,
        lease_secs: i64,
    ) -> EngineResult<Vec<Task>> {
        if kinds.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock();
        let now = now_iso();
        let lease_floor = iso_in_secs(-lease_secs);
        let kind_list = kinds.iter().map(|k| format!("'{}'", k.as_str())).collect::<Vec<_>>().join(",");

        conn.execute(
            &format!(
                "UPDATE tasks
                    SET status='running', claimed_by=?1, claimed_at=?2, updated_at=?2
                  WHERE id IN (
                    SELECT id FROM tasks
                     WHERE kind IN ({kind_list})
                       AND (scheduled_for IS NULL OR scheduled_for <= ?2)
                       AND (status='pending'
                            OR (status='running' AND (claimed_at IS NULL OR claimed_at < ?3)))
                     ORDER BY priority DESC, scheduled_for ASC, id ASC
                     LIMIT ?4
                  )"
            ),
            params![worker_id, now, lease_floor, max],
        )?;

        let mut stmt = conn.prepare(&format!(
            "SELECT {TASK_COLS} FROM tasks WHERE claimed_by=?1 AND claimed_at=?2 AND status='running'
             ORDER BY priority DESC, id ASC"
        ))?;
        let tasks = stmt
            .query_map(params![worker_id, now], Task::from_row)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(tasks)
    }

    // ── Completion ─────────────────────────────────────────────────────

    pub fn complete_task(&self, id: i64) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE tasks SET status='done', error=NULL, updated_at=?2 WHERE id=?1",
            params![id, now_iso()],
        )?;
        Ok(())
    }

    /// Record a failure. With attempts left the task reschedules for
    /// `next_attempt_at` (caller computes the backoff); otherwise it moves
    /// to the dead-letter state for inspection.
    pub fn fail_task(&self, id: i64, error: &str, next_attempt_at: Option<&str>) -> EngineResult<TaskStatus> {
        let conn = self.conn.lock();
        let now = now_iso();
        let (retry_count, max_attempts): (i64, i64) = conn
            .query_row("SELECT retry_count, max_attempts FROM tasks WHERE id=?1", params![id], |r| {
                Ok((r.get(0)?, r.get(1)?))
            })
            .optional()?
            .ok_or_else(|| EngineError::NotFound(format!("task {id}")))?;

        let next_retry = retry_count + 1;
        if next_retry < max_attempts {
            let when = next_attempt_at.map(str::to_string).unwrap_or_else(|| now.clone());
            conn.execute(
                "UPDATE tasks SET status='pending', retry_count=?2, error=?3, scheduled_for=?4,
                        claimed_by=NULL, claimed_at=NULL, updated_at=?5
                 WHERE id=?1",
                params![id, next_retry, error, when, now],
            )?;
            Ok(TaskStatus::Pending)
        } else {
            conn.execute(
                "UPDATE tasks SET status='dead', retry_count=?2, error=?3,
                        claimed_by=NULL, claimed_at=NULL, updated_at=?4
                 WHERE id=?1",
                params![id, next_retry, error, now],
            )?;
            Ok(TaskStatus::Dead)
        }
    }

    /// Move a task straight to the dead-letter state, bypassing retries.
    /// Used when the work itself is permanently non-retryable (adapter says
    /// the content is gone), not just this attempt.
    pub fn kill_task(&self, id: i64, error: &str) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE tasks SET status='dead', error=?2, claimed_by=NULL, claimed_at=NULL, updated_at=?3
             WHERE id=?1",
            params![id, error, now_iso()],
        )?;
        Ok(())
    }

    pub fn list_dead_tasks(&self, limit: u32) -> EngineResult<Vec<Task>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {TASK_COLS} FROM tasks WHERE status='dead' ORDER BY updated_at DESC LIMIT ?1"
        ))?;
        let tasks = stmt.query_map(params![limit], Task::from_row)?.filter_map(|r| r.ok()).collect();
        Ok(tasks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_is_exclusive_between_workers() {
        let store = Store::open_in_memory().unwrap();
        store.enqueue_task(TaskKind::Parse, &serde_json::json!({"content_id": 1}), 0).unwrap();

        let a = store.claim_tasks("worker-a", &[TaskKind::Parse], 5, 600).unwrap();
        let b = store.claim_tasks("worker-b", &[TaskKind::Parse], 5, 600).unwrap();
        assert_eq!(a.len(), 1);
        assert!(b.is_empty());
        assert_eq!(a[0].status, TaskStatus::Running);
    }

    #[test]
    fn duplicate_parse_enqueue_is_suppressed() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.enqueue_parse_if_absent(42).unwrap().is_some());
        assert!(store.enqueue_parse_if_absent(42).unwrap().is_none());

        // Completing the task lifts the suppression.
        let tasks = store.claim_tasks("w", &[TaskKind::Parse], 1, 600).unwrap();
        store.complete_task(tasks[0].id).unwrap();
        assert!(store.enqueue_parse_if_absent(42).unwrap().is_some());
    }

    #[test]
    fn failures_retry_then_dead_letter() {
        let store = Store::open_in_memory().unwrap();
        let id = store.enqueue_task(TaskKind::Distribute, &serde_json::json!({"queue_item_id": 5}), 0).unwrap();

        assert_eq!(store.fail_task(id, "t1", None).unwrap(), TaskStatus::Pending);
        assert_eq!(store.fail_task(id, "t2", None).unwrap(), TaskStatus::Pending);
        assert_eq!(store.fail_task(id, "t3", None).unwrap(), TaskStatus::Dead);
        let dead = store.list_dead_tasks(10).unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].retry_count, 3);
    }

    #[test]
    fn expired_lease_is_reclaimable() {
        let store = Store::open_in_memory().unwrap();
        store.enqueue_task(TaskKind::Parse, &serde_json::json!({"content_id": 2}), 0).unwrap();
        let claimed = store.claim_tasks("worker-a", &[TaskKind::Parse], 1, 600).unwrap();
        assert_eq!(claimed.len(), 1);

        // A zero-second lease means the claim is immediately stale.
        let reclaimed = store.claim_tasks("worker-b", &[TaskKind::Parse], 1, 0).unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].claimed_by.as_deref(), Some("worker-b"));
    }
}
