use rusqlite::params;
use serde_json::Value;

use super::Store;
use crate::atoms::error::EngineResult;
use crate::engine::clock::now_iso;

/// One durable outbox row as read back by the cross-process poller.
#[derive(Debug, Clone)]
pub struct OutboxRow {
    pub id: i64,
    pub kind: String,
    pub payload: Value,
    pub origin: String,
}

impl Store {
    /// Append an event to the outbox. Called by the event bus as the
    /// durable half of `publish`.
    pub fn append_event(&self, kind: &str, payload: &Value, origin: &str) -> EngineResult<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO realtime_events (kind, payload, origin, created_at) VALUES (?1,?2,?3,?4)",
            params![kind, serde_json::to_string(payload)?, origin, now_iso()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Rows past the consumer cursor, oldest first.
    pub fn events_after(&self, cursor: i64, limit: u32) -> EngineResult<Vec<OutboxRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, kind, payload, origin FROM realtime_events
             WHERE id > ?1 ORDER BY id ASC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![cursor, limit], |r| {
                let payload: String = r.get(2)?;
                Ok(OutboxRow {
                    id: r.get(0)?,
                    kind: r.get(1)?,
                    payload: serde_json::from_str(&payload).unwrap_or(Value::Null),
                    origin: r.get(3)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// Where a fresh consumer starts: everything before this id is history.
    pub fn latest_event_id(&self) -> EngineResult<i64> {
        let conn = self.conn.lock();
        let id: i64 =
            conn.query_row("SELECT COALESCE(MAX(id), 0) FROM realtime_events", [], |r| r.get(0))?;
        Ok(id)
    }

    /// Drop outbox rows older than `before` (RFC 3339). Keeps the table from
    /// growing without bound; every consumer has long since moved past them.
    pub fn prune_events_before(&self, before: &str) -> EngineResult<usize> {
        let conn = self.conn.lock();
        let deleted =
            conn.execute("DELETE FROM realtime_events WHERE created_at < ?1", params![before])?;
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn cursor_pagination_sees_only_new_rows() {
        let store = Store::open_in_memory().unwrap();
        let first = store.append_event("queue_updated", &json!({"n": 1}), "proc-a").unwrap();
        let second = store.append_event("content_created", &json!({"n": 2}), "proc-b").unwrap();
        assert!(second > first);

        let from_start = store.events_after(0, 100).unwrap();
        assert_eq!(from_start.len(), 2);

        let after_first = store.events_after(first, 100).unwrap();
        assert_eq!(after_first.len(), 1);
        assert_eq!(after_first[0].kind, "content_created");
        assert_eq!(after_first[0].origin, "proc-b");
    }

    #[test]
    fn latest_id_starts_consumers_past_history() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(store.latest_event_id().unwrap(), 0);
        store.append_event("queue_updated", &json!({}), "p").unwrap();
        let latest = store.latest_event_id().unwrap();
        assert!(store.events_after(latest, 10).unwrap().is_empty());
    }
}
