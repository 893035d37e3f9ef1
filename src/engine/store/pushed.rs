use rusqlite::{params, OptionalExtension};

use super::Store;
use crate::atoms::error::EngineResult;
use crate::atoms::types::PushedRecord;
use crate::engine::clock::now_iso;

const RECORD_COLS: &str = "id, content_id, target_id, message_id, push_status, pushed_at, error_message";

impl PushedRecord {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(PushedRecord {
            id: row.get(0)?,
            content_id: row.get(1)?,
            target_id: row.get(2)?,
            message_id: row.get(3)?,
            push_status: row.get(4)?,
            pushed_at: row.get(5)?,
            error_message: row.get(6)?,
        })
    }
}

impl Store {
    pub fn get_pushed_record(&self, content_id: i64, target_id: i64) -> EngineResult<Option<PushedRecord>> {
        let conn = self.conn.lock();
        let record = conn
            .query_row(
                &format!("SELECT {RECORD_COLS} FROM pushed_records WHERE content_id=?1 AND target_id=?2"),
                params![content_id, target_id],
                PushedRecord::from_row,
            )
            .optional()?;
        Ok(record)
    }

    /// Upsert on the `(content, target)` unique key. A re-approved content
    /// that pushes again refreshes `message_id` and `pushed_at` in place —
    /// rows are never deleted to reopen a target.
    pub fn upsert_pushed_record(
        &self,
        content_id: i64,
        target_id: i64,
        message_id: &str,
        push_status: &str,
        error_message: Option<&str>,
    ) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO pushed_records (content_id, target_id, message_id, push_status, pushed_at, error_message)
             VALUES (?1,?2,?3,?4,?5,?6)
             ON CONFLICT(content_id, target_id) DO UPDATE SET
                message_id=excluded.message_id,
                push_status=excluded.push_status,
                pushed_at=excluded.pushed_at,
                error_message=excluded.error_message",
            params![content_id, target_id, message_id, push_status, now_iso(), error_message],
        )?;
        Ok(())
    }

    /// Successful pushes to `target_id` since `since` (RFC 3339). The rate
    /// limiter computes its sliding window from this on every scheduling
    /// decision instead of caching a bucket in memory.
    pub fn count_pushed_since(&self, target_id: i64, since: &str) -> EngineResult<u32> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM pushed_records
             WHERE target_id=?1 AND push_status='success' AND pushed_at >= ?2",
            params![target_id, since],
            |r| r.get(0),
        )?;
        Ok(count as u32)
    }

    pub fn list_pushed_for_content(&self, content_id: i64) -> EngineResult<Vec<PushedRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {RECORD_COLS} FROM pushed_records WHERE content_id=?1 ORDER BY pushed_at ASC"
        ))?;
        let records = stmt
            .query_map(params![content_id], PushedRecord::from_row)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::clock::iso_in_secs;

    #[test]
    fn upsert_refreshes_in_place() {
        let store = Store::open_in_memory().unwrap();
        {
            let conn = store.conn.lock();
            conn.execute(
                "INSERT INTO contents (platform, url, canonical_url, created_at, updated_at)
                 VALUES ('web','u','u','2026-01-01T00:00:00+00:00','2026-01-01T00:00:00+00:00')",
                [],
            )
            .unwrap();
        }
        store.upsert_pushed_record(1, 7, "m1", "success", None).unwrap();
        store.upsert_pushed_record(1, 7, "m2", "success", None).unwrap();
        let record = store.get_pushed_record(1, 7).unwrap().unwrap();
        assert_eq!(record.message_id, "m2");
        let conn = store.conn.lock();
        let rows: i64 = conn.query_row("SELECT COUNT(*) FROM pushed_records", [], |r| r.get(0)).unwrap();
        assert_eq!(rows, 1);
    }

    #[test]
    fn window_count_only_sees_recent_successes() {
        let store = Store::open_in_memory().unwrap();
        {
            let conn = store.conn.lock();
            conn.execute(
                "INSERT INTO contents (platform, url, canonical_url, created_at, updated_at)
                 VALUES ('web','u','u','2026-01-01T00:00:00+00:00','2026-01-01T00:00:00+00:00')",
                [],
            )
            .unwrap();
            conn.execute(
                "INSERT INTO pushed_records (content_id, target_id, message_id, push_status, pushed_at)
                 VALUES (1, 9, 'old', 'success', ?1)",
                params![iso_in_secs(-7200)],
            )
            .unwrap();
        }
        store.upsert_pushed_record(1, 8, "fresh", "success", None).unwrap();
        assert_eq!(store.count_pushed_since(8, &iso_in_secs(-3600)).unwrap(), 1);
        assert_eq!(store.count_pushed_since(9, &iso_in_secs(-3600)).unwrap(), 0);
        assert_eq!(store.count_pushed_since(9, &iso_in_secs(-86400)).unwrap(), 1);
    }
}
