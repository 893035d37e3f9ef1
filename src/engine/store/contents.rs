use rusqlite::{params, Connection, OptionalExtension};
use serde::Deserialize;
use serde_json::Value;

use super::Store;
use crate::atoms::error::{EngineError, EngineResult, ErrorKind};
use crate::atoms::types::{Content, ContentSource, ContentStatus, LayoutType, ParsedContent, ReviewStatus};
use crate::engine::clock::now_iso;

// Column list shared by every content SELECT so from_row stays in sync.
const CONTENT_COLS: &str = "id, platform, platform_id, url, canonical_url, clean_url, title, \
     description, author_name, author_id, author_avatar_url, author_url, cover_url, cover_color, \
     media_urls, tags, is_nsfw, layout_type, layout_type_override, content_type, extra_stats, \
     raw_metadata, status, review_status, failure_count, last_error, last_error_type, \
     last_error_at, reviewed_at, reviewed_by, reviewed_note, created_at, updated_at";

fn json_list(raw: String) -> Vec<String> {
    serde_json::from_str(&raw).unwrap_or_default()
}

fn opt_json(raw: Option<String>) -> Option<Value> {
    raw.and_then(|s| serde_json::from_str(&s).ok())
}

impl Content {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Content {
            id: row.get(0)?,
            platform: row.get(1)?,
            platform_id: row.get(2)?,
            url: row.get(3)?,
            canonical_url: row.get(4)?,
            clean_url: row.get(5)?,
            title: row.get(6)?,
            description: row.get(7)?,
            author_name: row.get(8)?,
            author_id: row.get(9)?,
            author_avatar_url: row.get(10)?,
            author_url: row.get(11)?,
            cover_url: row.get(12)?,
            cover_color: row.get(13)?,
            media_urls: json_list(row.get(14)?),
            tags: json_list(row.get(15)?),
            is_nsfw: row.get::<_, i64>(16)? != 0,
            layout_type: row.get::<_, Option<String>>(17)?.and_then(|s| LayoutType::parse(&s)),
            layout_type_override: row.get::<_, Option<String>>(18)?.and_then(|s| LayoutType::parse(&s)),
            content_type: row.get(19)?,
            extra_stats: opt_json(row.get(20)?),
            raw_metadata: opt_json(row.get(21)?),
            status: ContentStatus::parse(&row.get::<_, String>(22)?).unwrap_or(ContentStatus::Unprocessed),
            review_status: ReviewStatus::parse(&row.get::<_, String>(23)?).unwrap_or(ReviewStatus::Pending),
            failure_count: row.get::<_, i64>(24)? as u32,
            last_error: row.get(25)?,
            last_error_type: row.get(26)?,
            last_error_at: row.get(27)?,
            reviewed_at: row.get(28)?,
            reviewed_by: row.get(29)?,
            reviewed_note: row.get(30)?,
            created_at: row.get(31)?,
            updated_at: row.get(32)?,
        })
    }
}

/// A user submission after platform routing: the canonical key is already
/// computed, the body is not yet parsed.
#[derive(Debug, Clone)]
pub struct NewShare {
    pub platform: String,
    pub url: String,
    pub canonical_url: String,
    pub tags: Vec<String>,
    pub source: Option<String>,
    pub note: Option<String>,
    pub is_nsfw: Option<bool>,
    pub layout_type_override: Option<LayoutType>,
}

/// Mutable descriptive fields for PATCH. `None` leaves a field untouched;
/// `layout_type_override: Some("")` clears the override.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContentPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub tags: Option<Vec<String>>,
    pub is_nsfw: Option<bool>,
    pub layout_type_override: Option<String>,
    pub cover_url: Option<String>,
}

/// List-endpoint filter. Page is 1-based.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContentListFilter {
    pub page: Option<u32>,
    pub size: Option<u32>,
    pub platform: Option<String>,
    pub status: Option<String>,
    pub review_status: Option<String>,
    pub tag: Option<String>,
    pub q: Option<String>,
    pub exclude_fields: Option<String>,
}

fn get_by_canonical(conn: &Connection, platform: &str, canonical: &str) -> rusqlite::Result<Option<Content>> {
    conn.query_row(
        &format!("SELECT {CONTENT_COLS} FROM contents WHERE platform = ?1 AND canonical_url = ?2"),
        params![platform, canonical],
        Content::from_row,
    )
    .optional()
}

impl Store {
    // ── Submission & dedup ─────────────────────────────────────────────

    /// Record a share. Re-submission of an existing `(platform,
    /// canonical_url)` returns the existing content and only appends a new
    /// `ContentSource`; a fresh URL inserts an `unprocessed` stub.
    /// Returns `(content, created)`.
    pub fn submit_share(&self, share: &NewShare) -> EngineResult<(Content, bool)> {
        let conn = self.conn.lock();
        let now = now_iso();

        let (content, created) = match get_by_canonical(&conn, &share.platform, &share.canonical_url)? {
            Some(existing) => (existing, false),
            None => {
                conn.execute(
                    "INSERT INTO contents (platform, url, canonical_url, tags, is_nsfw,
                                           layout_type_override, status, review_status,
                                           created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'unprocessed', 'pending', ?7, ?7)",
                    params![
                        share.platform,
                        share.url,
                        share.canonical_url,
                        serde_json::to_string(&share.tags)?,
                        share.is_nsfw.unwrap_or(false) as i64,
                        share.layout_type_override.map(|l| l.as_str()),
                        now,
                    ],
                )?;
                let id = conn.last_insert_rowid();
                let content = conn.query_row(
                    &format!("SELECT {CONTENT_COLS} FROM contents WHERE id = ?1"),
                    params![id],
                    Content::from_row,
                )?;
                (content, true)
            }
        };

        conn.execute(
            "INSERT INTO content_sources (content_id, url, tags, note, source, submitted_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                content.id,
                share.url,
                serde_json::to_string(&share.tags)?,
                share.note,
                share.source,
                now,
            ],
        )?;

        Ok((content, created))
    }

    // ── Reads ──────────────────────────────────────────────────────────

    pub fn get_content(&self, id: i64) -> EngineResult<Content> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {CONTENT_COLS} FROM contents WHERE id = ?1"),
            params![id],
            Content::from_row,
        )
        .optional()?
        .ok_or_else(|| EngineError::NotFound(format!("content {id}")))
    }

    /// Paginated listing. Returns `(items, total)`.
    pub fn list_contents(&self, filter: &ContentListFilter) -> EngineResult<(Vec<Content>, u32)> {
        let conn = self.conn.lock();

        let mut where_clauses: Vec<String> = Vec::new();
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(p) = &filter.platform {
            args.push(Box::new(p.clone()));
            where_clauses.push(format!("platform = ?{}", args.len()));
        }
        if let Some(s) = &filter.status {
            args.push(Box::new(s.clone()));
            where_clauses.push(format!("status = ?{}", args.len()));
        }
        if let Some(r) = &filter.review_status {
            args.push(Box::new(r.clone()));
            where_clauses.push(format!("review_status = ?{}", args.len()));
        }
        if let Some(tag) = &filter.tag {
            // tags is a JSON array of strings; match the quoted element.
            args.push(Box::new(format!("%\"{}\"%", tag.replace('"', ""))));
            where_clauses.push(format!("tags LIKE ?{}", args.len()));
        }
        if let Some(q) = &filter.q {
            let like = format!("%{q}%");
            args.push(Box::new(like.clone()));
            let a = args.len();
            args.push(Box::new(like.clone()));
            let b = args.len();
            args.push(Box::new(like));
            let c = args.len();
            where_clauses.push(format!("(title LIKE ?{a} OR description LIKE ?{b} OR author_name LIKE ?{c})"));
        }

        let where_sql = if where_clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", where_clauses.join(" AND "))
        };
        let arg_refs: Vec<&dyn rusqlite::ToSql> = args.iter().map(|a| a.as_ref()).collect();

        let total: u32 = conn.query_row(
            &format!("SELECT COUNT(*) FROM contents {where_sql}"),
            arg_refs.as_slice(),
            |row| row.get::<_, i64>(0),
        )? as u32;

        let size = filter.size.unwrap_or(20).clamp(1, 100);
        let page = filter.page.unwrap_or(1).max(1);
        let offset = (page - 1) * size;

        let mut stmt = conn.prepare(&format!(
            "SELECT {CONTENT_COLS} FROM contents {where_sql}
             ORDER BY created_at DESC, id DESC LIMIT {size} OFFSET {offset}"
        ))?;
        let mut items: Vec<Content> = stmt
            .query_map(arg_refs.as_slice(), Content::from_row)?
            .filter_map(|r| r.ok())
            .collect();

        // Projection: heavy JSON columns can be dropped from list responses.
        if let Some(excl) = &filter.exclude_fields {
            let drop_raw = excl.contains("raw_metadata");
            let drop_stats = excl.contains("extra_stats");
            for item in items.iter_mut() {
                if drop_raw {
                    item.raw_metadata = None;
                }
                if drop_stats {
                    item.extra_stats = None;
                }
            }
        }

        Ok((items, total))
    }

    pub fn list_sources(&self, content_id: i64) -> EngineResult<Vec<ContentSource>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, content_id, url, tags, note, source, submitted_at
             FROM content_sources WHERE content_id = ?1 ORDER BY submitted_at ASC",
        )?;
        let sources = stmt
            .query_map(params![content_id], |row| {
                Ok(ContentSource {
                    id: row.get(0)?,
                    content_id: row.get(1)?,
                    url: row.get(2)?,
                    tags: json_list(row.get(3)?),
                    note: row.get(4)?,
                    source: row.get(5)?,
                    submitted_at: row.get(6)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(sources)
    }

    // ── Mutations ──────────────────────────────────────────────────────

    pub fn patch_content(&self, id: i64, patch: &ContentPatch) -> EngineResult<Content> {
        {
            let conn = self.conn.lock();
            let now = now_iso();
            if let Some(title) = &patch.title {
                conn.execute("UPDATE contents SET title=?2, updated_at=?3 WHERE id=?1", params![id, title, now])?;
            }
            if let Some(desc) = &patch.description {
                conn.execute("UPDATE contents SET description=?2, updated_at=?3 WHERE id=?1", params![id, desc, now])?;
            }
            if let Some(tags) = &patch.tags {
                conn.execute(
                    "UPDATE contents SET tags=?2, updated_at=?3 WHERE id=?1",
                    params![id, serde_json::to_string(tags)?, now],
                )?;
            }
            if let Some(nsfw) = patch.is_nsfw {
                conn.execute("UPDATE contents SET is_nsfw=?2, updated_at=?3 WHERE id=?1", params![id, nsfw as i64, now])?;
            }
            if let Some(cover) = &patch.cover_url {
                conn.execute("UPDATE contents SET cover_url=?2, updated_at=?3 WHERE id=?1", params![id, cover, now])?;
            }
            if let Some(layout) = &patch.layout_type_override {
                if layout.is_empty() {
                    conn.execute(
                        "UPDATE contents SET layout_type_override=NULL, updated_at=?2 WHERE id=?1",
                        params![id, now],
                    )?;
                } else {
                    let parsed = LayoutType::parse(layout)
                        .ok_or_else(|| EngineError::Validation(format!("invalid layout_type_override '{layout}'")))?;
                    conn.execute(
                        "UPDATE contents SET layout_type_override=?2, updated_at=?3 WHERE id=?1",
                        params![id, parsed.as_str(), now],
                    )?;
                }
            }
        }
        self.get_content(id)
    }

    /// `unprocessed|failed → processing`. Returns false when the content is
    /// already being parsed by another worker.
    pub fn mark_content_processing(&self, id: i64) -> EngineResult<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE contents SET status='processing', updated_at=?2
             WHERE id=?1 AND status IN ('unprocessed', 'failed', 'pulled')",
            params![id, now_iso()],
        )?;
        Ok(changed > 0)
    }

    /// Persist adapter output: all normalized fields, `pulled` status,
    /// cleared `last_error*` (the failure counter is retained).
    pub fn apply_parsed(&self, id: i64, parsed: &ParsedContent, raw_metadata: &Value) -> EngineResult<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE contents SET
                platform_id=?2, title=?3, description=?4,
                author_name=?5, author_id=?6, author_avatar_url=?7, author_url=?8,
                cover_url=?9, media_urls=?10, tags=?11, is_nsfw=?12,
                layout_type=?13, content_type=?14, extra_stats=?15, raw_metadata=?16,
                clean_url=?17,
                status='pulled', last_error=NULL, last_error_type=NULL, last_error_at=NULL,
                updated_at=?18
             WHERE id=?1",
            params![
                id,
                parsed.content_id,
                parsed.title,
                parsed.description,
                parsed.author_name,
                parsed.author_id,
                parsed.author_avatar_url,
                parsed.author_url,
                parsed.cover_url,
                serde_json::to_string(&parsed.media_urls)?,
                serde_json::to_string(&merge_tags(&self_tags(&conn, id), &parsed.tags))?,
                parsed.is_nsfw as i64,
                parsed.layout_type.as_str(),
                parsed.content_type,
                serde_json::to_string(&parsed.stats)?,
                serde_json::to_string(raw_metadata)?,
                parsed.clean_url,
                now_iso(),
            ],
        )?;
        if changed == 0 {
            return Err(EngineError::NotFound(format!("content {id}")));
        }
        Ok(())
    }

    pub fn mark_parse_failed(&self, id: i64, error: &str, kind: ErrorKind) -> EngineResult<()> {
        let conn = self.conn.lock();
        let now = now_iso();
        conn.execute(
            "UPDATE contents SET status='failed', failure_count=failure_count+1,
                    last_error=?2, last_error_type=?3, last_error_at=?4, updated_at=?4
             WHERE id=?1",
            params![id, error, kind.as_str(), now],
        )?;
        Ok(())
    }

    pub fn set_review(
        &self,
        id: i64,
        status: ReviewStatus,
        by: Option<&str>,
        note: Option<&str>,
    ) -> EngineResult<Content> {
        {
            let conn = self.conn.lock();
            let now = now_iso();
            let changed = conn.execute(
                "UPDATE contents SET review_status=?2, reviewed_at=?3, reviewed_by=?4,
                        reviewed_note=?5, updated_at=?3
                 WHERE id=?1",
                params![id, status.as_str(), now, by, note],
            )?;
            if changed == 0 {
                return Err(EngineError::NotFound(format!("content {id}")));
            }
        }
        self.get_content(id)
    }

    /// Cascade: sources and pushed records go with the content; queue items
    /// are not owned and transition to `canceled` instead.
    pub fn delete_content(&self, id: i64) -> EngineResult<()> {
        let conn = self.conn.lock();
        let now = now_iso();
        conn.execute(
            "UPDATE content_queue SET status='canceled', completed_at=?2, updated_at=?2
             WHERE content_id=?1 AND status IN ('pending','scheduled','processing')",
            params![id, now],
        )?;
        let deleted = conn.execute("DELETE FROM contents WHERE id=?1", params![id])?;
        if deleted == 0 {
            return Err(EngineError::NotFound(format!("content {id}")));
        }
        Ok(())
    }

    /// Startup housekeeping: contents stuck in `processing` from a crashed
    /// run become `unprocessed` so the parse queue can pick them up again.
    pub fn recover_stale_processing(&self) -> EngineResult<Vec<i64>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT id FROM contents WHERE status='processing'")?;
        let ids: Vec<i64> = stmt
            .query_map([], |row| row.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        if !ids.is_empty() {
            conn.execute(
                "UPDATE contents SET status='unprocessed', updated_at=?1 WHERE status='processing'",
                params![now_iso()],
            )?;
        }
        Ok(ids)
    }
}

/// Current tags of a content row, for merging with adapter tags.
fn self_tags(conn: &Connection, id: i64) -> Vec<String> {
    conn.query_row("SELECT tags FROM contents WHERE id=?1", params![id], |row| {
        row.get::<_, String>(0)
    })
    .map(json_list)
    .unwrap_or_default()
}

/// Submission tags first, adapter tags appended, duplicates dropped.
fn merge_tags(existing: &[String], parsed: &[String]) -> Vec<String> {
    let mut merged: Vec<String> = existing.to_vec();
    for tag in parsed {
        if !merged.contains(tag) {
            merged.push(tag.clone());
        }
    }
    merged
}
