// Database schema and migrations for the VaultStream store.
// Called once at startup by Store::open() after WAL is enabled.
// Adding a new table or column: append an idempotent CREATE TABLE IF NOT
// EXISTS or ALTER TABLE … ADD COLUMN (errors are silently swallowed) at the
// end of run_migrations() — never modify existing SQL to keep upgrade paths
// clean.

use crate::atoms::error::EngineResult;
use rusqlite::Connection;

pub(crate) fn run_migrations(conn: &Connection) -> EngineResult<()> {
    // ── Contents & sources ───────────────────────────────────────────
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS contents (
            id INTEGER PRIMARY KEY,
            platform TEXT NOT NULL,
            platform_id TEXT NOT NULL DEFAULT '',
            url TEXT NOT NULL,
            canonical_url TEXT NOT NULL,
            clean_url TEXT,
            title TEXT NOT NULL DEFAULT '',
            description TEXT NOT NULL DEFAULT '',
            author_name TEXT,
            author_id TEXT,
            author_avatar_url TEXT,
            author_url TEXT,
            cover_url TEXT,
            cover_color TEXT,
            media_urls TEXT NOT NULL DEFAULT '[]',
            tags TEXT NOT NULL DEFAULT '[]',
            is_nsfw INTEGER NOT NULL DEFAULT 0,
            layout_type TEXT,
            layout_type_override TEXT,
            content_type TEXT,
            extra_stats TEXT,
            raw_metadata TEXT,
            status TEXT NOT NULL DEFAULT 'unprocessed',
            review_status TEXT NOT NULL DEFAULT 'pending',
            failure_count INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            last_error_type TEXT,
            last_error_at TEXT,
            reviewed_at TEXT,
            reviewed_by TEXT,
            reviewed_note TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE (platform, canonical_url)
        );

        CREATE INDEX IF NOT EXISTS idx_contents_status ON contents(status);
        CREATE INDEX IF NOT EXISTS idx_contents_review ON contents(review_status);
        CREATE INDEX IF NOT EXISTS idx_contents_platform ON contents(platform);

        CREATE TABLE IF NOT EXISTS content_sources (
            id INTEGER PRIMARY KEY,
            content_id INTEGER NOT NULL,
            url TEXT NOT NULL,
            tags TEXT NOT NULL DEFAULT '[]',
            note TEXT,
            source TEXT,
            submitted_at TEXT NOT NULL,
            FOREIGN KEY (content_id) REFERENCES contents(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_sources_content ON content_sources(content_id);
        ",
    )?;

    // ── Rules & targets ──────────────────────────────────────────────
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS distribution_rules (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            enabled INTEGER NOT NULL DEFAULT 1,
            priority INTEGER NOT NULL DEFAULT 0,
            match_conditions TEXT NOT NULL DEFAULT '{}',
            nsfw_policy TEXT NOT NULL DEFAULT 'block',
            approval_required INTEGER NOT NULL DEFAULT 0,
            auto_approve_conditions TEXT,
            rate_limit INTEGER,
            time_window_secs INTEGER,
            render_config TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS distribution_targets (
            id INTEGER PRIMARY KEY,
            rule_id INTEGER NOT NULL,
            bot_chat_id INTEGER NOT NULL,
            enabled INTEGER NOT NULL DEFAULT 1,
            merge_forward INTEGER NOT NULL DEFAULT 0,
            use_author_name INTEGER NOT NULL DEFAULT 0,
            summary TEXT,
            render_config_override TEXT,
            UNIQUE (rule_id, bot_chat_id),
            FOREIGN KEY (rule_id) REFERENCES distribution_rules(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_targets_rule ON distribution_targets(rule_id);
        ",
    )?;

    // ── Bots & chats ─────────────────────────────────────────────────
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS bot_configs (
            id INTEGER PRIMARY KEY,
            platform TEXT NOT NULL,
            name TEXT NOT NULL,
            enabled INTEGER NOT NULL DEFAULT 1,
            is_primary INTEGER NOT NULL DEFAULT 0,
            bot_token TEXT,
            napcat_http_url TEXT,
            napcat_ws_url TEXT,
            bot_id TEXT,
            bot_username TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS bot_chats (
            id INTEGER PRIMARY KEY,
            bot_config_id INTEGER NOT NULL,
            chat_id TEXT NOT NULL,
            chat_type TEXT NOT NULL DEFAULT '',
            title TEXT NOT NULL DEFAULT '',
            username TEXT,
            is_accessible INTEGER NOT NULL DEFAULT 1,
            enabled INTEGER NOT NULL DEFAULT 1,
            can_post INTEGER NOT NULL DEFAULT 1,
            total_pushed INTEGER NOT NULL DEFAULT 0,
            last_pushed_at TEXT,
            nsfw_chat_id TEXT,
            UNIQUE (bot_config_id, chat_id),
            FOREIGN KEY (bot_config_id) REFERENCES bot_configs(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_chats_bot ON bot_chats(bot_config_id);
        ",
    )?;

    // ── Queue items ──────────────────────────────────────────────────
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS content_queue (
            id INTEGER PRIMARY KEY,
            content_id INTEGER NOT NULL,
            rule_id INTEGER NOT NULL,
            bot_chat_id INTEGER NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            scheduled_at TEXT,
            priority INTEGER NOT NULL DEFAULT 0,
            next_attempt_at TEXT,
            attempt_count INTEGER NOT NULL DEFAULT 0,
            max_attempts INTEGER NOT NULL DEFAULT 3,
            locked_at TEXT,
            locked_by TEXT,
            message_id TEXT,
            rendered_payload TEXT,
            last_error TEXT,
            last_error_type TEXT,
            last_error_at TEXT,
            started_at TEXT,
            completed_at TEXT,
            needs_approval INTEGER NOT NULL DEFAULT 0,
            approved_at TEXT,
            approved_by TEXT,
            nsfw_routing_result TEXT,
            passed_rate_limit INTEGER NOT NULL DEFAULT 1,
            rate_limit_reason TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE (content_id, rule_id, bot_chat_id)
        );

        CREATE INDEX IF NOT EXISTS idx_queue_due
            ON content_queue(status, scheduled_at);
        CREATE INDEX IF NOT EXISTS idx_queue_content ON content_queue(content_id);
        CREATE INDEX IF NOT EXISTS idx_queue_rule ON content_queue(rule_id);
        ",
    )?;

    // ── Pushed records ───────────────────────────────────────────────
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS pushed_records (
            id INTEGER PRIMARY KEY,
            content_id INTEGER NOT NULL,
            target_id INTEGER NOT NULL,
            message_id TEXT NOT NULL DEFAULT '',
            push_status TEXT NOT NULL DEFAULT 'success',
            pushed_at TEXT NOT NULL,
            error_message TEXT,
            UNIQUE (content_id, target_id),
            FOREIGN KEY (content_id) REFERENCES contents(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_pushed_target_time
            ON pushed_records(target_id, pushed_at);
        ",
    )?;

    // ── Durable tasks ────────────────────────────────────────────────
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS tasks (
            id INTEGER PRIMARY KEY,
            kind TEXT NOT NULL,
            payload TEXT NOT NULL DEFAULT '{}',
            status TEXT NOT NULL DEFAULT 'pending',
            priority INTEGER NOT NULL DEFAULT 0,
            retry_count INTEGER NOT NULL DEFAULT 0,
            max_attempts INTEGER NOT NULL DEFAULT 3,
            scheduled_for TEXT,
            claimed_by TEXT,
            claimed_at TEXT,
            error TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_tasks_claim
            ON tasks(status, kind, scheduled_for);
        ",
    )?;

    // ── Realtime event outbox ────────────────────────────────────────
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS realtime_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            kind TEXT NOT NULL,
            payload TEXT NOT NULL DEFAULT '{}',
            origin TEXT NOT NULL,
            created_at TEXT NOT NULL
        );
        ",
    )?;

    // ── Settings ─────────────────────────────────────────────────────
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        ",
    )?;

    Ok(())
}
