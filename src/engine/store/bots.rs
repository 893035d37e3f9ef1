use rusqlite::{params, OptionalExtension};

use super::Store;
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{BotChat, BotConfig, BotPlatform};
use crate::engine::clock::now_iso;

const BOT_COLS: &str = "id, platform, name, enabled, is_primary, bot_token, napcat_http_url, \
     napcat_ws_url, bot_id, bot_username, created_at, updated_at";

const CHAT_COLS: &str = "id, bot_config_id, chat_id, chat_type, title, username, is_accessible, \
     enabled, can_post, total_pushed, last_pushed_at, nsfw_chat_id";

impl BotConfig {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(BotConfig {
            id: row.get(0)?,
            platform: BotPlatform::parse(&row.get::<_, String>(1)?).unwrap_or(BotPlatform::Telegram),
            name: row.get(2)?,
            enabled: row.get::<_, i64>(3)? != 0,
            is_primary: row.get::<_, i64>(4)? != 0,
            bot_token: row.get(5)?,
            napcat_http_url: row.get(6)?,
            napcat_ws_url: row.get(7)?,
            bot_id: row.get(8)?,
            bot_username: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }
}

impl BotChat {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(BotChat {
            id: row.get(0)?,
            bot_config_id: row.get(1)?,
            chat_id: row.get(2)?,
            chat_type: row.get(3)?,
            title: row.get(4)?,
            username: row.get(5)?,
            is_accessible: row.get::<_, i64>(6)? != 0,
            enabled: row.get::<_, i64>(7)? != 0,
            can_post: row.get::<_, i64>(8)? != 0,
            total_pushed: row.get(9)?,
            last_pushed_at: row.get(10)?,
            nsfw_chat_id: row.get(11)?,
        })
    }
}

/// A chat as reported by the platform during `sync_chats`.
#[derive(Debug, Clone)]
pub struct DiscoveredChat {
    pub chat_id: String,
    pub chat_type: String,
    pub title: String,
    pub username: Option<String>,
    pub can_post: bool,
}

/// What `upsert_chat` did, so sync jobs can report created/updated counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatUpsert {
    Created,
    Updated,
}

impl Store {
    // ── Bot configs ────────────────────────────────────────────────────

    pub fn create_bot(&self, bot: &BotConfig) -> EngineResult<i64> {
        let conn = self.conn.lock();
        let now = now_iso();
        if bot.is_primary {
            conn.execute(
                "UPDATE bot_configs SET is_primary=0, updated_at=?2 WHERE platform=?1",
                params![bot.platform.as_str(), now],
            )?;
        }
        conn.execute(
            "INSERT INTO bot_configs (platform, name, enabled, is_primary, bot_token,
                                      napcat_http_url, napcat_ws_url, bot_id, bot_username,
                                      created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?10)",
            params![
                bot.platform.as_str(),
                bot.name,
                bot.enabled as i64,
                bot.is_primary as i64,
                bot.bot_token,
                bot.napcat_http_url,
                bot.napcat_ws_url,
                bot.bot_id,
                bot.bot_username,
                now,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn update_bot(&self, bot: &BotConfig) -> EngineResult<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE bot_configs SET name=?2, enabled=?3, bot_token=?4, napcat_http_url=?5,
                    napcat_ws_url=?6, bot_id=?7, bot_username=?8, updated_at=?9
             WHERE id=?1",
            params![
                bot.id,
                bot.name,
                bot.enabled as i64,
                bot.bot_token,
                bot.napcat_http_url,
                bot.napcat_ws_url,
                bot.bot_id,
                bot.bot_username,
                now_iso(),
            ],
        )?;
        if changed == 0 {
            return Err(EngineError::NotFound(format!("bot {}", bot.id)));
        }
        Ok(())
    }

    /// Flip `is_primary` to this bot, clearing others on the same platform
    /// in the same statement batch so the invariant never breaks.
    pub fn activate_bot(&self, id: i64) -> EngineResult<BotConfig> {
        {
            let conn = self.conn.lock();
            let platform: Option<String> = conn
                .query_row("SELECT platform FROM bot_configs WHERE id=?1", params![id], |r| r.get(0))
                .optional()?;
            let platform = platform.ok_or_else(|| EngineError::NotFound(format!("bot {id}")))?;
            let now = now_iso();
            conn.execute(
                "UPDATE bot_configs SET is_primary = (id = ?2), updated_at=?3 WHERE platform=?1",
                params![platform, id, now],
            )?;
        }
        self.get_bot(id)
    }

    pub fn delete_bot(&self, id: i64) -> EngineResult<()> {
        let conn = self.conn.lock();
        let now = now_iso();
        // Queue items pointing at this bot's chats are orphaned → canceled.
        conn.execute(
            "UPDATE content_queue SET status='canceled', completed_at=?2, updated_at=?2
             WHERE bot_chat_id IN (SELECT id FROM bot_chats WHERE bot_config_id=?1)
               AND status IN ('pending','scheduled','processing')",
            params![id, now],
        )?;
        let deleted = conn.execute("DELETE FROM bot_configs WHERE id=?1", params![id])?;
        if deleted == 0 {
            return Err(EngineError::NotFound(format!("bot {id}")));
        }
        Ok(())
    }

    pub fn get_bot(&self, id: i64) -> EngineResult<BotConfig> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {BOT_COLS} FROM bot_configs WHERE id=?1"),
            params![id],
            BotConfig::from_row,
        )
        .optional()?
        .ok_or_else(|| EngineError::NotFound(format!("bot {id}")))
    }

    pub fn list_bots(&self) -> EngineResult<Vec<BotConfig>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare(&format!("SELECT {BOT_COLS} FROM bot_configs ORDER BY platform, id ASC"))?;
        let bots = stmt.query_map([], BotConfig::from_row)?.filter_map(|r| r.ok()).collect();
        Ok(bots)
    }

    /// Record the identity discovered by the first successful probe.
    pub fn set_bot_identity(&self, id: i64, bot_id: &str, bot_username: &str) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE bot_configs SET bot_id=?2, bot_username=?3, updated_at=?4 WHERE id=?1",
            params![id, bot_id, bot_username, now_iso()],
        )?;
        Ok(())
    }

    // ── Chats ──────────────────────────────────────────────────────────

    pub fn upsert_chat(&self, bot_config_id: i64, chat: &DiscoveredChat) -> EngineResult<ChatUpsert> {
        let conn = self.conn.lock();
        let existing: Option<i64> = conn
            .query_row(
                "SELECT id FROM bot_chats WHERE bot_config_id=?1 AND chat_id=?2",
                params![bot_config_id, chat.chat_id],
                |r| r.get(0),
            )
            .optional()?;
        match existing {
            Some(id) => {
                conn.execute(
                    "UPDATE bot_chats SET chat_type=?2, title=?3, username=?4, is_accessible=1, can_post=?5
                     WHERE id=?1",
                    params![id, chat.chat_type, chat.title, chat.username, chat.can_post as i64],
                )?;
                Ok(ChatUpsert::Updated)
            }
            None => {
                conn.execute(
                    "INSERT INTO bot_chats (bot_config_id, chat_id, chat_type, title, username,
                                            is_accessible, enabled, can_post)
                     VALUES (?1,?2,?3,?4,?5,1,1,?6)",
                    params![
                        bot_config_id,
                        chat.chat_id,
                        chat.chat_type,
                        chat.title,
                        chat.username,
                        chat.can_post as i64,
                    ],
                )?;
                Ok(ChatUpsert::Created)
            }
        }
    }

    /// Chats absent from the latest sync flip to inaccessible instead of
    /// being deleted, so push history and rule targets survive.
    pub fn mark_chats_inaccessible_except(&self, bot_config_id: i64, seen: &[String]) -> EngineResult<usize> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT id, chat_id FROM bot_chats WHERE bot_config_id=?1 AND is_accessible=1")?;
        let rows: Vec<(i64, String)> = stmt
            .query_map(params![bot_config_id], |r| Ok((r.get(0)?, r.get(1)?)))?
            .filter_map(|r| r.ok())
            .collect();
        let mut flipped = 0;
        for (id, chat_id) in rows {
            if !seen.contains(&chat_id) {
                conn.execute("UPDATE bot_chats SET is_accessible=0 WHERE id=?1", params![id])?;
                flipped += 1;
            }
        }
        Ok(flipped)
    }

    pub fn get_chat(&self, id: i64) -> EngineResult<BotChat> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {CHAT_COLS} FROM bot_chats WHERE id=?1"),
            params![id],
            BotChat::from_row,
        )
        .optional()?
        .ok_or_else(|| EngineError::NotFound(format!("bot chat {id}")))
    }

    pub fn list_chats(&self, bot_config_id: i64) -> EngineResult<Vec<BotChat>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {CHAT_COLS} FROM bot_chats WHERE bot_config_id=?1 ORDER BY title, id ASC"
        ))?;
        let chats = stmt
            .query_map(params![bot_config_id], BotChat::from_row)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(chats)
    }

    /// Chat counters are bumped in the same transaction that records the
    /// pushed record, from the push worker's success path.
    pub fn bump_chat_counters(&self, chat_id: i64) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE bot_chats SET total_pushed = total_pushed + 1, last_pushed_at=?2 WHERE id=?1",
            params![chat_id, now_iso()],
        )?;
        Ok(())
    }
}
