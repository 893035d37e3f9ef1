// VaultStream Engine — Bot Registry Operations
//
// Lifecycle of bot accounts and their chat registry. `sync_chats` pulls the
// platform's current chat list through the transport and upserts it,
// emitting `bot_sync_progress` along the way and `bot_sync_completed` with
// the tally at the end. A per-bot in-memory lock rejects concurrent syncs
// of the same account; different bots sync freely in parallel.

use std::collections::HashSet;
use std::sync::Arc;

use log::{info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;

use crate::atoms::constants::SYNC_PROGRESS_EVERY;
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{BotConfig, EventKind};
use crate::engine::events::EventBus;
use crate::engine::store::{ChatUpsert, Store};
use crate::engine::transports::ServiceFactory;

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub total: usize,
    pub created: usize,
    pub updated: usize,
    pub failed: usize,
    pub went_inaccessible: usize,
}

pub struct BotOps {
    store: Arc<Store>,
    bus: Arc<EventBus>,
    factory: Arc<dyn ServiceFactory>,
    syncing: Mutex<HashSet<i64>>,
}

/// Releases the per-bot sync lock on scope exit, success or error.
struct SyncGuard<'a> {
    ops: &'a BotOps,
    bot_id: i64,
}

impl Drop for SyncGuard<'_> {
    fn drop(&mut self) {
        self.ops.syncing.lock().remove(&self.bot_id);
    }
}

impl BotOps {
    pub fn new(store: Arc<Store>, bus: Arc<EventBus>, factory: Arc<dyn ServiceFactory>) -> Self {
        BotOps { store, bus, factory, syncing: Mutex::new(HashSet::new()) }
    }

    // ── CRUD wrappers ──────────────────────────────────────────────────

    pub fn create(&self, bot: &BotConfig) -> EngineResult<BotConfig> {
        let id = self.store.create_bot(bot)?;
        let created = self.store.get_bot(id)?;
        self.emit_status(&created, "created");
        Ok(created)
    }

    pub fn update(&self, bot: &BotConfig) -> EngineResult<BotConfig> {
        self.store.update_bot(bot)?;
        let updated = self.store.get_bot(bot.id)?;
        self.emit_status(&updated, "updated");
        Ok(updated)
    }

    pub fn delete(&self, id: i64) -> EngineResult<()> {
        let bot = self.store.get_bot(id)?;
        self.store.delete_bot(id)?;
        self.emit_status(&bot, "deleted");
        Ok(())
    }

    /// Make this bot the primary for its platform (clearing siblings).
    pub fn activate(&self, id: i64) -> EngineResult<BotConfig> {
        let activated = self.store.activate_bot(id)?;
        self.emit_status(&activated, "activated");
        Ok(activated)
    }

    // ── Chat sync ──────────────────────────────────────────────────────

    /// Pull the bot's joinable chats from the platform and reconcile the
    /// registry. Progress events fire per `SYNC_PROGRESS_EVERY` upserts.
    pub async fn sync_chats(&self, bot_id: i64) -> EngineResult<SyncReport> {
        {
            let mut syncing = self.syncing.lock();
            if !syncing.insert(bot_id) {
                return Err(EngineError::Conflict(format!("bot {bot_id} is already syncing")));
            }
        }
        let _guard = SyncGuard { ops: self, bot_id };

        let bot = self.store.get_bot(bot_id)?;
        let service = self.factory.service(&bot)?;

        // Refresh discovered identity on every sync; it is cheap and keys
        // the frontend's display.
        match service.probe().await {
            Ok(identity) => {
                self.store.set_bot_identity(bot_id, &identity.id, &identity.username)?;
            }
            Err(e) => {
                warn!("[bots] Probe failed for bot {}: {}", bot_id, e);
                return Err(EngineError::transport(
                    bot.platform.as_str(),
                    e.to_string(),
                    e.is_retryable(),
                ));
            }
        }

        let chats = service
            .list_chats()
            .await
            .map_err(|e| EngineError::transport(bot.platform.as_str(), e.to_string(), e.is_retryable()))?;

        let mut report = SyncReport { total: chats.len(), ..Default::default() };
        let mut seen: Vec<String> = Vec::with_capacity(chats.len());

        for (index, chat) in chats.iter().enumerate() {
            match self.store.upsert_chat(bot_id, chat) {
                Ok(ChatUpsert::Created) => report.created += 1,
                Ok(ChatUpsert::Updated) => report.updated += 1,
                Err(e) => {
                    warn!("[bots] Upsert of chat {} failed: {}", chat.chat_id, e);
                    report.failed += 1;
                }
            }
            seen.push(chat.chat_id.clone());

            if (index + 1) % SYNC_PROGRESS_EVERY == 0 {
                self.bus.publish(
                    EventKind::BotSyncProgress,
                    json!({ "bot_id": bot_id, "processed": index + 1, "total": report.total }),
                );
            }
        }

        report.went_inaccessible = self.store.mark_chats_inaccessible_except(bot_id, &seen)?;

        info!(
            "[bots] Sync of bot {} done: {} created, {} updated, {} failed, {} gone",
            bot_id, report.created, report.updated, report.failed, report.went_inaccessible
        );
        self.bus.publish(
            EventKind::BotSyncCompleted,
            json!({
                "bot_id": bot_id,
                "updated": report.updated,
                "created": report.created,
                "failed": report.failed,
                "total": report.total,
            }),
        );
        Ok(report)
    }

    /// QR login payload for platforms with QR flows.
    pub async fn get_qr(&self, bot_id: i64) -> EngineResult<Option<String>> {
        let bot = self.store.get_bot(bot_id)?;
        let service = self.factory.service(&bot)?;
        service
            .get_qr()
            .await
            .map_err(|e| EngineError::transport(bot.platform.as_str(), e.to_string(), e.is_retryable()))
    }

    fn emit_status(&self, bot: &BotConfig, change: &str) {
        self.bus.publish(
            EventKind::BotStatusChanged,
            json!({
                "bot_id": bot.id,
                "platform": bot.platform.as_str(),
                "enabled": bot.enabled,
                "is_primary": bot.is_primary,
                "change": change,
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::BotPlatform;
    use crate::engine::store::DiscoveredChat;
    use crate::engine::transports::{
        BotIdentity, PlatformService, RenderedMessage, SendOutcome, TransportError,
    };
    use async_trait::async_trait;

    struct ChatListService {
        chats: Vec<DiscoveredChat>,
    }

    #[async_trait]
    impl PlatformService for ChatListService {
        fn platform(&self) -> BotPlatform {
            BotPlatform::Telegram
        }
        async fn probe(&self) -> Result<BotIdentity, TransportError> {
            Ok(BotIdentity { id: "42".into(), username: "syncbot".into() })
        }
        async fn send(&self, _c: &str, _m: &RenderedMessage) -> Result<SendOutcome, TransportError> {
            unimplemented!("not used in sync tests")
        }
        async fn send_forward(
            &self,
            _c: &str,
            _m: &[RenderedMessage],
        ) -> Result<SendOutcome, TransportError> {
            unimplemented!("not used in sync tests")
        }
        async fn list_chats(&self) -> Result<Vec<DiscoveredChat>, TransportError> {
            Ok(self.chats.clone())
        }
    }

    struct FixedFactory(Arc<ChatListService>);

    impl ServiceFactory for FixedFactory {
        fn service(&self, _bot: &BotConfig) -> EngineResult<Arc<dyn PlatformService>> {
            Ok(Arc::clone(&self.0) as Arc<dyn PlatformService>)
        }
    }

    fn chat(id: &str, title: &str) -> DiscoveredChat {
        DiscoveredChat {
            chat_id: id.into(),
            chat_type: "group".into(),
            title: title.into(),
            username: None,
            can_post: true,
        }
    }

    fn ops_with(chats: Vec<DiscoveredChat>) -> (Arc<Store>, BotOps, i64) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let bus = Arc::new(EventBus::new(Arc::clone(&store)));
        let factory = Arc::new(FixedFactory(Arc::new(ChatListService { chats })));
        let ops = BotOps::new(Arc::clone(&store), bus, factory);
        let bot_id = store
            .create_bot(&BotConfig {
                id: 0,
                platform: BotPlatform::Telegram,
                name: "b".into(),
                enabled: true,
                is_primary: true,
                bot_token: Some("t".into()),
                napcat_http_url: None,
                napcat_ws_url: None,
                bot_id: None,
                bot_username: None,
                created_at: String::new(),
                updated_at: String::new(),
            })
            .unwrap();
        (store, ops, bot_id)
    }

    #[tokio::test]
    async fn sync_upserts_and_reconciles() {
        let (store, ops, bot_id) = ops_with(vec![chat("-1", "alpha"), chat("-2", "beta")]);

        let report = ops.sync_chats(bot_id).await.unwrap();
        assert_eq!(report.total, 2);
        assert_eq!(report.created, 2);
        assert_eq!(report.updated, 0);

        // Identity captured by the probe.
        let bot = store.get_bot(bot_id).unwrap();
        assert_eq!(bot.bot_id.as_deref(), Some("42"));
        assert_eq!(bot.bot_username.as_deref(), Some("syncbot"));

        // Second sync updates instead of duplicating.
        let report = ops.sync_chats(bot_id).await.unwrap();
        assert_eq!(report.created, 0);
        assert_eq!(report.updated, 2);
        assert_eq!(store.list_chats(bot_id).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn chats_absent_from_sync_go_inaccessible() {
        let (store, ops, bot_id) = ops_with(vec![chat("-1", "alpha")]);
        store.upsert_chat(bot_id, &chat("-9", "stale")).unwrap();

        let report = ops.sync_chats(bot_id).await.unwrap();
        assert_eq!(report.went_inaccessible, 1);

        let chats = store.list_chats(bot_id).unwrap();
        let stale = chats.iter().find(|c| c.chat_id == "-9").unwrap();
        assert!(!stale.is_accessible);
        let fresh = chats.iter().find(|c| c.chat_id == "-1").unwrap();
        assert!(fresh.is_accessible);
    }

    #[tokio::test]
    async fn completed_event_carries_the_tally() {
        let (store, ops, bot_id) = ops_with(vec![chat("-1", "alpha")]);
        let _ = store;
        let mut rx = ops.bus.subscribe();
        ops.sync_chats(bot_id).await.unwrap();

        let mut saw_completed = false;
        while let Ok(event) = rx.try_recv() {
            if event.kind == "bot_sync_completed" {
                assert_eq!(event.payload["created"], 1);
                assert_eq!(event.payload["total"], 1);
                saw_completed = true;
            }
        }
        assert!(saw_completed);
    }
}
