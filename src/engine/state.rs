// engine/state.rs — Shared engine state and wiring.
// Canonical home for EngineState: the store, the event bus, settings, the
// adapter registry and the operation facades the HTTP layer calls into.
// Worker processes are spawned from here so main.rs stays a thin shell.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{info, warn};
use serde_json::json;
use tokio::sync::Notify;

use crate::atoms::constants::PUSH_LEASE_SECS;
use crate::atoms::error::EngineResult;
use crate::atoms::types::{Content, EventKind, LayoutType};
use crate::engine::adapters::AdapterRegistry;
use crate::engine::archive::MediaArchiver;
use crate::engine::bots::BotOps;
use crate::engine::events::EventBus;
use crate::engine::parse_worker::ParseWorker;
use crate::engine::push_worker::PushWorker;
use crate::engine::queue_ops::QueueOps;
use crate::engine::settings::{keys, Settings};
use crate::engine::storage::BlobStorage;
use crate::engine::store::{NewShare, Store};
use crate::engine::transports::{DefaultServiceFactory, ServiceFactory};
use crate::engine::{matcher, paths};

/// A share submission as accepted by the API, before platform routing.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct ShareRequest {
    pub url: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub source: Option<String>,
    pub note: Option<String>,
    pub is_nsfw: Option<bool>,
    pub layout_type_override: Option<String>,
}

pub struct EngineState {
    pub store: Arc<Store>,
    pub bus: Arc<EventBus>,
    pub settings: Arc<Settings>,
    pub registry: Arc<AdapterRegistry>,
    pub storage: Arc<BlobStorage>,
    pub queue_ops: QueueOps,
    pub bot_ops: BotOps,
    pub push_wake: Arc<Notify>,
    pub stop: Arc<AtomicBool>,
    factory: Arc<dyn ServiceFactory>,
}

impl EngineState {
    pub fn open(db_path: &Path) -> EngineResult<Self> {
        let store = Arc::new(Store::open(db_path)?);
        Self::build(store, Arc::new(DefaultServiceFactory))
    }

    /// In-memory state for the test suite; takes the transport factory so
    /// tests can substitute a mock platform.
    pub fn for_testing(factory: Arc<dyn ServiceFactory>) -> EngineResult<Self> {
        let store = Arc::new(Store::open_in_memory()?);
        Self::build(store, factory)
    }

    fn build(store: Arc<Store>, factory: Arc<dyn ServiceFactory>) -> EngineResult<Self> {
        let settings = Arc::new(Settings::new(Arc::clone(&store)));
        let bus = Arc::new(EventBus::new(Arc::clone(&store)));
        let registry = Arc::new(AdapterRegistry::new(Arc::clone(&settings))?);

        let storage_root = settings
            .get(keys::STORAGE_LOCAL_ROOT)
            .map(std::path::PathBuf::from)
            .unwrap_or_else(paths::media_dir);
        let storage = Arc::new(BlobStorage::new(storage_root, settings.get(keys::STORAGE_PUBLIC_BASE_URL))?);

        let push_wake = Arc::new(Notify::new());
        let queue_ops = QueueOps::new(Arc::clone(&store), Arc::clone(&bus), Arc::clone(&push_wake));
        let bot_ops = BotOps::new(Arc::clone(&store), Arc::clone(&bus), Arc::clone(&factory));

        // Startup housekeeping: a crashed run leaves `processing` contents
        // and expired item leases behind; both re-enter their queues here.
        let stale_contents = store.recover_stale_processing()?;
        for content_id in &stale_contents {
            store.enqueue_parse_if_absent(*content_id)?;
        }
        let recovered = store.recover_expired_leases(PUSH_LEASE_SECS)?;
        if !stale_contents.is_empty() || recovered > 0 {
            warn!(
                "[engine] Recovered {} stale parse(s), {} expired push lease(s)",
                stale_contents.len(),
                recovered
            );
        }

        Ok(EngineState {
            store,
            bus,
            settings,
            registry,
            storage,
            queue_ops,
            bot_ops,
            push_wake,
            stop: Arc::new(AtomicBool::new(false)),
            factory,
        })
    }

    // ── Submission (C4 routing + C3 enqueue) ───────────────────────────

    /// Route a submitted URL, record the share, and queue the parse.
    /// Re-submission of a known canonical URL returns the existing content.
    pub async fn submit_share(&self, request: &ShareRequest) -> EngineResult<(Content, bool)> {
        let layout_override = match &request.layout_type_override {
            Some(raw) => Some(LayoutType::parse(raw).ok_or_else(|| {
                crate::atoms::error::EngineError::Validation(format!("invalid layout_type_override '{raw}'"))
            })?),
            None => None,
        };

        let route = self.registry.route(&request.url).await?;
        let share = NewShare {
            platform: route.platform,
            url: request.url.clone(),
            canonical_url: route.canonical_url,
            tags: request.tags.clone(),
            source: request.source.clone(),
            note: request.note.clone(),
            is_nsfw: request.is_nsfw,
            layout_type_override: layout_override,
        };

        let (content, created) = self.store.submit_share(&share)?;
        self.store.enqueue_parse_if_absent(content.id)?;

        if created {
            info!("[engine] New content {} ({}) from {}", content.id, content.platform, content.url);
            self.bus.publish(
                EventKind::ContentCreated,
                json!({ "content_id": content.id, "platform": content.platform }),
            );
        }
        Ok((content, created))
    }

    /// Queue a forced re-parse of an existing content.
    pub fn request_reparse(&self, content_id: i64) -> EngineResult<()> {
        self.store.get_content(content_id)?;
        self.store.enqueue_task(
            crate::atoms::types::TaskKind::Parse,
            &json!({ "content_id": content_id, "forced": true }),
            10,
        )?;
        Ok(())
    }

    /// Human review decision; delegates to the match engine.
    pub fn review_content(
        &self,
        content_id: i64,
        approve: bool,
        by: Option<&str>,
        note: Option<&str>,
    ) -> EngineResult<Content> {
        let content = matcher::review_content(&self.store, &self.bus, content_id, approve, by, note)?;
        if approve {
            self.push_wake.notify_one();
        }
        Ok(content)
    }

    // ── Worker lifecycle ───────────────────────────────────────────────

    /// Spawn the outbox poller, parse worker and push worker. Handles run
    /// until `self.stop` flips.
    pub fn spawn_workers(self: &Arc<Self>) -> EngineResult<Vec<tokio::task::JoinHandle<()>>> {
        let mut handles = Vec::new();

        handles.push(self.bus.spawn_outbox_poller(Arc::clone(&self.stop)));

        let archiver = self.build_archiver()?;
        let parse_worker = Arc::new(ParseWorker::new(
            Arc::clone(&self.store),
            Arc::clone(&self.bus),
            Arc::clone(&self.registry) as Arc<dyn crate::engine::parse_worker::ContentParser>,
            archiver,
            Arc::clone(&self.settings),
        ));
        handles.push(parse_worker.spawn(Arc::clone(&self.stop)));

        let push_worker = Arc::new(PushWorker::new(
            Arc::clone(&self.store),
            Arc::clone(&self.bus),
            Arc::clone(&self.factory),
            Arc::clone(&self.push_wake),
        ));
        handles.push(push_worker.spawn(Arc::clone(&self.stop)));

        Ok(handles)
    }

    fn build_archiver(&self) -> EngineResult<Option<Arc<MediaArchiver>>> {
        if !self.settings.get_bool(keys::ENABLE_ARCHIVE_MEDIA_PROCESSING, true) {
            return Ok(None);
        }
        let quality = self.settings.get_u32(keys::ARCHIVE_IMAGE_WEBP_QUALITY, 82).min(100) as u8;
        let max_images = self.settings.get_u32(keys::ARCHIVE_IMAGE_MAX_COUNT, 9) as usize;
        Ok(Some(Arc::new(MediaArchiver::new(Arc::clone(&self.storage), quality, max_images)?)))
    }

    /// Flip the shared stop flag; workers notice within one poll.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Relaxed);
        self.push_wake.notify_waiters();
        info!("[engine] Shutdown requested");
    }
}
