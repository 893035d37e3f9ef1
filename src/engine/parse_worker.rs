// VaultStream Engine — Parse Worker
//
// Claims `parse` tasks from the durable queue and runs the pipeline:
//   claim → adapter parse → archive media → persist → auto-approve check →
//   match & enqueue → emit.
// Several tasks run concurrently up to the configured parallelism. Adapter
// errors follow their retry class: transient ones reschedule the task with
// backoff; auth/not-found failures mark the content `failed` and
// dead-letter the task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use log::{error, info, warn};
use serde_json::{json, Value};

use crate::atoms::constants::{PARSE_CONCURRENCY_DEFAULT, TASK_LEASE_SECS};
use crate::atoms::error::{EngineError, EngineResult, ErrorKind};
use crate::atoms::types::{EventKind, ParsedContent, ReviewStatus, Task, TaskKind};
use crate::engine::adapters::{AdapterError, AdapterRegistry};
use crate::engine::archive::{archive_metadata, MediaArchiver};
use crate::engine::clock::iso_in_ms;
use crate::engine::events::EventBus;
use crate::engine::http::backoff_delay_ms;
use crate::engine::matcher;
use crate::engine::settings::{keys, Settings};
use crate::engine::store::Store;

/// How often an idle worker re-checks the task queue.
const IDLE_POLL_SECS: u64 = 2;

/// What a parser turns a URL into. The registry is the production
/// implementation; tests substitute a canned one.
#[async_trait]
pub trait ContentParser: Send + Sync {
    async fn parse_url(&self, url: &str) -> Result<ParsedContent, AdapterError>;
}

#[async_trait]
impl ContentParser for AdapterRegistry {
    async fn parse_url(&self, url: &str) -> Result<ParsedContent, AdapterError> {
        let route = self.route(url).await.map_err(|e| match e.kind() {
            ErrorKind::Validation => AdapterError::NotFound(e.to_string()),
            _ => AdapterError::Transient(e.to_string()),
        })?;
        route.adapter.parse(&route.resolved_url, self.context()).await
    }
}

pub struct ParseWorker {
    pub store: Arc<Store>,
    pub bus: Arc<EventBus>,
    pub parser: Arc<dyn ContentParser>,
    pub archiver: Option<Arc<MediaArchiver>>,
    pub settings: Arc<Settings>,
    pub worker_id: String,
    pub concurrency: usize,
}

impl ParseWorker {
    pub fn new(
        store: Arc<Store>,
        bus: Arc<EventBus>,
        parser: Arc<dyn ContentParser>,
        archiver: Option<Arc<MediaArchiver>>,
        settings: Arc<Settings>,
    ) -> Self {
        ParseWorker {
            store,
            bus,
            parser,
            archiver,
            settings,
            worker_id: format!("parse-{}", uuid::Uuid::new_v4()),
            concurrency: PARSE_CONCURRENCY_DEFAULT,
        }
    }

    /// Run until the stop flag flips. Claims up to `concurrency` tasks per
    /// round and handles them concurrently.
    pub fn spawn(self: Arc<Self>, stop: Arc<AtomicBool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!("[parse] Worker {} started", self.worker_id);
            loop {
                if stop.load(Ordering::Relaxed) {
                    break;
                }
                let claimed = match self.store.claim_tasks(
                    &self.worker_id,
                    &[TaskKind::Parse],
                    self.concurrency as u32,
                    TASK_LEASE_SECS,
                ) {
                    Ok(tasks) => tasks,
                    Err(e) => {
                        error!("[parse] Claim failed: {}", e);
                        Vec::new()
                    }
                };

                if claimed.is_empty() {
                    tokio::time::sleep(std::time::Duration::from_secs(IDLE_POLL_SECS)).await;
                    continue;
                }

                let handles: Vec<_> = claimed
                    .into_iter()
                    .map(|task| {
                        let worker = Arc::clone(&self);
                        tokio::spawn(async move { worker.handle_task(task).await })
                    })
                    .collect();
                for handle in handles {
                    let _ = handle.await;
                }
            }
            info!("[parse] Worker {} stopped", self.worker_id);
        })
    }

    /// One claimed task: run the parse, then settle the task row by the
    /// failure's retry class.
    pub async fn handle_task(&self, task: Task) {
        let Some(content_id) = task.payload["content_id"].as_i64() else {
            warn!("[parse] Task {} has no content_id; dead-lettering", task.id);
            self.store.kill_task(task.id, "payload missing content_id").ok();
            return;
        };
        let forced = task.payload["forced"].as_bool().unwrap_or(false);

        match self.run_parse(content_id, forced).await {
            Ok(()) => {
                self.store.complete_task(task.id).ok();
            }
            Err(e) if e.is_retryable() => {
                let delay_ms = backoff_delay_ms(task.retry_count);
                let next = iso_in_ms(delay_ms as i64);
                warn!("[parse] Content {} failed transiently: {} — retry at {}", content_id, e, next);
                self.store.fail_task(task.id, &e.to_string(), Some(&next)).ok();
            }
            Err(e) => {
                warn!("[parse] Content {} failed permanently: {}", content_id, e);
                self.store.kill_task(task.id, &e.to_string()).ok();
            }
        }
    }

    /// The pipeline body. Separated from task bookkeeping so tests can run
    /// it directly against an in-memory store.
    pub async fn run_parse(&self, content_id: i64, forced: bool) -> EngineResult<()> {
        let content = self.store.get_content(content_id)?;
        if !self.store.mark_content_processing(content_id)? {
            // Another worker holds it; not an error.
            return Ok(());
        }

        let parsed = match self.parser.parse_url(&content.url).await {
            Ok(parsed) => parsed,
            Err(e) => {
                let (kind, err): (ErrorKind, EngineError) = match &e {
                    AdapterError::Auth(m) => (ErrorKind::Auth, EngineError::Auth(m.clone())),
                    AdapterError::NotFound(m) => (ErrorKind::NotFound, EngineError::adapter("parse", m.clone())),
                    AdapterError::Transient(m) => (ErrorKind::Transient, EngineError::Transient(m.clone())),
                };
                self.store.mark_parse_failed(content_id, &e.to_string(), kind)?;
                self.bus.publish(
                    EventKind::ContentUpdated,
                    json!({ "content_id": content_id, "status": "failed" }),
                );
                return Err(err);
            }
        };

        // Media archival. Failures of individual images are recorded in the
        // archive report, not fatal to the parse.
        let mut raw_metadata = parsed.raw_metadata.clone();
        if let Some(archiver) = self.archive_target() {
            let mut urls = parsed.media_urls.clone();
            if let Some(cover) = &parsed.cover_url {
                if !urls.contains(cover) {
                    urls.insert(0, cover.clone());
                }
            }
            if !urls.is_empty() {
                let (stored, failed) = archiver.archive_images(&urls).await;
                if !stored.is_empty() || !failed.is_empty() {
                    merge_archive(&mut raw_metadata, archive_metadata(&stored, &failed));
                }
            }
        }

        self.store.apply_parsed(content_id, &parsed, &raw_metadata)?;

        // Auto-approval: a pending content that satisfies some matching
        // rule's conditions skips the human queue.
        let mut updated = self.store.get_content(content_id)?;
        if updated.review_status == ReviewStatus::Pending {
            let rules = self.store.list_rules(true)?;
            if matcher::qualifies_for_auto_approval(&rules, &updated) {
                updated = self.store.set_review(content_id, ReviewStatus::AutoApproved, Some("auto"), None)?;
                info!("[parse] Content {} auto-approved", content_id);
            }
        }

        matcher::match_and_enqueue(&self.store, &self.bus, &updated)?;

        self.bus.publish(
            EventKind::ContentUpdated,
            json!({ "content_id": content_id, "status": "pulled" }),
        );
        if forced {
            self.bus
                .publish(EventKind::ContentReParsed, json!({ "content_id": content_id }));
        }
        Ok(())
    }

    fn archive_target(&self) -> Option<&Arc<MediaArchiver>> {
        let enabled = self.settings.get_bool(keys::ENABLE_ARCHIVE_MEDIA_PROCESSING, true);
        if enabled { self.archiver.as_ref() } else { None }
    }
}

/// Merge the archive report into whatever raw metadata the adapter kept.
fn merge_archive(raw_metadata: &mut Value, archive: Value) {
    match raw_metadata {
        Value::Object(map) => {
            map.insert("archive".into(), archive);
        }
        other => {
            *other = json!({ "adapter": other.clone(), "archive": archive });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::{ContentStatus, LayoutType, ParsedContentDraft, QueueStatus};
    use crate::engine::store::NewShare;
    use parking_lot::Mutex;

    /// Scripted parser: pops the next result per call.
    struct ScriptedParser {
        results: Mutex<Vec<Result<ParsedContent, AdapterError>>>,
    }

    #[async_trait]
    impl ContentParser for ScriptedParser {
        async fn parse_url(&self, _url: &str) -> Result<ParsedContent, AdapterError> {
            self.results.lock().pop().unwrap_or_else(|| Err(AdapterError::Transient("script empty".into())))
        }
    }

    fn parsed(canonical: &str) -> ParsedContent {
        ParsedContent::new(ParsedContentDraft {
            platform: "bilibili".into(),
            content_type: "video".into(),
            content_id: "BV1".into(),
            title: "parsed title".into(),
            description: "words".into(),
            tags: vec!["tech".into()],
            layout_type: Some("video".into()),
            canonical_url: canonical.into(),
            ..Default::default()
        })
        .unwrap()
    }

    fn worker_with(results: Vec<Result<ParsedContent, AdapterError>>) -> (Arc<Store>, ParseWorker) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let bus = Arc::new(EventBus::new(Arc::clone(&store)));
        let settings = Arc::new(Settings::new(Arc::clone(&store)));
        let parser = Arc::new(ScriptedParser { results: Mutex::new(results) });
        let worker = ParseWorker::new(store.clone(), bus, parser, None, settings);
        (store, worker)
    }

    fn submit(store: &Store, url: &str) -> i64 {
        store
            .submit_share(&NewShare {
                platform: "bilibili".into(),
                url: url.into(),
                canonical_url: url.into(),
                tags: vec!["tech".into()],
                source: None,
                note: None,
                is_nsfw: None,
                layout_type_override: None,
            })
            .unwrap()
            .0
            .id
    }

    #[tokio::test]
    async fn successful_parse_persists_and_emits() {
        let url = "https://www.bilibili.com/video/BV1";
        let (store, worker) = worker_with(vec![Ok(parsed(url))]);
        let id = submit(&store, url);
        let mut rx = worker.bus.subscribe();

        worker.run_parse(id, false).await.unwrap();

        let content = store.get_content(id).unwrap();
        assert_eq!(content.status, ContentStatus::Pulled);
        assert_eq!(content.title, "parsed title");
        assert_eq!(content.layout_type, Some(LayoutType::Video));
        assert!(content.last_error.is_none());

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, "content_updated");
        assert_eq!(event.payload["status"], "pulled");
    }

    #[tokio::test]
    async fn transient_failure_marks_failed_and_is_retryable() {
        let url = "https://www.bilibili.com/video/BV2";
        let (store, worker) = worker_with(vec![Err(AdapterError::Transient("timeout".into()))]);
        let id = submit(&store, url);

        let err = worker.run_parse(id, false).await.unwrap_err();
        assert!(err.is_retryable());

        let content = store.get_content(id).unwrap();
        assert_eq!(content.status, ContentStatus::Failed);
        assert_eq!(content.failure_count, 1);
        assert_eq!(content.last_error_type.as_deref(), Some("transient"));
    }

    #[tokio::test]
    async fn not_found_is_permanent() {
        let url = "https://www.bilibili.com/video/BV3";
        let (store, worker) = worker_with(vec![Err(AdapterError::NotFound("gone".into()))]);
        let id = submit(&store, url);

        let err = worker.run_parse(id, false).await.unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(store.get_content(id).unwrap().last_error_type.as_deref(), Some("not_found"));
    }

    #[tokio::test]
    async fn auto_approval_releases_matching_content() {
        let url = "https://www.bilibili.com/video/BV4";
        let (store, worker) = worker_with(vec![Ok(parsed(url))]);
        let id = submit(&store, url);

        // Rule with approval required + auto-approve on the tech tag.
        let bot_id = store
            .create_bot(&crate::atoms::types::BotConfig {
                id: 0,
                platform: crate::atoms::types::BotPlatform::Telegram,
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
        store
            .upsert_chat(
                bot_id,
                &crate::engine::store::DiscoveredChat {
                    chat_id: "-1".into(),
                    chat_type: "channel".into(),
                    title: "t".into(),
                    username: None,
                    can_post: true,
                },
            )
            .unwrap();
        let chat = store.list_chats(bot_id).unwrap()[0].id;
        store
            .create_rule(
                &crate::engine::store::RuleDraft {
                    name: "tech".into(),
                    description: String::new(),
                    enabled: true,
                    priority: 1,
                    match_conditions: crate::atoms::types::MatchConditions {
                        tags: vec!["tech".into()],
                        ..Default::default()
                    },
                    nsfw_policy: crate::atoms::types::NsfwPolicy::Allow,
                    approval_required: true,
                    auto_approve_conditions: Some(crate::atoms::types::AutoApproveConditions {
                        tags: vec!["tech".into()],
                        ..Default::default()
                    }),
                    rate_limit: None,
                    time_window_secs: None,
                    render_config: crate::atoms::types::RenderConfig::default(),
                },
                &[crate::engine::store::TargetDraft {
                    bot_chat_id: chat,
                    enabled: true,
                    merge_forward: false,
                    use_author_name: false,
                    summary: None,
                    render_config_override: None,
                }],
            )
            .unwrap();

        worker.run_parse(id, false).await.unwrap();

        let content = store.get_content(id).unwrap();
        assert_eq!(content.review_status, ReviewStatus::AutoApproved);
        assert!(content.reviewed_at.is_some());

        // Auto-approved → the expansion bypasses the approval gate.
        let items = store.items_for_content(id).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].status, QueueStatus::Scheduled);
    }

    #[tokio::test]
    async fn replaying_a_parse_is_idempotent() {
        let url = "https://www.bilibili.com/video/BV5";
        let (store, worker) = worker_with(vec![Ok(parsed(url)), Ok(parsed(url))]);
        let id = submit(&store, url);

        worker.run_parse(id, false).await.unwrap();
        worker.run_parse(id, true).await.unwrap();

        let (contents, total) = store
            .list_contents(&crate::engine::store::ContentListFilter::default())
            .unwrap();
        assert_eq!(total, 1);
        assert_eq!(contents.len(), 1);
        assert_eq!(store.get_content(id).unwrap().status, ContentStatus::Pulled);
    }
}
