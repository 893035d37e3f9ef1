// VaultStream integration suite — exercises the full pipeline against an
// in-memory store, a scripted parser, and a mock platform transport:
// submit → parse → match → queue → push, plus approval, retry, merge and
// event fan-out behavior.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use vaultstream::atoms::error::EngineResult;
use vaultstream::atoms::types::*;
use vaultstream::engine::adapters::AdapterError;
use vaultstream::engine::clock::iso_in_secs;
use vaultstream::engine::events::EventBus;
use vaultstream::engine::parse_worker::{ContentParser, ParseWorker};
use vaultstream::engine::push_worker::PushWorker;
use vaultstream::engine::settings::Settings;
use vaultstream::engine::state::{EngineState, ShareRequest};
use vaultstream::engine::store::{DiscoveredChat, RuleDraft, TargetDraft};
use vaultstream::engine::transports::{
    BotIdentity, PlatformService, RenderedMessage, SendOutcome, ServiceFactory, TransportError,
};
use tokio::sync::Notify;

// ── Test doubles ───────────────────────────────────────────────────────────

/// Transport that replays a script of outcomes and records every call.
struct MockService {
    script: Mutex<Vec<Result<SendOutcome, TransportError>>>,
    calls: Mutex<Vec<(String, usize)>>,
}

impl MockService {
    fn always_ok() -> Arc<Self> {
        Arc::new(MockService { script: Mutex::new(vec![]), calls: Mutex::new(vec![]) })
    }

    fn scripted(script: Vec<Result<SendOutcome, TransportError>>) -> Arc<Self> {
        Arc::new(MockService { script: Mutex::new(script), calls: Mutex::new(vec![]) })
    }

    fn next(&self) -> Result<SendOutcome, TransportError> {
        self.script
            .lock()
            .pop()
            .unwrap_or(Ok(SendOutcome { message_id: format!("msg-{}", self.calls.lock().len()) }))
    }
}

#[async_trait]
impl PlatformService for MockService {
    fn platform(&self) -> BotPlatform {
        BotPlatform::Telegram
    }
    async fn probe(&self) -> Result<BotIdentity, TransportError> {
        Ok(BotIdentity { id: "9".into(), username: "mock".into() })
    }
    async fn send(&self, chat_id: &str, _m: &RenderedMessage) -> Result<SendOutcome, TransportError> {
        self.calls.lock().push((chat_id.into(), 1));
        self.next()
    }
    async fn send_forward(
        &self,
        chat_id: &str,
        messages: &[RenderedMessage],
    ) -> Result<SendOutcome, TransportError> {
        self.calls.lock().push((chat_id.into(), messages.len()));
        self.next()
    }
    async fn list_chats(&self) -> Result<Vec<DiscoveredChat>, TransportError> {
        Ok(vec![])
    }
}

struct MockFactory(Arc<MockService>);

impl ServiceFactory for MockFactory {
    fn service(&self, _bot: &BotConfig) -> EngineResult<Arc<dyn PlatformService>> {
        Ok(Arc::clone(&self.0) as Arc<dyn PlatformService>)
    }
}

/// Parser that returns a canned `ParsedContent` derived from the URL.
struct CannedParser {
    tags: Vec<String>,
    failures: Mutex<Vec<AdapterError>>,
}

impl CannedParser {
    fn ok_with_tags(tags: &[&str]) -> Arc<Self> {
        Arc::new(CannedParser {
            tags: tags.iter().map(|t| t.to_string()).collect(),
            failures: Mutex::new(vec![]),
        })
    }
}

#[async_trait]
impl ContentParser for CannedParser {
    async fn parse_url(&self, url: &str) -> Result<ParsedContent, AdapterError> {
        if let Some(failure) = self.failures.lock().pop() {
            return Err(failure);
        }
        ParsedContent::new(ParsedContentDraft {
            platform: "bilibili".into(),
            content_type: "video".into(),
            content_id: url.rsplit('/').next().unwrap_or("id").to_string(),
            title: format!("title for {url}"),
            description: "canned description".into(),
            tags: self.tags.clone(),
            layout_type: Some("video".into()),
            canonical_url: url.to_string(),
            ..Default::default()
        })
        .map_err(AdapterError::Transient)
    }
}

// ── Harness ────────────────────────────────────────────────────────────────

struct Harness {
    state: Arc<EngineState>,
    service: Arc<MockService>,
    parse_worker: ParseWorker,
    push_worker: PushWorker,
    chat_row_id: i64,
    rule_id: i64,
    target_id: i64,
}

fn harness(service: Arc<MockService>, parser: Arc<CannedParser>, rule: RuleDraft) -> Harness {
    let factory: Arc<dyn ServiceFactory> = Arc::new(MockFactory(Arc::clone(&service)));
    let state = Arc::new(EngineState::for_testing(Arc::clone(&factory)).unwrap());

    let bot_id = state
        .store
        .create_bot(&BotConfig {
            id: 0,
            platform: BotPlatform::Telegram,
            name: "bot".into(),
            enabled: true,
            is_primary: true,
            bot_token: Some("123:abc".into()),
            napcat_http_url: None,
            napcat_ws_url: None,
            bot_id: None,
            bot_username: None,
            created_at: String::new(),
            updated_at: String::new(),
        })
        .unwrap();
    state
        .store
        .upsert_chat(
            bot_id,
            &DiscoveredChat {
                chat_id: "-1001".into(),
                chat_type: "channel".into(),
                title: "main channel".into(),
                username: None,
                can_post: true,
            },
        )
        .unwrap();
    let chat_row_id = state.store.list_chats(bot_id).unwrap()[0].id;

    let rule_id = state
        .store
        .create_rule(
            &rule,
            &[TargetDraft {
                bot_chat_id: chat_row_id,
                enabled: true,
                merge_forward: false,
                use_author_name: true,
                summary: None,
                render_config_override: None,
            }],
        )
        .unwrap();
    let target_id = state.store.list_targets(rule_id).unwrap()[0].id;

    let settings = Arc::new(Settings::new(Arc::clone(&state.store)));
    let bus: Arc<EventBus> = Arc::clone(&state.bus);
    let parse_worker = ParseWorker::new(
        Arc::clone(&state.store),
        Arc::clone(&bus),
        parser as Arc<dyn ContentParser>,
        None,
        settings,
    );
    let push_worker = PushWorker::new(
        Arc::clone(&state.store),
        Arc::clone(&bus),
        factory,
        Arc::new(Notify::new()),
    );

    Harness { state, service, parse_worker, push_worker, chat_row_id, rule_id, target_id }
}

fn tech_rule() -> RuleDraft {
    RuleDraft {
        name: "tech".into(),
        description: String::new(),
        enabled: true,
        priority: 5,
        match_conditions: MatchConditions { tags: vec!["tech".into()], ..Default::default() },
        nsfw_policy: NsfwPolicy::Block,
        approval_required: false,
        auto_approve_conditions: None,
        rate_limit: None,
        time_window_secs: None,
        render_config: RenderConfig::default(),
    }
}

fn share(url: &str) -> ShareRequest {
    ShareRequest {
        url: url.into(),
        tags: vec!["tech".into()],
        source: None,
        note: None,
        is_nsfw: None,
        layout_type_override: None,
    }
}

async fn make_due(state: &EngineState, content_id: i64) {
    state
        .store
        .schedule_content(content_id, &iso_in_secs(-5))
        .unwrap();
}

// ── Scenarios ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn submit_parse_match_push_end_to_end() {
    let hx = harness(MockService::always_ok(), CannedParser::ok_with_tags(&["tech"]), tech_rule());
    let mut rx = hx.state.bus.subscribe();

    // Submit: content is created and a parse task queued.
    let url = "https://www.bilibili.com/video/BV1xx411c7mu";
    let (content, created) = hx.state.submit_share(&share(url)).await.unwrap();
    assert!(created);
    assert_eq!(content.platform, "bilibili");
    assert_eq!(content.status, ContentStatus::Unprocessed);
    assert_eq!(content.canonical_url, url);
    assert_eq!(hx.state.store.list_sources(content.id).unwrap().len(), 1);

    let event = rx.recv().await.unwrap();
    assert_eq!(event.kind, "content_created");

    // Parse: content pulled, rule matched, queue item scheduled.
    hx.parse_worker.run_parse(content.id, false).await.unwrap();
    let pulled = hx.state.store.get_content(content.id).unwrap();
    assert_eq!(pulled.status, ContentStatus::Pulled);
    assert_eq!(pulled.layout_type, Some(LayoutType::Video));

    let items = hx.state.store.items_for_content(content.id).unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].status, QueueStatus::Scheduled);
    assert_eq!(items[0].rule_id, hx.rule_id);
    assert_eq!(items[0].priority, 5);

    // Push: the item goes out, a pushed record with a message id exists.
    make_due(&hx.state, content.id).await;
    let settled = hx.push_worker.process_due_batch().await.unwrap();
    assert_eq!(settled, 1);

    let item = hx.state.store.get_queue_item(items[0].id).unwrap();
    assert_eq!(item.status, QueueStatus::Success);
    let record = hx.state.store.get_pushed_record(content.id, hx.target_id).unwrap().unwrap();
    assert!(!record.message_id.is_empty());

    // Chat counters moved with the record.
    let chat = hx.state.store.get_chat(hx.chat_row_id).unwrap();
    assert_eq!(chat.total_pushed, 1);
}

#[tokio::test]
async fn resubmission_reuses_content_and_never_double_parses() {
    let hx = harness(MockService::always_ok(), CannedParser::ok_with_tags(&["tech"]), tech_rule());
    let url = "https://www.bilibili.com/video/BV1re5ubm1ss";

    let (first, created) = hx.state.submit_share(&share(url)).await.unwrap();
    assert!(created);
    let (second, created_again) = hx.state.submit_share(&share(url)).await.unwrap();
    assert!(!created_again);
    assert_eq!(first.id, second.id);
    assert_eq!(hx.state.store.list_sources(first.id).unwrap().len(), 2);

    // Exactly one pending parse task despite two submissions.
    let tasks = hx
        .state
        .store
        .claim_tasks("probe", &[TaskKind::Parse], 10, 600)
        .unwrap();
    assert_eq!(tasks.len(), 1);

    // Replaying the parse after success creates nothing new.
    hx.parse_worker.run_parse(first.id, false).await.unwrap();
    hx.parse_worker.run_parse(first.id, true).await.unwrap();
    let (_, total) = hx
        .state
        .store
        .list_contents(&vaultstream::engine::store::ContentListFilter::default())
        .unwrap();
    assert_eq!(total, 1);
    assert_eq!(hx.state.store.items_for_content(first.id).unwrap().len(), 1);
}

#[tokio::test]
async fn approval_gate_holds_until_review_then_pushes() {
    let mut rule = tech_rule();
    rule.approval_required = true;
    let hx = harness(MockService::always_ok(), CannedParser::ok_with_tags(&["tech"]), rule);

    let (content, _) = hx
        .state
        .submit_share(&share("https://www.bilibili.com/video/BV1approval1"))
        .await
        .unwrap();
    hx.parse_worker.run_parse(content.id, false).await.unwrap();

    let items = hx.state.store.items_for_content(content.id).unwrap();
    assert_eq!(items[0].status, QueueStatus::Pending);
    assert!(items[0].needs_approval);

    // Nothing is pushable while pending.
    make_due(&hx.state, content.id).await;
    assert_eq!(hx.push_worker.process_due_batch().await.unwrap(), 0);

    // Approve → scheduled → pushed.
    hx.state.review_content(content.id, true, Some("admin"), None).unwrap();
    let items = hx.state.store.items_for_content(content.id).unwrap();
    assert_eq!(items[0].status, QueueStatus::Scheduled);
    assert!(items[0].approved_at.is_some());

    make_due(&hx.state, content.id).await;
    assert_eq!(hx.push_worker.process_due_batch().await.unwrap(), 1);
    assert!(hx
        .state
        .store
        .get_pushed_record(content.id, hx.target_id)
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn rejection_skips_pending_items() {
    let mut rule = tech_rule();
    rule.approval_required = true;
    let hx = harness(MockService::always_ok(), CannedParser::ok_with_tags(&["tech"]), rule);

    let (content, _) = hx
        .state
        .submit_share(&share("https://www.bilibili.com/video/BV1reject111"))
        .await
        .unwrap();
    hx.parse_worker.run_parse(content.id, false).await.unwrap();
    hx.state.review_content(content.id, false, Some("admin"), Some("nope")).unwrap();

    let items = hx.state.store.items_for_content(content.id).unwrap();
    assert_eq!(items[0].status, QueueStatus::Skipped);
    let rejected = hx.state.store.get_content(content.id).unwrap();
    assert_eq!(rejected.review_status, ReviewStatus::Rejected);
    assert_eq!(rejected.reviewed_note.as_deref(), Some("nope"));
}

#[tokio::test]
async fn nsfw_block_produces_no_items_for_that_rule() {
    let hx = harness(MockService::always_ok(), CannedParser::ok_with_tags(&["tech"]), tech_rule());
    let mut request = share("https://www.bilibili.com/video/BV1nsfw11111");
    request.is_nsfw = Some(true);

    let (content, _) = hx.state.submit_share(&request).await.unwrap();
    hx.parse_worker.run_parse(content.id, false).await.unwrap();
    assert!(hx.state.store.items_for_content(content.id).unwrap().is_empty());
}

#[tokio::test]
async fn transient_transport_failures_exhaust_attempts_with_events() {
    let retry = || Err(TransportError::Retryable("HTTP 429: slow down".into()));
    let hx = harness(
        MockService::scripted(vec![retry(), retry(), retry()]),
        CannedParser::ok_with_tags(&["tech"]),
        tech_rule(),
    );
    let mut rx = hx.state.bus.subscribe();

    let (content, _) = hx
        .state
        .submit_share(&share("https://www.bilibili.com/video/BV1retry1111"))
        .await
        .unwrap();
    hx.parse_worker.run_parse(content.id, false).await.unwrap();
    let item_id = hx.state.store.items_for_content(content.id).unwrap()[0].id;

    for round in 1..=3u32 {
        make_due(&hx.state, content.id).await;
        assert_eq!(hx.push_worker.process_due_batch().await.unwrap(), 1, "round {round}");
    }

    let item = hx.state.store.get_queue_item(item_id).unwrap();
    assert_eq!(item.status, QueueStatus::Failed);
    assert_eq!(item.attempt_count, 3);
    assert!(item.completed_at.is_some());
    assert_eq!(item.last_error_type.as_deref(), Some("transient"));

    // Three distribution_push_failed events with ascending attempt counts.
    let mut attempts = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if event.kind == "distribution_push_failed" {
            attempts.push(event.payload["attempt"].as_u64().unwrap());
        }
    }
    assert_eq!(attempts, vec![1, 2, 3]);

    // No pushed record for a failed delivery.
    assert!(hx.state.store.get_pushed_record(content.id, hx.target_id).unwrap().is_none());
}

#[tokio::test]
async fn push_now_makes_an_item_immediately_due() {
    let hx = harness(MockService::always_ok(), CannedParser::ok_with_tags(&["tech"]), tech_rule());
    let (content, _) = hx
        .state
        .submit_share(&share("https://www.bilibili.com/video/BV1pushnow11"))
        .await
        .unwrap();
    hx.parse_worker.run_parse(content.id, false).await.unwrap();
    let item_id = hx.state.store.items_for_content(content.id).unwrap()[0].id;

    // Park it far in the future, then push-now.
    hx.state.store.schedule_content(content.id, &iso_in_secs(86_400)).unwrap();
    assert_eq!(hx.push_worker.process_due_batch().await.unwrap(), 0);

    hx.state.queue_ops.push_now_item(item_id).unwrap();
    assert_eq!(hx.push_worker.process_due_batch().await.unwrap(), 1);
    assert_eq!(
        hx.state.store.get_queue_item(item_id).unwrap().status,
        QueueStatus::Success
    );
}

#[tokio::test]
async fn merge_group_aligns_and_sends_one_forward() {
    let mut rule = tech_rule();
    rule.priority = 0;
    let hx = harness(MockService::always_ok(), CannedParser::ok_with_tags(&["tech"]), rule);
    // Flip the single target to merge_forward.
    {
        let conn = hx.state.store.conn.lock();
        conn.execute("UPDATE distribution_targets SET merge_forward=1", []).unwrap();
    }

    let mut content_ids = Vec::new();
    for n in 0..2 {
        let (content, _) = hx
            .state
            .submit_share(&share(&format!("https://www.bilibili.com/video/BV1merge{n}00x")))
            .await
            .unwrap();
        hx.parse_worker.run_parse(content.id, false).await.unwrap();
        content_ids.push(content.id);
    }

    let aligned = hx
        .state
        .queue_ops
        .merge_group(&content_ids, Some(&iso_in_secs(-3)))
        .unwrap();
    for &content_id in &content_ids {
        for item in hx.state.store.items_for_content(content_id).unwrap() {
            assert_eq!(item.scheduled_at.as_deref(), Some(aligned.as_str()));
        }
    }

    assert_eq!(hx.push_worker.process_due_batch().await.unwrap(), 2);
    let calls = hx.service.calls.lock();
    assert_eq!(calls.len(), 1, "one transport call for the merged pair");
    assert_eq!(calls[0].1, 2, "forward carried both items");
}

#[tokio::test]
async fn at_most_one_live_item_per_content_target_pair() {
    let hx = harness(MockService::always_ok(), CannedParser::ok_with_tags(&["tech"]), tech_rule());
    let (content, _) = hx
        .state
        .submit_share(&share("https://www.bilibili.com/video/BV1invariant"))
        .await
        .unwrap();

    // Parse twice (forced re-parse) → still a single live item.
    hx.parse_worker.run_parse(content.id, false).await.unwrap();
    hx.parse_worker.run_parse(content.id, true).await.unwrap();
    assert_eq!(hx.state.store.count_live_for_pair(content.id, hx.chat_row_id).unwrap(), 1);
}

#[tokio::test]
async fn reorder_places_content_at_requested_index() {
    let hx = harness(MockService::always_ok(), CannedParser::ok_with_tags(&["tech"]), tech_rule());
    let mut ids = Vec::new();
    for n in 0..3 {
        let (content, _) = hx
            .state
            .submit_share(&share(&format!("https://www.bilibili.com/video/BV1order{n}00x")))
            .await
            .unwrap();
        hx.parse_worker.run_parse(content.id, false).await.unwrap();
        ids.push(content.id);
    }
    // One shared time bucket so order is purely priority.
    hx.state
        .queue_ops
        .merge_group(&ids, Some("2026-09-01T00:00:00+00:00"))
        .unwrap();

    hx.state.queue_ops.reorder_content(ids[2], 0, None).unwrap();
    let order = hx.state.store.queue_view_order(None).unwrap();
    assert_eq!(order[0], ids[2]);

    // Stability: repeating the same reorder keeps the order.
    hx.state.queue_ops.reorder_content(ids[2], 0, None).unwrap();
    assert_eq!(hx.state.store.queue_view_order(None).unwrap()[0], ids[2]);
}

#[tokio::test]
async fn every_queue_mutation_reaches_two_live_subscribers() {
    let hx = harness(MockService::always_ok(), CannedParser::ok_with_tags(&["tech"]), tech_rule());
    let (content, _) = hx
        .state
        .submit_share(&share("https://www.bilibili.com/video/BV1fanout111"))
        .await
        .unwrap();
    hx.parse_worker.run_parse(content.id, false).await.unwrap();

    let mut a = hx.state.bus.subscribe();
    let mut b = hx.state.bus.subscribe();
    hx.state.queue_ops.push_now_content(content.id).unwrap();

    for rx in [&mut a, &mut b] {
        let mut saw_queue_updated = false;
        while let Ok(event) = rx.try_recv() {
            if event.kind == "queue_updated" {
                saw_queue_updated = true;
            }
        }
        assert!(saw_queue_updated, "subscriber missed queue_updated");
    }
}

#[tokio::test]
async fn reapproval_reopens_a_pushed_target() {
    let hx = harness(MockService::always_ok(), CannedParser::ok_with_tags(&["tech"]), tech_rule());
    let (content, _) = hx
        .state
        .submit_share(&share("https://www.bilibili.com/video/BV1reopen111"))
        .await
        .unwrap();
    hx.parse_worker.run_parse(content.id, false).await.unwrap();
    make_due(&hx.state, content.id).await;
    assert_eq!(hx.push_worker.process_due_batch().await.unwrap(), 1);
    let first = hx.state.store.get_pushed_record(content.id, hx.target_id).unwrap().unwrap();

    // A plain re-parse does not reopen the pushed target.
    hx.parse_worker.run_parse(content.id, true).await.unwrap();
    assert_eq!(hx.state.store.count_live_for_pair(content.id, hx.chat_row_id).unwrap(), 0);

    // Re-approval after the push does.
    hx.state.review_content(content.id, true, Some("admin"), None).unwrap();
    assert_eq!(hx.state.store.count_live_for_pair(content.id, hx.chat_row_id).unwrap(), 1);

    make_due(&hx.state, content.id).await;
    assert_eq!(hx.push_worker.process_due_batch().await.unwrap(), 1);
    let second = hx.state.store.get_pushed_record(content.id, hx.target_id).unwrap().unwrap();
    assert_eq!(first.id, second.id, "record upserted in place, never duplicated");
}
