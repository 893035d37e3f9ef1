// VaultStream Engine — Push Worker
//
// Polls the triplet queue for due items (default every 30s; `push_now` and
// fresh schedules poke the wake signal so the gap is sub-second), claims a
// batch atomically, renders each item against its effective config, and
// delivers through the platform transport.
//
// Grouping: claimed items sharing `(target, scheduled_at)` whose target has
// `merge_forward` set go out as one forwarded message; everything else is
// sent individually. Failures are classified by the transport: transient
// ones reschedule with backoff until `max_attempts`, permission errors are
// terminal immediately.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{error, info, warn};
use serde_json::json;
use tokio::sync::Notify;

use crate::atoms::constants::{PUSH_BATCH_SIZE, PUSH_LEASE_SECS, PUSH_POLL_SECS, TASK_LEASE_SECS};
use crate::atoms::error::{EngineResult, ErrorKind};
use crate::atoms::types::{
    BotChat, BotConfig, Content, ContentQueueItem, DistributionRule, DistributionTarget, EventKind, TaskKind,
};
use crate::engine::clock::iso_in_ms;
use crate::engine::events::EventBus;
use crate::engine::http::backoff_delay_ms;
use crate::engine::render;
use crate::engine::store::Store;
use crate::engine::transports::{RenderedMessage, ServiceFactory, TransportError};

pub struct PushWorker {
    pub store: Arc<Store>,
    pub bus: Arc<EventBus>,
    pub factory: Arc<dyn ServiceFactory>,
    pub wake: Arc<Notify>,
    pub worker_id: String,
}

/// A claimed item with everything resolved for delivery.
struct Prepared {
    item: ContentQueueItem,
    rule: DistributionRule,
    target: DistributionTarget,
    chat: BotChat,
    bot: BotConfig,
    message: RenderedMessage,
    /// Platform chat id to deliver to; NSFW routing may redirect it.
    destination: String,
}

impl PushWorker {
    pub fn new(
        store: Arc<Store>,
        bus: Arc<EventBus>,
        factory: Arc<dyn ServiceFactory>,
        wake: Arc<Notify>,
    ) -> Self {
        PushWorker { store, bus, factory, wake, worker_id: format!("push-{}", uuid::Uuid::new_v4()) }
    }

    pub fn spawn(self: Arc<Self>, stop: Arc<AtomicBool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!("[push] Worker {} started", self.worker_id);
            loop {
                if stop.load(Ordering::Relaxed) {
                    break;
                }
                let pushed = match self.process_due_batch().await {
                    Ok(count) => count,
                    Err(e) => {
                        error!("[push] Batch failed: {}", e);
                        0
                    }
                };
                if pushed > 0 {
                    // Drain the backlog before sleeping again.
                    continue;
                }
                tokio::select! {
                    _ = self.wake.notified() => {}
                    _ = tokio::time::sleep(std::time::Duration::from_secs(PUSH_POLL_SECS)) => {}
                }
            }
            info!("[push] Worker {} stopped", self.worker_id);
        })
    }

    /// One claim-and-deliver round. Returns the number of items settled.
    pub async fn process_due_batch(&self) -> EngineResult<usize> {
        // Durable distribute tasks are the cross-process push-now signal;
        // their items were already made due, so the claim below picks them
        // up. The task rows just need settling.
        if let Ok(tasks) =
            self.store.claim_tasks(&self.worker_id, &[TaskKind::Distribute], PUSH_BATCH_SIZE, TASK_LEASE_SECS)
        {
            for task in tasks {
                self.store.complete_task(task.id).ok();
            }
        }

        let claimed = self.store.claim_due_items(&self.worker_id, PUSH_BATCH_SIZE, PUSH_LEASE_SECS)?;
        if claimed.is_empty() {
            return Ok(0);
        }

        // Resolve each claimed item; unresolvable ones (deleted rule/chat)
        // fail terminally right here.
        let mut singles: Vec<Prepared> = Vec::new();
        let mut merge_buckets: HashMap<(i64, String), Vec<Prepared>> = HashMap::new();
        for item in claimed {
            match self.prepare(&item) {
                Ok(prepared) => {
                    if prepared.target.merge_forward {
                        let key = (
                            prepared.target.id,
                            prepared.item.scheduled_at.clone().unwrap_or_default(),
                        );
                        merge_buckets.entry(key).or_default().push(prepared);
                    } else {
                        singles.push(prepared);
                    }
                }
                Err(e) => {
                    warn!("[push] Item {} unresolvable: {}", item.id, e);
                    self.store.queue_item_failed(item.id, &e.to_string(), ErrorKind::Fatal)?;
                    self.emit_failed(&item, &e.to_string());
                }
            }
        }

        let mut settled = 0;
        for prepared in singles {
            settled += self.deliver(vec![prepared], false).await;
        }
        for (_, bucket) in merge_buckets {
            let merged = bucket.len() > 1;
            settled += self.deliver(bucket, merged).await;
        }

        if settled > 0 {
            self.bus.publish(EventKind::QueueUpdated, json!({ "op": "push_round", "settled": settled }));
        }
        Ok(settled)
    }

    fn prepare(&self, item: &ContentQueueItem) -> EngineResult<Prepared> {
        let content = self.store.get_content(item.content_id)?;
        let rule = self.store.get_rule(item.rule_id)?;
        let target = self.store.get_target_for_pair(item.rule_id, item.bot_chat_id)?;
        let chat = self.store.get_chat(item.bot_chat_id)?;
        let bot = self.store.get_bot(chat.bot_config_id)?;

        let message = self.render_or_cached(item, &content, &rule, &target);
        let destination = item.nsfw_routing_result.clone().unwrap_or_else(|| chat.chat_id.clone());
        Ok(Prepared { item: item.clone(), rule, target, chat, bot, message, destination })
    }

    /// Reuse the cached payload when present, else render and cache.
    fn render_or_cached(
        &self,
        item: &ContentQueueItem,
        content: &Content,
        rule: &DistributionRule,
        target: &DistributionTarget,
    ) -> RenderedMessage {
        if let Some(cached) = item.rendered_payload.as_deref().and_then(render::payload_from_string) {
            return cached;
        }
        let config = render::effective_config(rule, target);
        let message = render::render_message(content, &config, target);
        self.store.cache_rendered_payload(item.id, &render::payload_to_string(&message)).ok();
        message
    }

    /// Deliver one group (singleton or merged). Returns settled item count.
    async fn deliver(&self, group: Vec<Prepared>, merged: bool) -> usize {
        let first = &group[0];

        // Delivery-time window check. Scheduling already spread items out,
        // but several deferred items can become due together; the recount
        // here keeps the per-target window honest. Deferral is not an
        // attempt.
        if let (Some(limit), Some(window)) = (first.rule.rate_limit, first.rule.time_window_secs) {
            let since = crate::engine::clock::iso_in_secs(-(window as i64));
            let count = self.store.count_pushed_since(first.target.id, &since).unwrap_or(0);
            if count + group.len() as u32 > limit {
                let shift = ((window as f64) / (limit.max(1) as f64)).round() as i64;
                let at = crate::engine::clock::iso_in_secs(shift);
                let reason = format!("window full at delivery: {count}/{limit} in {window}s");
                warn!("[push] Deferring {} item(s) for target {}: {}", group.len(), first.target.id, reason);
                for prepared in &group {
                    self.store.defer_for_rate_limit(prepared.item.id, &at, &reason).ok();
                }
                return 0;
            }
        }

        let service = match self.factory.service(&first.bot) {
            Ok(service) => service,
            Err(e) => {
                for prepared in &group {
                    self.store
                        .queue_item_failed(prepared.item.id, &e.to_string(), ErrorKind::Fatal)
                        .ok();
                    self.emit_failed(&prepared.item, &e.to_string());
                }
                return group.len();
            }
        };

        let outcome = if merged {
            let messages: Vec<RenderedMessage> = group.iter().map(|p| p.message.clone()).collect();
            service.send_forward(&first.destination, &messages).await
        } else {
            service.send(&first.destination, &first.message).await
        };

        match outcome {
            Ok(sent) => {
                for prepared in &group {
                    self.settle_success(prepared, &sent.message_id);
                }
                group.len()
            }
            Err(e) => {
                for prepared in &group {
                    self.settle_failure(prepared, &e);
                }
                group.len()
            }
        }
    }

    fn settle_success(&self, prepared: &Prepared, message_id: &str) {
        let item = &prepared.item;
        // PushedRecord upsert and counter bumps ride the same success path
        // so the dedup row exists the moment the item is terminal.
        self.store
            .upsert_pushed_record(item.content_id, prepared.target.id, message_id, "success", None)
            .ok();
        self.store.bump_chat_counters(prepared.chat.id).ok();
        self.store.queue_item_success(item.id, message_id).ok();

        info!(
            "[push] Item {} → chat {} ok (message {})",
            item.id, prepared.destination, message_id
        );
        self.bus.publish(
            EventKind::DistributionPushSuccess,
            json!({
                "item_id": item.id,
                "content_id": item.content_id,
                "target_id": prepared.target.id,
                "message_id": message_id,
            }),
        );
        self.bus.publish(
            EventKind::ContentPushed,
            json!({ "content_id": item.content_id, "chat_id": prepared.chat.chat_id }),
        );
    }

    fn settle_failure(&self, prepared: &Prepared, error: &TransportError) {
        let item = &prepared.item;
        let retryable = error.is_retryable();
        let message = error.to_string();

        if retryable && item.attempt_count < item.max_attempts {
            // attempt_count was bumped at claim; backoff grows with it.
            let delay_ms = backoff_delay_ms(item.attempt_count.saturating_sub(1));
            let next = iso_in_ms(delay_ms as i64);
            warn!(
                "[push] Item {} attempt {}/{} failed: {} — retry at {}",
                item.id, item.attempt_count, item.max_attempts, message, next
            );
            self.store
                .queue_item_reschedule(item.id, &next, &message, ErrorKind::Transient)
                .ok();
        } else {
            let kind = if retryable { ErrorKind::Transient } else { ErrorKind::Fatal };
            warn!(
                "[push] Item {} failed terminally after attempt {}: {}",
                item.id, item.attempt_count, message
            );
            self.store.queue_item_failed(item.id, &message, kind).ok();
        }
        self.emit_failed(item, &message);
    }

    fn emit_failed(&self, item: &ContentQueueItem, error: &str) {
        self.bus.publish(
            EventKind::DistributionPushFailed,
            json!({
                "item_id": item.id,
                "content_id": item.content_id,
                "attempt": item.attempt_count,
                "error": error,
            }),
        );
    }
}
