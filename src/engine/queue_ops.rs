// VaultStream Engine — Distribution Queue Operations
//
// The user-facing surface of the triplet queue: listing, stats, push-now,
// scheduling, reorder, merge grouping, cancel and retry. Every mutation
// emits `queue_updated` so dashboards stay live, and anything that makes an
// item due right now also pokes the push worker's wake signal instead of
// waiting out the poll interval.

use std::sync::Arc;

use serde_json::json;
use tokio::sync::Notify;

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{ContentQueueItem, EventKind, TaskKind};
use crate::engine::clock::parse_iso;
use crate::engine::events::EventBus;
use crate::engine::store::{QueueListFilter, QueueStats, Store};

pub struct QueueOps {
    store: Arc<Store>,
    bus: Arc<EventBus>,
    push_wake: Arc<Notify>,
}

impl QueueOps {
    pub fn new(store: Arc<Store>, bus: Arc<EventBus>, push_wake: Arc<Notify>) -> Self {
        QueueOps { store, bus, push_wake }
    }

    // ── Reads ──────────────────────────────────────────────────────────

    pub fn list(&self, filter: &QueueListFilter) -> EngineResult<(Vec<ContentQueueItem>, u32)> {
        self.store.list_queue_items(filter)
    }

    pub fn stats(&self, rule_id: Option<i64>) -> EngineResult<QueueStats> {
        self.store.queue_stats(rule_id)
    }

    // ── Mutations ──────────────────────────────────────────────────────

    pub fn push_now_item(&self, item_id: i64) -> EngineResult<()> {
        self.store.push_now_item(item_id)?;
        // A durable task lets a push worker in another process pick this up
        // even if ours is down.
        self.store
            .enqueue_task(TaskKind::Distribute, &json!({ "queue_item_id": item_id }), 100)?;
        self.emit_queue_updated(json!({ "item_id": item_id, "op": "push_now" }));
        self.push_wake.notify_one();
        Ok(())
    }

    pub fn push_now_content(&self, content_id: i64) -> EngineResult<usize> {
        let changed = self.store.push_now_content(content_id)?;
        if changed > 0 {
            self.emit_queue_updated(json!({ "content_id": content_id, "op": "push_now", "items": changed }));
            self.push_wake.notify_one();
        }
        Ok(changed)
    }

    pub fn schedule_content(&self, content_id: i64, at: &str) -> EngineResult<usize> {
        if parse_iso(at).is_none() {
            return Err(EngineError::Validation(format!("'{at}' is not an RFC 3339 timestamp")));
        }
        let changed = self.store.schedule_content(content_id, at)?;
        if changed > 0 {
            self.emit_queue_updated(json!({ "content_id": content_id, "op": "schedule", "at": at }));
            self.push_wake.notify_one();
        }
        Ok(changed)
    }

    pub fn reorder_content(&self, content_id: i64, index: usize, rule_id: Option<i64>) -> EngineResult<()> {
        self.store.reorder_content(content_id, index, rule_id)?;
        self.bus.publish(
            EventKind::QueueItemReordered,
            json!({ "content_id": content_id, "index": index, "rule_id": rule_id }),
        );
        self.emit_queue_updated(json!({ "content_id": content_id, "op": "reorder" }));
        Ok(())
    }

    pub fn merge_group(&self, content_ids: &[i64], at: Option<&str>) -> EngineResult<String> {
        if content_ids.is_empty() {
            return Err(EngineError::Validation("merge_group needs at least one content id".into()));
        }
        if let Some(at) = at {
            if parse_iso(at).is_none() {
                return Err(EngineError::Validation(format!("'{at}' is not an RFC 3339 timestamp")));
            }
        }
        let aligned = self.store.merge_group(content_ids, at)?;
        self.emit_queue_updated(json!({ "content_ids": content_ids, "op": "merge_group", "at": aligned }));
        self.push_wake.notify_one();
        Ok(aligned)
    }

    pub fn cancel_item(&self, item_id: i64) -> EngineResult<()> {
        self.store.cancel_item(item_id)?;
        self.emit_queue_updated(json!({ "item_id": item_id, "op": "cancel" }));
        Ok(())
    }

    pub fn retry_item(&self, item_id: i64) -> EngineResult<()> {
        self.store.retry_item(item_id)?;
        self.emit_queue_updated(json!({ "item_id": item_id, "op": "retry" }));
        self.push_wake.notify_one();
        Ok(())
    }

    /// Retry a batch; items that are not retryable are reported back, not
    /// fatal for the rest.
    pub fn batch_retry(&self, item_ids: &[i64]) -> EngineResult<(usize, Vec<i64>)> {
        let mut retried = 0;
        let mut rejected = Vec::new();
        for &id in item_ids {
            match self.store.retry_item(id) {
                Ok(()) => retried += 1,
                Err(_) => rejected.push(id),
            }
        }
        if retried > 0 {
            self.emit_queue_updated(json!({ "op": "batch_retry", "retried": retried }));
            self.push_wake.notify_one();
        }
        Ok((retried, rejected))
    }

    fn emit_queue_updated(&self, payload: serde_json::Value) {
        self.bus.publish(EventKind::QueueUpdated, payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::QueueStatus;
    use crate::engine::clock::iso_in_secs;
    use crate::engine::store::QueueUpsert;

    fn ops() -> (Arc<Store>, QueueOps, tokio::sync::broadcast::Receiver<crate::atoms::types::BusEvent>) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let bus = Arc::new(EventBus::new(Arc::clone(&store)));
        let rx = bus.subscribe();
        let ops = QueueOps::new(Arc::clone(&store), bus, Arc::new(Notify::new()));
        (store, ops, rx)
    }

    fn seed_item(store: &Store, content: i64) -> i64 {
        store
            .upsert_queue_item(&QueueUpsert {
                content_id: content,
                rule_id: 1,
                bot_chat_id: 1,
                needs_approval: false,
                scheduled_at: iso_in_secs(3600),
                priority: 0,
                nsfw_routing_result: None,
                passed_rate_limit: true,
                rate_limit_reason: None,
                reopen_terminal: false,
            })
            .unwrap()
            .id()
    }

    #[tokio::test]
    async fn push_now_rewinds_and_emits() {
        let (store, ops, mut rx) = ops();
        let id = seed_item(&store, 1);
        ops.push_now_item(id).unwrap();

        let item = store.get_queue_item(id).unwrap();
        assert!(item.scheduled_at.unwrap() < iso_in_secs(0));
        assert_eq!(item.priority, crate::atoms::constants::PUSH_NOW_PRIORITY);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, "queue_updated");
        assert_eq!(event.payload["op"], "push_now");

        // And a durable distribute task exists for cross-process pickup.
        let tasks = store.claim_tasks("w", &[TaskKind::Distribute], 10, 600).unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].payload["queue_item_id"], id);
    }

    #[tokio::test]
    async fn schedule_validates_timestamp() {
        let (store, ops, _rx) = ops();
        seed_item(&store, 2);
        assert!(ops.schedule_content(2, "tomorrow").is_err());
        assert_eq!(ops.schedule_content(2, &iso_in_secs(60)).unwrap(), 1);
    }

    #[tokio::test]
    async fn batch_retry_reports_rejects() {
        let (store, ops, _rx) = ops();
        let good = seed_item(&store, 3);
        store.claim_due_items("w", 0, 600).unwrap();
        // `good` is still scheduled (not due yet) → not retryable.
        let (retried, rejected) = ops.batch_retry(&[good, 9999]).unwrap();
        assert_eq!(retried, 0);
        assert_eq!(rejected, vec![good, 9999]);

        // Fail it properly, then retry succeeds.
        store.queue_item_failed(good, "x", crate::atoms::error::ErrorKind::Fatal).unwrap();
        let (retried, rejected) = ops.batch_retry(&[good]).unwrap();
        assert_eq!(retried, 1);
        assert!(rejected.is_empty());
        assert_eq!(store.get_queue_item(good).unwrap().status, QueueStatus::Scheduled);
    }
}
