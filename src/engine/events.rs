// VaultStream Engine — Realtime Event Bus
//
// Two delivery paths compose `publish`:
//   1. In-process: a tokio broadcast channel fans out to every live
//      subscriber (SSE handlers, tests).
//   2. Cross-process: the same event is appended to the durable
//      `realtime_events` outbox; a background poller in every process tails
//      the table and re-broadcasts rows written by *other* processes
//      (rows whose `origin` matches our own are skipped, so local publishes
//      are delivered exactly once).
//
// Ordering is per-subscriber FIFO. Subscriber queues are bounded: a slow
// subscriber is lagged by the broadcast channel and observes a synthetic
// `dropped_n` counter event instead of blocking publishers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, warn};
use serde_json::{json, Value};
use tokio::sync::broadcast;

use crate::atoms::constants::{EVENT_CHANNEL_CAPACITY, OUTBOX_POLL_MS};
use crate::atoms::error::EngineResult;
use crate::atoms::types::{BusEvent, EventKind};
use crate::engine::store::Store;

pub struct EventBus {
    tx: broadcast::Sender<BusEvent>,
    store: Arc<Store>,
    /// Unique per process; lets the outbox poller ignore its own rows.
    origin: String,
}

impl EventBus {
    pub fn new(store: Arc<Store>) -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        EventBus { tx, store, origin: uuid::Uuid::new_v4().to_string() }
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Durable append + local fan-out. A failed outbox write is logged and
    /// local delivery still happens; the reverse (durable but silent) would
    /// hide events from the very user who caused them.
    pub fn publish(&self, kind: EventKind, payload: Value) {
        if let Err(e) = self.store.append_event(kind.as_str(), &payload, &self.origin) {
            warn!("[events] Outbox append failed for {}: {}", kind.as_str(), e);
        }
        // Send fails only when there are no subscribers; that is fine.
        let _ = self.tx.send(BusEvent { kind: kind.as_str().to_string(), payload });
    }

    /// Long-lived subscription. Each subscriber gets every event published
    /// after this call, local and remote.
    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// The synthetic event a lagged subscriber receives in place of the
    /// events its bounded queue dropped.
    pub fn dropped_event(dropped: u64) -> BusEvent {
        BusEvent { kind: "dropped_n".into(), payload: json!({ "dropped": dropped }) }
    }

    /// Fan out outbox rows past `cursor` written by other processes.
    /// Returns the advanced cursor. One poll step; the spawned poller loops
    /// over this.
    pub fn drain_outbox(&self, cursor: i64) -> EngineResult<i64> {
        let rows = self.store.events_after(cursor, 256)?;
        let mut next = cursor;
        for row in rows {
            next = row.id;
            if row.origin == self.origin {
                continue;
            }
            debug!("[events] Relaying remote event {} ({})", row.id, row.kind);
            let _ = self.tx.send(BusEvent { kind: row.kind, payload: row.payload });
        }
        Ok(next)
    }

    /// Spawn the cross-process poller. Starts at the current outbox head so
    /// history is not replayed, then tails at `OUTBOX_POLL_MS`.
    pub fn spawn_outbox_poller(self: &Arc<Self>, stop: Arc<AtomicBool>) -> tokio::task::JoinHandle<()> {
        let bus = Arc::clone(self);
        tokio::spawn(async move {
            let mut cursor = bus.store.latest_event_id().unwrap_or(0);
            loop {
                if stop.load(Ordering::Relaxed) {
                    break;
                }
                match bus.drain_outbox(cursor) {
                    Ok(next) => cursor = next,
                    Err(e) => warn!("[events] Outbox poll failed: {}", e),
                }
                tokio::time::sleep(std::time::Duration::from_millis(OUTBOX_POLL_MS)).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bus() -> EventBus {
        EventBus::new(Arc::new(Store::open_in_memory().unwrap()))
    }

    #[tokio::test]
    async fn publish_reaches_subscriber_and_outbox() {
        let bus = bus();
        let mut rx = bus.subscribe();
        bus.publish(EventKind::QueueUpdated, json!({"content_id": 1}));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, "queue_updated");
        assert_eq!(event.payload["content_id"], 1);

        let rows = bus.store.events_after(0, 10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].kind, "queue_updated");
        assert_eq!(rows[0].origin, bus.origin());
    }

    #[tokio::test]
    async fn two_subscribers_each_get_every_event() {
        let bus = bus();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        bus.publish(EventKind::ContentCreated, json!({"id": 1}));
        bus.publish(EventKind::ContentPushed, json!({"id": 1}));

        for rx in [&mut a, &mut b] {
            assert_eq!(rx.recv().await.unwrap().kind, "content_created");
            assert_eq!(rx.recv().await.unwrap().kind, "content_pushed");
        }
    }

    #[tokio::test]
    async fn drain_skips_own_rows_and_relays_foreign_ones() {
        let bus = bus();
        let mut rx = bus.subscribe();

        // Our own publish lands in the outbox but must not be re-delivered.
        bus.publish(EventKind::QueueUpdated, json!({"n": 1}));
        let _ = rx.recv().await.unwrap();
        let cursor = bus.drain_outbox(0).unwrap();
        assert!(rx.try_recv().is_err(), "own outbox row must not be relayed");

        // A row from another process is relayed exactly once.
        bus.store
            .append_event("content_updated", &json!({"n": 2}), "other-process")
            .unwrap();
        let cursor = bus.drain_outbox(cursor).unwrap();
        let relayed = rx.recv().await.unwrap();
        assert_eq!(relayed.kind, "content_updated");
        assert_eq!(bus.drain_outbox(cursor).unwrap(), cursor, "cursor is stable when drained");
    }
}
