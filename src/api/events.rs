// VaultStream API — SSE Event Stream
//
// `GET /api/v1/events/subscribe` bridges the in-process event bus onto a
// `text/event-stream` response: each bus event becomes one SSE message with
// `event:` set to the kind and `data:` carrying the JSON payload. A lagged
// subscriber (bounded queue overflow) receives a `dropped_n` counter event
// instead of silently missing messages.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use log::debug;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use crate::engine::events::EventBus;
use crate::engine::state::EngineState;

pub async fn subscribe(
    State(state): State<Arc<EngineState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.bus.subscribe();
    debug!("[api] SSE subscriber connected ({} live)", state.bus.subscriber_count());

    let stream = BroadcastStream::new(rx).map(|item| {
        let bus_event = match item {
            Ok(event) => event,
            Err(BroadcastStreamRecvError::Lagged(dropped)) => EventBus::dropped_event(dropped),
        };
        let data = serde_json::to_string(&bus_event.payload).unwrap_or_else(|_| "{}".into());
        Ok(Event::default().event(bus_event.kind).data(data))
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}
