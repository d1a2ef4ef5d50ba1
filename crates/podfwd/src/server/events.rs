//! `GET /api/forwards/events`: forward events as server-sent events.
//!
//! Each client gets its own subscription. The first event is always `init`
//! with the full rule list; later events follow in the order the manager
//! produced them. The stream ends when the client disconnects, when it falls
//! so far behind that its queue overflows, or when the server shuts down; the
//! subscription goes with it. A client cut off for falling behind reconnects
//! and starts over from a fresh `init`.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::{
    extract::State,
    http::{header, HeaderName},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
};
use common::ForwardEvent;
use forwarder::{ForwardManager, ObserverError, Subscription};
use futures::{Stream, StreamExt};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use super::state::AppState;

/// Events buffered per client before it is disconnected.
const EVENT_QUEUE_DEPTH: usize = 256;

/// Events for one client. Dropping it unsubscribes.
pub struct EventStream {
    events: ReceiverStream<ForwardEvent>,
    overflowed: Arc<AtomicBool>,
    _subscription: Subscription,
}

impl Stream for EventStream {
    type Item = ForwardEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        // A client that missed an event must not see later ones.
        if self.overflowed.load(Ordering::Acquire) {
            return Poll::Ready(None);
        }
        Pin::new(&mut self.events).poll_next(cx)
    }
}

/// Subscribe to `manager`. The `init` event is already queued on return.
pub fn subscribe(manager: &ForwardManager) -> EventStream {
    subscribe_bounded(manager, EVENT_QUEUE_DEPTH)
}

fn subscribe_bounded(manager: &ForwardManager, depth: usize) -> EventStream {
    let (tx, rx) = mpsc::channel(depth);
    let overflowed = Arc::new(AtomicBool::new(false));
    let flag = overflowed.clone();
    let subscription = manager.subscribe(move |event| {
        if flag.load(Ordering::Acquire) {
            return Ok(());
        }
        match tx.try_send(event.clone()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                flag.store(true, Ordering::Release);
                Err(ObserverError::new("event queue full; closing client stream"))
            }
            Err(e) => Err(ObserverError::new(e)),
        }
    });
    EventStream {
        events: ReceiverStream::new(rx),
        overflowed,
        _subscription: subscription,
    }
}

/// `GET /api/forwards/events` — live forward events.
pub async fn stream_events(State(state): State<AppState>) -> impl IntoResponse {
    let events = subscribe(&state.manager);
    debug!(subscribers = state.manager.subscriber_count(), "event stream opened");

    let events = events
        .map(|event| Event::default().json_data(&event))
        .take_until(state.shutdown.clone().cancelled_owned());

    let sse = Sse::new(events).keep_alive(
        KeepAlive::new()
            .interval(state.sse_heartbeat)
            .text("ping"),
    );

    (
        [
            (header::CACHE_CONTROL, "no-cache, no-transform"),
            (HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        sse,
    )
}
