//! In-process publish/subscribe for [`ForwardEvent`]s.
//!
//! Publishing is two steps. [`EventBus::enqueue`] appends to an ordered outbox
//! and is cheap enough to call while holding the registry lock;
//! [`EventBus::flush`] delivers the outbox once that lock is released. Only one
//! caller drains at a time, so every observer sees events in enqueue order,
//! and an observer may call back into the manager without deadlocking.
//!
//! The subscriber list lives behind an [`ArcSwap`]; subscribing and
//! unsubscribing swap in a new list.

use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use arc_swap::ArcSwap;
use common::ForwardEvent;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::warn;

/// Returned by an observer that could not take an event.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct ObserverError(String);

impl ObserverError {
    pub fn new(message: impl fmt::Display) -> Self {
        Self(message.to_string())
    }
}

type Observer = Box<dyn Fn(&ForwardEvent) -> Result<(), ObserverError> + Send + Sync>;

struct Subscriber {
    id: u64,
    live: AtomicBool,
    observer: Observer,
}

impl Subscriber {
    fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// Call the observer. Failures and panics are logged, never propagated.
    fn deliver(&self, event: &ForwardEvent) {
        if !self.is_live() {
            return;
        }
        match panic::catch_unwind(AssertUnwindSafe(|| (self.observer)(event))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(subscriber = self.id, error = %e, "event observer failed"),
            Err(_) => warn!(subscriber = self.id, "event observer panicked"),
        }
    }
}

enum Outgoing {
    Event(ForwardEvent),
    /// Hand `init` to a new subscriber, then start delivering to it.
    Attach {
        subscriber: Arc<Subscriber>,
        init: ForwardEvent,
    },
}

/// Broadcasts events to every current subscriber.
pub struct EventBus {
    next_id: AtomicU64,
    subscribers: ArcSwap<Vec<Arc<Subscriber>>>,
    outbox: Mutex<VecDeque<Outgoing>>,
    draining: AtomicBool,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(1),
            subscribers: ArcSwap::from_pointee(Vec::new()),
            outbox: Mutex::new(VecDeque::new()),
            draining: AtomicBool::new(false),
        })
    }

    /// Queue `event` behind everything queued so far. Delivered by [`Self::flush`].
    pub fn enqueue(&self, event: ForwardEvent) {
        self.outbox.lock().push_back(Outgoing::Event(event));
    }

    /// Register `observer`, queued like an event: it receives `init` first,
    /// then every event queued after this call, until the returned
    /// [`Subscription`] is dropped.
    pub fn subscribe<F>(self: &Arc<Self>, init: ForwardEvent, observer: F) -> Subscription
    where
        F: Fn(&ForwardEvent) -> Result<(), ObserverError> + Send + Sync + 'static,
    {
        let subscriber = Arc::new(Subscriber {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            live: AtomicBool::new(true),
            observer: Box::new(observer),
        });
        self.outbox.lock().push_back(Outgoing::Attach {
            subscriber: subscriber.clone(),
            init,
        });
        Subscription {
            bus: Arc::downgrade(self),
            subscriber: Some(subscriber),
        }
    }

    /// Deliver everything queued.
    ///
    /// If another caller is already draining, this returns at once and that
    /// caller delivers the new entries too.
    pub fn flush(&self) {
        loop {
            if self
                .draining
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }
            while let Some(item) = self.pop() {
                self.dispatch(item);
            }
            self.draining.store(false, Ordering::Release);

            // Something may have been queued after our last pop but before
            // the flag cleared; its caller saw us draining and left.
            let pending = !self.outbox.lock().is_empty();
            if !pending {
                return;
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.load().iter().filter(|s| s.is_live()).count()
    }

    fn pop(&self) -> Option<Outgoing> {
        self.outbox.lock().pop_front()
    }

    fn dispatch(&self, item: Outgoing) {
        match item {
            Outgoing::Event(event) => {
                let subscribers = self.subscribers.load();
                for sub in subscribers.iter() {
                    sub.deliver(&event);
                }
            }
            Outgoing::Attach { subscriber, init } => {
                if !subscriber.is_live() {
                    return;
                }
                subscriber.deliver(&init);
                self.subscribers.rcu(|current| {
                    let mut next = Vec::with_capacity(current.len() + 1);
                    next.extend(current.iter().cloned());
                    next.push(subscriber.clone());
                    next
                });
                // Dropped while being attached.
                if !subscriber.is_live() {
                    self.remove(subscriber.id);
                }
            }
        }
    }

    fn remove(&self, id: u64) {
        self.subscribers.rcu(|current| {
            current
                .iter()
                .filter(|s| s.id != id)
                .cloned()
                .collect::<Vec<_>>()
        });
    }
}

/// Registration handle returned by [`EventBus::subscribe`]. Dropping it
/// unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    bus: Weak<EventBus>,
    subscriber: Option<Arc<Subscriber>>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(sub) = self.subscriber.take() {
            sub.live.store(false, Ordering::Release);
            if let Some(bus) = self.bus.upgrade() {
                bus.remove(sub.id);
            }
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.subscriber.as_ref().map(|s| s.id))
            .finish()
    }
}
