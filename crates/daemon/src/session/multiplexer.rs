//! Session event multiplexer.
//!
//! This module fans session events out to any number of live subscribers.
//! Delivery never blocks the producer: each subscriber has a bounded
//! channel fed with `try_send`, and a subscriber whose channel is full or
//! closed is removed on the spot. A removed subscriber can recover by
//! polling the session history with `since`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use protocol::SessionEvent;
use tokio::sync::mpsc;

/// Unique identifier for a subscriber within one session.
pub type SubscriberId = u64;

/// Default channel capacity for subscriber queues.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 256;

/// Statistics about a subscriber's deliveries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriberStats {
    /// Events delivered successfully.
    pub events_sent: u64,
}

/// Sending half kept by the hub for one subscriber.
struct SubscriberHandle {
    id: SubscriberId,
    tx: mpsc::Sender<SessionEvent>,
    stats: SubscriberStats,
}

impl SubscriberHandle {
    /// Attempts to deliver `event` without blocking.
    ///
    /// Returns false if the subscriber must be dropped.
    fn try_send(&mut self, event: SessionEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => {
                self.stats.events_sent += 1;
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(
                    subscriber_id = self.id,
                    delivered = self.stats.events_sent,
                    "Subscriber queue full, dropping subscriber"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(subscriber_id = self.id, "Subscriber channel closed");
                false
            }
        }
    }
}

/// Receiving half handed to a subscriber.
///
/// The channel closes when the session finishes (after the final
/// `Exited` event) or when the subscriber is dropped by the hub.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriberId,
    rx: mpsc::Receiver<SessionEvent>,
}

impl Subscription {
    /// Returns the subscriber ID, used to unsubscribe.
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Waits for the next event. `None` once the channel is closed.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        self.rx.recv().await
    }

    /// Returns the next event if one is queued.
    pub fn try_recv(&mut self) -> Option<SessionEvent> {
        self.rx.try_recv().ok()
    }
}

#[derive(Default)]
struct HubState {
    subscribers: HashMap<SubscriberId, SubscriberHandle>,
    final_event: Option<SessionEvent>,
}

/// Fans session events out to subscribers.
pub struct SubscriberHub {
    state: Mutex<HubState>,
    next_id: AtomicU64,
    capacity: usize,
}

impl SubscriberHub {
    /// Creates a hub whose subscriber queues hold `capacity` events.
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(HubState::default()),
            next_id: AtomicU64::new(1),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a subscriber.
    ///
    /// On a closed hub the subscription receives the final event and then
    /// ends immediately.
    pub fn subscribe(&self) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.capacity);

        let mut state = self.lock();
        match &state.final_event {
            Some(event) => {
                let _ = tx.try_send(event.clone());
            }
            None => {
                state.subscribers.insert(
                    id,
                    SubscriberHandle {
                        id,
                        tx,
                        stats: SubscriberStats::default(),
                    },
                );
                tracing::debug!(subscriber_id = id, "Added subscriber");
            }
        }

        Subscription { id, rx }
    }

    /// Removes a subscriber. Returns its statistics if it was registered.
    pub fn unsubscribe(&self, id: SubscriberId) -> Option<SubscriberStats> {
        self.lock().subscribers.remove(&id).map(|handle| handle.stats)
    }

    /// Delivers `event` to every subscriber, dropping the ones that cannot
    /// keep up. Returns the number of successful deliveries.
    pub fn broadcast(&self, event: &SessionEvent) -> usize {
        let mut state = self.lock();
        let mut delivered = 0;
        state.subscribers.retain(|_, handle| {
            let ok = handle.try_send(event.clone());
            if ok {
                delivered += 1;
            }
            ok
        });
        delivered
    }

    /// Sends `final_event` to everyone and closes every channel.
    ///
    /// Later calls are no-ops.
    pub fn close(&self, final_event: SessionEvent) {
        let mut state = self.lock();
        if state.final_event.is_some() {
            return;
        }

        for (_, mut handle) in state.subscribers.drain() {
            handle.try_send(final_event.clone());
        }
        state.final_event = Some(final_event);
    }

    /// Returns true once [`close`](Self::close) has run.
    pub fn is_closed(&self) -> bool {
        self.lock().final_event.is_some()
    }

    /// Number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    /// Statistics for one subscriber.
    pub fn subscriber_stats(&self, id: SubscriberId) -> Option<SubscriberStats> {
        self.lock().subscribers.get(&id).map(|handle| handle.stats.clone())
    }
}

impl Default for SubscriberHub {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_CAPACITY)
    }
}
