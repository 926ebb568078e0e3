//! In-memory event fan-out with optional cross-process bridging.
//!
//! Subscribers get a bounded channel each; delivery is non-blocking and a
//! full buffer drops that delivery for that subscriber only. A slow
//! consumer can never stall the publisher or its peers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::Event;

/// Per-subscriber channel capacity.
pub const SUBSCRIBER_BUFFER: usize = 64;

/// Outbound side of an external notification channel (e.g. Postgres
/// NOTIFY). Expected to return without waiting for remote delivery.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, payload: &str) -> anyhow::Result<()>;
}

/// Fan-out broker for task events.
///
/// When a [`Notifier`] is configured, `publish` routes through the external
/// channel and local delivery happens in [`EventBroker::receive`] once the
/// listen loop echoes the payload back; otherwise `publish` fans out
/// directly. Only one of the two paths ever fans out a given event.
pub struct EventBroker {
    subscribers: RwLock<HashMap<u64, mpsc::Sender<Event>>>,
    next_id: AtomicU64,
    notifier: Option<Arc<dyn Notifier>>,
}

impl Default for EventBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBroker {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            notifier: None,
        }
    }

    pub fn with_notifier(notifier: Arc<dyn Notifier>) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            notifier: Some(notifier),
        }
    }

    /// Register a new subscriber. The returned id is passed to
    /// [`EventBroker::unsubscribe`]; dropping the receiver also works, the
    /// dead sender is pruned on the next fan-out.
    pub fn subscribe(&self) -> (u64, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.write().unwrap().insert(id, tx);
        (id, rx)
    }

    /// Remove and close a subscriber channel. Safe to call once.
    pub fn unsubscribe(&self, id: u64) {
        self.subscribers.write().unwrap().remove(&id);
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().unwrap().len()
    }

    /// Publish an event: through the notifier when configured, otherwise
    /// straight to local subscribers.
    pub async fn publish(&self, event: Event) {
        if let Some(notifier) = &self.notifier {
            match serde_json::to_string(&event) {
                Ok(payload) => {
                    if let Err(e) = notifier.notify(&payload).await {
                        // Keep same-process subscribers alive even when the
                        // bridge is down.
                        warn!(error = %e, "event notifier failed, falling back to local fan-out");
                        self.fan_out(&event);
                    }
                }
                Err(e) => warn!(error = %e, "failed to serialize event"),
            }
        } else {
            self.fan_out(&event);
        }
    }

    /// Inject an event received from the external channel for local
    /// delivery only. Never re-broadcast.
    pub fn receive(&self, event: Event) {
        self.fan_out(&event);
    }

    fn fan_out(&self, event: &Event) {
        let mut dead = Vec::new();
        {
            let subscribers = self.subscribers.read().unwrap();
            for (id, tx) in subscribers.iter() {
                match tx.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        // Drop this delivery for this subscriber only.
                        debug!(subscriber = id, "subscriber buffer full, dropping event");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => dead.push(*id),
                }
            }
        }
        if !dead.is_empty() {
            let mut subscribers = self.subscribers.write().unwrap();
            for id in dead {
                subscribers.remove(&id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventType;

    fn event(task_id: &str) -> Event {
        Event::task_deleted("repo", task_id)
    }

    #[tokio::test]
    async fn delivers_in_publish_order() {
        let broker = EventBroker::new();
        let (_id, mut rx) = broker.subscribe();

        broker.publish(event("tsk-1")).await;
        broker.publish(event("tsk-2")).await;
        broker.publish(event("tsk-3")).await;

        assert_eq!(rx.recv().await.unwrap().task_id, "tsk-1");
        assert_eq!(rx.recv().await.unwrap().task_id, "tsk-2");
        assert_eq!(rx.recv().await.unwrap().task_id, "tsk-3");
    }

    #[tokio::test]
    async fn slow_subscriber_never_blocks_fast_one() {
        let broker = EventBroker::new();
        let (_slow_id, mut slow_rx) = broker.subscribe();
        let (_fast_id, mut fast_rx) = broker.subscribe();

        // Publish past the slow subscriber's buffer while draining the fast
        // one as we go.
        let total = SUBSCRIBER_BUFFER + 10;
        let mut fast_received = Vec::new();
        for i in 0..total {
            broker.publish(event(&format!("tsk-{i}"))).await;
            if let Ok(e) = fast_rx.try_recv() {
                fast_received.push(e.task_id);
            }
        }
        while let Ok(e) = fast_rx.try_recv() {
            fast_received.push(e.task_id);
        }

        // The fast subscriber saw every event even though the slow one's
        // buffer overflowed partway through.
        assert_eq!(fast_received.len(), total);
        assert_eq!(fast_received[0], "tsk-0");
        assert_eq!(fast_received[total - 1], format!("tsk-{}", total - 1));

        // The slow subscriber kept only its buffer's worth; the overflow
        // was dropped, not queued.
        let mut slow_count = 0;
        while slow_rx.try_recv().is_ok() {
            slow_count += 1;
        }
        assert_eq!(slow_count, SUBSCRIBER_BUFFER);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let broker = EventBroker::new();
        let (id, mut rx) = broker.subscribe();
        assert_eq!(broker.subscriber_count(), 1);

        broker.unsubscribe(id);
        assert_eq!(broker.subscriber_count(), 0);

        broker.publish(event("tsk-1")).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn dropped_receiver_is_pruned() {
        let broker = EventBroker::new();
        let (_id, rx) = broker.subscribe();
        drop(rx);

        broker.publish(event("tsk-1")).await;
        assert_eq!(broker.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn receive_fans_out_locally() {
        let broker = EventBroker::new();
        let (_id, mut rx) = broker.subscribe();

        broker.receive(event("tsk-9"));
        let got = rx.recv().await.unwrap();
        assert_eq!(got.event_type, EventType::TaskDeleted);
        assert_eq!(got.task_id, "tsk-9");
    }
}
