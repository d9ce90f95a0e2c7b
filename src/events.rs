//! In-process event bus.
//!
//! Mutation operations and the scheduler publish lifecycle events here;
//! subscriber streams attach to receive them. Fan-out is best-effort and
//! transient: each subscriber gets its own unbounded queue, a publish
//! never blocks on a slow consumer, and events published before a
//! subscriber attaches (or after it detaches) are simply not seen by it.

use crate::activity::Activity;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

/// Kind of lifecycle event carried on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Created,
    Updated,
    Completed,
    Deleted,
    Snoozed,
    DueSoon,
    Missed,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventKind::Created => write!(f, "created"),
            EventKind::Updated => write!(f, "updated"),
            EventKind::Completed => write!(f, "completed"),
            EventKind::Deleted => write!(f, "deleted"),
            EventKind::Snoozed => write!(f, "snoozed"),
            EventKind::DueSoon => write!(f, "due_soon"),
            EventKind::Missed => write!(f, "missed"),
        }
    }
}

/// An ephemeral event message. Not persisted, not retried.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub payload: serde_json::Value,
}

impl ActivityEvent {
    /// Event with the standard activity summary payload.
    pub fn for_activity(kind: EventKind, activity: &Activity) -> Self {
        Self {
            kind,
            payload: json!({
                "id": activity.id,
                "title": activity.title,
                "status": activity.status,
                "deadline": activity.deadline.to_rfc3339(),
            }),
        }
    }

    /// Due-soon reminder event, carrying the lead time that triggered it.
    pub fn due_soon(activity: &Activity) -> Self {
        Self {
            kind: EventKind::DueSoon,
            payload: json!({
                "id": activity.id,
                "title": activity.title,
                "deadline": activity.deadline.to_rfc3339(),
                "notification_minutes": activity.notification_minutes,
            }),
        }
    }

    /// Deletion event; only the id survives the record.
    pub fn deleted(id: uuid::Uuid) -> Self {
        Self {
            kind: EventKind::Deleted,
            payload: json!({ "id": id }),
        }
    }
}

/// Unique subscriber ID. Monotonically increasing, so id order is
/// registration order.
type SubscriberId = u64;

/// Registered delivery destinations, in registration order.
struct SubscriberRegistry {
    subscribers: Vec<(SubscriberId, mpsc::UnboundedSender<ActivityEvent>)>,
    next_id: SubscriberId,
}

impl SubscriberRegistry {
    fn new() -> Self {
        Self {
            subscribers: Vec::new(),
            next_id: 0,
        }
    }

    fn add(&mut self, tx: mpsc::UnboundedSender<ActivityEvent>) -> SubscriberId {
        let id = self.next_id;
        self.next_id += 1;
        self.subscribers.push((id, tx));
        id
    }

    fn remove(&mut self, id: SubscriberId) {
        self.subscribers.retain(|(sub_id, _)| *sub_id != id);
    }

    /// Delivers an event to every destination in registration order.
    /// Returns IDs whose receiver is gone, for cleanup.
    fn deliver(&self, event: &ActivityEvent) -> Vec<SubscriberId> {
        let mut failed = Vec::new();
        for (id, tx) in &self.subscribers {
            if tx.send(event.clone()).is_err() {
                failed.push(*id);
            }
        }
        failed
    }

    fn count(&self) -> usize {
        self.subscribers.len()
    }
}

/// Handle returned by [`EventBus::subscribe`].
///
/// Owns the delivery queue; dropping it detaches the subscriber (the bus
/// prunes the dead destination on the next publish). Undelivered events
/// are dropped silently.
pub struct Subscription {
    id: SubscriberId,
    rx: mpsc::UnboundedReceiver<ActivityEvent>,
}

impl Subscription {
    /// Receives the next event, in publish order.
    /// Returns `None` once detached and drained.
    pub async fn recv(&mut self) -> Option<ActivityEvent> {
        self.rx.recv().await
    }

    /// Non-blocking receive, for test drain loops.
    #[cfg(test)]
    pub fn try_recv(&mut self) -> Option<ActivityEvent> {
        self.rx.try_recv().ok()
    }
}

/// Process-wide publish/subscribe hub.
///
/// Cheap to clone; all clones share one registry.
#[derive(Clone)]
pub struct EventBus {
    registry: Arc<RwLock<SubscriberRegistry>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(RwLock::new(SubscriberRegistry::new())),
        }
    }

    /// Registers a new delivery destination.
    pub async fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.registry.write().await.add(tx);
        tracing::debug!("Subscriber {} attached", id);
        Subscription { id, rx }
    }

    /// Removes a destination. Nothing is delivered to it afterward;
    /// calling this for an already-removed handle is a no-op.
    pub async fn unsubscribe(&self, subscription: &Subscription) {
        self.registry.write().await.remove(subscription.id);
        tracing::debug!("Subscriber {} detached", subscription.id);
    }

    /// Fans an event out to every attached subscriber. Never blocks on a
    /// slow consumer and never surfaces subscriber-side failure to the
    /// caller; destinations whose receiver is gone are pruned.
    ///
    /// The write lock is held for the whole fan-out so concurrent
    /// publishes are serialized: every subscriber observes the same
    /// relative order of any two events.
    pub async fn publish(&self, event: ActivityEvent) {
        let mut registry = self.registry.write().await;
        for id in registry.deliver(&event) {
            registry.remove(id);
            tracing::debug!("Pruned dead subscriber {}", id);
        }
    }

    /// Number of currently attached subscribers.
    pub async fn subscriber_count(&self) -> usize {
        self.registry.read().await.count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample_event(kind: EventKind) -> ActivityEvent {
        let activity = Activity::new("sample", Utc::now());
        ActivityEvent::for_activity(kind, &activity)
    }

    #[tokio::test]
    async fn test_subscriber_receives_events_published_after_attach() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe().await;

        bus.publish(sample_event(EventKind::Created)).await;

        let event = sub.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::Created);
    }

    #[tokio::test]
    async fn test_events_before_attach_are_not_seen() {
        let bus = EventBus::new();
        bus.publish(sample_event(EventKind::Created)).await;

        let mut sub = bus.subscribe().await;
        bus.publish(sample_event(EventKind::Updated)).await;

        let event = sub.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::Updated);
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_unsubscribed_destination_gets_nothing() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe().await;
        bus.unsubscribe(&sub).await;

        bus.publish(sample_event(EventKind::Created)).await;
        assert!(sub.try_recv().is_none());
        assert_eq!(bus.subscriber_count().await, 0);
    }

    #[tokio::test]
    async fn test_two_subscribers_see_same_order() {
        let bus = EventBus::new();
        let mut first = bus.subscribe().await;
        let mut second = bus.subscribe().await;

        bus.publish(sample_event(EventKind::Created)).await;
        bus.publish(sample_event(EventKind::Completed)).await;
        bus.publish(sample_event(EventKind::Deleted)).await;

        for sub in [&mut first, &mut second] {
            assert_eq!(sub.recv().await.unwrap().kind, EventKind::Created);
            assert_eq!(sub.recv().await.unwrap().kind, EventKind::Completed);
            assert_eq!(sub.recv().await.unwrap().kind, EventKind::Deleted);
        }
    }

    #[tokio::test]
    async fn test_concurrent_publishers_deliver_in_one_shared_order() {
        let bus = EventBus::new();
        let mut first = bus.subscribe().await;
        let mut second = bus.subscribe().await;

        // Two tasks racing on the same bus, distinguishable by kind.
        let bus_a = bus.clone();
        let publisher_a = tokio::spawn(async move {
            for _ in 0..100 {
                bus_a.publish(sample_event(EventKind::Created)).await;
                tokio::task::yield_now().await;
            }
        });
        let bus_b = bus.clone();
        let publisher_b = tokio::spawn(async move {
            for _ in 0..100 {
                bus_b.publish(sample_event(EventKind::Updated)).await;
                tokio::task::yield_now().await;
            }
        });
        publisher_a.await.unwrap();
        publisher_b.await.unwrap();

        let mut seen_by_first = Vec::new();
        while let Some(event) = first.try_recv() {
            seen_by_first.push(event.kind);
        }
        let mut seen_by_second = Vec::new();
        while let Some(event) = second.try_recv() {
            seen_by_second.push(event.kind);
        }

        // Whatever interleaving the race produced, both subscribers saw
        // the same one.
        assert_eq!(seen_by_first.len(), 200);
        assert_eq!(seen_by_first, seen_by_second);
    }

    #[tokio::test]
    async fn test_dropped_subscriber_is_pruned_on_publish() {
        let bus = EventBus::new();
        let sub = bus.subscribe().await;
        let _live = bus.subscribe().await;
        assert_eq!(bus.subscriber_count().await, 2);

        drop(sub);
        bus.publish(sample_event(EventKind::Created)).await;
        assert_eq!(bus.subscriber_count().await, 1);
    }

    #[tokio::test]
    async fn test_slow_subscriber_does_not_block_publisher() {
        let bus = EventBus::new();
        // Never read from this subscription; its queue just grows.
        let mut stalled = bus.subscribe().await;
        let mut live = bus.subscribe().await;

        for _ in 0..1000 {
            bus.publish(sample_event(EventKind::Updated)).await;
        }

        // The live subscriber saw everything despite the stalled peer.
        let mut seen = 0;
        while live.try_recv().is_some() {
            seen += 1;
        }
        assert_eq!(seen, 1000);
        assert!(stalled.try_recv().is_some());
    }

    #[test]
    fn test_event_kind_serializes_snake_case() {
        let json = serde_json::to_string(&EventKind::DueSoon).unwrap();
        assert_eq!(json, "\"due_soon\"");
    }

    #[test]
    fn test_due_soon_event_carries_lead_time() {
        let mut activity = Activity::new("standup", Utc::now());
        activity.notification_minutes = 15;
        let event = ActivityEvent::due_soon(&activity);
        assert_eq!(event.kind, EventKind::DueSoon);
        assert_eq!(event.payload["notification_minutes"], 15);
        assert_eq!(event.payload["title"], "standup");
    }
}
