//! Topic-based pub/sub bus
//!
//! Topics are created lazily on first publish or subscribe and backed by
//! tokio broadcast channels, so delivery within a topic is FIFO and a
//! subscriber that falls behind sees `RecvError::Lagged` instead of
//! blocking publishers.

use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::trace;

use super::BusEvent;

/// Default per-topic channel capacity. Event streams from busy daemons can
/// burst, so this errs on the large side.
const DEFAULT_CAPACITY: usize = 1024;

pub struct EventBus {
    topics: DashMap<String, broadcast::Sender<BusEvent>>,
    capacity: usize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            topics: DashMap::new(),
            capacity,
        }
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<BusEvent> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    /// Publish an event on a topic. Returns the number of receivers that
    /// got it; an event published to a topic nobody listens on is dropped.
    pub fn publish(&self, topic: &str, event: BusEvent) -> usize {
        let delivered = self.sender(topic).send(event).unwrap_or(0);
        trace!(topic, delivered, "published bus event");
        delivered
    }

    /// Subscribe to a topic. Only events published after this call are
    /// delivered.
    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<BusEvent> {
        self.sender(topic).subscribe()
    }

    /// Drop a topic, disconnecting its subscribers. Used when the entity a
    /// per-instance topic belongs to goes away.
    pub fn remove_topic(&self, topic: &str) {
        self.topics.remove(topic);
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .get(topic)
            .map(|s| s.receiver_count())
            .unwrap_or(0)
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
    use crate::events::{ClusterEvent, ClusterEventKind, JobEvent};

    fn cluster_event(name: &str) -> BusEvent {
        BusEvent::Cluster(ClusterEvent {
            cluster: name.to_string(),
            kind: ClusterEventKind::Created,
        })
    }

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe("cluster-events");

        bus.publish("cluster-events", cluster_event("alpha"));

        match rx.recv().await.unwrap() {
            BusEvent::Cluster(ev) => assert_eq!(ev.cluster, "alpha"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_topics_are_isolated() {
        let bus = EventBus::new();
        let mut a = bus.subscribe("job.1");
        let mut b = bus.subscribe("job.2");

        bus.publish(
            "job.1",
            BusEvent::Job(JobEvent {
                job: "1".into(),
                line: Some("step one".into()),
                status: None,
            }),
        );

        assert!(matches!(a.recv().await.unwrap(), BusEvent::Job(_)));
        assert!(b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_topic_fifo() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe("cluster-events");

        for name in ["one", "two", "three"] {
            bus.publish("cluster-events", cluster_event(name));
        }

        for expected in ["one", "two", "three"] {
            match rx.recv().await.unwrap() {
                BusEvent::Cluster(ev) => assert_eq!(ev.cluster, expected),
                other => panic!("unexpected event: {:?}", other),
            }
        }
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new();
        assert_eq!(bus.publish("nowhere", cluster_event("x")), 0);
        assert_eq!(bus.subscriber_count("nowhere"), 0);
    }
}
