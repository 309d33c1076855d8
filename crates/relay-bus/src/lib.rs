//! Topic bus carrying relayed client traffic between the relay service and external consumers.
//!
//! Client messages that are not filter registrations are published on
//! [`inbound_topic`]; replies for a session arrive on [`outbound_topic`] and are written back to
//! that session's socket. [`LocalBus`] keeps everything in-process; networked implementations
//! fan their received messages into a `LocalBus` so subscribers see one interface.

use std::collections::HashMap;

use bytes::Bytes;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::broadcast;

pub const INBOUND_PREFIX: &str = "relay:in:";
pub const OUTBOUND_PREFIX: &str = "relay:out:";

const TOPIC_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Bytes,
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus channel closed")]
    Closed,
    #[error("bus transport error: {0}")]
    Transport(String),
}

pub type BusResult<T> = Result<T, BusError>;

pub trait Bus: Send + Sync {
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<BusMessage>;

    /// Publishes `payload` on `topic`. Returns the number of local subscribers reached; remote
    /// transports report zero because delivery happens elsewhere.
    fn publish(&self, topic: &str, payload: Bytes) -> BusResult<usize>;

    /// Releases topics without subscribers. Returns how many were dropped.
    fn prune(&self) -> usize {
        0
    }
}

/// Topic a session's relayed client messages are published on.
pub fn inbound_topic(session_id: &str) -> String {
    format!("{INBOUND_PREFIX}{session_id}")
}

/// Topic external consumers publish replies for a session on.
pub fn outbound_topic(session_id: &str) -> String {
    format!("{OUTBOUND_PREFIX}{session_id}")
}

/// Session id encoded in an outbound topic, if `topic` is one.
pub fn outbound_session(topic: &str) -> Option<&str> {
    topic
        .strip_prefix(OUTBOUND_PREFIX)
        .filter(|session| !session.is_empty())
}

/// In-memory bus. Topics are created on first subscribe; topics whose subscribers are all gone
/// are dropped on the next failed publish or [`Bus::prune`].
#[derive(Debug, Default)]
pub struct LocalBus {
    topics: RwLock<HashMap<String, broadcast::Sender<BusMessage>>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn topic_count(&self) -> usize {
        self.topics.read().len()
    }
}

impl Bus for LocalBus {
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<BusMessage> {
        let mut guard = self.topics.write();
        guard
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .subscribe()
    }

    fn publish(&self, topic: &str, payload: Bytes) -> BusResult<usize> {
        let sender = match self.topics.read().get(topic) {
            Some(sender) => sender.clone(),
            None => return Ok(0),
        };
        match sender.send(BusMessage {
            topic: topic.to_string(),
            payload,
        }) {
            Ok(reached) => Ok(reached),
            Err(_) => {
                self.prune();
                Ok(0)
            }
        }
    }

    fn prune(&self) -> usize {
        let mut guard = self.topics.write();
        let before = guard.len();
        guard.retain(|_, sender| sender.receiver_count() > 0);
        before - guard.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::tokio_timeout_test(5)]
    async fn subscriber_receives_published_payload() {
        let bus = LocalBus::new();
        let mut sub = bus.subscribe(&outbound_topic("abc"));
        let reached = bus
            .publish(&outbound_topic("abc"), Bytes::from_static(b"pong"))
            .expect("publish ok");
        assert_eq!(reached, 1);
        let msg = sub.recv().await.expect("receive ok");
        assert_eq!(msg.topic, "relay:out:abc");
        assert_eq!(msg.payload, Bytes::from_static(b"pong"));
    }

    #[test_timeout::timeout]
    fn publish_without_subscribers_is_dropped() {
        let bus = LocalBus::new();
        let reached = bus
            .publish(&inbound_topic("abc"), Bytes::from_static(b"{}"))
            .expect("publish ok");
        assert_eq!(reached, 0);
        assert_eq!(bus.topic_count(), 0);
    }

    #[test_timeout::timeout]
    fn abandoned_topics_are_pruned() {
        let bus = LocalBus::new();
        let sub = bus.subscribe("relay:out:one");
        let _kept = bus.subscribe("relay:out:two");
        drop(sub);
        assert_eq!(bus.prune(), 1);
        assert_eq!(bus.topic_count(), 1);

        let reached = bus
            .publish("relay:out:one", Bytes::from_static(b"x"))
            .expect("publish ok");
        assert_eq!(reached, 0);
    }

    #[test_timeout::timeout]
    fn outbound_session_parses_topic() {
        assert_eq!(outbound_session("relay:out:abc"), Some("abc"));
        assert_eq!(outbound_session("relay:out:"), None);
        assert_eq!(outbound_session("relay:in:abc"), None);
    }
}
