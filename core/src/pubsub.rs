//! Pluggable pub/sub for multi-node fan-out.
//!
//! A server configured with a [`PubSub`] subscribes to
//! [`CHANNEL_BROADCAST`] (fan-out to every local session) and
//! `ws:room:*` (payload carries `_roomId` for local room fan-out), so
//! broadcasts published by any node reach the sessions on this one.
//! [`MemoryPubSub`] is the in-process implementation used for
//! single-node setups and tests; production deployments plug in Redis
//! or NATS behind the same trait.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::errors::Error;
use crate::protocol::Message;

/// Channel every node publishes global broadcasts on.
pub const CHANNEL_BROADCAST: &str = "ws:broadcast";

/// Channel prefix for per-room broadcasts (`ws:room:<room-id>`).
pub const CHANNEL_ROOM_PREFIX: &str = "ws:room:";

/// The wildcard pattern covering every room channel.
pub const CHANNEL_ROOM_PATTERN: &str = "ws:room:*";

/// A message received from a subscription, with the concrete channel it
/// arrived on.
#[derive(Debug, Clone)]
pub struct ChannelMessage {
    pub channel: String,
    pub message: Message,
}

/// External pub/sub capability.
#[async_trait]
pub trait PubSub: Send + Sync {
    async fn publish(&self, channel: &str, message: &Message) -> Result<(), Error>;

    /// Subscribe to a channel or wildcard pattern. Messages published
    /// to matching channels arrive on the returned receiver.
    async fn subscribe(
        &self,
        pattern: &str,
    ) -> Result<mpsc::UnboundedReceiver<ChannelMessage>, Error>;

    async fn unsubscribe(&self, pattern: &str) -> Result<(), Error>;

    async fn close(&self);
}

/// Whether a colon-separated channel matches a pattern where `*`
/// matches exactly one segment.
pub fn channel_matches(pattern: &str, channel: &str) -> bool {
    let pattern: Vec<&str> = pattern.split(':').collect();
    let channel: Vec<&str> = channel.split(':').collect();
    if pattern.len() != channel.len() {
        return false;
    }
    pattern
        .iter()
        .zip(&channel)
        .all(|(p, c)| *p == "*" || p == c)
}

/// In-process [`PubSub`] backed by unbounded channels.
#[derive(Default)]
pub struct MemoryPubSub {
    subscriptions: Mutex<Vec<Subscription>>,
    closed: AtomicBool,
}

struct Subscription {
    pattern: String,
    tx: mpsc::UnboundedSender<ChannelMessage>,
}

impl MemoryPubSub {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PubSub for MemoryPubSub {
    async fn publish(&self, channel: &str, message: &Message) -> Result<(), Error> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Internal("pub/sub is closed".to_string()));
        }
        let mut subscriptions = self.subscriptions.lock();
        // Prune subscribers whose receiver is gone while delivering.
        subscriptions.retain(|sub| {
            if !channel_matches(&sub.pattern, channel) {
                return true;
            }
            sub.tx
                .send(ChannelMessage {
                    channel: channel.to_string(),
                    message: message.clone(),
                })
                .is_ok()
        });
        Ok(())
    }

    async fn subscribe(
        &self,
        pattern: &str,
    ) -> Result<mpsc::UnboundedReceiver<ChannelMessage>, Error> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Internal("pub/sub is closed".to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscriptions.lock().push(Subscription {
            pattern: pattern.to_string(),
            tx,
        });
        Ok(rx)
    }

    async fn unsubscribe(&self, pattern: &str) -> Result<(), Error> {
        self.subscriptions.lock().retain(|sub| sub.pattern != pattern);
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.subscriptions.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_matches_one_segment() {
        assert!(channel_matches("ws:room:*", "ws:room:lobby"));
        assert!(channel_matches("ws:broadcast", "ws:broadcast"));
        assert!(!channel_matches("ws:room:*", "ws:room:lobby:extra"));
        assert!(!channel_matches("ws:room:*", "ws:broadcast"));
        assert!(channel_matches("ws:*:lobby", "ws:room:lobby"));
    }

    #[tokio::test]
    async fn publish_reaches_matching_subscribers() {
        let bus = MemoryPubSub::new();
        let mut rooms = bus.subscribe("ws:room:*").await.unwrap();
        let mut broadcast = bus.subscribe(CHANNEL_BROADCAST).await.unwrap();

        let msg = Message::new("1.0", "chat.message");
        bus.publish("ws:room:lobby", &msg).await.unwrap();

        let received = rooms.recv().await.unwrap();
        assert_eq!(received.channel, "ws:room:lobby");
        assert_eq!(received.message.event, "chat.message");
        assert!(broadcast.try_recv().is_err());
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let bus = MemoryPubSub::new();
        let mut rx = bus.subscribe("ws:broadcast").await.unwrap();
        bus.unsubscribe("ws:broadcast").await.unwrap();
        bus.publish("ws:broadcast", &Message::new("1.0", "x"))
            .await
            .unwrap();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn closed_bus_rejects_operations() {
        let bus = MemoryPubSub::new();
        bus.close().await;
        assert!(bus.publish("ws:broadcast", &Message::new("1.0", "x")).await.is_err());
        assert!(bus.subscribe("ws:broadcast").await.is_err());
    }

    #[tokio::test]
    async fn dropped_receivers_are_pruned() {
        let bus = MemoryPubSub::new();
        let rx = bus.subscribe("ws:broadcast").await.unwrap();
        drop(rx);
        bus.publish("ws:broadcast", &Message::new("1.0", "x"))
            .await
            .unwrap();
        assert!(bus.subscriptions.lock().is_empty());
    }
}
