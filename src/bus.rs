// =============================================================================
// Message Bus (C5) — string-topic pub/sub.
// =============================================================================
//
// One publish fans out to every current subscriber of that topic. Topics
// that have never been subscribed to simply drop their first publish (no
// subscriber, nothing to notify) — callers that need durability use C2/C3
// instead of the bus.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::broadcast;

const TOPIC_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Value,
    pub ts: chrono::DateTime<chrono::Utc>,
}

pub struct Bus {
    topics: RwLock<HashMap<String, broadcast::Sender<BusMessage>>>,
}

impl Bus {
    pub fn new() -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
        }
    }

    pub fn publish(&self, topic: &str, payload: Value) {
        let sender = self.sender_for(topic);
        let _ = sender.send(BusMessage {
            topic: topic.to_string(),
            payload,
            ts: chrono::Utc::now(),
        });
    }

    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<BusMessage> {
        self.sender_for(topic).subscribe()
    }

    fn sender_for(&self, topic: &str) -> broadcast::Sender<BusMessage> {
        if let Some(sender) = self.topics.read().get(topic) {
            return sender.clone();
        }
        let mut topics = self.topics.write();
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CHANNEL_CAPACITY).0)
            .clone()
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn publish_fans_out_to_all_current_subscribers() {
        let bus = Bus::new();
        let mut a = bus.subscribe("spx_stream_log");
        let mut b = bus.subscribe("spx_stream_log");
        bus.publish("spx_stream_log", json!({"msg": "hello"}));
        let msg_a = a.recv().await.unwrap();
        let msg_b = b.recv().await.unwrap();
        assert_eq!(msg_a.payload, json!({"msg": "hello"}));
        assert_eq!(msg_b.payload, json!({"msg": "hello"}));
    }

    #[test]
    fn publish_with_no_subscribers_does_not_panic() {
        let bus = Bus::new();
        bus.publish("system_status", json!({"ok": true}));
    }

    #[tokio::test]
    async fn late_subscriber_does_not_see_earlier_publishes() {
        let bus = Bus::new();
        bus.publish("spx_stream_price", json!({"price": 1.0}));
        let mut late = bus.subscribe("spx_stream_price");
        bus.publish("spx_stream_price", json!({"price": 2.0}));
        let msg = late.recv().await.unwrap();
        assert_eq!(msg.payload, json!({"price": 2.0}));
    }
}
