//! Observer sink: a broadcast bus of topic-tagged events.
//!
//! Every forwarded stream event is published under the stream's topic;
//! diff updates go out under the owning thread's file-change topic. Lagging
//! subscribers drop the oldest messages rather than stalling streams.

use tokio::sync::broadcast;

pub const STREAM_TOPIC_PREFIX: &str = "agent:stream:";
pub const FILE_CHANGE_TOPIC_PREFIX: &str = "agent:file-change:";

pub fn stream_topic(stream_id: &str) -> String {
    format!("{STREAM_TOPIC_PREFIX}{stream_id}")
}

pub fn file_change_topic(thread_id: i64) -> String {
    format!("{FILE_CHANGE_TOPIC_PREFIX}{thread_id}")
}

#[derive(Clone, Debug)]
pub struct BusMessage {
    pub topic: String,
    pub payload: serde_json::Value,
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BusMessage>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusMessage> {
        self.tx.subscribe()
    }

    pub fn emit(&self, topic: impl Into<String>, payload: serde_json::Value) {
        let _ = self.tx.send(BusMessage {
            topic: topic.into(),
            payload,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emitted_messages_reach_subscribers_with_topics() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.emit(stream_topic("s1"), serde_json::json!({"type": "custom"}));
        let message = rx.recv().await.expect("message");
        assert_eq!(message.topic, "agent:stream:s1");
        assert_eq!(message.payload["type"], "custom");
    }

    #[test]
    fn topics_are_deterministic() {
        assert_eq!(stream_topic("abc"), "agent:stream:abc");
        assert_eq!(file_change_topic(7), "agent:file-change:7");
    }
}
