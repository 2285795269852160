//! Broadcasts go to the JSONL audit stream and the tracing log.
//!
//! Downstream consumers tail the `BROADCAST` lines; a failed write never
//! reaches the caller.

use feed_model::Publisher;
use logger::{now_iso, BroadcastEvent, EventLogger};
use std::sync::Arc;
use tracing::debug;

pub struct JsonlPublisher {
    log: Arc<EventLogger>,
}

impl JsonlPublisher {
    pub fn new(log: Arc<EventLogger>) -> Self {
        Self { log }
    }
}

impl Publisher for JsonlPublisher {
    fn publish(&self, channel: &str, event_name: &str, payload: serde_json::Value) {
        debug!(channel, event = event_name, "broadcast");
        self.log.log_quiet(&BroadcastEvent {
            ts: now_iso(),
            event: "BROADCAST",
            channel: channel.to_string(),
            name: event_name.to_string(),
            payload,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_broadcast_lands_in_jsonl() {
        let dir = std::env::temp_dir().join(format!("feedsync-publisher-{}", std::process::id()));
        let log = Arc::new(EventLogger::new(&dir));
        let publisher = JsonlPublisher::new(log);
        publisher.publish("event:7", "score", serde_json::json!({"eventId": 7, "scores": "1-0"}));

        let body: String = fs::read_dir(&dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| fs::read_to_string(e.path()).unwrap())
            .collect();
        let line: serde_json::Value = serde_json::from_str(body.lines().last().unwrap()).unwrap();
        assert_eq!(line["event"], "BROADCAST");
        assert_eq!(line["channel"], "event:7");
        assert_eq!(line["name"], "score");
        assert_eq!(line["payload"]["scores"], "1-0");
        fs::remove_dir_all(&dir).ok();
    }
}
