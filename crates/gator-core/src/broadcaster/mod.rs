//! Per-process pub/sub fan-out with resumable monotonic event IDs (§4.3).
//!
//! Each subscriber gets its own bounded channel. A slow subscriber is
//! dropped, never allowed to block the producer or other subscribers
//! (§5 ordering guarantees, §9 SSE fan-out design note).

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Map;
use tokio::sync::mpsc;

/// Per-sink queue depth before a subscriber is dropped (§4.3, §9).
pub const SINK_QUEUE_CAPACITY: usize = 256;

/// One broadcaster event: a monotonic id plus its tagged payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: u64,
    #[serde(flatten)]
    pub payload: EventPayload,
}

/// Tagged payload record (§4.3): `{type, stream?, data?, …}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventPayload {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(flatten, skip_serializing_if = "Map::is_empty", default)]
    pub extra: Map<String, serde_json::Value>,
}

impl EventPayload {
    pub fn output(stream: &str, data: impl Into<String>) -> Self {
        Self {
            kind: "output".to_string(),
            stream: Some(stream.to_string()),
            data: Some(data.into()),
            extra: Map::new(),
        }
    }

    pub fn log(data: impl Into<String>) -> Self {
        Self {
            kind: "log".to_string(),
            stream: None,
            data: Some(data.into()),
            extra: Map::new(),
        }
    }

    pub fn status(status: impl Into<String>) -> Self {
        let mut extra = Map::new();
        extra.insert("status".to_string(), serde_json::Value::String(status.into()));
        Self {
            kind: "status".to_string(),
            stream: None,
            data: None,
            extra,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            kind: "error".to_string(),
            stream: None,
            data: Some(message.into()),
            extra: Map::new(),
        }
    }
}

#[derive(Default)]
struct ProcessState {
    next_id: u64,
    subscribers: Vec<mpsc::Sender<Event>>,
}

/// Per-process event fan-out. One instance is shared process-wide (see
/// `crate::root`); internal state is guarded by a plain mutex since every
/// critical section is a short, non-blocking map/vec operation.
#[derive(Default)]
pub struct Broadcaster {
    state: Mutex<HashMap<String, ProcessState>>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber for a process, returning the receiving
    /// end. Dropping the receiver is how a subscriber unsubscribes.
    pub fn subscribe(&self, process_id: &str) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(SINK_QUEUE_CAPACITY);
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .entry(process_id.to_string())
            .or_default()
            .subscribers
            .push(tx);
        rx
    }

    /// Atomically allocate the next monotonic event id for a process,
    /// starting at 1.
    pub fn next_event_id(&self, process_id: &str) -> u64 {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let entry = state.entry(process_id.to_string()).or_default();
        entry.next_id += 1;
        entry.next_id
    }

    /// The highest event id issued so far for a process (0 if none yet).
    pub fn current(&self, process_id: &str) -> u64 {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.get(process_id).map(|e| e.next_id).unwrap_or(0)
    }

    /// Deliver an event to every live subscriber of a process. Subscribers
    /// whose queue is full or closed are dropped silently; this call never
    /// blocks.
    pub fn broadcast(&self, process_id: &str, event_id: u64, payload: EventPayload) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let Some(entry) = state.get_mut(process_id) else {
            return;
        };
        let event = Event { id: event_id, payload };
        entry.subscribers.retain(|tx| {
            matches!(tx.try_send(event.clone()), Ok(()))
        });
    }

    /// Number of live subscribers for a process (test/diagnostic use).
    pub fn subscriber_count(&self, process_id: &str) -> usize {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.get(process_id).map(|e| e.subscribers.len()).unwrap_or(0)
    }

    /// Drop all per-process state (shutdown).
    pub fn cleanup(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_event_id_starts_at_one_and_is_monotonic() {
        let b = Broadcaster::new();
        assert_eq!(b.next_event_id("p1"), 1);
        assert_eq!(b.next_event_id("p1"), 2);
        assert_eq!(b.next_event_id("p1"), 3);
        assert_eq!(b.current("p1"), 3);
    }

    #[test]
    fn current_is_zero_for_unknown_process() {
        let b = Broadcaster::new();
        assert_eq!(b.current("never-seen"), 0);
    }

    #[tokio::test]
    async fn broadcast_delivers_to_subscriber() {
        let b = Broadcaster::new();
        let mut rx = b.subscribe("p1");

        let id = b.next_event_id("p1");
        b.broadcast("p1", id, EventPayload::output("stdout", "hello"));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.id, 1);
        assert_eq!(event.payload.kind, "output");
        assert_eq!(event.payload.data.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn broadcast_fans_out_to_every_subscriber() {
        let b = Broadcaster::new();
        let mut rx1 = b.subscribe("p1");
        let mut rx2 = b.subscribe("p1");

        let id = b.next_event_id("p1");
        b.broadcast("p1", id, EventPayload::log("line"));

        assert_eq!(rx1.recv().await.unwrap().id, 1);
        assert_eq!(rx2.recv().await.unwrap().id, 1);
    }

    #[tokio::test]
    async fn broadcast_to_process_with_no_subscribers_is_a_noop() {
        let b = Broadcaster::new();
        b.broadcast("p1", 1, EventPayload::log("nobody listening"));
    }

    #[tokio::test]
    async fn dropped_receiver_is_pruned_on_next_broadcast() {
        let b = Broadcaster::new();
        let rx = b.subscribe("p1");
        drop(rx);

        assert_eq!(b.subscriber_count("p1"), 1);
        b.broadcast("p1", 1, EventPayload::log("x"));
        assert_eq!(b.subscriber_count("p1"), 0);
    }

    #[tokio::test]
    async fn full_queue_drops_the_slow_subscriber_without_blocking() {
        let b = Broadcaster::new();
        let _rx = b.subscribe("p1"); // never drained

        for i in 0..(SINK_QUEUE_CAPACITY as u64 + 5) {
            b.broadcast("p1", i, EventPayload::log(format!("{i}")));
        }

        // The subscriber's queue filled and got dropped; this call must
        // have returned promptly rather than blocking.
        assert_eq!(b.subscriber_count("p1"), 0);
    }

    #[test]
    fn error_payload_serializes_with_type_tag() {
        let payload = EventPayload::error("boom");
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["data"], "boom");
    }

    #[test]
    fn status_payload_carries_extra_field() {
        let payload = EventPayload::status("exited");
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], "status");
        assert_eq!(json["status"], "exited");
    }
}
