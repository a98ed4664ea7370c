//! Append-only, in-order collection of captured events.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tokio::sync::broadcast;
use tracing::debug;

/// Capacity of the live-event broadcast; slower subscribers lag, the buffer keeps everything.
const BROADCAST_CAPACITY: usize = 256;

/// Kind of a captured event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    WsSend,
    WsMessage,
    FetchRequest,
    FetchResponse,
    XhrRequest,
    XhrResponse,
    SignCall,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WsSend => "ws_send",
            Self::WsMessage => "ws_message",
            Self::FetchRequest => "fetch_request",
            Self::FetchResponse => "fetch_response",
            Self::XhrRequest => "xhr_request",
            Self::XhrResponse => "xhr_response",
            Self::SignCall => "sign_call",
        }
    }
}

/// One captured event. Immutable once pushed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterceptedEvent {
    pub kind: EventKind,
    pub endpoint: String,
    pub payload: Json,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<u64>,
    #[serde(rename = "timestamp")]
    pub timestamp_ms: u64,
}

impl InterceptedEvent {
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_connection(mut self, id: u64) -> Self {
        self.connection_id = Some(id);
        self
    }
}

/// Shared event buffer.
pub struct EventBuffer {
    epoch: Instant,
    events: Mutex<Vec<InterceptedEvent>>,
    tx: broadcast::Sender<InterceptedEvent>,
}

impl Default for EventBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBuffer {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            epoch: Instant::now(),
            events: Mutex::new(Vec::new()),
            tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<InterceptedEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Build an event stamped with the current monotonic time.
    pub fn event(&self, kind: EventKind, endpoint: impl Into<String>, payload: Json) -> InterceptedEvent {
        InterceptedEvent {
            kind,
            endpoint: endpoint.into(),
            payload,
            status: None,
            connection_id: None,
            timestamp_ms: self.epoch.elapsed().as_millis() as u64,
        }
    }

    pub fn push(&self, event: InterceptedEvent) {
        debug!(kind = event.kind.as_str(), endpoint = %event.endpoint, "event captured");
        self.lock().push(event.clone());
        // No subscribers is the normal case.
        let _ = self.tx.send(event);
    }

    /// Snapshot of all events in insertion order.
    pub fn events(&self) -> Vec<InterceptedEvent> {
        self.lock().clone()
    }

    pub fn events_of(&self, kind: EventKind) -> Vec<InterceptedEvent> {
        self.lock()
            .iter()
            .filter(|event| event.kind == kind)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Live feed of events pushed after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<InterceptedEvent> {
        self.tx.subscribe()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_push_preserves_order() {
        let buffer = EventBuffer::new();
        for i in 0..5 {
            buffer.push(buffer.event(EventKind::WsSend, "ws://x", json!(i)));
        }
        let payloads: Vec<Json> = buffer.events().into_iter().map(|e| e.payload).collect();
        assert_eq!(payloads, vec![json!(0), json!(1), json!(2), json!(3), json!(4)]);
    }

    #[test]
    fn test_events_of_and_clear() {
        let buffer = EventBuffer::new();
        buffer.push(buffer.event(EventKind::FetchRequest, "/a", Json::Null));
        buffer.push(buffer.event(EventKind::SignCall, "window.sign", Json::Null));
        buffer.push(buffer.event(EventKind::FetchRequest, "/a", Json::Null));

        assert_eq!(buffer.events_of(EventKind::FetchRequest).len(), 2);
        assert_eq!(buffer.len(), 3);

        buffer.clear();
        assert!(buffer.is_empty());
        assert!(buffer.events().is_empty());
    }

    #[test]
    fn test_event_serialization() {
        let buffer = EventBuffer::new();
        let event = buffer
            .event(EventKind::WsMessage, "ws://host", json!("hi"))
            .with_connection(3);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "ws_message");
        assert_eq!(json["connection_id"], 3);
        assert!(json.get("status").is_none());
        assert_eq!(json["timestamp"], event.timestamp_ms);
        assert!(json.get("timestamp_ms").is_none());

        let back: InterceptedEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_subscribe_receives_new_events() {
        let buffer = EventBuffer::new();
        let mut rx = buffer.subscribe();
        buffer.push(buffer.event(EventKind::XhrResponse, "/x", Json::Null).with_status(200));
        let event = rx.try_recv().unwrap();
        assert_eq!(event.status, Some(200));
    }
}
