//! WebSocket capability and its capture decorator.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde::Serialize;
use serde_json::Value as Json;
use tracing::debug;

use super::{best_effort, ListenerId, ListenerSet};
use crate::buffer::{EventBuffer, EventKind, InterceptedEvent};
use crate::InterceptError;

// ============================================================================
// Capability
// ============================================================================

/// Frame payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageData {
    Text(String),
    Binary(Vec<u8>),
}

impl MessageData {
    /// Text frames as strings, binary frames as byte arrays.
    pub fn to_json(&self) -> Json {
        match self {
            MessageData::Text(text) => Json::String(text.clone()),
            MessageData::Binary(bytes) => Json::from(bytes.clone()),
        }
    }
}

impl From<&str> for MessageData {
    fn from(text: &str) -> Self {
        MessageData::Text(text.to_string())
    }
}

impl From<String> for MessageData {
    fn from(text: String) -> Self {
        MessageData::Text(text)
    }
}

impl From<Vec<u8>> for MessageData {
    fn from(bytes: Vec<u8>) -> Self {
        MessageData::Binary(bytes)
    }
}

/// Socket notification kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketEventKind {
    Open,
    Message,
    Close,
    Error,
}

impl SocketEventKind {
    pub const ALL: [SocketEventKind; 4] = [
        SocketEventKind::Open,
        SocketEventKind::Message,
        SocketEventKind::Close,
        SocketEventKind::Error,
    ];
}

/// One socket notification
#[derive(Debug, Clone, PartialEq)]
pub struct SocketEvent {
    pub kind: SocketEventKind,
    pub data: Option<MessageData>,
    pub code: Option<u16>,
    pub reason: Option<String>,
}

impl SocketEvent {
    pub fn open() -> Self {
        Self::bare(SocketEventKind::Open)
    }

    pub fn message(data: impl Into<MessageData>) -> Self {
        Self {
            data: Some(data.into()),
            ..Self::bare(SocketEventKind::Message)
        }
    }

    pub fn close(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            reason: Some(reason.into()),
            ..Self::bare(SocketEventKind::Close)
        }
    }

    pub fn error() -> Self {
        Self::bare(SocketEventKind::Error)
    }

    fn bare(kind: SocketEventKind) -> Self {
        Self {
            kind,
            data: None,
            code: None,
            reason: None,
        }
    }
}

/// Socket lifecycle as seen by page code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReadyState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

pub type SocketListener = Arc<dyn Fn(&SocketEvent) + Send + Sync>;

/// An open (or opening) message socket.
///
/// Notifications are delivered to listeners added with [`Socket::add_listener`]
/// and to the single handler per kind installed with [`Socket::set_handler`].
pub trait Socket: Send + Sync {
    fn url(&self) -> String;
    fn protocols(&self) -> Vec<String>;
    fn ready_state(&self) -> ReadyState;
    fn send(&self, data: MessageData) -> Result<(), InterceptError>;
    fn close(&self, code: Option<u16>, reason: Option<&str>);
    fn add_listener(&self, kind: SocketEventKind, listener: SocketListener) -> ListenerId;
    fn remove_listener(&self, id: ListenerId) -> bool;
    fn set_handler(&self, kind: SocketEventKind, handler: Option<SocketListener>);
    fn handler(&self, kind: SocketEventKind) -> Option<SocketListener>;
}

/// Listeners to attach at construction, one per entry.
pub type InitialListeners = Vec<(SocketEventKind, SocketListener)>;

/// Socket constructor.
pub trait SocketFactory: Send + Sync {
    fn create(&self, url: &str, protocols: &[String]) -> Result<Arc<dyn Socket>, InterceptError>;

    /// Construct a socket with `listeners` attached before any event can fire.
    ///
    /// The default attaches them right after [`create`](Self::create), which
    /// only suffices for sockets that deliver events on the constructing thread.
    /// Factories whose sockets deliver from another task must override it.
    fn create_with_listeners(
        &self,
        url: &str,
        protocols: &[String],
        listeners: InitialListeners,
    ) -> Result<Arc<dyn Socket>, InterceptError> {
        let socket = self.create(url, protocols)?;
        for (kind, listener) in listeners {
            socket.add_listener(kind, listener);
        }
        Ok(socket)
    }
}

// ============================================================================
// Connection Log
// ============================================================================

/// Connection lifecycle as recorded by capture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
    Errored,
}

/// Capture record for one socket.
#[derive(Debug, Clone, Serialize)]
pub struct Connection {
    pub id: u64,
    pub url: String,
    pub protocols: Vec<String>,
    pub state: ConnectionState,
    pub messages: Vec<InterceptedEvent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub close_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub close_reason: Option<String>,
}

type ConnectionRecord = Arc<Mutex<Connection>>;

fn lock_record(record: &Mutex<Connection>) -> MutexGuard<'_, Connection> {
    record.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Registry of captured connections.
///
/// Records are held weakly: a record disappears once its socket is gone.
pub struct ConnectionLog {
    next_id: AtomicU64,
    records: Mutex<Vec<Weak<Mutex<Connection>>>>,
    buffer: Arc<EventBuffer>,
}

impl ConnectionLog {
    pub fn new(buffer: Arc<EventBuffer>) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            records: Mutex::new(Vec::new()),
            buffer,
        }
    }

    fn open(&self, url: &str, protocols: &[String]) -> ConnectionRecord {
        let record = Arc::new(Mutex::new(Connection {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            url: url.to_string(),
            protocols: protocols.to_vec(),
            state: ConnectionState::Connecting,
            messages: Vec::new(),
            close_code: None,
            close_reason: None,
        }));
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        records.retain(|weak| weak.strong_count() > 0);
        records.push(Arc::downgrade(&record));
        record
    }

    fn live(&self) -> Vec<ConnectionRecord> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        records.retain(|weak| weak.strong_count() > 0);
        records.iter().filter_map(Weak::upgrade).collect()
    }

    /// Snapshot of every live connection.
    pub fn connections(&self) -> Vec<Connection> {
        self.live().iter().map(|record| lock_record(record).clone()).collect()
    }

    pub fn connection(&self, id: u64) -> Option<Connection> {
        self.live()
            .iter()
            .map(|record| lock_record(record))
            .find(|connection| connection.id == id)
            .map(|connection| connection.clone())
    }

    /// Messages of one connection in delivery order.
    pub fn connection_messages(&self, id: u64) -> Vec<InterceptedEvent> {
        self.connection(id)
            .map(|connection| connection.messages)
            .unwrap_or_default()
    }

    /// Every captured WebSocket message across connections, in delivery order.
    pub fn messages(&self) -> Vec<InterceptedEvent> {
        self.buffer
            .events()
            .into_iter()
            .filter(|event| matches!(event.kind, EventKind::WsSend | EventKind::WsMessage))
            .collect()
    }

    /// Drop the per-connection message history; connections stay registered.
    pub fn clear_messages(&self) {
        for record in self.live() {
            lock_record(&record).messages.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.live().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn record(&self, record: &ConnectionRecord, kind: EventKind, data: &MessageData) {
        let mut connection = lock_record(record);
        let event = self
            .buffer
            .event(kind, connection.url.clone(), data.to_json())
            .with_connection(connection.id);
        connection.messages.push(event.clone());
        drop(connection);
        self.buffer.push(event);
    }
}

// ============================================================================
// Capture Decorator
// ============================================================================

/// Factory decorator that wraps every socket it constructs.
pub struct CapturedSocketFactory {
    inner: Arc<dyn SocketFactory>,
    log: Arc<ConnectionLog>,
}

impl CapturedSocketFactory {
    pub fn new(inner: Arc<dyn SocketFactory>, log: Arc<ConnectionLog>) -> Self {
        Self { inner, log }
    }

    /// The factory this one delegates to.
    pub fn inner(&self) -> &Arc<dyn SocketFactory> {
        &self.inner
    }
}

impl SocketFactory for CapturedSocketFactory {
    fn create(&self, url: &str, protocols: &[String]) -> Result<Arc<dyn Socket>, InterceptError> {
        self.create_with_listeners(url, protocols, Vec::new())
    }

    fn create_with_listeners(
        &self,
        url: &str,
        protocols: &[String],
        listeners: InitialListeners,
    ) -> Result<Arc<dyn Socket>, InterceptError> {
        let record = self.log.open(url, protocols);
        let handlers: Arc<ListenerSet<SocketEventKind, SocketEvent>> = Arc::new(ListenerSet::new());
        let mut initial = capture_listeners(&self.log, &record, &handlers);
        initial.extend(listeners);

        let inner = self.inner.create_with_listeners(url, protocols, initial)?;
        debug!(id = lock_record(&record).id, url = %url, "socket captured");
        Ok(Arc::new(CapturedSocket {
            inner,
            log: self.log.clone(),
            record,
            handlers,
        }))
    }
}

/// Socket decorator recording every send and receive.
///
/// Handlers set on the decorator are held here; a persistent internal
/// listener on the wrapped socket records each notification and then
/// forwards it to whichever handler is currently set.
pub struct CapturedSocket {
    inner: Arc<dyn Socket>,
    log: Arc<ConnectionLog>,
    record: ConnectionRecord,
    handlers: Arc<ListenerSet<SocketEventKind, SocketEvent>>,
}

impl CapturedSocket {
    /// Capture a socket that already exists.
    ///
    /// Events the socket delivered before this call are not recorded; prefer
    /// constructing through [`CapturedSocketFactory`].
    pub fn wrap(inner: Arc<dyn Socket>, log: Arc<ConnectionLog>) -> Self {
        let record = log.open(&inner.url(), &inner.protocols());
        let handlers: Arc<ListenerSet<SocketEventKind, SocketEvent>> = Arc::new(ListenerSet::new());
        for (kind, listener) in capture_listeners(&log, &record, &handlers) {
            inner.add_listener(kind, listener);
        }

        debug!(id = lock_record(&record).id, url = %inner.url(), "socket captured");
        Self {
            inner,
            log,
            record,
            handlers,
        }
    }

    /// The socket this one delegates to.
    pub fn inner(&self) -> &Arc<dyn Socket> {
        &self.inner
    }

    pub fn connection_id(&self) -> u64 {
        lock_record(&self.record).id
    }
}

/// One internal listener per kind: record the event, then forward it to
/// whichever handler is currently set.
fn capture_listeners(
    log: &Arc<ConnectionLog>,
    record: &ConnectionRecord,
    handlers: &Arc<ListenerSet<SocketEventKind, SocketEvent>>,
) -> InitialListeners {
    SocketEventKind::ALL
        .into_iter()
        .map(|kind| {
            let log = log.clone();
            let record = record.clone();
            let handlers = handlers.clone();
            let listener: SocketListener = Arc::new(move |event: &SocketEvent| {
                best_effort("ws event", || observe(&log, &record, event));
                if let Some(handler) = handlers.handler(event.kind) {
                    handler(event);
                }
                // Nothing follows a close; a handler holding the socket would keep it alive.
                if event.kind == SocketEventKind::Close {
                    handlers.clear_handlers();
                }
            });
            (kind, listener)
        })
        .collect()
}

fn observe(log: &ConnectionLog, record: &ConnectionRecord, event: &SocketEvent) {
    match event.kind {
        SocketEventKind::Open => lock_record(record).state = ConnectionState::Open,
        SocketEventKind::Message => {
            if let Some(data) = &event.data {
                log.record(record, EventKind::WsMessage, data);
            }
        }
        SocketEventKind::Close => {
            let mut connection = lock_record(record);
            connection.state = ConnectionState::Closed;
            connection.close_code = event.code;
            connection.close_reason = event.reason.clone();
        }
        SocketEventKind::Error => lock_record(record).state = ConnectionState::Errored,
    }
}

impl Socket for CapturedSocket {
    fn url(&self) -> String {
        self.inner.url()
    }

    fn protocols(&self) -> Vec<String> {
        self.inner.protocols()
    }

    fn ready_state(&self) -> ReadyState {
        self.inner.ready_state()
    }

    fn send(&self, data: MessageData) -> Result<(), InterceptError> {
        best_effort("ws send", || self.log.record(&self.record, EventKind::WsSend, &data));
        self.inner.send(data)
    }

    fn close(&self, code: Option<u16>, reason: Option<&str>) {
        self.inner.close(code, reason)
    }

    fn add_listener(&self, kind: SocketEventKind, listener: SocketListener) -> ListenerId {
        self.inner.add_listener(kind, listener)
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.remove_listener(id)
    }

    fn set_handler(&self, kind: SocketEventKind, handler: Option<SocketListener>) {
        self.handlers.set_handler(kind, handler)
    }

    fn handler(&self, kind: SocketEventKind) -> Option<SocketListener> {
        self.handlers.handler(kind)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockSocketFactory;
    use serde_json::json;

    fn captured() -> (Arc<EventBuffer>, Arc<ConnectionLog>, MockSocketFactory, CapturedSocketFactory) {
        let buffer = Arc::new(EventBuffer::new());
        let log = Arc::new(ConnectionLog::new(buffer.clone()));
        let mock = MockSocketFactory::new();
        let factory = CapturedSocketFactory::new(Arc::new(mock.clone()), log.clone());
        (buffer, log, mock, factory)
    }

    #[test]
    fn test_send_and_receive_recorded_in_order() {
        let (buffer, log, mock, factory) = captured();
        let socket = factory.create("ws://game/live", &[]).unwrap();
        let remote = mock.last().unwrap();

        remote.emit(SocketEvent::open());
        socket.send("a".into()).unwrap();
        remote.emit(SocketEvent::message("b"));
        socket.send("c".into()).unwrap();
        remote.emit(SocketEvent::message("d"));

        let kinds: Vec<EventKind> = buffer.events().iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![EventKind::WsSend, EventKind::WsMessage, EventKind::WsSend, EventKind::WsMessage]
        );
        let payloads: Vec<Json> = log.messages().into_iter().map(|e| e.payload).collect();
        assert_eq!(payloads, vec![json!("a"), json!("b"), json!("c"), json!("d")]);
        assert_eq!(remote.sent(), vec![MessageData::from("a"), MessageData::from("c")]);
    }

    #[test]
    fn test_close_releases_self_referencing_handler() {
        let (_, log, mock, factory) = captured();
        let socket = factory.create("ws://host", &[]).unwrap();
        let remote = mock.last().unwrap();

        let held = socket.clone();
        socket.set_handler(
            SocketEventKind::Message,
            Some(Arc::new(move |_: &SocketEvent| {
                let _ = held.send("echo".into());
            })),
        );
        let weak = Arc::downgrade(&socket);
        drop(socket);
        assert!(weak.upgrade().is_some());

        remote.emit(SocketEvent::open());
        remote.emit(SocketEvent::message("hi"));
        assert_eq!(remote.sent(), vec![MessageData::from("echo")]);

        remote.emit(SocketEvent::close(1000, "done"));
        assert!(weak.upgrade().is_none());
        drop(remote);
        drop(mock);
        assert!(log.is_empty());
    }

    #[test]
    fn test_wrap_existing_socket() {
        let buffer = Arc::new(EventBuffer::new());
        let log = Arc::new(ConnectionLog::new(buffer.clone()));
        let mock = MockSocketFactory::new();
        let raw = mock.create("ws://existing", &[]).unwrap();
        let remote = mock.last().unwrap();
        remote.open();

        let socket = CapturedSocket::wrap(raw, log.clone());
        remote.receive("late");
        socket.send("reply".into()).unwrap();

        let id = socket.connection_id();
        let payloads: Vec<Json> = log.connection_messages(id).into_iter().map(|e| e.payload).collect();
        assert_eq!(payloads, vec![json!("late"), json!("reply")]);
        // The open happened before capture; the record starts out connecting.
        assert_eq!(log.connection(id).unwrap().state, ConnectionState::Connecting);
    }

    #[test]
    fn test_connection_lifecycle() {
        let (_, log, mock, factory) = captured();
        let socket = factory
            .create("ws://host", &["v1".to_string()])
            .unwrap();
        let remote = mock.last().unwrap();

        let connection = log.connections().pop().unwrap();
        assert_eq!(connection.state, ConnectionState::Connecting);
        assert_eq!(connection.protocols, vec!["v1"]);

        remote.emit(SocketEvent::open());
        assert_eq!(log.connections()[0].state, ConnectionState::Open);

        remote.emit(SocketEvent::close(4000, "bye"));
        let connection = log.connections().pop().unwrap();
        assert_eq!(connection.state, ConnectionState::Closed);
        assert_eq!(connection.close_code, Some(4000));
        assert_eq!(connection.close_reason.as_deref(), Some("bye"));

        drop(socket);
        drop(remote);
        drop(mock);
        assert!(log.is_empty());
    }

    #[test]
    fn test_handler_and_listener_both_delivered() {
        let (_, _, mock, factory) = captured();
        let socket = factory.create("ws://host", &[]).unwrap();
        let remote = mock.last().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        socket.set_handler(
            SocketEventKind::Message,
            Some(Arc::new(move |e: &SocketEvent| sink.lock().unwrap().push(("handler", e.data.clone())))),
        );
        let sink = seen.clone();
        socket.add_listener(
            SocketEventKind::Message,
            Arc::new(move |e: &SocketEvent| sink.lock().unwrap().push(("listener", e.data.clone()))),
        );
        remote.emit(SocketEvent::message("x"));

        // Replacing the handler keeps capture in place.
        socket.set_handler(SocketEventKind::Message, None);
        remote.emit(SocketEvent::message("y"));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert!(seen.contains(&("handler", Some(MessageData::from("x")))));
        assert!(seen.contains(&("listener", Some(MessageData::from("y")))));
    }

    #[test]
    fn test_error_marks_connection_and_clear_messages() {
        let (buffer, log, mock, factory) = captured();
        let socket = factory.create("ws://host", &[]).unwrap();
        let remote = mock.last().unwrap();
        remote.emit(SocketEvent::message(vec![1u8, 2]));
        remote.emit(SocketEvent::error());

        let id = log.connections()[0].id;
        assert_eq!(log.connection(id).unwrap().state, ConnectionState::Errored);
        assert_eq!(log.connection_messages(id)[0].payload, json!([1, 2]));
        assert_eq!(buffer.events()[0].connection_id, Some(id));

        log.clear_messages();
        buffer.clear();
        assert!(log.connection_messages(id).is_empty());
        assert!(log.messages().is_empty());
        drop(socket);
    }

    #[test]
    fn test_decorator_delegates() {
        let (_, _, mock, factory) = captured();
        let socket = factory.create("ws://host/x", &[]).unwrap();
        assert_eq!(socket.url(), "ws://host/x");
        assert_eq!(socket.ready_state(), ReadyState::Connecting);
        socket.close(Some(1000), None);
        assert_eq!(mock.last().unwrap().ready_state(), ReadyState::Closed);
        assert_eq!(factory.inner().create("ws://y", &[]).unwrap().url(), "ws://y");
    }
}
