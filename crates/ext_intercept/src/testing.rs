//! In-memory primitives for tests.
//!
//! Each mock records what page code did with it and lets the test play the
//! remote side: open or close a socket, deliver messages, complete a request.
//! Mock notifications are dispatched synchronously from the test's call.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;

use crate::net::{
    Fetch, FetchRequest, FetchResponse, HttpRequest, HttpRequestFactory, ListenerId, ListenerSet,
    MessageData, ReadyState, Socket, SocketEvent, SocketEventKind, SocketFactory, SocketListener,
    XhrEvent, XhrEventKind, XhrListener, XhrReadyState,
};
use crate::realm::{Primitives, Realm};
use crate::InterceptError;

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Socket
// ============================================================================

/// A socket whose remote side is driven by the test.
pub struct MockSocket {
    url: String,
    protocols: Vec<String>,
    state: Mutex<ReadyState>,
    sent: Mutex<Vec<MessageData>>,
    listeners: ListenerSet<SocketEventKind, SocketEvent>,
}

impl MockSocket {
    fn new(url: &str, protocols: &[String]) -> Self {
        Self {
            url: url.to_string(),
            protocols: protocols.to_vec(),
            state: Mutex::new(ReadyState::Connecting),
            sent: Mutex::new(Vec::new()),
            listeners: ListenerSet::new(),
        }
    }

    /// Deliver a notification as the remote side, updating the ready state first.
    pub fn emit(&self, event: SocketEvent) {
        match event.kind {
            SocketEventKind::Open => *locked(&self.state) = ReadyState::Open,
            SocketEventKind::Close => *locked(&self.state) = ReadyState::Closed,
            SocketEventKind::Message | SocketEventKind::Error => {}
        }
        self.listeners.dispatch(event.kind, &event);
    }

    pub fn open(&self) {
        self.emit(SocketEvent::open());
    }

    pub fn receive(&self, text: &str) {
        self.emit(SocketEvent::message(text));
    }

    /// Drop the connection from the remote side: error, then abnormal close.
    pub fn fail(&self) {
        self.emit(SocketEvent::error());
        self.emit(SocketEvent::close(1006, ""));
    }

    pub fn sent(&self) -> Vec<MessageData> {
        locked(&self.sent).clone()
    }

    /// Sent text frames only.
    pub fn sent_text(&self) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter_map(|data| match data {
                MessageData::Text(text) => Some(text),
                MessageData::Binary(_) => None,
            })
            .collect()
    }
}

impl Socket for MockSocket {
    fn url(&self) -> String {
        self.url.clone()
    }

    fn protocols(&self) -> Vec<String> {
        self.protocols.clone()
    }

    fn ready_state(&self) -> ReadyState {
        *locked(&self.state)
    }

    fn send(&self, data: MessageData) -> Result<(), InterceptError> {
        match self.ready_state() {
            ReadyState::Connecting => Err(InterceptError::invalid_state("socket is still connecting")),
            ReadyState::Open => {
                locked(&self.sent).push(data);
                Ok(())
            }
            ReadyState::Closing | ReadyState::Closed => Ok(()),
        }
    }

    fn close(&self, code: Option<u16>, reason: Option<&str>) {
        if matches!(self.ready_state(), ReadyState::Closing | ReadyState::Closed) {
            return;
        }
        self.emit(SocketEvent::close(
            code.unwrap_or(1005),
            reason.unwrap_or_default(),
        ));
    }

    fn add_listener(&self, kind: SocketEventKind, listener: SocketListener) -> ListenerId {
        self.listeners.add(kind, listener)
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    fn set_handler(&self, kind: SocketEventKind, handler: Option<SocketListener>) {
        self.listeners.set_handler(kind, handler)
    }

    fn handler(&self, kind: SocketEventKind) -> Option<SocketListener> {
        self.listeners.handler(kind)
    }
}

/// Factory handing out [`MockSocket`]s. Clones share the same record.
#[derive(Clone, Default)]
pub struct MockSocketFactory {
    sockets: Arc<Mutex<Vec<Weak<MockSocket>>>>,
    created: Arc<AtomicUsize>,
    refuse: Arc<AtomicBool>,
}

impl MockSocketFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make later `create` calls fail.
    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Number of sockets constructed so far.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Most recently constructed socket, if still alive.
    pub fn last(&self) -> Option<Arc<MockSocket>> {
        locked(&self.sockets).last().and_then(Weak::upgrade)
    }
}

impl SocketFactory for MockSocketFactory {
    fn create(&self, url: &str, protocols: &[String]) -> Result<Arc<dyn Socket>, InterceptError> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(InterceptError::socket_connect(format!("refused: {}", url)));
        }
        let socket = Arc::new(MockSocket::new(url, protocols));
        locked(&self.sockets).push(Arc::downgrade(&socket));
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(socket)
    }
}

// ============================================================================
// Fetch
// ============================================================================

/// Fetch answering from a fixed route table.
#[derive(Clone, Default)]
pub struct MockFetch {
    routes: Arc<Mutex<HashMap<String, MockRoute>>>,
    requests: Arc<Mutex<Vec<FetchRequest>>>,
}

impl MockFetch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, url: &str, status: u16, body: &str) {
        locked(&self.routes).insert(
            url.to_string(),
            MockRoute {
                status,
                body: body.to_string(),
                consumed: false,
            },
        );
    }

    /// Answer `url` with a response whose body has already been read.
    pub fn respond_consumed(&self, url: &str, status: u16) {
        locked(&self.routes).insert(
            url.to_string(),
            MockRoute {
                status,
                body: String::new(),
                consumed: true,
            },
        );
    }

    pub fn requests(&self) -> Vec<FetchRequest> {
        locked(&self.requests).clone()
    }
}

#[derive(Clone)]
struct MockRoute {
    status: u16,
    body: String,
    consumed: bool,
}

#[async_trait]
impl Fetch for MockFetch {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, InterceptError> {
        locked(&self.requests).push(request.clone());
        let route = locked(&self.routes).get(&request.url).cloned();
        let Some(route) = route else {
            return Err(InterceptError::fetch(format!("no route for {}", request.url)));
        };
        let response = FetchResponse::new(route.status, request.url, route.body);
        if route.consumed {
            response.bytes().await?;
        }
        Ok(response)
    }
}

// ============================================================================
// XHR
// ============================================================================

struct RequestState {
    ready: XhrReadyState,
    method: String,
    url: String,
    body: Option<String>,
    status: u16,
    response: String,
}

/// Request completed by the test via [`MockHttpRequest::complete`].
pub struct MockHttpRequest {
    state: Mutex<RequestState>,
    listeners: ListenerSet<XhrEventKind, XhrEvent>,
}

impl MockHttpRequest {
    fn new() -> Self {
        Self {
            state: Mutex::new(RequestState {
                ready: XhrReadyState::Unsent,
                method: String::new(),
                url: String::new(),
                body: None,
                status: 0,
                response: String::new(),
            }),
            listeners: ListenerSet::new(),
        }
    }

    /// Finish the request with `status` and `body`, firing the load lifecycle.
    pub fn complete(&self, status: u16, body: &str) {
        {
            let mut state = locked(&self.state);
            state.ready = XhrReadyState::Done;
            state.status = status;
            state.response = body.to_string();
        }
        for kind in [XhrEventKind::ReadyStateChange, XhrEventKind::Load, XhrEventKind::LoadEnd] {
            self.emit(kind);
        }
    }

    pub fn method(&self) -> String {
        locked(&self.state).method.clone()
    }

    pub fn url(&self) -> String {
        locked(&self.state).url.clone()
    }

    pub fn body(&self) -> Option<String> {
        locked(&self.state).body.clone()
    }

    fn emit(&self, kind: XhrEventKind) {
        let event = {
            let state = locked(&self.state);
            XhrEvent {
                kind,
                ready_state: state.ready,
                status: state.status,
                response_text: state.response.clone(),
            }
        };
        self.listeners.dispatch(kind, &event);
    }
}

impl HttpRequest for MockHttpRequest {
    fn open(&self, method: &str, url: &str) -> Result<(), InterceptError> {
        let mut state = locked(&self.state);
        state.ready = XhrReadyState::Opened;
        state.method = method.to_uppercase();
        state.url = url.to_string();
        state.body = None;
        state.status = 0;
        state.response.clear();
        Ok(())
    }

    fn set_request_header(&self, _name: &str, _value: &str) -> Result<(), InterceptError> {
        Ok(())
    }

    fn send(&self, body: Option<String>) -> Result<(), InterceptError> {
        let mut state = locked(&self.state);
        if state.ready != XhrReadyState::Opened {
            return Err(InterceptError::invalid_state("request is not open"));
        }
        state.body = body;
        state.ready = XhrReadyState::HeadersReceived;
        Ok(())
    }

    fn abort(&self) {
        locked(&self.state).ready = XhrReadyState::Unsent;
    }

    fn ready_state(&self) -> XhrReadyState {
        locked(&self.state).ready
    }

    fn status(&self) -> u16 {
        locked(&self.state).status
    }

    fn response_text(&self) -> String {
        locked(&self.state).response.clone()
    }

    fn add_listener(&self, kind: XhrEventKind, listener: XhrListener) -> ListenerId {
        self.listeners.add(kind, listener)
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }
}

/// Factory handing out [`MockHttpRequest`]s. Clones share the same record.
#[derive(Clone, Default)]
pub struct MockHttpRequestFactory {
    requests: Arc<Mutex<Vec<Arc<MockHttpRequest>>>>,
}

impl MockHttpRequestFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last(&self) -> Option<Arc<MockHttpRequest>> {
        locked(&self.requests).last().cloned()
    }
}

impl HttpRequestFactory for MockHttpRequestFactory {
    fn create(&self) -> Arc<dyn HttpRequest> {
        let request = Arc::new(MockHttpRequest::new());
        locked(&self.requests).push(request.clone());
        request
    }
}

// ============================================================================
// Realm
// ============================================================================

/// Handles on the mocks installed by [`mock_realm`].
#[derive(Clone, Default)]
pub struct MockPrimitives {
    pub websocket: MockSocketFactory,
    pub fetch: MockFetch,
    pub xhr: MockHttpRequestFactory,
}

/// A realm whose primitives are all mocks.
pub fn mock_realm() -> (Arc<Realm>, MockPrimitives) {
    let mocks = MockPrimitives::default();
    let realm = Realm::new(Primitives {
        websocket: Arc::new(mocks.websocket.clone()),
        fetch: Arc::new(mocks.fetch.clone()),
        xhr: Arc::new(mocks.xhr.clone()),
    });
    (Arc::new(realm), mocks)
}
