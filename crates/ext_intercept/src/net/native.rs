//! Native primitives: tokio-tungstenite sockets and reqwest-backed fetch/XHR.
//!
//! These must be constructed inside a tokio runtime. Notifications are
//! delivered from spawned driver tasks. On a current-thread runtime a
//! listener added right after construction still sees the first event; on a
//! multi-thread runtime the driver may already be running, so pass listeners
//! to [`SocketFactory::create_with_listeners`] instead.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use url::Url;

use super::fetch::{Fetch, FetchRequest, FetchResponse};
use super::socket::{
    InitialListeners, MessageData, ReadyState, Socket, SocketEvent, SocketEventKind, SocketFactory,
    SocketListener,
};
use super::xhr::{
    HttpRequest, HttpRequestFactory, XhrEvent, XhrEventKind, XhrListener, XhrReadyState,
};
use super::{ListenerId, ListenerSet};
use crate::InterceptError;

/// Close code reported when the connection drops without a close frame.
const CLOSE_ABNORMAL: u16 = 1006;
/// Close code reported when the peer's close frame carries no code.
const CLOSE_NO_STATUS: u16 = 1005;

fn runtime() -> Result<Handle, InterceptError> {
    Handle::try_current()
        .map_err(|_| InterceptError::invalid_state("native primitives need a tokio runtime"))
}

// ============================================================================
// WebSocket
// ============================================================================

/// Constructs sockets backed by tokio-tungstenite.
#[derive(Debug, Clone, Default)]
pub struct NativeSocketFactory;

impl NativeSocketFactory {
    pub fn new() -> Self {
        Self
    }
}

impl SocketFactory for NativeSocketFactory {
    fn create(&self, url: &str, protocols: &[String]) -> Result<Arc<dyn Socket>, InterceptError> {
        self.create_with_listeners(url, protocols, Vec::new())
    }

    fn create_with_listeners(
        &self,
        url: &str,
        protocols: &[String],
        listeners: InitialListeners,
    ) -> Result<Arc<dyn Socket>, InterceptError> {
        let parsed = Url::parse(url)?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(InterceptError::socket_connect(format!(
                "unsupported scheme '{}' in {}",
                parsed.scheme(),
                url
            )));
        }
        let handle = runtime()?;

        let shared = Arc::new(SocketShared {
            url: url.to_string(),
            protocols: protocols.to_vec(),
            state: Mutex::new(ReadyState::Connecting),
            listeners: ListenerSet::new(),
        });
        for (kind, listener) in listeners {
            shared.listeners.add(kind, listener);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        handle.spawn(drive(shared.clone(), rx));

        debug!(url = %url, "ws.connect");
        Ok(Arc::new(NativeSocket { shared, outbound: tx }))
    }
}

enum Outbound {
    Frame(Message),
    Close(u16, String),
}

struct SocketShared {
    url: String,
    protocols: Vec<String>,
    state: Mutex<ReadyState>,
    listeners: ListenerSet<SocketEventKind, SocketEvent>,
}

impl SocketShared {
    fn state(&self) -> MutexGuard<'_, ReadyState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: SocketEvent) {
        self.listeners.dispatch(event.kind, &event);
    }

    fn closed(&self, code: u16, reason: String) {
        *self.state() = ReadyState::Closed;
        debug!(url = %self.url, code = code, "ws.closed");
        self.emit(SocketEvent::close(code, reason));
    }

    fn failed(&self, error: impl std::fmt::Display) {
        warn!(url = %self.url, error = %error, "ws.error");
        *self.state() = ReadyState::Closed;
        self.emit(SocketEvent::error());
        self.emit(SocketEvent::close(CLOSE_ABNORMAL, String::new()));
    }
}

/// Socket handle; dropping it closes the connection.
pub struct NativeSocket {
    shared: Arc<SocketShared>,
    outbound: mpsc::UnboundedSender<Outbound>,
}

async fn drive(shared: Arc<SocketShared>, mut rx: mpsc::UnboundedReceiver<Outbound>) {
    let mut request = match shared.url.as_str().into_client_request() {
        Ok(request) => request,
        Err(e) => return shared.failed(e),
    };
    if !shared.protocols.is_empty() {
        match HeaderValue::from_str(&shared.protocols.join(", ")) {
            Ok(value) => {
                request.headers_mut().insert("Sec-WebSocket-Protocol", value);
            }
            Err(e) => return shared.failed(e),
        }
    }

    let stream = match connect_async(request).await {
        Ok((stream, _)) => stream,
        Err(e) => return shared.failed(e),
    };
    let (mut sink, mut stream) = stream.split();

    let opened = {
        let mut state = shared.state();
        if *state == ReadyState::Connecting {
            *state = ReadyState::Open;
            true
        } else {
            false
        }
    };
    if opened {
        info!(url = %shared.url, "ws.open");
        shared.emit(SocketEvent::open());
    }

    let mut requested_close: Option<(u16, String)> = None;
    loop {
        tokio::select! {
            outbound = rx.recv(), if requested_close.is_none() => match outbound {
                Some(Outbound::Frame(message)) => {
                    if let Err(e) = sink.send(message).await {
                        return shared.failed(e);
                    }
                }
                Some(Outbound::Close(code, reason)) => {
                    let frame = CloseFrame {
                        code: CloseCode::from(code),
                        reason: reason.clone().into(),
                    };
                    if let Err(e) = sink.send(Message::Close(Some(frame))).await {
                        return shared.failed(e);
                    }
                    requested_close = Some((code, reason));
                }
                None => {
                    // Handle dropped.
                    let _ = sink.close().await;
                    return;
                }
            },
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => shared.emit(SocketEvent::message(text)),
                Some(Ok(Message::Binary(bytes))) => shared.emit(SocketEvent::message(bytes)),
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = match (frame, requested_close.take()) {
                        (Some(frame), _) => (u16::from(frame.code), frame.reason.into_owned()),
                        (None, Some(requested)) => requested,
                        (None, None) => (CLOSE_NO_STATUS, String::new()),
                    };
                    return shared.closed(code, reason);
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return shared.failed(e),
                None => {
                    let (code, reason) = requested_close
                        .take()
                        .unwrap_or((CLOSE_ABNORMAL, String::new()));
                    return shared.closed(code, reason);
                }
            },
        }
    }
}

impl Socket for NativeSocket {
    fn url(&self) -> String {
        self.shared.url.clone()
    }

    fn protocols(&self) -> Vec<String> {
        self.shared.protocols.clone()
    }

    fn ready_state(&self) -> ReadyState {
        *self.shared.state()
    }

    fn send(&self, data: MessageData) -> Result<(), InterceptError> {
        match self.ready_state() {
            ReadyState::Connecting => {
                return Err(InterceptError::invalid_state("socket is still connecting"))
            }
            ReadyState::Closing | ReadyState::Closed => {
                debug!(url = %self.shared.url, "ws.send on closed socket discarded");
                return Ok(());
            }
            ReadyState::Open => {}
        }
        let message = match data {
            MessageData::Text(text) => Message::Text(text),
            MessageData::Binary(bytes) => Message::Binary(bytes),
        };
        self.outbound
            .send(Outbound::Frame(message))
            .map_err(|_| InterceptError::socket_send("connection driver has stopped"))
    }

    fn close(&self, code: Option<u16>, reason: Option<&str>) {
        {
            let mut state = self.shared.state();
            if matches!(*state, ReadyState::Closing | ReadyState::Closed) {
                return;
            }
            *state = ReadyState::Closing;
        }
        let close = Outbound::Close(code.unwrap_or(1000), reason.unwrap_or_default().to_string());
        if self.outbound.send(close).is_err() {
            self.shared.closed(code.unwrap_or(CLOSE_ABNORMAL), String::new());
        }
    }

    fn add_listener(&self, kind: SocketEventKind, listener: SocketListener) -> ListenerId {
        self.shared.listeners.add(kind, listener)
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        self.shared.listeners.remove(id)
    }

    fn set_handler(&self, kind: SocketEventKind, handler: Option<SocketListener>) {
        self.shared.listeners.set_handler(kind, handler)
    }

    fn handler(&self, kind: SocketEventKind) -> Option<SocketListener> {
        self.shared.listeners.handler(kind)
    }
}

// ============================================================================
// Fetch
// ============================================================================

fn parse_method(method: &str) -> Result<reqwest::Method, InterceptError> {
    reqwest::Method::from_bytes(method.to_uppercase().as_bytes())
        .map_err(|_| InterceptError::request(format!("invalid method '{}'", method)))
}

/// reqwest-backed fetch.
#[derive(Debug, Clone)]
pub struct NativeFetch {
    client: reqwest::Client,
}

impl NativeFetch {
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Fetch for NativeFetch {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, InterceptError> {
        debug!(method = %request.method, url = %request.url, "fetch");
        let mut builder = self.client.request(parse_method(&request.method)?, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let url = response.url().to_string();
        let headers: Vec<(String, String)> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_string(), value.to_string()))
            })
            .collect();
        let body = response.bytes().await?;

        Ok(headers
            .into_iter()
            .fold(FetchResponse::new(status, url, body.to_vec()), |response, (name, value)| {
                response.with_header(name, value)
            }))
    }
}

// ============================================================================
// XHR
// ============================================================================

/// Constructs reqwest-backed requests.
#[derive(Debug, Clone)]
pub struct NativeHttpRequestFactory {
    client: reqwest::Client,
}

impl NativeHttpRequestFactory {
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl HttpRequestFactory for NativeHttpRequestFactory {
    fn create(&self) -> Arc<dyn HttpRequest> {
        let client = self.client.clone();
        Arc::new_cyclic(|me| NativeHttpRequest {
            client,
            me: me.clone(),
            state: Mutex::new(XhrState::default()),
            listeners: ListenerSet::new(),
        })
    }
}

struct XhrState {
    ready: XhrReadyState,
    method: String,
    url: String,
    headers: Vec<(String, String)>,
    status: u16,
    response: String,
    task: Option<AbortHandle>,
}

impl Default for XhrState {
    fn default() -> Self {
        Self {
            ready: XhrReadyState::Unsent,
            method: String::new(),
            url: String::new(),
            headers: Vec::new(),
            status: 0,
            response: String::new(),
            task: None,
        }
    }
}

struct NativeHttpRequest {
    client: reqwest::Client,
    me: Weak<NativeHttpRequest>,
    state: Mutex<XhrState>,
    listeners: ListenerSet<XhrEventKind, XhrEvent>,
}

impl NativeHttpRequest {
    fn state(&self) -> MutexGuard<'_, XhrState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, kind: XhrEventKind) {
        let event = {
            let state = self.state();
            XhrEvent {
                kind,
                ready_state: state.ready,
                status: state.status,
                response_text: state.response.clone(),
            }
        };
        self.listeners.dispatch(kind, &event);
    }

    fn finish(&self, outcome: Result<(u16, String), InterceptError>) {
        let loaded = {
            let mut state = self.state();
            state.ready = XhrReadyState::Done;
            state.task = None;
            match outcome {
                Ok((status, body)) => {
                    state.status = status;
                    state.response = body;
                    true
                }
                Err(e) => {
                    warn!(url = %state.url, error = %e, "xhr failed");
                    state.status = 0;
                    false
                }
            }
        };
        self.emit(XhrEventKind::ReadyStateChange);
        self.emit(if loaded { XhrEventKind::Load } else { XhrEventKind::Error });
        self.emit(XhrEventKind::LoadEnd);
    }
}

impl HttpRequest for NativeHttpRequest {
    fn open(&self, method: &str, url: &str) -> Result<(), InterceptError> {
        let method = parse_method(method)?;
        {
            let mut state = self.state();
            if let Some(task) = state.task.take() {
                task.abort();
            }
            *state = XhrState {
                ready: XhrReadyState::Opened,
                method: method.to_string(),
                url: url.to_string(),
                ..XhrState::default()
            };
        }
        self.emit(XhrEventKind::ReadyStateChange);
        Ok(())
    }

    fn set_request_header(&self, name: &str, value: &str) -> Result<(), InterceptError> {
        let mut state = self.state();
        if state.ready != XhrReadyState::Opened || state.task.is_some() {
            return Err(InterceptError::invalid_state("request is not open"));
        }
        state.headers.push((name.to_string(), value.to_string()));
        Ok(())
    }

    fn send(&self, body: Option<String>) -> Result<(), InterceptError> {
        let handle = runtime()?;
        let me = self
            .me
            .upgrade()
            .ok_or_else(|| InterceptError::invalid_state("request dropped"))?;

        let mut state = self.state();
        if state.ready != XhrReadyState::Opened || state.task.is_some() {
            return Err(InterceptError::invalid_state("request is not open"));
        }
        let mut builder = self
            .client
            .request(parse_method(&state.method)?, state.url.as_str());
        for (name, value) in &state.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = body {
            builder = builder.body(body);
        }

        debug!(method = %state.method, url = %state.url, "xhr.send");
        let task = handle.spawn(async move {
            let outcome = async {
                let response = builder.send().await?;
                let status = response.status().as_u16();
                let text = response.text().await?;
                Ok::<_, InterceptError>((status, text))
            }
            .await;
            me.finish(outcome);
        });
        state.task = Some(task.abort_handle());
        Ok(())
    }

    fn abort(&self) {
        let mut state = self.state();
        if let Some(task) = state.task.take() {
            task.abort();
        }
        *state = XhrState::default();
    }

    fn ready_state(&self) -> XhrReadyState {
        self.state().ready
    }

    fn status(&self) -> u16 {
        self.state().status
    }

    fn response_text(&self) -> String {
        self.state().response.clone()
    }

    fn add_listener(&self, kind: XhrEventKind, listener: XhrListener) -> ListenerId {
        self.listeners.add(kind, listener)
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_socket_factory_rejects_bad_urls() {
        let factory = NativeSocketFactory::new();
        assert!(matches!(
            factory.create("not a url", &[]),
            Err(InterceptError::SocketConnect { .. })
        ));
        assert!(matches!(
            factory.create("http://example.com", &[]),
            Err(InterceptError::SocketConnect { .. })
        ));
    }

    #[test]
    fn test_socket_factory_needs_runtime() {
        let err = NativeSocketFactory::new()
            .create("ws://localhost:1", &[])
            .err()
            .unwrap();
        assert!(matches!(err, InterceptError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_refused_connection_reports_error_then_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let socket = NativeSocketFactory::new()
            .create(&format!("ws://{}", addr), &[])
            .unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        for kind in SocketEventKind::ALL {
            let tx = tx.clone();
            socket.add_listener(kind, Arc::new(move |e: &SocketEvent| {
                let _ = tx.send(e.kind);
            }));
        }
        assert!(matches!(
            socket.send("early".into()),
            Err(InterceptError::InvalidState { .. })
        ));

        assert_eq!(rx.recv().await, Some(SocketEventKind::Error));
        assert_eq!(rx.recv().await, Some(SocketEventKind::Close));
        assert_eq!(socket.ready_state(), ReadyState::Closed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_initial_listeners_see_open_and_first_message() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.send(Message::Text("welcome".into())).await.unwrap();
            // Hold the connection until the client closes it.
            while let Some(Ok(message)) = ws.next().await {
                if message.is_close() {
                    break;
                }
            }
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let listeners: InitialListeners = SocketEventKind::ALL
            .into_iter()
            .map(|kind| {
                let tx = tx.clone();
                let listener: SocketListener = Arc::new(move |e: &SocketEvent| {
                    let _ = tx.send((e.kind, e.data.clone()));
                });
                (kind, listener)
            })
            .collect();
        let socket = NativeSocketFactory::new()
            .create_with_listeners(&format!("ws://{}", addr), &[], listeners)
            .unwrap();

        assert_eq!(rx.recv().await, Some((SocketEventKind::Open, None)));
        assert_eq!(
            rx.recv().await,
            Some((SocketEventKind::Message, Some(MessageData::from("welcome"))))
        );
        socket.close(Some(1000), Some("done"));
        // An abrupt server hang-up may report an error before the close.
        while let Some((kind, _)) = rx.recv().await {
            if kind == SocketEventKind::Close {
                break;
            }
        }
        assert_eq!(socket.ready_state(), ReadyState::Closed);
        server.await.unwrap();
    }

    #[test]
    fn test_parse_method() {
        assert_eq!(parse_method("post").unwrap(), reqwest::Method::POST);
        assert!(parse_method("bad method").is_err());
    }

    #[tokio::test]
    async fn test_xhr_send_requires_open() {
        let factory = NativeHttpRequestFactory::with_client(reqwest::Client::new());
        let request = factory.create();
        assert!(request.send(None).is_err());
        request.open("GET", "http://127.0.0.1:1/").unwrap();
        assert_eq!(request.ready_state(), XhrReadyState::Opened);
        request.set_request_header("x-a", "1").unwrap();
        request.abort();
        assert_eq!(request.ready_state(), XhrReadyState::Unsent);
    }
}
