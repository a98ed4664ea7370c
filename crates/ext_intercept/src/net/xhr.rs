//! XHR capability and its capture decorator.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::json;

use super::{best_effort, ListenerId};
use crate::buffer::{EventBuffer, EventKind};
use crate::InterceptError;

/// XHR notification kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum XhrEventKind {
    ReadyStateChange,
    Load,
    Error,
    LoadEnd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum XhrReadyState {
    Unsent = 0,
    Opened = 1,
    HeadersReceived = 2,
    Loading = 3,
    Done = 4,
}

/// Snapshot of the request at the moment a notification fired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XhrEvent {
    pub kind: XhrEventKind,
    pub ready_state: XhrReadyState,
    pub status: u16,
    pub response_text: String,
}

pub type XhrListener = Arc<dyn Fn(&XhrEvent) + Send + Sync>;

/// A request object: open, then send, then observe completion.
pub trait HttpRequest: Send + Sync {
    fn open(&self, method: &str, url: &str) -> Result<(), InterceptError>;
    fn set_request_header(&self, name: &str, value: &str) -> Result<(), InterceptError>;
    fn send(&self, body: Option<String>) -> Result<(), InterceptError>;
    fn abort(&self);
    fn ready_state(&self) -> XhrReadyState;
    /// HTTP status; 0 until headers arrive or on network failure.
    fn status(&self) -> u16;
    fn response_text(&self) -> String;
    fn add_listener(&self, kind: XhrEventKind, listener: XhrListener) -> ListenerId;
    fn remove_listener(&self, id: ListenerId) -> bool;
}

/// Request constructor.
pub trait HttpRequestFactory: Send + Sync {
    fn create(&self) -> Arc<dyn HttpRequest>;
}

/// Factory decorator that wraps every request it constructs.
pub struct CapturedHttpRequestFactory {
    inner: Arc<dyn HttpRequestFactory>,
    buffer: Arc<EventBuffer>,
}

impl CapturedHttpRequestFactory {
    pub fn new(inner: Arc<dyn HttpRequestFactory>, buffer: Arc<EventBuffer>) -> Self {
        Self { inner, buffer }
    }

    /// The factory this one delegates to.
    pub fn inner(&self) -> &Arc<dyn HttpRequestFactory> {
        &self.inner
    }
}

impl HttpRequestFactory for CapturedHttpRequestFactory {
    fn create(&self) -> Arc<dyn HttpRequest> {
        Arc::new(CapturedHttpRequest::wrap(self.inner.create(), self.buffer.clone()))
    }
}

#[derive(Default)]
struct Pending {
    target: Option<(String, String)>,
    load_listener: Option<ListenerId>,
}

/// Request decorator. `open` remembers method and URL; `send` records the
/// request and installs a completion listener that records the response.
pub struct CapturedHttpRequest {
    inner: Arc<dyn HttpRequest>,
    buffer: Arc<EventBuffer>,
    pending: Mutex<Pending>,
}

impl CapturedHttpRequest {
    pub fn wrap(inner: Arc<dyn HttpRequest>, buffer: Arc<EventBuffer>) -> Self {
        Self {
            inner,
            buffer,
            pending: Mutex::new(Pending::default()),
        }
    }

    /// The request this one delegates to.
    pub fn inner(&self) -> &Arc<dyn HttpRequest> {
        &self.inner
    }

    fn pending(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn observe_send(&self, body: Option<&str>) {
        let mut pending = self.pending();
        let Some((method, url)) = pending.target.clone() else {
            return;
        };

        self.buffer.push(self.buffer.event(
            EventKind::XhrRequest,
            url.clone(),
            json!({ "method": method, "body": body }),
        ));

        if let Some(previous) = pending.load_listener.take() {
            self.inner.remove_listener(previous);
        }
        let buffer = self.buffer.clone();
        let id = self.inner.add_listener(
            XhrEventKind::Load,
            Arc::new(move |loaded: &XhrEvent| {
                best_effort("xhr response", || {
                    let event = buffer
                        .event(
                            EventKind::XhrResponse,
                            url.clone(),
                            json!({ "method": method, "body": loaded.response_text }),
                        )
                        .with_status(loaded.status);
                    buffer.push(event);
                });
            }),
        );
        pending.load_listener = Some(id);
    }
}

impl HttpRequest for CapturedHttpRequest {
    fn open(&self, method: &str, url: &str) -> Result<(), InterceptError> {
        best_effort("xhr open", || {
            self.pending().target = Some((method.to_uppercase(), url.to_string()));
        });
        self.inner.open(method, url)
    }

    fn set_request_header(&self, name: &str, value: &str) -> Result<(), InterceptError> {
        self.inner.set_request_header(name, value)
    }

    fn send(&self, body: Option<String>) -> Result<(), InterceptError> {
        best_effort("xhr send", || self.observe_send(body.as_deref()));
        self.inner.send(body)
    }

    fn abort(&self) {
        self.inner.abort()
    }

    fn ready_state(&self) -> XhrReadyState {
        self.inner.ready_state()
    }

    fn status(&self) -> u16 {
        self.inner.status()
    }

    fn response_text(&self) -> String {
        self.inner.response_text()
    }

    fn add_listener(&self, kind: XhrEventKind, listener: XhrListener) -> ListenerId {
        self.inner.add_listener(kind, listener)
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.remove_listener(id)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockHttpRequestFactory;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_request_and_response_recorded() {
        let buffer = Arc::new(EventBuffer::new());
        let mock = MockHttpRequestFactory::new();
        let factory = CapturedHttpRequestFactory::new(Arc::new(mock.clone()), buffer.clone());

        let request = factory.create();
        request.open("post", "/api/login").unwrap();
        request.send(Some("user=a".to_string())).unwrap();

        let events = buffer.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::XhrRequest);
        assert_eq!(events[0].endpoint, "/api/login");
        assert_eq!(events[0].payload["method"], "POST");
        assert_eq!(events[0].payload["body"], "user=a");

        mock.last().unwrap().complete(200, "welcome");
        let response = buffer.events_of(EventKind::XhrResponse).pop().unwrap();
        assert_eq!(response.status, Some(200));
        assert_eq!(response.payload["body"], "welcome");
        assert_eq!(request.status(), 200);
        assert_eq!(request.response_text(), "welcome");
        assert_eq!(request.ready_state(), XhrReadyState::Done);
    }

    #[test]
    fn test_caller_listeners_still_fire() {
        let buffer = Arc::new(EventBuffer::new());
        let mock = MockHttpRequestFactory::new();
        let factory = CapturedHttpRequestFactory::new(Arc::new(mock.clone()), buffer.clone());
        let hits = Arc::new(AtomicUsize::new(0));

        let request = factory.create();
        let counter = hits.clone();
        request.add_listener(
            XhrEventKind::Load,
            Arc::new(move |event: &XhrEvent| {
                assert_eq!(event.status, 404);
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        request.open("GET", "/missing").unwrap();
        request.send(None).unwrap();
        mock.last().unwrap().complete(404, "");

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn test_send_without_open_is_not_recorded() {
        let buffer = Arc::new(EventBuffer::new());
        let factory = CapturedHttpRequestFactory::new(
            Arc::new(MockHttpRequestFactory::new()),
            buffer.clone(),
        );
        let request = factory.create();
        assert!(request.send(None).is_err());
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_reopened_request_records_once_per_send() {
        let buffer = Arc::new(EventBuffer::new());
        let mock = MockHttpRequestFactory::new();
        let factory = CapturedHttpRequestFactory::new(Arc::new(mock.clone()), buffer.clone());

        let request = factory.create();
        for _ in 0..2 {
            request.open("GET", "/poll").unwrap();
            request.send(None).unwrap();
            mock.last().unwrap().complete(200, "tick");
        }
        assert_eq!(buffer.events_of(EventKind::XhrResponse).len(), 2);
        assert_eq!(buffer.events_of(EventKind::XhrRequest).len(), 2);
    }
}
