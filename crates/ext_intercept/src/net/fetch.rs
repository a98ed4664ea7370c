//! Fetch capability and its capture decorator.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use super::best_effort;
use crate::buffer::{EventBuffer, EventKind};
use crate::InterceptError;

/// Outbound fetch request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub url: String,
    pub method: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

impl FetchRequest {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: method.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new("GET", url)
    }

    pub fn post(url: impl Into<String>, body: impl Into<String>) -> Self {
        Self::new("POST", url).with_body(body)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }
}

/// Fetch response with a one-shot body.
///
/// The body can be read once. [`FetchResponse::try_clone`] duplicates an
/// unread body so an observer can read its copy while the caller keeps an
/// untouched original.
#[derive(Debug)]
pub struct FetchResponse {
    status: u16,
    url: String,
    headers: Vec<(String, String)>,
    body: Mutex<Option<Arc<Vec<u8>>>>,
}

impl FetchResponse {
    pub fn new(status: u16, url: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            url: url.into(),
            headers: Vec::new(),
            body: Mutex::new(Some(Arc::new(body.into()))),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn body_used(&self) -> bool {
        self.body.lock().unwrap_or_else(PoisonError::into_inner).is_none()
    }

    /// Duplicate this response; fails once the body has been read.
    pub fn try_clone(&self) -> Result<FetchResponse, InterceptError> {
        let body = self
            .body
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| InterceptError::body_used(self.url.clone()))?;
        Ok(FetchResponse {
            status: self.status,
            url: self.url.clone(),
            headers: self.headers.clone(),
            body: Mutex::new(Some(body)),
        })
    }

    /// Consume the body as raw bytes.
    pub async fn bytes(&self) -> Result<Vec<u8>, InterceptError> {
        let body = self
            .body
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| InterceptError::body_used(self.url.clone()))?;
        Ok(Arc::try_unwrap(body).unwrap_or_else(|shared| shared.as_ref().clone()))
    }

    /// Consume the body as text (lossy UTF-8).
    pub async fn text(&self) -> Result<String, InterceptError> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// The fetch entry point.
#[async_trait]
pub trait Fetch: Send + Sync {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, InterceptError>;
}

/// Fetch decorator recording requests and responses.
pub struct CapturedFetch {
    inner: Arc<dyn Fetch>,
    buffer: Arc<EventBuffer>,
}

impl CapturedFetch {
    pub fn new(inner: Arc<dyn Fetch>, buffer: Arc<EventBuffer>) -> Self {
        Self { inner, buffer }
    }

    /// The fetch this one delegates to.
    pub fn inner(&self) -> &Arc<dyn Fetch> {
        &self.inner
    }

    fn record_request(&self, request: &FetchRequest) {
        let payload = json!({
            "method": request.method,
            "headers": request.headers.iter().cloned().collect::<std::collections::BTreeMap<_, _>>(),
            "body": request.body,
        });
        self.buffer
            .push(self.buffer.event(EventKind::FetchRequest, request.url.clone(), payload));
    }

    fn schedule_response(&self, endpoint: String, response: &FetchResponse) {
        let copy = match response.try_clone() {
            Ok(copy) => copy,
            Err(e) => {
                debug!(url = %endpoint, error = %e, "response body not capturable");
                return;
            }
        };
        let buffer = self.buffer.clone();
        let capture = async move {
            match copy.text().await {
                Ok(body) => {
                    let event = buffer
                        .event(EventKind::FetchResponse, endpoint, json!({ "body": body }))
                        .with_status(copy.status());
                    buffer.push(event);
                }
                Err(e) => debug!(url = %endpoint, error = %e, "response body read failed"),
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(capture);
            }
            Err(_) => debug!("no runtime, response capture skipped"),
        }
    }
}

#[async_trait]
impl Fetch for CapturedFetch {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, InterceptError> {
        let endpoint = request.url.clone();
        best_effort("fetch request", || self.record_request(&request));

        let response = self.inner.fetch(request).await?;
        best_effort("fetch response", || self.schedule_response(endpoint, &response));
        Ok(response)
    }
}

// ============================================================================
// Tests
// ============================================================================
