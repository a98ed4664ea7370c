//! ext_intercept - Call interception and network capture for instrumented page contexts
//!
//! Wraps callable bindings inside a [`Realm`] so that calls pass through an
//! interception callback, and decorates the realm's communication primitives
//! (WebSocket, fetch, XHR) so that their traffic lands in a shared
//! [`EventBuffer`].
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                    Realm                     │
//! │  global object ── hooked functions ──┐       │
//! │  socket / fetch / xhr bindings ──────┤       │
//! └──────────────────────────────────────┼───────┘
//!                                        ▼
//!                               ┌──────────────┐
//!                               │ EventBuffer  │
//!                               └──────────────┘
//! ```
//!
//! The [`Instrumentation`] context owns every piece of mutable capture state
//! and has an explicit attach/detach lifecycle.
//!
//! Error codes: 9800-9810

pub mod buffer;
pub mod context;
pub mod hook;
pub mod net;
pub mod path;
pub mod realm;
pub mod signature;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use buffer::{EventBuffer, EventKind, InterceptedEvent};
pub use context::{CaptureConfig, Instrumentation, API_ROOT};
pub use hook::{HookCallback, HookRegistration, HookTable, Interception, Invocation, ROOT_LABEL};
pub use net::{
    CapturedFetch, CapturedHttpRequest, CapturedHttpRequestFactory, CapturedSocket,
    CapturedSocketFactory, Connection, ConnectionLog, ConnectionState, Fetch, FetchRequest,
    FetchResponse, HttpRequest, HttpRequestFactory, InitialListeners, ListenerId, ListenerSet,
    MessageData, NativeFetch, NativeHttpRequestFactory, NativeSocketFactory, ReadyState, Socket,
    SocketEvent, SocketEventKind, SocketFactory, SocketListener, XhrEvent, XhrEventKind,
    XhrListener, XhrReadyState,
};
pub use path::{define_path, resolve, resolve_callable, resolve_slot};
pub use realm::{capture_stack, Exception, Function, Object, Primitives, Realm, Value};
pub use signature::{SignatureCapture, DEFAULT_SIGNATURE_CONTEXTS, DEFAULT_SIGNATURE_NAMES};

// ============================================================================
// Error Types (Error codes 9800-9810)
// ============================================================================

/// Error codes for interception operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum InterceptErrorCode {
    /// Generic interception error
    Generic = 9800,
    /// Hook target object is absent
    TargetAbsent = 9801,
    /// Hook target property is not callable
    NotCallable = 9802,
    /// Dotted path did not resolve
    PathNotFound = 9803,
    /// Dotted path is syntactically invalid or blocked
    InvalidPath = 9804,
    /// Primitive used in the wrong lifecycle state
    InvalidState = 9805,
    /// Socket could not be constructed
    SocketConnect = 9806,
    /// Socket send failed
    SocketSend = 9807,
    /// Fetch failed
    Fetch = 9808,
    /// Response body already consumed
    BodyUsed = 9809,
    /// XHR request failed
    Request = 9810,
}

/// Custom error type for interception operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InterceptError {
    #[error("[{code}] Interception error: {message}")]
    Generic { code: u32, message: String },

    #[error("[{code}] Hook target absent: {message}")]
    TargetAbsent { code: u32, message: String },

    #[error("[{code}] Not callable: {message}")]
    NotCallable { code: u32, message: String },

    #[error("[{code}] Path not found: {message}")]
    PathNotFound { code: u32, message: String },

    #[error("[{code}] Invalid path: {message}")]
    InvalidPath { code: u32, message: String },

    #[error("[{code}] Invalid state: {message}")]
    InvalidState { code: u32, message: String },

    #[error("[{code}] Socket connect error: {message}")]
    SocketConnect { code: u32, message: String },

    #[error("[{code}] Socket send error: {message}")]
    SocketSend { code: u32, message: String },

    #[error("[{code}] Fetch error: {message}")]
    Fetch { code: u32, message: String },

    #[error("[{code}] Body already used: {message}")]
    BodyUsed { code: u32, message: String },

    #[error("[{code}] Request error: {message}")]
    Request { code: u32, message: String },
}

impl InterceptError {
    pub fn generic(message: impl Into<String>) -> Self {
        Self::Generic {
            code: InterceptErrorCode::Generic as u32,
            message: message.into(),
        }
    }

    pub fn target_absent(message: impl Into<String>) -> Self {
        Self::TargetAbsent {
            code: InterceptErrorCode::TargetAbsent as u32,
            message: message.into(),
        }
    }

    pub fn not_callable(message: impl Into<String>) -> Self {
        Self::NotCallable {
            code: InterceptErrorCode::NotCallable as u32,
            message: message.into(),
        }
    }

    pub fn path_not_found(message: impl Into<String>) -> Self {
        Self::PathNotFound {
            code: InterceptErrorCode::PathNotFound as u32,
            message: message.into(),
        }
    }

    pub fn invalid_path(message: impl Into<String>) -> Self {
        Self::InvalidPath {
            code: InterceptErrorCode::InvalidPath as u32,
            message: message.into(),
        }
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            code: InterceptErrorCode::InvalidState as u32,
            message: message.into(),
        }
    }

    pub fn socket_connect(message: impl Into<String>) -> Self {
        Self::SocketConnect {
            code: InterceptErrorCode::SocketConnect as u32,
            message: message.into(),
        }
    }

    pub fn socket_send(message: impl Into<String>) -> Self {
        Self::SocketSend {
            code: InterceptErrorCode::SocketSend as u32,
            message: message.into(),
        }
    }

    pub fn fetch(message: impl Into<String>) -> Self {
        Self::Fetch {
            code: InterceptErrorCode::Fetch as u32,
            message: message.into(),
        }
    }

    pub fn body_used(message: impl Into<String>) -> Self {
        Self::BodyUsed {
            code: InterceptErrorCode::BodyUsed as u32,
            message: message.into(),
        }
    }

    pub fn request(message: impl Into<String>) -> Self {
        Self::Request {
            code: InterceptErrorCode::Request as u32,
            message: message.into(),
        }
    }

    /// Numeric code of this error
    pub fn code(&self) -> u32 {
        match self {
            Self::Generic { code, .. }
            | Self::TargetAbsent { code, .. }
            | Self::NotCallable { code, .. }
            | Self::PathNotFound { code, .. }
            | Self::InvalidPath { code, .. }
            | Self::InvalidState { code, .. }
            | Self::SocketConnect { code, .. }
            | Self::SocketSend { code, .. }
            | Self::Fetch { code, .. }
            | Self::BodyUsed { code, .. }
            | Self::Request { code, .. } => *code,
        }
    }
}

impl From<url::ParseError> for InterceptError {
    fn from(e: url::ParseError) -> Self {
        Self::socket_connect(format!("invalid URL: {}", e))
    }
}

impl From<reqwest::Error> for InterceptError {
    fn from(e: reqwest::Error) -> Self {
        Self::fetch(e.to_string())
    }
}

// ============================================================================
// Tests
// ============================================================================
