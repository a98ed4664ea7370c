//! ext_jsrpc - Remote-call channel for instrumented page contexts
//!
//! Keeps one outbound socket to a controller, registers under a group and
//! client name, and answers `call` frames by invoking functions (or
//! evaluating expressions) inside a [`Realm`](ext_intercept::Realm).
//!
//! ```text
//!   controller ──call──▶ RemoteChannel ──▶ Dispatcher ──▶ realm function
//!        ▲                    │
//!        └─────response───────┘
//! ```
//!
//! Lost connections are retried on a fixed interval up to a configured
//! attempt budget; see [`ChannelState`] for the lifecycle.
//!
//! Error codes: 9900-9909

pub mod channel;
pub mod config;
pub mod dispatch;
pub mod eval;
pub mod protocol;

pub use channel::{ChannelState, ChannelStatus, RemoteChannel, API_ROOT};
pub use config::{ChannelConfig, ConfigPatch};
pub use dispatch::Dispatcher;
pub use eval::{Evaluator, ExpressionEvaluator};
pub use protocol::{decode, encode, CallRequest, CallResponse, ProtocolFault, RemoteMessage};

use ext_intercept::InterceptError;

// ============================================================================
// Error Types (Error codes 9900-9909)
// ============================================================================

/// Error codes for remote-call operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum JsrpcErrorCode {
    /// Generic channel error
    Generic = 9900,
    /// Channel socket is not open
    NotConnected = 9901,
    /// Dotted path could not be used
    InvalidPath = 9902,
    /// Socket construction or send failed
    Transport = 9903,
    /// Frame could not be encoded or decoded
    Protocol = 9904,
    /// Configuration value rejected
    Config = 9905,
}

/// Custom error type for remote-call operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JsrpcError {
    #[error("[{code}] Channel error: {message}")]
    Generic { code: u32, message: String },

    #[error("[{code}] Not connected: {message}")]
    NotConnected { code: u32, message: String },

    #[error("[{code}] Invalid path: {message}")]
    InvalidPath { code: u32, message: String },

    #[error("[{code}] Transport error: {message}")]
    Transport { code: u32, message: String },

    #[error("[{code}] Protocol error: {message}")]
    Protocol { code: u32, message: String },

    #[error("[{code}] Config error: {message}")]
    Config { code: u32, message: String },
}

impl JsrpcError {
    pub fn generic(message: impl Into<String>) -> Self {
        Self::Generic {
            code: JsrpcErrorCode::Generic as u32,
            message: message.into(),
        }
    }

    pub fn not_connected(message: impl Into<String>) -> Self {
        Self::NotConnected {
            code: JsrpcErrorCode::NotConnected as u32,
            message: message.into(),
        }
    }

    pub fn invalid_path(message: impl Into<String>) -> Self {
        Self::InvalidPath {
            code: JsrpcErrorCode::InvalidPath as u32,
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            code: JsrpcErrorCode::Transport as u32,
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            code: JsrpcErrorCode::Protocol as u32,
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            code: JsrpcErrorCode::Config as u32,
            message: message.into(),
        }
    }

    /// Numeric code of this error
    pub fn code(&self) -> u32 {
        match self {
            Self::Generic { code, .. }
            | Self::NotConnected { code, .. }
            | Self::InvalidPath { code, .. }
            | Self::Transport { code, .. }
            | Self::Protocol { code, .. }
            | Self::Config { code, .. } => *code,
        }
    }
}

impl From<InterceptError> for JsrpcError {
    fn from(e: InterceptError) -> Self {
        match e {
            InterceptError::InvalidPath { .. } | InterceptError::PathNotFound { .. } => {
                Self::invalid_path(e.to_string())
            }
            InterceptError::SocketConnect { .. }
            | InterceptError::SocketSend { .. }
            | InterceptError::InvalidState { .. } => Self::transport(e.to_string()),
            _ => Self::generic(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for JsrpcError {
    fn from(e: serde_json::Error) -> Self {
        Self::protocol(e.to_string())
    }
}

// ============================================================================
// Tests
// ============================================================================
