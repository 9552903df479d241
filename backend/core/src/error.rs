use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error-kind code carried across the RPC boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    Generic,
    InvalidAuthToken,
    RegistrationTimeout,
    ProxyNotFound,
    PluginLoadFailure,
    TransportFailure,
    HandlerInternalError,
    InvalidColumnIndex,
    NoData,
    CannotCast,
    InvalidObject,
    InvalidArguments,
    NotSupported,
    Cancelled,
}

impl ErrorKind {
    /// Data-level kinds are raised by the data-access layer and never indicate
    /// a communication problem.
    pub fn is_data_error(self) -> bool {
        matches!(
            self,
            ErrorKind::InvalidColumnIndex | ErrorKind::NoData | ErrorKind::CannotCast
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Generic => "generic",
            ErrorKind::InvalidAuthToken => "invalid auth token",
            ErrorKind::RegistrationTimeout => "registration timeout",
            ErrorKind::ProxyNotFound => "proxy not found",
            ErrorKind::PluginLoadFailure => "plugin load failure",
            ErrorKind::TransportFailure => "transport failure",
            ErrorKind::HandlerInternalError => "handler internal error",
            ErrorKind::InvalidColumnIndex => "invalid column index",
            ErrorKind::NoData => "no data",
            ErrorKind::CannotCast => "cannot cast",
            ErrorKind::InvalidObject => "invalid object",
            ErrorKind::InvalidArguments => "invalid arguments",
            ErrorKind::NotSupported => "not supported",
            ErrorKind::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Structured exception exchanged between host and plugin.
///
/// Lets the receiving side tell "the peer's logic failed" apart from
/// "the peer is unreachable".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[serde(rename_all = "camelCase")]
#[error("{kind}: {message}")]
pub struct PluginException {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_handle: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nested: Option<Box<PluginException>>,
}

impl PluginException {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            object_handle: None,
            nested: None,
        }
    }

    pub fn with_object_handle(mut self, handle: i32) -> Self {
        self.object_handle = Some(handle);
        self
    }

    pub fn with_nested(mut self, nested: PluginException) -> Self {
        self.nested = Some(Box::new(nested));
        self
    }
}

/// Top-level error type for the plugin host.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("invalid registration token")]
    InvalidAuthToken,

    #[error("plugin registration timed out after {timeout:?} (token {token})")]
    RegistrationTimeout { token: String, timeout: Duration },

    #[error("registration token '{0}' is already pending")]
    TokenInUse(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("plugins proxy executable '{0}' not found")]
    ProxyNotFound(String),

    #[error("failed to load plugin '{plugin}': {message}")]
    PluginLoad { plugin: String, message: String },

    #[error("transport failure: {0}")]
    Transport(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("remote error: {0}")]
    Remote(PluginException),

    #[error("{kind}: {message}")]
    Data { kind: ErrorKind, message: String },

    #[error("{0} is disposed")]
    Disposed(&'static str),

    #[error("internal handler error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HostError {
    pub fn data(kind: ErrorKind, message: impl Into<String>) -> Self {
        HostError::Data {
            kind,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            HostError::InvalidAuthToken => ErrorKind::InvalidAuthToken,
            HostError::RegistrationTimeout { .. } => ErrorKind::RegistrationTimeout,
            HostError::TokenInUse(_) => ErrorKind::InvalidAuthToken,
            HostError::Cancelled => ErrorKind::Cancelled,
            HostError::ProxyNotFound(_) => ErrorKind::ProxyNotFound,
            HostError::PluginLoad { .. } => ErrorKind::PluginLoadFailure,
            HostError::Transport(_) | HostError::Protocol(_) => ErrorKind::TransportFailure,
            HostError::Remote(e) => e.kind,
            HostError::Data { kind, .. } => *kind,
            HostError::Disposed(_) => ErrorKind::InvalidObject,
            HostError::Internal(_) | HostError::Other(_) => ErrorKind::HandlerInternalError,
        }
    }

    /// Whether the underlying connection can no longer be trusted.
    pub fn is_transport(&self) -> bool {
        matches!(self, HostError::Transport(_) | HostError::Protocol(_))
    }

    /// Convert into the structured exception sent over the wire.
    pub fn to_exception(&self) -> PluginException {
        match self {
            HostError::Remote(e) => e.clone(),
            HostError::Data { kind, message } => PluginException::new(*kind, message.clone()),
            HostError::Other(e) => {
                let mut exception = PluginException::new(ErrorKind::HandlerInternalError, e.to_string());
                if let Some(cause) = e.source() {
                    exception = exception.with_nested(PluginException::new(
                        ErrorKind::Generic,
                        cause.to_string(),
                    ));
                }
                exception
            }
            other => PluginException::new(other.kind(), other.to_string()),
        }
    }
}

impl From<PluginException> for HostError {
    fn from(e: PluginException) -> Self {
        if e.kind.is_data_error() {
            HostError::Data {
                kind: e.kind,
                message: e.message,
            }
        } else {
            HostError::Remote(e)
        }
    }
}

pub type HostResult<T> = Result<T, HostError>;
