//! Error types for Tandem.
//!
//! Callers must be able to tell a call that never got an answer
//! (`NoResponse`) apart from one the remote side answered with an error
//! (`RemoteFailure`); both carry the originating command name.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Why a pending call settled without a response value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoResponseCause {
    /// The response timeout elapsed before a matching response arrived.
    Timeout(Duration),
    /// Pending calls were cleared locally.
    Cancelled,
    /// The peer answered with a cancellation packet.
    RemoteCancelled(Option<String>),
    /// The transport reported a disconnect.
    Disconnected,
    /// The transport reported an exception.
    TransportFault(String),
    /// The connection was torn down.
    Disposed,
}

impl std::fmt::Display for NoResponseCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NoResponseCause::Timeout(after) => write!(f, "timed out after {:?}", after),
            NoResponseCause::Cancelled => write!(f, "cancelled"),
            NoResponseCause::RemoteCancelled(Some(reason)) => {
                write!(f, "cancelled by peer: {}", reason)
            }
            NoResponseCause::RemoteCancelled(None) => write!(f, "cancelled by peer"),
            NoResponseCause::Disconnected => write!(f, "peer disconnected"),
            NoResponseCause::TransportFault(message) => write!(f, "transport fault: {}", message),
            NoResponseCause::Disposed => write!(f, "connection disposed"),
        }
    }
}

/// Serializable description of an error raised on the remote side.
///
/// This is what travels inside `CommandFailure`/`ResponseFailure` packets and
/// what bound functions return when they fail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteFailure {
    /// Short machine-readable error kind (e.g. `invalid_argument`, `panic`).
    pub kind: String,
    /// Human-readable message.
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl RemoteFailure {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            data: None,
        }
    }

    /// Attach a structured payload to the failure.
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Decode a failure from a packet parameter.
    ///
    /// Peers that send a bare string or some other shape still produce a
    /// usable failure rather than a decode error.
    pub fn from_parameter(parameter: &serde_json::Value) -> Self {
        match serde_json::from_value::<RemoteFailure>(parameter.clone()) {
            Ok(failure) => failure,
            Err(_) => match parameter.as_str() {
                Some(message) => RemoteFailure::new("remote_error", message),
                None => RemoteFailure::new("remote_error", parameter.to_string()),
            },
        }
    }

    /// Encode the failure as a packet parameter.
    pub fn to_parameter(&self) -> serde_json::Value {
        serde_json::to_value(self)
            .unwrap_or_else(|_| serde_json::Value::String(self.message.clone()))
    }
}

impl std::fmt::Display for RemoteFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for RemoteFailure {}

/// Main error type for Tandem.
#[derive(Debug, Error)]
pub enum RpcError {
    // Call outcomes
    #[error("No response for '{command}': {cause}")]
    NoResponse {
        command: String,
        cause: NoResponseCause,
    },

    #[error("Remote failure in '{command}': {failure}")]
    RemoteFailure {
        command: String,
        failure: RemoteFailure,
    },

    // Protocol errors
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("Packet id {0} is already pending")]
    DuplicatePendingId(u64),

    // Lifecycle errors
    #[error("Connection has been disposed")]
    Disposed,

    #[error("{operation} is already in progress")]
    DisposeInProgress { operation: &'static str },

    // Transport errors
    #[error("Transport error: {message}")]
    Transport {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("Failed to decode result of '{command}': {message}")]
    Decode { command: String, message: String },

    #[error("Invalid arguments for '{command}': {message}")]
    InvalidArguments { command: String, message: String },

    #[error("Internal error: {0}")]
    Internal(String),

    /// A blocking wrapper was called on a thread that drives a
    /// current-thread runtime. Parking it would stall the runtime forever.
    #[error("{operation} would block a current-thread runtime; use the async form")]
    WouldBlock { operation: &'static str },
}

/// Result type alias for Tandem operations.
pub type Result<T> = std::result::Result<T, RpcError>;

impl From<std::io::Error> for RpcError {
    fn from(err: std::io::Error) -> Self {
        RpcError::Transport {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl RpcError {
    /// Create a no-response error for a command.
    pub fn no_response(command: impl Into<String>, cause: NoResponseCause) -> Self {
        RpcError::NoResponse {
            command: command.into(),
            cause,
        }
    }

    /// Create a transport error without an underlying IO source.
    pub fn transport(message: impl Into<String>) -> Self {
        RpcError::Transport {
            message: message.into(),
            source: None,
        }
    }

    /// True for calls that never received a response (timeout, cancel, disconnect, disposal).
    pub fn is_no_response(&self) -> bool {
        matches!(self, RpcError::NoResponse { .. })
    }

    /// True for calls the remote side answered with an error.
    pub fn is_remote_failure(&self) -> bool {
        matches!(self, RpcError::RemoteFailure { .. })
    }

    /// True if the call failed because its response timeout elapsed.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            RpcError::NoResponse {
                cause: NoResponseCause::Timeout(_),
                ..
            }
        )
    }

    /// True if the error stems from the connection being torn down.
    pub fn is_disposed(&self) -> bool {
        matches!(
            self,
            RpcError::Disposed
                | RpcError::NoResponse {
                    cause: NoResponseCause::Disposed,
                    ..
                }
        )
    }

    /// The underlying cause of a no-response error.
    pub fn no_response_cause(&self) -> Option<&NoResponseCause> {
        match self {
            RpcError::NoResponse { cause, .. } => Some(cause),
            _ => None,
        }
    }

    /// Describe this error as a failure that can be sent to the peer.
    pub fn to_remote_failure(&self) -> RemoteFailure {
        match self {
            RpcError::RemoteFailure { failure, .. } => failure.clone(),
            RpcError::NoResponse { .. } => RemoteFailure::new("no_response", self.to_string()),
            RpcError::Protocol { .. } => RemoteFailure::new("unknown_command", self.to_string()),
            RpcError::InvalidArguments { .. } | RpcError::Json { .. } | RpcError::Decode { .. } => {
                RemoteFailure::new("invalid_argument", self.to_string())
            }
            RpcError::Disposed | RpcError::DisposeInProgress { .. } => {
                RemoteFailure::new("disposed", self.to_string())
            }
            RpcError::WouldBlock { .. } => RemoteFailure::new("would_block", self.to_string()),
            _ => RemoteFailure::new("internal", self.to_string()),
        }
    }
}
