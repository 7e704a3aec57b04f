//! MCP-specific error types.

use std::time::Duration;

use thiserror::Error;

use crate::protocol::{DecodeError, RpcError};

/// Errors that can occur during transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Failed to spawn the child process.
    #[error("failed to spawn process: {0}")]
    SpawnFailed(std::io::Error),

    /// Failed to write to the transport.
    #[error("write error: {0}")]
    WriteError(std::io::Error),

    /// Failed to read from the transport.
    #[error("read error: {0}")]
    ReadError(std::io::Error),

    /// Connection was closed unexpectedly.
    #[error("connection closed")]
    ConnectionClosed,

    /// Transport is not connected.
    #[error("not connected")]
    NotConnected,

    /// The HTTP request could not be sent or its body not read.
    #[error("http request failed: {0}")]
    Http(String),

    /// The server answered with a non-2xx status.
    #[error("http status {status}: {body}")]
    HttpStatus { status: u16, body: String },

    /// The response body exceeded the read limit.
    #[error("response body exceeds {limit} bytes")]
    BodyTooLarge { limit: usize },

    /// The encoded request exceeded the send limit.
    #[error("request body exceeds {limit} bytes")]
    RequestTooLarge { limit: usize },

    /// The outgoing message could not be serialized.
    #[error("failed to encode message: {0}")]
    Encode(String),

    /// The server sent bytes that are not a usable JSON-RPC response.
    #[error("undecodable response: {0}")]
    Decode(String),

    /// The caller cancelled the operation.
    #[error("cancelled")]
    Cancelled,

    /// No response arrived within the per-request timeout.
    #[error("no response within {0:?}")]
    Timeout(Duration),

    /// The caller's deadline passed.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// Failed to terminate the process.
    #[error("failed to terminate process: {0}")]
    TerminateFailed(std::io::Error),
}

impl TransportError {
    /// Whether this error means the connection itself is gone.
    ///
    /// Only these drop a client back to disconnected; everything else is a
    /// per-request failure.
    pub fn is_connection_loss(&self) -> bool {
        matches!(
            self,
            Self::ConnectionClosed
                | Self::NotConnected
                | Self::WriteError(_)
                | Self::ReadError(_)
                | Self::Http(_)
        )
    }
}

impl From<DecodeError> for TransportError {
    fn from(err: DecodeError) -> Self {
        Self::Decode(err.to_string())
    }
}

/// Errors that can occur during MCP operations.
#[derive(Debug, Error)]
pub enum McpError {
    /// Transport-level error.
    #[error("{method}: transport error: {source}")]
    Transport {
        method: String,
        #[source]
        source: TransportError,
    },

    /// The server answered with a JSON-RPC error object.
    #[error("{method}: {error}")]
    Rpc {
        method: String,
        #[source]
        error: RpcError,
    },

    /// The tool ran and reported failure.
    #[error("tool '{tool}' on server '{server}' failed: {message}")]
    Tool {
        server: String,
        tool: String,
        message: String,
    },

    /// The operation needs a ready client.
    #[error("server '{server}' is not ready (state: {state})")]
    NotReady { server: String, state: String },

    /// The per-request timeout or the caller's deadline elapsed.
    #[error("{method}: timed out: {reason}")]
    Timeout { method: String, reason: String },

    /// The caller cancelled the operation.
    #[error("{method}: cancelled")]
    Cancelled { method: String },

    /// Tool not found in the registry.
    #[error("tool not found: {0}")]
    ToolNotFound(String),

    /// Server not found by name.
    #[error("server not found: {0}")]
    ServerNotFound(String),

    /// Server with this name already exists.
    #[error("server already exists: {0}")]
    ServerAlreadyExists(String),

    /// The client was closed and cannot be reused.
    #[error("server '{0}' is closed")]
    Closed(String),

    /// Protocol-level error (malformed result payloads, etc.).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Server initialization failed.
    #[error("initialization failed: {0}")]
    InitializationFailed(String),
}

impl McpError {
    /// Attach the method name to a transport failure.
    ///
    /// Cancellation and timeouts get their own variants.
    pub fn transport(method: impl Into<String>, source: TransportError) -> Self {
        let method = method.into();
        match source {
            TransportError::Cancelled => Self::Cancelled { method },
            TransportError::DeadlineExceeded => Self::Timeout {
                method,
                reason: "deadline exceeded".to_string(),
            },
            TransportError::Timeout(after) => Self::Timeout {
                method,
                reason: format!("no response within {:?}", after),
            },
            source => Self::Transport { method, source },
        }
    }

    /// Create a protocol error.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Whether the underlying transport reported a lost connection.
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, Self::Transport { source, .. } if source.is_connection_loss())
    }

    /// The JSON-RPC error if the server reported one.
    pub fn rpc_error(&self) -> Option<&RpcError> {
        match self {
            Self::Rpc { error, .. } => Some(error),
            _ => None,
        }
    }
}

impl From<McpError> for hearth_core::Error {
    fn from(err: McpError) -> Self {
        match err {
            McpError::ToolNotFound(_) | McpError::ServerNotFound(_) => Self::NotFound(err.to_string()),
            other => Self::Mcp(other.to_string()),
        }
    }
}
