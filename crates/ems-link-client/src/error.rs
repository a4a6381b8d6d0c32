//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "JSON-RPC session client over WebSocket."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::time::Duration;

use ems_link_msg::RpcError;

/// Convenience alias used throughout the client.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Coarse classification of a [`ClientError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The connection is lost, unreachable or not open.
    Transport,
    /// A frame or result could not be interpreted.
    Protocol,
    /// The remote answered with a JSON-RPC error object.
    Application,
    /// No response arrived within the configured window.
    Timeout,
    /// The session is not authenticated for this request.
    NotAuthenticated,
    /// Credentials were rejected or the session was invalidated.
    Authentication,
    /// The session task is gone.
    Closed,
}

/// Errors surfaced by session operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
    /// The connection dropped while the request was in flight.
    #[error("connection lost")]
    ConnectionLost,
    /// No connection is currently open.
    #[error("connection is not open")]
    NotConnected,
    /// Opening the connection failed.
    #[error("transport error: {0}")]
    Transport(String),
    /// Malformed frame or result.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// Verbatim error response from the remote.
    #[error("remote error {0}")]
    Application(RpcError),
    /// The request expired.
    #[error("request `{method}` timed out after {timeout:?}")]
    Timeout {
        /// Method of the expired request.
        method: String,
        /// Window that elapsed.
        timeout: Duration,
    },
    /// Non-authentication traffic attempted before login completed.
    #[error("session is not authenticated")]
    NotAuthenticated,
    /// Login rejected by the remote.
    #[error("authentication rejected: {0}")]
    AuthenticationRejected(RpcError),
    /// Session invalidated by a push from the remote.
    #[error("authentication invalidated by the remote")]
    AuthenticationInvalidated,
    /// The session dispatch loop has shut down.
    #[error("session closed")]
    Closed,
}

impl ClientError {
    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClientError::ConnectionLost | ClientError::NotConnected | ClientError::Transport(_) => {
                ErrorKind::Transport
            }
            ClientError::Protocol(_) => ErrorKind::Protocol,
            ClientError::Application(_) => ErrorKind::Application,
            ClientError::Timeout { .. } => ErrorKind::Timeout,
            ClientError::NotAuthenticated => ErrorKind::NotAuthenticated,
            ClientError::AuthenticationRejected(_) | ClientError::AuthenticationInvalidated => {
                ErrorKind::Authentication
            }
            ClientError::Closed => ErrorKind::Closed,
        }
    }

    /// The remote error object, for application errors and rejected logins.
    pub fn rpc_error(&self) -> Option<&RpcError> {
        match self {
            ClientError::Application(error) | ClientError::AuthenticationRejected(error) => {
                Some(error)
            }
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.kind() == ErrorKind::Timeout
    }

    pub fn is_transport(&self) -> bool {
        self.kind() == ErrorKind::Transport
    }
}

impl From<ems_link_msg::ParseError> for ClientError {
    fn from(value: ems_link_msg::ParseError) -> Self {
        ClientError::Protocol(value.to_string())
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(value: serde_json::Error) -> Self {
        ClientError::Protocol(value.to_string())
    }
}
