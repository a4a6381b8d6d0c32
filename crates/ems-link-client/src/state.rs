//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "JSON-RPC session client over WebSocket."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Connection and login lifecycle.
//!
//! The machine only decides what state follows an event and which methods
//! a state admits; it never buffers or sends traffic itself.

use std::fmt;

use ems_link_msg::methods::is_authentication_method;

/// Lifecycle of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// No connection and none scheduled.
    #[default]
    Disconnected,
    /// A connection attempt is running or a reconnect is scheduled.
    Connecting,
    /// Transport open, not logged in.
    Connected,
    /// A login request is in flight.
    Authenticating,
    /// Logged in; all traffic admitted.
    Authenticated,
}

/// Inputs driving [`ConnectionState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthEvent {
    /// `connect()` called or reconnect attempt started.
    Connect,
    /// Transport reported open.
    TransportOpened,
    /// Transport closed without being asked to.
    TransportLost,
    /// `disconnect()` called.
    Disconnect,
    /// A login request was sent.
    LoginStarted,
    /// Login confirmed by the authoritative signal for the mode.
    LoginSucceeded,
    /// Login rejected by the remote.
    LoginFailed,
    /// The remote invalidated the session.
    SessionInvalidated,
    /// The user logged out.
    Logout,
}

impl ConnectionState {
    /// Next state after `event`. Defined for every pair; events that make no
    /// sense in the current state leave it unchanged.
    pub fn apply(self, event: AuthEvent) -> ConnectionState {
        use AuthEvent::*;
        use ConnectionState::*;

        match (self, event) {
            (_, Disconnect) => Disconnected,
            (_, Connect) => Connecting,

            (Connecting, TransportOpened) => Connected,
            (state, TransportOpened) => state,

            (Connected | Authenticating | Authenticated, TransportLost) => Connecting,
            (state, TransportLost) => state,

            // A new login replaces the current identity, so traffic waits for it.
            (Connected | Authenticating | Authenticated, LoginStarted) => Authenticating,
            (state, LoginStarted) => state,

            (Connected | Authenticating, LoginSucceeded) => Authenticated,
            (state, LoginSucceeded) => state,

            (Authenticating, LoginFailed) => Connected,
            (state, LoginFailed) => state,

            (Authenticating | Authenticated, SessionInvalidated | Logout) => Connected,
            (state, SessionInvalidated | Logout) => state,
        }
    }

    /// Whether a frame for `method` may be written in this state.
    pub fn permits(self, method: &str) -> bool {
        match self {
            ConnectionState::Authenticated => true,
            ConnectionState::Connected | ConnectionState::Authenticating => {
                is_authentication_method(method)
            }
            ConnectionState::Disconnected | ConnectionState::Connecting => false,
        }
    }

    /// Whether the transport is open.
    pub fn is_open(self) -> bool {
        matches!(
            self,
            ConnectionState::Connected
                | ConnectionState::Authenticating
                | ConnectionState::Authenticated
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::Authenticated => "authenticated",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
