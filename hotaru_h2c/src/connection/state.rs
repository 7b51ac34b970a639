use super::error::{ConnectionError, Result};

/// Lifecycle of a [`Connection`](super::Connection).
///
/// ```text
/// Idle ──connect()──► Connecting ──transport ready──► Connected
///                        │                               │
///                        └──timeout / error──► Closed ◄──┘ close / GOAWAY / error
/// ```
///
/// `Closed` is terminal. Retrying means building a new connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Constructed, `connect()` not called yet
    Idle,

    /// Transport connect (and TLS handshake) in flight, timer armed
    Connecting,

    /// Engine initiated, read loop armed
    Connected,

    /// Torn down, every resource released
    Closed,
}

impl ConnectionState {
    /// `connect()` was called. Only valid from `Idle`; re-entrant calls are rejected.
    pub fn begin_connect(self) -> Result<Self> {
        match self {
            ConnectionState::Idle => Ok(ConnectionState::Connecting),
            ConnectionState::Connecting => Err(ConnectionError::AlreadyConnecting),
            ConnectionState::Connected => Err(ConnectionError::AlreadyConnected),
            ConnectionState::Closed => Err(ConnectionError::ConnectionClosed),
        }
    }

    /// The transport finished connecting.
    ///
    /// Returns `None` when the attempt is no longer wanted, in which case the
    /// late transport must be discarded.
    pub fn transport_ready(self) -> Option<Self> {
        match self {
            ConnectionState::Connecting => Some(ConnectionState::Connected),
            _ => None,
        }
    }

    /// Enter the closure path. `None` means it already ran.
    pub fn close(self) -> Option<Self> {
        match self {
            ConnectionState::Closed => None,
            _ => Some(ConnectionState::Closed),
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, ConnectionState::Closed)
    }
}
