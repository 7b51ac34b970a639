use std::fmt;
use std::io;
use std::time::Duration;

use crate::engine::{EngineError, EventKind, StreamId};

#[derive(Debug)]
pub enum ConnectionError {
    IoError(io::Error),
    TlsError(String),
    HostResolutionFailed(String),
    ConnectionClosed,
    NotConnected,
    AlreadyConnecting,
    AlreadyConnected,
    EngineBusy,
    Protocol(EngineError),
    StreamIdReused(StreamId),
    HandlerNotFound(EventKind),
    InvalidUrl(String),
    UnsupportedScheme(String),
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IoError(err) => write!(f, "I/O error: {}", err),
            Self::TlsError(err) => write!(f, "TLS error: {}", err),
            Self::HostResolutionFailed(h) => write!(f, "Failed to resolve host: {}", h),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::NotConnected => write!(f, "Connection is not established"),
            Self::AlreadyConnecting => write!(f, "Already waiting for a connection"),
            Self::AlreadyConnected => write!(f, "Already connected"),
            Self::EngineBusy => write!(f, "Protocol engine is in use"),
            Self::Protocol(err) => write!(f, "{}", err),
            Self::StreamIdReused(id) => write!(f, "Stream id {} was already used on this connection", id),
            Self::HandlerNotFound(kind) => write!(f, "No such handler registered for {:?}", kind),
            Self::InvalidUrl(err) => write!(f, "Invalid URL: {}", err),
            Self::UnsupportedScheme(s) => write!(f, "Unsupported scheme: {}", s),
        }
    }
}

impl std::error::Error for ConnectionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::IoError(err) => Some(err),
            Self::Protocol(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for ConnectionError {
    fn from(err: io::Error) -> Self {
        Self::IoError(err)
    }
}

impl From<EngineError> for ConnectionError {
    fn from(err: EngineError) -> Self {
        Self::Protocol(err)
    }
}

pub type Result<T> = std::result::Result<T, ConnectionError>;

/// Why a connection reached `Closed`. Delivered exactly once to
/// `on_connection_closed`.
#[derive(Debug)]
pub enum CloseReason {
    /// The connect deadline passed before the transport was ready.
    Timeout(Duration),
    /// Transport, TLS or protocol failure.
    Error(ConnectionError),
    /// The peer closed the byte stream.
    PeerClosed,
    /// The peer sent GOAWAY.
    Terminated {
        error_code: u32,
        last_stream_id: Option<StreamId>,
    },
    /// `Connection::close` was called.
    Local,
}

impl CloseReason {
    /// Request-timeout status reported for connect timeouts.
    pub const TIMEOUT_STATUS: u16 = 599;

    pub fn is_timeout(&self) -> bool {
        matches!(self, CloseReason::Timeout(_))
    }

    /// True for closures caused by a failure rather than an orderly shutdown.
    pub fn is_error(&self) -> bool {
        match self {
            CloseReason::Timeout(_) | CloseReason::Error(_) => true,
            CloseReason::Terminated { error_code, .. } => *error_code != 0,
            CloseReason::PeerClosed | CloseReason::Local => false,
        }
    }

    pub fn error(&self) -> Option<&ConnectionError> {
        match self {
            CloseReason::Error(err) => Some(err),
            _ => None,
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout(after) => write!(f, "HTTP {}: Timeout after {:?}", Self::TIMEOUT_STATUS, after),
            Self::Error(err) => write!(f, "{}", err),
            Self::PeerClosed => write!(f, "Connection closed by peer"),
            Self::Terminated { error_code, last_stream_id } => write!(
                f,
                "Connection terminated by peer (error code {}, last stream {:?})",
                error_code, last_stream_id
            ),
            Self::Local => write!(f, "Connection closed locally"),
        }
    }
}

impl From<ConnectionError> for CloseReason {
    fn from(err: ConnectionError) -> Self {
        CloseReason::Error(err)
    }
}
