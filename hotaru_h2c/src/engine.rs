//! Protocol engine abstraction.
//!
//! The engine is the HTTP/2 state machine: it owns frame parsing, HPACK and
//! stream state. The connection never looks at frames. It feeds raw bytes in,
//! gets ordered [`Event`]s back, and periodically drains the bytes the engine
//! wants written.
//!
//! ```text
//! transport bytes ──► receive_data() ──► Vec<Event> ──► dispatcher
//!                                                          │
//! transport write ◄── data_to_send() ◄── credit / settings ◄┘
//! ```

use std::fmt;

use bytes::Bytes;

/// Protocol-assigned stream identifier. `0` is the connection itself.
pub type StreamId = u32;

/// A decoded header field, name then value.
pub type Header = (Bytes, Bytes);

/// Largest window increment a single WINDOW_UPDATE may carry (2^31 - 1).
pub const MAX_WINDOW_INCREMENT: u32 = 0x7fff_ffff;

// ============================================================================
// Settings
// ============================================================================

/// Connection settings the client may push to the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum SettingCode {
    HeaderTableSize = 0x1,
    EnablePush = 0x2,
    MaxConcurrentStreams = 0x3,
    InitialWindowSize = 0x4,
    MaxFrameSize = 0x5,
    MaxHeaderListSize = 0x6,
    EnableConnectProtocol = 0x8,
}

impl SettingCode {
    /// Wire identifier of the setting.
    pub fn id(self) -> u16 {
        self as u16
    }

    pub fn from_id(id: u16) -> Option<Self> {
        match id {
            0x1 => Some(Self::HeaderTableSize),
            0x2 => Some(Self::EnablePush),
            0x3 => Some(Self::MaxConcurrentStreams),
            0x4 => Some(Self::InitialWindowSize),
            0x5 => Some(Self::MaxFrameSize),
            0x6 => Some(Self::MaxHeaderListSize),
            0x8 => Some(Self::EnableConnectProtocol),
            _ => None,
        }
    }
}

// ============================================================================
// Events
// ============================================================================

/// One decoded unit produced by [`ProtocolEngine::receive_data`].
///
/// Events are immutable and consumed by exactly one dispatch pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Final response headers arrived on a stream.
    ResponseReceived { stream_id: StreamId, headers: Vec<Header> },
    /// A 1xx response arrived on a stream.
    InformationalResponseReceived { stream_id: StreamId, headers: Vec<Header> },
    /// Trailing headers arrived on a stream.
    TrailersReceived { stream_id: StreamId, headers: Vec<Header> },
    /// Body bytes arrived. `flow_controlled_length` includes padding and is
    /// what must be credited back.
    DataReceived {
        stream_id: StreamId,
        data: Bytes,
        flow_controlled_length: u32,
    },
    /// The peer granted us more send window. `None` is the connection window.
    WindowUpdated { stream_id: Option<StreamId>, delta: u32 },
    /// The peer changed its settings; they must be acknowledged.
    RemoteSettingsChanged { changed: Vec<(u16, u32)> },
    /// The peer acknowledged our settings.
    SettingsAcknowledged,
    PingReceived { data: [u8; 8] },
    PingAckReceived { data: [u8; 8] },
    /// The peer half-closed the stream.
    StreamEnded { stream_id: StreamId },
    /// The stream was reset, by the peer when `remote_reset` is set.
    StreamReset {
        stream_id: StreamId,
        error_code: u32,
        remote_reset: bool,
    },
    PriorityUpdated {
        stream_id: StreamId,
        depends_on: StreamId,
        weight: u16,
        exclusive: bool,
    },
    /// The peer sent GOAWAY. The connection is finished.
    ConnectionTerminated {
        error_code: u32,
        last_stream_id: Option<StreamId>,
        additional_data: Option<Bytes>,
    },
}

/// Event category, the key connection-level observers register under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ResponseReceived,
    InformationalResponseReceived,
    TrailersReceived,
    DataReceived,
    WindowUpdated,
    RemoteSettingsChanged,
    SettingsAcknowledged,
    PingReceived,
    PingAckReceived,
    StreamEnded,
    StreamReset,
    PriorityUpdated,
    ConnectionTerminated,
}

impl Event {
    /// The stream this event belongs to, or `None` for connection scope.
    ///
    /// Stream `0` is normalized to `None`.
    pub fn stream_id(&self) -> Option<StreamId> {
        let id = match self {
            Event::ResponseReceived { stream_id, .. }
            | Event::InformationalResponseReceived { stream_id, .. }
            | Event::TrailersReceived { stream_id, .. }
            | Event::DataReceived { stream_id, .. }
            | Event::StreamEnded { stream_id }
            | Event::StreamReset { stream_id, .. }
            | Event::PriorityUpdated { stream_id, .. } => Some(*stream_id),
            Event::WindowUpdated { stream_id, .. } => *stream_id,
            Event::RemoteSettingsChanged { .. }
            | Event::SettingsAcknowledged
            | Event::PingReceived { .. }
            | Event::PingAckReceived { .. }
            | Event::ConnectionTerminated { .. } => None,
        };
        id.filter(|id| *id != 0)
    }

    pub fn kind(&self) -> EventKind {
        match self {
            Event::ResponseReceived { .. } => EventKind::ResponseReceived,
            Event::InformationalResponseReceived { .. } => EventKind::InformationalResponseReceived,
            Event::TrailersReceived { .. } => EventKind::TrailersReceived,
            Event::DataReceived { .. } => EventKind::DataReceived,
            Event::WindowUpdated { .. } => EventKind::WindowUpdated,
            Event::RemoteSettingsChanged { .. } => EventKind::RemoteSettingsChanged,
            Event::SettingsAcknowledged => EventKind::SettingsAcknowledged,
            Event::PingReceived { .. } => EventKind::PingReceived,
            Event::PingAckReceived { .. } => EventKind::PingAckReceived,
            Event::StreamEnded { .. } => EventKind::StreamEnded,
            Event::StreamReset { .. } => EventKind::StreamReset,
            Event::PriorityUpdated { .. } => EventKind::PriorityUpdated,
            Event::ConnectionTerminated { .. } => EventKind::ConnectionTerminated,
        }
    }

    /// Bytes this event consumed from the receive window.
    pub fn flow_controlled_length(&self) -> Option<u32> {
        match self {
            Event::DataReceived { flow_controlled_length, .. } => Some(*flow_controlled_length),
            _ => None,
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Failure reported by the protocol engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The stream is already closed on the peer's side.
    StreamClosed(StreamId),
    /// The client stream id space is exhausted.
    NoAvailableStreamIds,
    FlowControl(String),
    /// Malformed or illegal input from the peer.
    Protocol(String),
}

impl EngineError {
    pub fn is_stream_closed(&self) -> bool {
        matches!(self, EngineError::StreamClosed(_))
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StreamClosed(id) => write!(f, "Stream {} is closed", id),
            Self::NoAvailableStreamIds => write!(f, "No stream ids left on this connection"),
            Self::FlowControl(err) => write!(f, "Flow control error: {}", err),
            Self::Protocol(err) => write!(f, "Protocol error: {}", err),
        }
    }
}

impl std::error::Error for EngineError {}

// ============================================================================
// Engine Trait
// ============================================================================

/// Client-side HTTP/2 state machine consumed by [`Connection`](crate::Connection).
///
/// Implementations are sans-I/O: nothing here may block or touch a socket.
/// A new engine is built for every established transport.
pub trait ProtocolEngine: Send + 'static {
    /// Queue the connection preface and initial SETTINGS.
    fn initiate_connection(&mut self);

    /// Queue a SETTINGS frame changing local settings.
    fn update_settings(&mut self, settings: &[(SettingCode, u32)]) -> Result<(), EngineError>;

    /// Feed received bytes. Partial frames are buffered by the engine.
    fn receive_data(&mut self, data: &[u8]) -> Result<Vec<Event>, EngineError>;

    /// Drain everything the engine wants written. Empty when idle.
    fn data_to_send(&mut self) -> Bytes;

    /// Queue a WINDOW_UPDATE. `None` targets the connection window.
    ///
    /// Fails with [`EngineError::StreamClosed`] for streams the peer closed.
    fn increment_flow_control_window(
        &mut self,
        increment: u32,
        stream_id: Option<StreamId>,
    ) -> Result<(), EngineError>;

    /// Allocate the next client stream id. Ids are strictly increasing.
    fn get_next_available_stream_id(&mut self) -> Result<StreamId, EngineError>;
}
