//! Client-side management of one multiplexed HTTP/2 connection.
//!
//! A [`Connection`] opens a byte stream through a [`Transport`], drives a
//! sans-io [`ProtocolEngine`] over it, routes decoded events to the
//! [`StreamHandler`] registered for each stream id, and returns the
//! flow-control credit for every batch it received. Framing and HPACK live
//! in the engine; this crate owns the lifecycle around it.

pub mod alias;
pub mod config;
pub mod connection;
pub mod debug;
pub mod engine;
pub mod flow;
pub mod observer;
pub mod registry;
pub mod transport;

#[doc(hidden)]
pub use tracing as __tracing;

pub use config::ConnectionConfig;
pub use connection::{CloseReason, Connection, ConnectionError, ConnectionState, Result};
pub use engine::{EngineError, Event, EventKind, Header, ProtocolEngine, SettingCode, StreamId};
pub use observer::EventObserver;
pub use registry::{StreamError, StreamHandler};
pub use transport::{TcpTransport, Transport};

pub mod prelude {
    pub use crate::{
        CloseReason, Connection, ConnectionConfig, ConnectionError, Event, EventKind, ProtocolEngine,
        StreamHandler, StreamId, TcpTransport, Transport,
    };
}
