//! Stream registry: which handler owns which stream id.
//!
//! The caller owns its stream handler. The registry only keeps a `Weak`
//! reference keyed by stream id, so a handler the caller dropped simply stops
//! receiving events. Entries are removed when the caller ends the stream, not
//! when the engine reports the stream closed.

use std::fmt;
use std::sync::{Arc, Weak};

use fnv::FnvHashMap;

use crate::connection::error::{CloseReason, ConnectionError, Result};
use crate::debug_log;
use crate::engine::{Event, StreamId};

/// Failure raised while a stream processed an event.
///
/// Reported back to the same stream through
/// [`StreamHandler::handle_exception`]; it never affects other streams or
/// the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// `handle_event` returned an error.
    Handler(String),
    /// `handle_event` panicked.
    Panicked(String),
}

impl StreamError {
    pub fn handler(err: impl fmt::Display) -> Self {
        StreamError::Handler(err.to_string())
    }
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Handler(err) => write!(f, "Stream handler failed: {}", err),
            Self::Panicked(msg) => write!(f, "Stream handler panicked: {}", msg),
        }
    }
}

impl std::error::Error for StreamError {}

/// Per-stream consumer of dispatched events.
pub trait StreamHandler: Send + Sync + 'static {
    /// Process one event addressed to this stream.
    fn handle_event(&self, event: &Event) -> std::result::Result<(), StreamError>;

    /// Called with whatever `handle_event` raised.
    fn handle_exception(&self, error: StreamError);

    /// The connection closed while this stream was still registered.
    fn connection_lost(&self, _reason: &CloseReason) {}
}

#[derive(Default)]
pub struct StreamRegistry {
    streams: FnvHashMap<StreamId, Weak<dyn StreamHandler>>,
    last_id: Option<StreamId>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under a freshly allocated id.
    ///
    /// Ids must be strictly increasing over the registry's lifetime.
    pub fn register(&mut self, stream_id: StreamId, handler: &Arc<dyn StreamHandler>) -> Result<()> {
        if self.last_id.is_some_and(|last| stream_id <= last) {
            return Err(ConnectionError::StreamIdReused(stream_id));
        }
        self.last_id = Some(stream_id);
        self.streams.insert(stream_id, Arc::downgrade(handler));
        debug_log!("Registered stream {} ({} live)", stream_id, self.streams.len());
        Ok(())
    }

    /// Look up the live handler for `stream_id`.
    ///
    /// A handler whose owner dropped it is pruned and reported as absent.
    pub fn get(&mut self, stream_id: StreamId) -> Option<Arc<dyn StreamHandler>> {
        let handler = self.streams.get(&stream_id)?.upgrade();
        if handler.is_none() {
            debug_log!("Stream {} handler was dropped without ending the stream", stream_id);
            self.streams.remove(&stream_id);
        }
        handler
    }

    /// Remove `stream_id`. Removing an unknown id is a no-op.
    pub fn remove(&mut self, stream_id: StreamId) -> bool {
        self.streams.remove(&stream_id).is_some()
    }

    pub fn contains(&self, stream_id: StreamId) -> bool {
        self.streams.contains_key(&stream_id)
    }

    /// Empty the registry, returning the handlers still alive.
    pub fn drain(&mut self) -> Vec<Arc<dyn StreamHandler>> {
        let mut live: Vec<(StreamId, Arc<dyn StreamHandler>)> = self
            .streams
            .drain()
            .filter_map(|(id, handler)| handler.upgrade().map(|h| (id, h)))
            .collect();
        live.sort_by_key(|(id, _)| *id);
        live.into_iter().map(|(_, handler)| handler).collect()
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}
