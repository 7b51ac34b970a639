//! Receive-side flow control aggregation.
//!
//! Credit is accumulated for one decode batch and returned to the peer in one
//! go: one WINDOW_UPDATE per stream that received bytes, and a single one for
//! the connection covering the whole batch.

use std::collections::BTreeMap;
use std::mem;

use tracing::warn;

use crate::debug_log;
use crate::engine::{EngineError, ProtocolEngine, StreamId, MAX_WINDOW_INCREMENT};

/// Bytes received since the last settlement.
///
/// Counters are drained before any credit is issued, so the same bytes can
/// never be credited twice.
#[derive(Debug, Default)]
pub struct FlowLedger {
    streams: BTreeMap<StreamId, u64>,
    connection: u64,
}

/// What one [`FlowLedger::settle`] call sent back.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Settlement {
    /// Streams that got a WINDOW_UPDATE.
    pub stream_increments: usize,
    /// Streams whose credit was dropped because the peer already closed them.
    pub closed_streams: usize,
    /// Total connection-level credit issued.
    pub connection_increment: u64,
}

impl Settlement {
    /// Whether any increment command was issued, so a flush is owed.
    pub fn credited(&self) -> bool {
        self.stream_increments > 0 || self.connection_increment > 0
    }
}

impl FlowLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Account bytes received on a registered stream.
    pub fn record_stream(&mut self, stream_id: StreamId, bytes: u32) {
        *self.streams.entry(stream_id).or_insert(0) += u64::from(bytes);
    }

    /// Account bytes against the connection window.
    pub fn record_connection(&mut self, bytes: u32) {
        self.connection += u64::from(bytes);
    }

    pub fn stream_pending(&self, stream_id: StreamId) -> u64 {
        self.streams.get(&stream_id).copied().unwrap_or(0)
    }

    pub fn connection_pending(&self) -> u64 {
        self.connection
    }

    pub fn is_empty(&self) -> bool {
        self.connection == 0 && self.streams.values().all(|n| *n == 0)
    }

    /// Issue the accumulated credit through `engine` and reset the ledger.
    ///
    /// Streams with nothing received are skipped. A stream the peer already
    /// closed is logged and skipped; any other engine failure aborts the
    /// settlement and is returned.
    pub fn settle<E: ProtocolEngine + ?Sized>(&mut self, engine: &mut E) -> Result<Settlement, EngineError> {
        let streams = mem::take(&mut self.streams);
        let connection = mem::take(&mut self.connection);
        let mut settlement = Settlement::default();

        for (stream_id, received) in streams {
            if received == 0 {
                continue;
            }
            debug_log!("Incrementing flow control window for stream {} by {}", stream_id, received);
            match credit(engine, received, Some(stream_id)) {
                Ok(()) => settlement.stream_increments += 1,
                Err(err) if err.is_stream_closed() => {
                    warn!(stream_id, received, "Tried to increment flow control window for closed stream");
                    settlement.closed_streams += 1;
                }
                Err(err) => return Err(err),
            }
        }

        if connection > 0 {
            debug_log!("Incrementing connection flow control window by {}", connection);
            credit(engine, connection, None)?;
            settlement.connection_increment = connection;
        }

        Ok(settlement)
    }
}

/// Split `total` into protocol-legal increments.
fn credit<E: ProtocolEngine + ?Sized>(
    engine: &mut E,
    mut total: u64,
    stream_id: Option<StreamId>,
) -> Result<(), EngineError> {
    while total > 0 {
        let step = total.min(u64::from(MAX_WINDOW_INCREMENT));
        engine.increment_flow_control_window(step as u32, stream_id)?;
        total -= step;
    }
    Ok(())
}
