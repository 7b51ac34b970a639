//! Inbound pump: bytes in, events out, credit back.
//!
//! Every chunk the reader delivers is queued, then decoded by whichever
//! caller owns the pump (`Inner::pumping`). Only one caller decodes and
//! dispatches at a time, so chunks are decoded in arrival order and batches
//! never interleave. One decoded chunk is one batch: its events are routed in
//! the order the engine produced them, then the batch's flow-control credit
//! is returned and written out in a single flush.
//!
//! While the engine is lent to `Connection::with_engine`, chunks stay queued
//! and owed credit stays in the ledger; the borrower resumes the pump when it
//! hands the engine back.
//!
//! The connection state is checked under the lock right before each
//! delivery. A `close()` issued from another thread can still land between
//! that check and the handler call, so a handler may see one last event
//! after its `connection_lost`.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, error, warn};

use crate::debug_trace;
use crate::engine::{Event, ProtocolEngine};
use crate::observer::EventObserver;
use crate::registry::{StreamError, StreamHandler};
use crate::transport::Transport;

use super::error::{CloseReason, ConnectionError};
use super::manager::Connection;

impl<T: Transport, E: ProtocolEngine> Connection<T, E> {
    /// Queue one chunk from the transport and decode it unless another
    /// caller already owns the pump.
    pub(crate) fn data_received(&self, data: Bytes) {
        {
            let mut inner = self.shared.inner.lock();
            if !inner.state.is_connected() {
                return;
            }
            inner.inbound.push_back(data);
            if inner.pumping || inner.engine.is_none() {
                return;
            }
            inner.pumping = true;
        }
        self.pump();
    }

    /// Decode and dispatch queued chunks until the queue is empty, the engine
    /// is lent out, or the connection closed. The caller must own the pump.
    pub(crate) fn pump(&self) {
        loop {
            let decoded = {
                let mut guard = self.shared.inner.lock();
                let inner = &mut *guard;
                let chunk = match (inner.engine.as_mut(), inner.state.is_connected()) {
                    (Some(engine), true) => inner.inbound.pop_front().map(|chunk| (engine, chunk)),
                    _ => None,
                };
                let Some((engine, chunk)) = chunk else {
                    inner.pumping = false;
                    return;
                };
                debug_trace!("Decoding {} bytes", chunk.len());
                engine.receive_data(&chunk)
            };

            match decoded {
                Ok(events) => self.dispatch(&events),
                Err(err) => {
                    error!(error = %err, "Failed to decode inbound frames");
                    self.shutdown(CloseReason::Error(err.into()));
                }
            }
        }
    }

    /// Route one batch, then return its credit.
    fn dispatch(&self, events: &[Event]) {
        debug_trace!("Dispatching {} events", events.len());
        let mut terminated = None;

        for event in events {
            let (handler, observers) = {
                let mut guard = self.shared.inner.lock();
                // A handler or observer may have closed us mid-batch.
                if !guard.state.is_connected() {
                    return;
                }
                let inner = &mut *guard;
                let handler = event.stream_id().and_then(|id| inner.streams.get(id));

                match event {
                    Event::DataReceived {
                        stream_id,
                        flow_controlled_length,
                        ..
                    } => {
                        inner.ledger.record_connection(*flow_controlled_length);
                        if handler.is_some() {
                            inner.ledger.record_stream(*stream_id, *flow_controlled_length);
                        }
                    }
                    Event::RemoteSettingsChanged { .. } => inner.settings_owed = true,
                    _ => {}
                }

                (handler, inner.observers.get(event.kind()))
            };

            if let Event::ConnectionTerminated {
                error_code,
                last_stream_id,
                ..
            } = event
            {
                terminated = Some(CloseReason::Terminated {
                    error_code: *error_code,
                    last_stream_id: *last_stream_id,
                });
            }

            match (event.stream_id(), handler) {
                (Some(_), Some(handler)) => deliver(&handler, event),
                (Some(stream_id), None) => {
                    debug!(stream_id, kind = ?event.kind(), "Event for a stream we do not track");
                }
                (None, _) => debug!(kind = ?event.kind(), "Connection event"),
            }

            for observer in &observers {
                notify(observer, event);
            }
        }

        self.settle_credit();

        if let Some(reason) = terminated {
            self.shutdown(reason);
        }
    }

    /// Issue the owed credit and flush if anything was queued.
    ///
    /// A lent engine leaves the ledger untouched for the borrower to settle.
    pub(crate) fn settle_credit(&self) {
        let settled = {
            let mut guard = self.shared.inner.lock();
            if !guard.state.is_connected() {
                return;
            }
            let inner = &mut *guard;
            let Some(engine) = inner.engine.as_mut() else {
                return;
            };
            match inner.ledger.settle(engine) {
                Ok(settlement) if settlement.credited() || inner.settings_owed => {
                    inner.settings_owed = false;
                    inner.flush()
                }
                Ok(_) => Ok(()),
                Err(err) => Err(ConnectionError::from(err)),
            }
        };
        if let Err(err) = settled {
            error!(error = %err, "Failed to return flow control credit");
            self.shutdown(CloseReason::Error(err));
        }
    }
}

/// Hand `event` to one stream. Nothing it raises escapes.
fn deliver(handler: &Arc<dyn StreamHandler>, event: &Event) {
    let failure = match catch_unwind(AssertUnwindSafe(|| handler.handle_event(event))) {
        Ok(Ok(())) => return,
        Ok(Err(err)) => err,
        Err(panic) => StreamError::Panicked(panic_message(&*panic)),
    };
    warn!(stream_id = ?event.stream_id(), error = %failure, "Stream failed to handle event");

    if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler.handle_exception(failure))) {
        error!(
            stream_id = ?event.stream_id(),
            panic = %panic_message(&*panic),
            "Stream panicked while handling its own failure"
        );
    }
}

fn notify(observer: &EventObserver, event: &Event) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(|| (**observer)(event))) {
        error!(kind = ?event.kind(), panic = %panic_message(&*panic), "Event observer panicked");
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
