//! Connection lifecycle: connect, ready, pump, close.
//!
//! All state sits behind one lock. Tasks (connect attempt, connect timer,
//! transport reader and writer) only ever hold a `Weak` to it and take the
//! lock between suspension points, so every transition below runs to
//! completion without interleaving. User code (stream handlers, observers,
//! callbacks) always runs with the lock released.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::alias::PMutex;
use crate::config::ConnectionConfig;
use crate::debug_log;
use crate::engine::{EventKind, ProtocolEngine, SettingCode, StreamId};
use crate::flow::FlowLedger;
use crate::observer::{EventObserver, EventObservers};
use crate::registry::{StreamHandler, StreamRegistry};
use crate::transport::{tls, CloseHook, IoStream, Transport};

use super::error::{CloseReason, ConnectionError, Result};
use super::state::ConnectionState;

pub type EngineFactory<E> = Box<dyn Fn() -> E + Send + Sync>;
pub type ReadyCallback = Box<dyn FnOnce() + Send>;
pub type ClosedCallback = Box<dyn FnOnce(CloseReason) + Send>;

pub(crate) struct Shared<T: Transport, E: ProtocolEngine> {
    pub(crate) config: ConnectionConfig,
    transport: T,
    engine_factory: EngineFactory<E>,
    pub(crate) inner: PMutex<Inner<E>>,
}

pub(crate) struct Inner<E> {
    pub(crate) state: ConnectionState,
    timed_out: bool,
    connect_timer: Option<JoinHandle<()>>,
    pub(crate) io: Option<IoStream>,
    /// `None` while connected means the engine is lent to `with_engine`.
    pub(crate) engine: Option<E>,
    pub(crate) streams: StreamRegistry,
    pub(crate) observers: EventObservers,
    /// Chunks read but not yet decoded, in arrival order.
    pub(crate) inbound: VecDeque<Bytes>,
    /// Set while one caller owns decoding and dispatch.
    pub(crate) pumping: bool,
    /// Credit owed for the batch being dispatched.
    pub(crate) ledger: FlowLedger,
    /// A peer SETTINGS change awaits its acknowledgement flush.
    pub(crate) settings_owed: bool,
    on_ready: Option<ReadyCallback>,
    on_closed: Option<ClosedCallback>,
}

impl<E: ProtocolEngine> Inner<E> {
    /// Write whatever the engine has queued.
    pub(crate) fn flush(&mut self) -> Result<()> {
        let Some(io) = self.io.as_ref() else {
            return Err(ConnectionError::NotConnected);
        };
        let Some(engine) = self.engine.as_mut() else {
            return Err(ConnectionError::EngineBusy);
        };
        let data = engine.data_to_send();
        if data.is_empty() {
            return Ok(());
        }
        debug_log!("Flushing {} bytes", data.len());
        io.write(data)
    }
}

/// Client side of one multiplexed HTTP/2 connection.
///
/// Cheap to clone; every clone drives the same connection.
///
/// ```ignore
/// let conn = Connection::new(ConnectionConfig::new("example.com", 443), TcpTransport::new(), MyEngine::client)
///     .on_connection_ready(|| println!("ready"))
///     .on_connection_closed(|reason| println!("closed: {}", reason));
/// conn.connect()?;
/// ```
pub struct Connection<T: Transport, E: ProtocolEngine> {
    pub(crate) shared: Arc<Shared<T, E>>,
}

impl<T: Transport, E: ProtocolEngine> Clone for Connection<T, E> {
    fn clone(&self) -> Self {
        Self { shared: self.shared.clone() }
    }
}

impl<T: Transport, E: ProtocolEngine> Connection<T, E> {
    /// Build an idle connection. Nothing happens until [`connect`](Self::connect).
    ///
    /// `engine_factory` is called once per established transport.
    pub fn new<F>(config: ConnectionConfig, transport: T, engine_factory: F) -> Self
    where
        F: Fn() -> E + Send + Sync + 'static,
    {
        Self {
            shared: Arc::new(Shared {
                config,
                transport,
                engine_factory: Box::new(engine_factory),
                inner: PMutex::new(Inner {
                    state: ConnectionState::Idle,
                    timed_out: false,
                    connect_timer: None,
                    io: None,
                    engine: None,
                    streams: StreamRegistry::new(),
                    observers: EventObservers::new(),
                    inbound: VecDeque::new(),
                    pumping: false,
                    ledger: FlowLedger::new(),
                    settings_owed: false,
                    on_ready: None,
                    on_closed: None,
                }),
            }),
        }
    }

    /// Called once the preface is flushed, on a later scheduler tick.
    pub fn on_connection_ready(self, callback: impl FnOnce() + Send + 'static) -> Self {
        self.shared.inner.lock().on_ready = Some(Box::new(callback));
        self
    }

    /// Called exactly once, with the first reason the connection closed.
    pub fn on_connection_closed(self, callback: impl FnOnce(CloseReason) + Send + 'static) -> Self {
        self.shared.inner.lock().on_closed = Some(Box::new(callback));
        self
    }

    fn from_weak(weak: &Weak<Shared<T, E>>) -> Option<Self> {
        weak.upgrade().map(|shared| Self { shared })
    }

    fn downgrade(&self) -> Weak<Shared<T, E>> {
        Arc::downgrade(&self.shared)
    }

    pub fn host(&self) -> &str {
        &self.shared.config.host
    }

    pub fn port(&self) -> u16 {
        self.shared.config.port
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.shared.config
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.inner.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Number of registered streams.
    pub fn stream_count(&self) -> usize {
        self.shared.inner.lock().streams.len()
    }

    // ========================================================================
    // Connect
    // ========================================================================

    /// Start connecting in the background.
    ///
    /// Rejected (and logged) while a connect is pending or after it succeeded;
    /// a closed connection cannot be reused. Every failure after this point
    /// is reported through `on_connection_closed`.
    pub fn connect(&self) -> Result<()> {
        let weak = self.downgrade();
        {
            let mut inner = self.shared.inner.lock();
            inner.state = inner.state.begin_connect().inspect_err(|e| {
                warn!(host = %self.host(), port = self.port(), reason = %e, "Connect rejected");
            })?;
            inner.timed_out = false;
            inner.connect_timer = Some(tokio::spawn(connect_timer(
                weak.clone(),
                self.shared.config.connect_timeout,
            )));
        }
        info!(host = %self.host(), port = self.port(), tls = self.shared.config.uses_tls(), "Connecting");
        tokio::spawn(establish(weak));
        Ok(())
    }

    async fn on_transport_connected(&self, mut stream: T::Stream) {
        info!(host = %self.host(), port = self.port(), "Transport opened");
        let accepted = {
            let mut inner = self.shared.inner.lock();
            match inner.state.transport_ready() {
                Some(next) if !inner.timed_out => {
                    inner.state = next;
                    Ok(self.start_session(&mut inner, stream))
                }
                _ => Err((stream, inner.state, inner.timed_out)),
            }
        };

        match accepted {
            Ok(Ok(())) => self.schedule_ready(),
            Ok(Err(err)) => {
                error!(error = %err, "Failed to start HTTP/2 session");
                self.shutdown(CloseReason::Error(err));
            }
            Err((mut late, state, timed_out)) => {
                info!(?state, timed_out, "Discarding transport that arrived after the attempt ended");
                if let Err(err) = late.shutdown().await {
                    warn!(error = %err, "Error closing late transport");
                }
            }
        }
    }

    /// Everything between "transport accepted" and "ready", under one lock.
    fn start_session(&self, inner: &mut Inner<E>, stream: T::Stream) -> Result<()> {
        if let Some(timer) = inner.connect_timer.take() {
            timer.abort();
        }

        let on_data = {
            let weak = self.downgrade();
            move |data: Bytes| {
                if let Some(conn) = Self::from_weak(&weak) {
                    conn.data_received(data);
                }
            }
        };
        let on_close: CloseHook = {
            let weak = self.downgrade();
            Arc::new(move |err: Option<io::Error>| {
                if let Some(conn) = Self::from_weak(&weak) {
                    conn.transport_closed(err);
                }
            })
        };

        let mut engine = (self.shared.engine_factory)();
        engine.initiate_connection();
        // Client only: we never accept pushed streams.
        engine.update_settings(&[(SettingCode::EnablePush, 0)])?;
        inner.engine = Some(engine);
        inner.io = Some(IoStream::spawn(
            stream,
            self.shared.config.read_chunk_size,
            on_data,
            on_close,
        ));

        inner.flush()
    }

    fn schedule_ready(&self) {
        let weak = self.downgrade();
        tokio::spawn(async move {
            let Some(conn) = Self::from_weak(&weak) else {
                return;
            };
            let callback = {
                let mut inner = conn.shared.inner.lock();
                if !inner.state.is_connected() {
                    return;
                }
                inner.on_ready.take()
            };
            info!(host = %conn.host(), port = conn.port(), "Connection ready");
            if let Some(callback) = callback {
                callback();
            }
        });
    }

    fn on_connect_timeout(&self) {
        {
            let mut inner = self.shared.inner.lock();
            if inner.state != ConnectionState::Connecting {
                return;
            }
            inner.timed_out = true;
            inner.connect_timer = None;
        }
        let timeout = self.shared.config.connect_timeout;
        info!(host = %self.host(), port = self.port(), ?timeout, "Connection timed out");
        self.shutdown(CloseReason::Timeout(timeout));
    }

    fn transport_closed(&self, err: Option<io::Error>) {
        match err {
            Some(err) => {
                error!(error = %err, "Transport failed");
                self.shutdown(CloseReason::Error(ConnectionError::IoError(err)));
            }
            None => self.shutdown(CloseReason::PeerClosed),
        }
    }

    // ========================================================================
    // Close
    // ========================================================================

    /// Close the connection locally. Safe to call any number of times.
    pub fn close(&self) {
        self.shutdown(CloseReason::Local);
    }

    /// The single closure path. Only the first call has any effect.
    pub(crate) fn shutdown(&self, reason: CloseReason) {
        let (timer, io, streams, on_closed) = {
            let mut inner = self.shared.inner.lock();
            let Some(next) = inner.state.close() else {
                debug_log!("Close requested on an already closed connection: {}", reason);
                return;
            };
            inner.state = next;
            inner.engine = None;
            inner.on_ready = None;
            inner.inbound.clear();
            (
                inner.connect_timer.take(),
                inner.io.take(),
                inner.streams.drain(),
                inner.on_closed.take(),
            )
        };

        info!(host = %self.host(), port = self.port(), %reason, "Connection closed");

        if let Some(timer) = timer {
            timer.abort();
        }
        if let Some(mut io) = io {
            // Secondary failure; never replaces `reason`.
            if let Err(err) = io.close() {
                error!(error = %err, "Error trying to close stream");
            }
        }
        for stream in streams {
            stream.connection_lost(&reason);
        }
        if let Some(callback) = on_closed {
            callback(reason);
        }
    }

    // ========================================================================
    // Streams, observers, outbound
    // ========================================================================

    /// Register `handler` under the engine's next stream id.
    pub fn begin_stream<H: StreamHandler>(&self, handler: &Arc<H>) -> Result<StreamId> {
        let handler: Arc<dyn StreamHandler> = handler.clone();
        let mut inner = self.shared.inner.lock();
        if !inner.state.is_connected() {
            return Err(ConnectionError::NotConnected);
        }
        let engine = inner.engine.as_mut().ok_or(ConnectionError::EngineBusy)?;
        let stream_id = engine.get_next_available_stream_id()?;
        inner.streams.register(stream_id, &handler)?;
        Ok(stream_id)
    }

    /// Forget `stream_id`. Returns whether it was registered.
    pub fn end_stream(&self, stream_id: StreamId) -> bool {
        let removed = self.shared.inner.lock().streams.remove(stream_id);
        if !removed {
            debug_log!("end_stream for unknown stream {}", stream_id);
        }
        removed
    }

    /// Observe every event of `kind`. Returns `false` if already registered.
    pub fn add_event_handler(&self, kind: EventKind, handler: EventObserver) -> bool {
        self.shared.inner.lock().observers.add(kind, handler)
    }

    /// Stop observing; fails with `HandlerNotFound` if `handler` was not registered.
    pub fn remove_event_handler(&self, kind: EventKind, handler: &EventObserver) -> Result<()> {
        self.shared.inner.lock().observers.remove(kind, handler)
    }

    /// Write out whatever the engine has queued.
    pub fn flush(&self) -> Result<()> {
        let result = self.shared.inner.lock().flush();
        self.fail_on_closed_transport(result)
    }

    /// Run `f` against the live engine, then flush what it queued.
    ///
    /// This is how streams send headers and bodies. The engine is lent to `f`
    /// with the connection unlocked, so `f` may call back into the connection.
    /// While it runs, anything else that needs the engine (`begin_stream`,
    /// `flush`, a nested `with_engine`) fails with `EngineBusy`, and inbound
    /// bytes are queued and decoded once the engine is returned. If the
    /// connection closes while `f` runs, the engine is dropped and the call
    /// fails with `ConnectionClosed`.
    pub fn with_engine<R>(&self, f: impl FnOnce(&mut E) -> R) -> Result<R> {
        let mut engine = {
            let mut inner = self.shared.inner.lock();
            if !inner.state.is_connected() {
                return Err(ConnectionError::NotConnected);
            }
            inner.engine.take().ok_or(ConnectionError::EngineBusy)?
        };

        let value = f(&mut engine);

        let (result, resume) = {
            let mut inner = self.shared.inner.lock();
            if !inner.state.is_connected() {
                return Err(ConnectionError::ConnectionClosed);
            }
            inner.engine = Some(engine);
            // Take over whatever piled up while the engine was out, unless a
            // dispatch pass is still running and will pick it up itself.
            let resume = !inner.pumping
                && (!inner.inbound.is_empty() || !inner.ledger.is_empty() || inner.settings_owed);
            if resume {
                inner.pumping = true;
            }
            (inner.flush().map(|()| value), resume)
        };

        if resume {
            self.settle_credit();
            self.pump();
        }
        self.fail_on_closed_transport(result)
    }

    /// A write into a dead transport means the connection is gone.
    pub(crate) fn fail_on_closed_transport<R>(&self, result: Result<R>) -> Result<R> {
        if let Err(ConnectionError::ConnectionClosed) = &result {
            self.shutdown(CloseReason::Error(ConnectionError::ConnectionClosed));
        }
        result
    }
}

async fn connect_timer<T: Transport, E: ProtocolEngine>(weak: Weak<Shared<T, E>>, timeout: std::time::Duration) {
    tokio::time::sleep(timeout).await;
    if let Some(conn) = Connection::from_weak(&weak) {
        conn.on_connect_timeout();
    }
}

async fn establish<T: Transport, E: ProtocolEngine>(weak: Weak<Shared<T, E>>) {
    let Some(conn) = Connection::from_weak(&weak) else {
        return;
    };
    let config = &conn.shared.config;

    let stream = match tls::client_config_for(config) {
        Ok(tls) => conn.shared.transport.connect(&config.host, config.port, tls).await,
        Err(err) => Err(err),
    };

    match stream {
        Ok(stream) => conn.on_transport_connected(stream).await,
        Err(err) => {
            error!(host = %config.host, port = config.port, error = %err, "HTTP2ClientConnection error during connection");
            conn.shutdown(CloseReason::Error(err));
        }
    }
}
