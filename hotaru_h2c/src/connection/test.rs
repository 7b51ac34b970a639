//! End-to-end behaviour of `Connection` over an in-memory transport.
//!
//! The peer side of every connection is the other half of a
//! `tokio::io::duplex` pair. The engine is scripted: each chunk the peer
//! writes pops the next batch of events, and every command the connection
//! issues is recorded and echoed as a short marker on the wire.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use rustls::ClientConfig;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

use super::{CloseReason, Connection, ConnectionError, ConnectionState, Result};
use crate::alias::PMutex;
use crate::config::ConnectionConfig;
use crate::engine::{EngineError, Event, EventKind, ProtocolEngine, SettingCode, StreamId};
use crate::observer::EventObserver;
use crate::registry::{StreamError, StreamHandler};
use crate::transport::Transport;

const PREFACE: &[u8] = b"PREFACESETTINGS";

// ============================================================================
// Scripted engine
// ============================================================================

#[derive(Default)]
struct Script {
    batches: VecDeque<std::result::Result<Vec<Event>, EngineError>>,
    increments: Vec<(u32, Option<StreamId>)>,
    settings: Vec<(SettingCode, u32)>,
    closed_streams: Vec<StreamId>,
}

type SharedScript = Arc<PMutex<Script>>;

struct ScriptedEngine {
    script: SharedScript,
    outbound: BytesMut,
    next_stream_id: StreamId,
}

impl ScriptedEngine {
    fn new(script: SharedScript) -> Self {
        Self {
            script,
            outbound: BytesMut::new(),
            next_stream_id: 1,
        }
    }

    fn send(&mut self, data: &[u8]) {
        self.outbound.extend_from_slice(data);
    }
}

impl ProtocolEngine for ScriptedEngine {
    fn initiate_connection(&mut self) {
        self.send(b"PREFACE");
    }

    fn update_settings(&mut self, settings: &[(SettingCode, u32)]) -> std::result::Result<(), EngineError> {
        self.script.lock().settings.extend_from_slice(settings);
        self.send(b"SETTINGS");
        Ok(())
    }

    fn receive_data(&mut self, _data: &[u8]) -> std::result::Result<Vec<Event>, EngineError> {
        let batch = self.script.lock().batches.pop_front().unwrap_or(Ok(Vec::new()))?;
        if batch.iter().any(|e| matches!(e, Event::RemoteSettingsChanged { .. })) {
            self.send(b"ACK");
        }
        Ok(batch)
    }

    fn data_to_send(&mut self) -> Bytes {
        self.outbound.split().freeze()
    }

    fn increment_flow_control_window(
        &mut self,
        increment: u32,
        stream_id: Option<StreamId>,
    ) -> std::result::Result<(), EngineError> {
        let mut script = self.script.lock();
        if let Some(id) = stream_id.filter(|id| script.closed_streams.contains(id)) {
            return Err(EngineError::StreamClosed(id));
        }
        script.increments.push((increment, stream_id));
        drop(script);
        self.send(b"WU");
        Ok(())
    }

    fn get_next_available_stream_id(&mut self) -> std::result::Result<StreamId, EngineError> {
        let id = self.next_stream_id;
        self.next_stream_id += 2;
        Ok(id)
    }
}

// ============================================================================
// Duplex transport
// ============================================================================

struct DuplexTransport {
    peers: mpsc::UnboundedSender<DuplexStream>,
    delay: Duration,
    fail: bool,
    tls: Arc<PMutex<Vec<Option<Arc<ClientConfig>>>>>,
}

#[async_trait]
impl Transport for DuplexTransport {
    type Stream = DuplexStream;

    async fn connect(&self, _host: &str, _port: u16, tls: Option<Arc<ClientConfig>>) -> Result<DuplexStream> {
        self.tls.lock().push(tls);
        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }
        if self.fail {
            return Err(ConnectionError::IoError(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "refused",
            )));
        }
        let (local, peer) = tokio::io::duplex(64 * 1024);
        let _ = self.peers.send(peer);
        Ok(local)
    }
}

// ============================================================================
// Recording stream handler
// ============================================================================

#[derive(Default, Clone, Copy, PartialEq)]
enum Misbehave {
    #[default]
    No,
    Fail,
    Panic,
}

#[derive(Default)]
struct RecordingHandler {
    misbehave: Misbehave,
    events: PMutex<Vec<Event>>,
    failures: PMutex<Vec<StreamError>>,
    lost: PMutex<Vec<String>>,
}

impl RecordingHandler {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn misbehaving(misbehave: Misbehave) -> Arc<Self> {
        Arc::new(Self {
            misbehave,
            ..Self::default()
        })
    }
}

impl StreamHandler for RecordingHandler {
    fn handle_event(&self, event: &Event) -> std::result::Result<(), StreamError> {
        self.events.lock().push(event.clone());
        match self.misbehave {
            Misbehave::No => Ok(()),
            Misbehave::Fail => Err(StreamError::handler("bad body")),
            Misbehave::Panic => panic!("boom"),
        }
    }

    fn handle_exception(&self, error: StreamError) {
        self.failures.lock().push(error);
    }

    fn connection_lost(&self, reason: &CloseReason) {
        self.lost.lock().push(reason.to_string());
    }
}

/// Closes the whole connection from inside its first event.
struct ClosingHandler {
    conn: Connection<DuplexTransport, ScriptedEngine>,
    events: AtomicUsize,
}

impl StreamHandler for ClosingHandler {
    fn handle_event(&self, _event: &Event) -> std::result::Result<(), StreamError> {
        self.events.fetch_add(1, Ordering::SeqCst);
        self.conn.close();
        Ok(())
    }

    fn handle_exception(&self, _error: StreamError) {}
}

// ============================================================================
// Harness
// ============================================================================

struct Harness {
    conn: Connection<DuplexTransport, ScriptedEngine>,
    peers: mpsc::UnboundedReceiver<DuplexStream>,
    script: SharedScript,
    ready: Arc<AtomicUsize>,
    closed: Arc<PMutex<Vec<CloseReason>>>,
    tls: Arc<PMutex<Vec<Option<Arc<ClientConfig>>>>>,
}

struct Options {
    port: u16,
    delay: Duration,
    fail: bool,
    connect_timeout: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            port: 8080,
            delay: Duration::ZERO,
            fail: false,
            connect_timeout: Duration::from_secs(2),
        }
    }
}

fn harness(options: Options) -> Harness {
    let (peers_tx, peers) = mpsc::unbounded_channel();
    let script = SharedScript::default();
    let ready = Arc::new(AtomicUsize::new(0));
    let closed = Arc::new(PMutex::new(Vec::new()));
    let tls = Arc::new(PMutex::new(Vec::new()));

    let transport = DuplexTransport {
        peers: peers_tx,
        delay: options.delay,
        fail: options.fail,
        tls: tls.clone(),
    };
    let config = ConnectionConfig::new("localhost", options.port).connect_timeout(options.connect_timeout);
    let factory_script = script.clone();

    let conn = Connection::new(config, transport, move || ScriptedEngine::new(factory_script.clone()))
        .on_connection_ready({
            let ready = ready.clone();
            move || {
                ready.fetch_add(1, Ordering::SeqCst);
            }
        })
        .on_connection_closed({
            let closed = closed.clone();
            move |reason| closed.lock().push(reason)
        });

    Harness {
        conn,
        peers,
        script,
        ready,
        closed,
        tls,
    }
}

/// Poll `done` until it holds, failing the test after two seconds.
async fn eventually(what: &str, done: impl Fn() -> bool) {
    let waited = timeout(Duration::from_secs(2), async {
        while !done() {
            sleep(Duration::from_millis(2)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {}", what);
}

/// Give stray work a moment to show up before asserting it did not happen.
async fn quiet() {
    sleep(Duration::from_millis(30)).await;
}

/// Every queued batch was decoded and its dispatch pass finished.
fn drained(h: &Harness) -> bool {
    let inner = h.conn.shared.inner.lock();
    h.script.lock().batches.is_empty() && inner.inbound.is_empty() && !inner.pumping
}

async fn read_exactly(peer: &mut DuplexStream, n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    timeout(Duration::from_secs(1), peer.read_exact(&mut buf))
        .await
        .expect("peer read timed out")
        .unwrap();
    buf
}

async fn read_to_eof(peer: &mut DuplexStream) -> Vec<u8> {
    let mut rest = Vec::new();
    timeout(Duration::from_secs(1), peer.read_to_end(&mut rest))
        .await
        .expect("transport was never closed")
        .unwrap();
    rest
}

/// Connect and consume the preface on the peer side.
async fn connected(h: &mut Harness) -> DuplexStream {
    h.conn.connect().unwrap();
    let mut peer = timeout(Duration::from_secs(1), h.peers.recv())
        .await
        .expect("transport never connected")
        .unwrap();
    assert_eq!(read_exactly(&mut peer, PREFACE.len()).await, PREFACE);
    eventually("ready", || h.ready.load(Ordering::SeqCst) == 1).await;
    peer
}

/// Have the engine decode `batch` from the next inbound chunk.
async fn deliver(h: &Harness, peer: &mut DuplexStream, batch: Vec<Event>) {
    h.script.lock().batches.push_back(Ok(batch));
    peer.write_all(b"x").await.unwrap();
    eventually("batch dispatched", || drained(h)).await;
}

fn data(stream_id: StreamId, len: u32) -> Event {
    Event::DataReceived {
        stream_id,
        data: Bytes::from(vec![0u8; len as usize]),
        flow_controlled_length: len,
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_plaintext_connect_becomes_ready() {
    let mut h = harness(Options::default());
    assert_eq!(h.conn.state(), ConnectionState::Idle);

    let _peer = connected(&mut h).await;

    assert!(h.conn.is_connected());
    assert_eq!(h.ready.load(Ordering::SeqCst), 1);
    assert!(h.closed.lock().is_empty());
    assert_eq!(h.script.lock().settings, vec![(SettingCode::EnablePush, 0)]);
    assert!(h.tls.lock()[0].is_none());
}

#[tokio::test]
async fn test_secure_port_offers_h2_over_tls() {
    let mut h = harness(Options {
        port: 443,
        ..Options::default()
    });
    let _peer = connected(&mut h).await;

    let tls = h.tls.lock()[0].clone().expect("port 443 must use TLS");
    assert_eq!(tls.alpn_protocols, vec![b"h2".to_vec()]);
}

#[tokio::test]
async fn test_connect_is_not_reentrant() {
    let mut h = harness(Options::default());
    h.conn.connect().unwrap();
    assert!(matches!(h.conn.connect(), Err(ConnectionError::AlreadyConnecting)));

    let _peer = h.peers.recv().await.unwrap();
    eventually("ready", || h.ready.load(Ordering::SeqCst) == 1).await;
    assert!(matches!(h.conn.connect(), Err(ConnectionError::AlreadyConnected)));

    h.conn.close();
    assert!(matches!(h.conn.connect(), Err(ConnectionError::ConnectionClosed)));
    assert_eq!(h.ready.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_timeout_closes_once_and_discards_late_transport() {
    let mut h = harness(Options {
        delay: Duration::from_millis(500),
        connect_timeout: Duration::from_millis(50),
        ..Options::default()
    });
    h.conn.connect().unwrap();

    eventually("timeout", || !h.closed.lock().is_empty()).await;
    assert_eq!(h.conn.state(), ConnectionState::Closed);
    {
        let closed = h.closed.lock();
        assert_eq!(closed.len(), 1);
        assert!(closed[0].is_timeout());
        assert!(closed[0].to_string().starts_with("HTTP 599"));
    }

    // The transport still shows up, and is shut without a preface.
    let mut late = h.peers.recv().await.unwrap();
    assert!(read_to_eof(&mut late).await.is_empty());

    quiet().await;
    assert_eq!(h.closed.lock().len(), 1);
    assert_eq!(h.ready.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_close_while_connecting_discards_transport() {
    let mut h = harness(Options {
        delay: Duration::from_millis(100),
        ..Options::default()
    });
    h.conn.connect().unwrap();
    h.conn.close();

    let mut late = h.peers.recv().await.unwrap();
    assert!(read_to_eof(&mut late).await.is_empty());

    quiet().await;
    assert_eq!(h.conn.state(), ConnectionState::Closed);
    assert_eq!(h.closed.lock().len(), 1);
    assert!(matches!(h.closed.lock()[0], CloseReason::Local));
    assert_eq!(h.ready.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_transport_failure_reports_error() {
    let h = harness(Options {
        fail: true,
        ..Options::default()
    });
    h.conn.connect().unwrap();
    eventually("close", || !h.closed.lock().is_empty()).await;

    let closed = h.closed.lock();
    assert_eq!(closed.len(), 1);
    assert!(matches!(
        closed[0].error(),
        Some(ConnectionError::IoError(e)) if e.kind() == io::ErrorKind::ConnectionRefused
    ));
    assert_eq!(h.ready.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_timer_is_cancelled_once_connected() {
    let mut h = harness(Options {
        connect_timeout: Duration::from_millis(300),
        ..Options::default()
    });
    let _peer = connected(&mut h).await;

    sleep(Duration::from_millis(400)).await;
    assert!(h.conn.is_connected());
    assert!(h.closed.lock().is_empty());
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let mut h = harness(Options::default());
    let mut peer = connected(&mut h).await;
    let stream = RecordingHandler::new();
    h.conn.begin_stream(&stream).unwrap();

    h.conn.close();
    h.conn.close();

    assert_eq!(h.conn.state(), ConnectionState::Closed);
    let closed = h.closed.lock();
    assert_eq!(closed.len(), 1);
    assert!(matches!(closed[0], CloseReason::Local));
    drop(closed);

    assert_eq!(stream.lost.lock().len(), 1);
    assert_eq!(h.conn.stream_count(), 0);
    assert!(read_to_eof(&mut peer).await.is_empty());
}

#[tokio::test]
async fn test_peer_close_notifies_streams() {
    let mut h = harness(Options::default());
    let peer = connected(&mut h).await;
    let stream = RecordingHandler::new();
    h.conn.begin_stream(&stream).unwrap();

    drop(peer);
    eventually("close", || !h.closed.lock().is_empty()).await;

    assert_eq!(h.conn.state(), ConnectionState::Closed);
    assert!(matches!(h.closed.lock()[0], CloseReason::PeerClosed));
    assert_eq!(*stream.lost.lock(), vec!["Connection closed by peer".to_string()]);
}

// ============================================================================
// Streams and outbound
// ============================================================================

#[tokio::test]
async fn test_stream_ids_increase() {
    let mut h = harness(Options::default());
    let stream = RecordingHandler::new();
    assert!(matches!(h.conn.begin_stream(&stream), Err(ConnectionError::NotConnected)));

    let _peer = connected(&mut h).await;
    assert_eq!(h.conn.begin_stream(&stream).unwrap(), 1);
    assert_eq!(h.conn.begin_stream(&stream).unwrap(), 3);
    assert_eq!(h.conn.begin_stream(&stream).unwrap(), 5);
    assert_eq!(h.conn.stream_count(), 3);

    assert!(h.conn.end_stream(3));
    assert!(!h.conn.end_stream(3));
    assert_eq!(h.conn.stream_count(), 2);
}

#[tokio::test]
async fn test_with_engine_flushes() {
    let mut h = harness(Options::default());
    assert!(matches!(h.conn.with_engine(|_| ()), Err(ConnectionError::NotConnected)));

    let mut peer = connected(&mut h).await;
    let id = h
        .conn
        .with_engine(|engine| {
            engine.send(b"HEADERS");
            engine.next_stream_id
        })
        .unwrap();

    assert_eq!(id, 1);
    assert_eq!(read_exactly(&mut peer, 7).await, b"HEADERS");
}

#[tokio::test]
async fn test_with_engine_closure_can_use_connection() {
    let mut h = harness(Options::default());
    let mut peer = connected(&mut h).await;
    let stream = RecordingHandler::new();
    let id = h.conn.begin_stream(&stream).unwrap();

    let (count, nested, ended) = h
        .conn
        .with_engine(|engine| {
            engine.send(b"HEADERS");
            (h.conn.stream_count(), h.conn.begin_stream(&stream), h.conn.end_stream(id))
        })
        .unwrap();

    assert_eq!(count, 1);
    assert!(matches!(nested, Err(ConnectionError::EngineBusy)));
    assert!(ended);
    assert!(matches!(
        h.conn.with_engine(|_| h.conn.flush()),
        Ok(Err(ConnectionError::EngineBusy))
    ));
    assert!(h.conn.is_connected());
    assert_eq!(read_exactly(&mut peer, 7).await, b"HEADERS");

    // The engine is back: stream ids continue where they left off.
    assert_eq!(h.conn.begin_stream(&stream).unwrap(), 3);
}

#[tokio::test]
async fn test_inbound_data_waits_for_lent_engine() {
    let mut h = harness(Options::default());
    let mut peer = connected(&mut h).await;
    let stream = RecordingHandler::new();
    h.conn.begin_stream(&stream).unwrap();
    h.script.lock().batches.push_back(Ok(vec![data(1, 6)]));

    let seen_while_lent = h
        .conn
        .with_engine(|engine| {
            engine.send(b"HEADERS");
            h.conn.data_received(Bytes::from_static(b"x"));
            stream.events.lock().len()
        })
        .unwrap();

    assert_eq!(seen_while_lent, 0);
    assert_eq!(stream.events.lock().len(), 1);
    assert_eq!(h.script.lock().increments, vec![(6, Some(1)), (6, None)]);
    assert_eq!(read_exactly(&mut peer, 11).await, b"HEADERSWUWU");
}

#[tokio::test]
async fn test_close_while_engine_is_lent() {
    let mut h = harness(Options::default());
    let _peer = connected(&mut h).await;

    let result = h.conn.with_engine(|_| h.conn.close());

    assert!(matches!(result, Err(ConnectionError::ConnectionClosed)));
    assert_eq!(h.conn.state(), ConnectionState::Closed);
    assert_eq!(h.closed.lock().len(), 1);
    assert!(matches!(h.closed.lock()[0], CloseReason::Local));
}

// ============================================================================
// Dispatch and flow control
// ============================================================================

#[tokio::test]
async fn test_batch_credit_is_aggregated() {
    let mut h = harness(Options::default());
    let mut peer = connected(&mut h).await;
    let streams = [RecordingHandler::new(), RecordingHandler::new(), RecordingHandler::new()];
    for stream in &streams {
        h.conn.begin_stream(stream).unwrap();
    }

    deliver(&h, &mut peer, vec![data(1, 10), data(3, 0), data(5, 25)]).await;

    assert_eq!(
        h.script.lock().increments,
        vec![(10, Some(1)), (25, Some(5)), (35, None)]
    );
    assert_eq!(read_exactly(&mut peer, 6).await, b"WUWUWU");
    for stream in &streams {
        assert_eq!(stream.events.lock().len(), 1);
    }
}

#[tokio::test]
async fn test_unknown_stream_is_ignored_but_credited() {
    let mut h = harness(Options::default());
    let mut peer = connected(&mut h).await;

    deliver(&h, &mut peer, vec![data(7, 4), Event::StreamEnded { stream_id: 7 }]).await;

    assert!(h.conn.is_connected());
    assert_eq!(h.script.lock().increments, vec![(4, None)]);
    assert_eq!(read_exactly(&mut peer, 2).await, b"WU");
}

#[tokio::test]
async fn test_dropped_handler_is_pruned() {
    let mut h = harness(Options::default());
    let mut peer = connected(&mut h).await;
    let stream = RecordingHandler::new();
    h.conn.begin_stream(&stream).unwrap();
    drop(stream);

    deliver(&h, &mut peer, vec![data(1, 8)]).await;

    assert_eq!(h.conn.stream_count(), 0);
    assert_eq!(h.script.lock().increments, vec![(8, None)]);
}

#[tokio::test]
async fn test_failing_stream_does_not_affect_others() {
    let mut h = harness(Options::default());
    let mut peer = connected(&mut h).await;
    let failing = RecordingHandler::misbehaving(Misbehave::Fail);
    let panicking = RecordingHandler::misbehaving(Misbehave::Panic);
    let healthy = RecordingHandler::new();
    h.conn.begin_stream(&failing).unwrap();
    h.conn.begin_stream(&panicking).unwrap();
    h.conn.begin_stream(&healthy).unwrap();

    deliver(&h, &mut peer, vec![data(1, 1), data(3, 1), data(5, 1)]).await;

    assert_eq!(*failing.failures.lock(), vec![StreamError::Handler("bad body".into())]);
    assert_eq!(*panicking.failures.lock(), vec![StreamError::Panicked("boom".into())]);
    assert!(healthy.failures.lock().is_empty());
    assert_eq!(healthy.events.lock().len(), 1);

    assert!(h.conn.is_connected());
    assert_eq!(h.script.lock().increments.len(), 4);
}

#[tokio::test]
async fn test_settings_change_alone_triggers_flush() {
    let mut h = harness(Options::default());
    let mut peer = connected(&mut h).await;

    deliver(
        &h,
        &mut peer,
        vec![Event::RemoteSettingsChanged {
            changed: vec![(SettingCode::MaxConcurrentStreams.id(), 100)],
        }],
    )
    .await;

    assert!(h.script.lock().increments.is_empty());
    assert_eq!(read_exactly(&mut peer, 3).await, b"ACK");
}

#[tokio::test]
async fn test_goaway_closes_after_batch() {
    let mut h = harness(Options::default());
    let mut peer = connected(&mut h).await;
    let first = RecordingHandler::new();
    let second = RecordingHandler::new();
    h.conn.begin_stream(&first).unwrap();
    h.conn.begin_stream(&second).unwrap();

    deliver(
        &h,
        &mut peer,
        vec![
            data(1, 5),
            Event::ConnectionTerminated {
                error_code: 0,
                last_stream_id: Some(3),
                additional_data: None,
            },
            data(3, 7),
        ],
    )
    .await;

    assert_eq!(second.events.lock().len(), 1);
    assert_eq!(
        h.script.lock().increments,
        vec![(5, Some(1)), (7, Some(3)), (12, None)]
    );

    assert_eq!(h.conn.state(), ConnectionState::Closed);
    let closed = h.closed.lock();
    assert_eq!(closed.len(), 1);
    assert!(matches!(
        closed[0],
        CloseReason::Terminated {
            error_code: 0,
            last_stream_id: Some(3)
        }
    ));
    assert!(!closed[0].is_error());
    drop(closed);

    assert_eq!(first.lost.lock().len(), 1);
    assert_eq!(read_to_eof(&mut peer).await, b"WUWUWU");
}

#[tokio::test]
async fn test_decode_error_closes_with_protocol_error() {
    let mut h = harness(Options::default());
    let mut peer = connected(&mut h).await;

    h.script
        .lock()
        .batches
        .push_back(Err(EngineError::Protocol("bad frame".into())));
    peer.write_all(b"garbage").await.unwrap();
    eventually("close", || !h.closed.lock().is_empty()).await;

    assert_eq!(h.conn.state(), ConnectionState::Closed);
    assert!(matches!(
        h.closed.lock()[0].error(),
        Some(ConnectionError::Protocol(EngineError::Protocol(_)))
    ));
    assert!(read_to_eof(&mut peer).await.is_empty());
}

#[tokio::test]
async fn test_closed_stream_credit_is_swallowed() {
    let mut h = harness(Options::default());
    let mut peer = connected(&mut h).await;
    let first = RecordingHandler::new();
    let second = RecordingHandler::new();
    h.conn.begin_stream(&first).unwrap();
    h.conn.begin_stream(&second).unwrap();
    h.script.lock().closed_streams.push(1);

    deliver(&h, &mut peer, vec![data(1, 10), data(3, 5)]).await;

    assert!(h.conn.is_connected());
    assert_eq!(h.script.lock().increments, vec![(5, Some(3)), (15, None)]);
    assert_eq!(read_exactly(&mut peer, 4).await, b"WUWU");
}

#[tokio::test]
async fn test_close_from_handler_stops_the_batch() {
    let mut h = harness(Options::default());
    let mut peer = connected(&mut h).await;
    let closer = Arc::new(ClosingHandler {
        conn: h.conn.clone(),
        events: AtomicUsize::new(0),
    });
    let other = RecordingHandler::new();
    h.conn.begin_stream(&closer).unwrap();
    h.conn.begin_stream(&other).unwrap();

    deliver(&h, &mut peer, vec![data(1, 5), data(3, 7)]).await;

    assert_eq!(closer.events.load(Ordering::SeqCst), 1);
    assert!(other.events.lock().is_empty());
    assert_eq!(other.lost.lock().len(), 1);
    assert_eq!(h.closed.lock().len(), 1);
    assert!(matches!(h.closed.lock()[0], CloseReason::Local));
    // No credit for a batch cut short by closure.
    assert!(h.script.lock().increments.is_empty());
    assert!(read_to_eof(&mut peer).await.is_empty());
}

// ============================================================================
// Observers
// ============================================================================

#[tokio::test]
async fn test_event_observers() {
    let mut h = harness(Options::default());
    let mut peer = connected(&mut h).await;

    let seen = Arc::new(AtomicUsize::new(0));
    let observer: EventObserver = {
        let seen = seen.clone();
        Arc::new(move |event: &Event| {
            assert_eq!(event.kind(), EventKind::PingReceived);
            seen.fetch_add(1, Ordering::SeqCst);
        })
    };
    let panicking: EventObserver = Arc::new(|_: &Event| panic!("observer bug"));

    assert!(h.conn.add_event_handler(EventKind::PingReceived, observer.clone()));
    assert!(!h.conn.add_event_handler(EventKind::PingReceived, observer.clone()));
    assert!(h.conn.add_event_handler(EventKind::PingReceived, panicking.clone()));

    let ping = Event::PingReceived { data: [1; 8] };
    deliver(&h, &mut peer, vec![ping.clone(), Event::SettingsAcknowledged]).await;
    assert_eq!(seen.load(Ordering::SeqCst), 1);
    assert!(h.conn.is_connected());

    h.conn.remove_event_handler(EventKind::PingReceived, &observer).unwrap();
    assert!(matches!(
        h.conn.remove_event_handler(EventKind::PingReceived, &observer),
        Err(ConnectionError::HandlerNotFound(EventKind::PingReceived))
    ));

    deliver(&h, &mut peer, vec![ping]).await;
    assert_eq!(seen.load(Ordering::SeqCst), 1);
}
