//! `ReactorClient`: one connection, in one of four framing/handshake
//! shapes, dispatched through a single method set instead of a trait
//! object -- a tagged variant over the transport kind, following the same
//! idiom the teacher uses for its own connection-state types.

use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use mio::net::TcpStream;
use rustls_pki_types::ServerName;
use tracing::{debug, warn};

use crate::codec::websocket::{self, HandshakeOutcome, WebSocketDecoder};
use crate::codec::{DecodeStep, LengthPrefixedDecoder, DEFAULT_MAX_MESSAGE_SIZE};
use crate::error::{CallError, DecodeError, SendError, WireError};
use crate::tls::TlsStream;

/// Which framing and handshake a [`ReactorClient`] uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Plain,
    Tls,
    Ws,
    WsTls,
}

/// Lifecycle of a single connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Closed,
    Initializing,
    Open,
}

/// TOCTOU-safe outbound byte queue: the buffer and its byte-cap bookkeeping
/// live behind one mutex, mirroring the teacher's `WriteHandleImpl` pattern
/// so a queued write and the wakeup announcing it are never observed out
/// of order by the reactor thread.
struct OutboundQueue {
    inner: Mutex<Vec<u8>>,
    cap_bytes: usize,
}

impl OutboundQueue {
    fn new(cap_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(Vec::new()),
            cap_bytes,
        }
    }

    fn push(&self, bytes: &[u8]) -> Result<(), SendError> {
        let mut buf = self.inner.lock().expect("outbound queue mutex poisoned");
        if buf.len() + bytes.len() > self.cap_bytes {
            return Err(SendError::QueueFull);
        }
        buf.extend_from_slice(bytes);
        Ok(())
    }

    fn take(&self) -> Vec<u8> {
        std::mem::take(&mut *self.inner.lock().expect("outbound queue mutex poisoned"))
    }

    fn requeue_front(&self, unsent: &[u8]) {
        if unsent.is_empty() {
            return;
        }
        let mut buf = self.inner.lock().expect("outbound queue mutex poisoned");
        let mut combined = Vec::with_capacity(unsent.len() + buf.len());
        combined.extend_from_slice(unsent);
        combined.append(&mut buf);
        *buf = combined;
    }

    fn is_empty(&self) -> bool {
        self.inner.lock().expect("outbound queue mutex poisoned").is_empty()
    }
}

/// Default byte cap on a client's outbound queue before `send_message`
/// fails fast with [`SendError::QueueFull`] instead of buffering without
/// bound.
pub const DEFAULT_OUTBOUND_QUEUE_CAP: usize = 16 * 1024 * 1024;

/// Configuration shared by every `ReactorClient` variant.
#[derive(Clone)]
pub struct TransportConfig {
    pub max_message_size: usize,
    pub outbound_queue_cap: usize,
    pub tls_config: Option<Arc<rustls::ClientConfig>>,
    pub ws_path: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            outbound_queue_cap: DEFAULT_OUTBOUND_QUEUE_CAP,
            tls_config: None,
            ws_path: "/".to_owned(),
        }
    }
}

/// The underlying byte transport, unified so the same framing code serves
/// both `Plain`/`Ws` and their TLS-wrapped counterparts.
enum Channel {
    Plain(TcpStream),
    Tls(TlsStream<TcpStream>),
}

impl Read for Channel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Channel::Plain(s) => s.read(buf),
            Channel::Tls(s) => s.read(buf),
        }
    }
}

impl Write for Channel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Channel::Plain(s) => s.write(buf),
            Channel::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Channel::Plain(s) => s.flush(),
            Channel::Tls(s) => s.flush(),
        }
    }
}

impl Channel {
    /// The raw socket, for `mio::Poll` registration. Only ever called once,
    /// immediately after `connect`, while the channel is still in
    /// [`Conn::Connecting`]: interest is registered for both read and write
    /// up front and never changed afterward, so nothing later needs to
    /// reach back through a TLS or WebSocket layer to find it again.
    fn raw(&mut self) -> &mut TcpStream {
        match self {
            Channel::Plain(s) => s,
            Channel::Tls(s) => s.get_mut(),
        }
    }
}

/// Per-framing connection state: length-prefixed framing reads raw bytes
/// into our own decoder, while WebSocket framing -- handshake included --
/// is driven by `tungstenite` directly against the channel.
enum Conn {
    /// Socket opened, handshake/framing not yet established.
    Connecting(Channel),
    Framed(Channel, LengthPrefixedDecoder),
    WsHandshaking(websocket::PendingHandshake<Channel>),
    WsOpen(WebSocketDecoder<Channel>),
}

/// One connection to a host agent: owns the socket, the inbound decoder,
/// the outbound queue, and the heartbeat clocks.
///
/// Variants differ only in framing and handshake; the reactor drives all
/// four through the same capability set (`process`, `send_message`,
/// `perform_action`, `close`).
pub struct ReactorClient {
    kind: TransportKind,
    state: ConnState,
    config: TransportConfig,
    host: String,
    port: u16,
    conn: Option<Conn>,
    outbound: Arc<OutboundQueue>,
    /// Whole WebSocket messages submitted while still `Initializing`: frame
    /// boundaries matter for `Ws`/`WsTls`, unlike the flat byte stream
    /// `outbound` uses for length-prefixed framing, so these wait as
    /// discrete messages and are replayed through `ws.send` once the
    /// handshake completes.
    ws_pending: Mutex<Vec<Vec<u8>>>,
    last_incoming: Option<Instant>,
    last_outgoing: Option<Instant>,
}

/// A message delivered up to the [`JsonRpcClient`](crate::client::JsonRpcClient), or a
/// signal that the connection just opened or closed.
pub enum ClientEvent {
    /// The handshake (if any) completed and the client transitioned into `Open`.
    Connected,
    Message(Vec<u8>),
    Disconnected(CallError),
}

impl ReactorClient {
    /// Create a client for `host:port` in the `Closed` state. No socket
    /// work happens until [`begin_connect`](Self::begin_connect) runs it,
    /// on the reactor thread.
    pub fn new(kind: TransportKind, host: String, port: u16, config: TransportConfig) -> Self {
        Self {
            kind,
            state: ConnState::Closed,
            outbound: Arc::new(OutboundQueue::new(config.outbound_queue_cap)),
            ws_pending: Mutex::new(Vec::new()),
            config,
            host,
            port,
            conn: None,
            last_incoming: None,
            last_outgoing: None,
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == ConnState::Open
    }

    pub fn is_closed(&self) -> bool {
        !self.is_open() && !matches!(self.state, ConnState::Initializing)
    }

    /// Open the TCP socket and, for `Tls`/`WsTls`, wrap it in a TLS session.
    /// Framing/handshake is advanced afterward by [`process`](Self::process).
    pub fn begin_connect(&mut self) -> Result<(), CallError> {
        let addr = format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e: std::net::AddrParseError| {
                CallError::ConnectionFailed(Arc::new(io::Error::new(io::ErrorKind::InvalidInput, e)))
            })?;
        let stream = TcpStream::connect(addr)?;
        self.state = ConnState::Initializing;

        let channel = match self.kind {
            TransportKind::Plain | TransportKind::Ws => Channel::Plain(stream),
            TransportKind::Tls | TransportKind::WsTls => {
                let tls_config = self
                    .config
                    .tls_config
                    .clone()
                    .expect("tls transport requires a configured rustls::ClientConfig");
                let name = ServerName::try_from(self.host.clone()).map_err(|e| {
                    CallError::ConnectionFailed(Arc::new(io::Error::new(io::ErrorKind::InvalidInput, e)))
                })?;
                Channel::Tls(TlsStream::new(tls_config, name, stream)?)
            }
        };
        self.conn = Some(Conn::Connecting(channel));
        debug!(host = %self.host, port = self.port, kind = ?self.kind, "connecting");
        Ok(())
    }

    /// Append an already-encoded payload to the outbound queue. Never
    /// blocks; fails immediately if the client is closed and not permitted
    /// to reconnect, or if the queue is past its byte cap.
    pub fn send_message(&mut self, payload: &[u8]) -> Result<(), SendError> {
        if self.is_closed() {
            return Err(SendError::ClientConnectionFailed);
        }
        match (self.kind, &mut self.conn) {
            (TransportKind::Plain | TransportKind::Tls, _) => {
                self.outbound.push(&crate::codec::length_prefixed::encode(payload))
            }
            (TransportKind::Ws | TransportKind::WsTls, Some(Conn::WsOpen(ws))) => ws
                .send(payload)
                .map_err(|_| SendError::ClientConnectionFailed),
            (TransportKind::Ws | TransportKind::WsTls, _) => {
                // Still handshaking: queued sends wait for `Open`, per the
                // "sends during Initializing are buffered, not dropped" rule.
                self.ws_pending.lock().expect("ws pending queue mutex poisoned").push(payload.to_vec());
                Ok(())
            }
        }
    }

    /// `processIncoming -> processHeartbeat -> processOutgoing`, run by the
    /// reactor whenever this client's socket reports readiness.
    pub fn process(&mut self, now: Instant, incoming_heartbeat: Option<Duration>) -> Vec<ClientEvent> {
        let mut events = Vec::new();
        let was_open = self.state == ConnState::Open;

        if let Err(e) = self.advance_handshake() {
            events.push(ClientEvent::Disconnected(e));
            self.state = ConnState::Closed;
            return events;
        }
        if !was_open && self.state == ConnState::Open {
            // Seed the incoming-heartbeat clock at connection-open time: a
            // peer that opens and then falls silent must still trip the
            // heartbeat, not be exempted forever for lack of a first message.
            self.last_incoming = Some(now);
            events.push(ClientEvent::Connected);
        }

        if let Err(e) = self.process_incoming(now, &mut events) {
            // Past `Open`, any I/O or decode failure here is mid-session: a
            // `ConnectionFailed` is reserved for the socket-open/handshake
            // step, which has already succeeded by the time `process_incoming`
            // ever runs.
            events.push(ClientEvent::Disconnected(CallError::ConnectionLost(WireError::connection_closed(&e.to_string()))));
            self.state = ConnState::Closed;
            return events;
        }

        if self.state == ConnState::Open {
            if let Some(heartbeat) = incoming_heartbeat {
                if let Some(last) = self.last_incoming {
                    if now.saturating_duration_since(last) > heartbeat {
                        warn!(host = %self.host, "heartbeat exceeded");
                        events.push(ClientEvent::Disconnected(CallError::ConnectionLost(
                            WireError::connection_closed("heartbeat exceeded"),
                        )));
                        self.state = ConnState::Closed;
                        return events;
                    }
                }
            }
        }

        if let Err(e) = self.process_outgoing(now) {
            events.push(ClientEvent::Disconnected(CallError::ConnectionLost(WireError::connection_closed(&e.to_string()))));
            self.state = ConnState::Closed;
        }
        events
    }

    fn advance_handshake(&mut self) -> Result<(), CallError> {
        let Some(conn) = self.conn.take() else {
            return Ok(());
        };
        self.conn = Some(match conn {
            Conn::Connecting(channel) => match self.kind {
                TransportKind::Plain | TransportKind::Tls => {
                    self.state = ConnState::Open;
                    Conn::Framed(channel, LengthPrefixedDecoder::new(self.config.max_message_size))
                }
                TransportKind::Ws | TransportKind::WsTls => {
                    match websocket::start_client_handshake(channel, &self.host, &self.config.ws_path)
                        .map_err(ws_handshake_call_error)?
                    {
                        HandshakeOutcome::Ready(ws) => {
                            self.state = ConnState::Open;
                            Conn::WsOpen(ws)
                        }
                        HandshakeOutcome::Pending(mid) => Conn::WsHandshaking(mid),
                    }
                }
            },
            Conn::WsHandshaking(mid) => match websocket::continue_client_handshake(mid).map_err(ws_handshake_call_error)? {
                HandshakeOutcome::Ready(ws) => {
                    self.state = ConnState::Open;
                    Conn::WsOpen(ws)
                }
                HandshakeOutcome::Pending(mid) => Conn::WsHandshaking(mid),
            },
            other => other,
        });

        if self.state == ConnState::Open {
            if let Some(Conn::WsOpen(ws)) = self.conn.as_mut() {
                let pending = std::mem::take(&mut *self.ws_pending.lock().expect("ws pending queue mutex poisoned"));
                for msg in pending {
                    if let Err(e) = ws.send(&msg) {
                        return Err(ws_handshake_call_error(e));
                    }
                }
            }
        }
        Ok(())
    }

    fn process_incoming(&mut self, now: Instant, events: &mut Vec<ClientEvent>) -> io::Result<()> {
        match self.conn.as_mut() {
            Some(Conn::Framed(channel, decoder)) => {
                let mut chunk = [0u8; 16 * 1024];
                loop {
                    match channel.read(&mut chunk) {
                        Ok(0) => {
                            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed connection"));
                        }
                        Ok(n) => {
                            decoder.feed(&chunk[..n]);
                            loop {
                                match decoder.next_message() {
                                    Ok(Some(bytes)) => {
                                        self.last_incoming = Some(now);
                                        events.push(ClientEvent::Message(bytes));
                                    }
                                    Ok(None) => break,
                                    Err(e) => return Err(decode_error_to_io(e)),
                                }
                            }
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(e) => return Err(e),
                    }
                }
            }
            Some(Conn::WsOpen(ws)) => loop {
                match ws.next_message() {
                    Ok(DecodeStep::Message(bytes)) => {
                        self.last_incoming = Some(now);
                        events.push(ClientEvent::Message(bytes));
                    }
                    Ok(DecodeStep::ControlOnly) => self.last_incoming = Some(now),
                    Ok(DecodeStep::Closed) => {
                        events.push(ClientEvent::Disconnected(CallError::ConnectionLost(
                            WireError::connection_closed("peer sent close frame"),
                        )));
                        break;
                    }
                    Ok(DecodeStep::NeedMoreData) => break,
                    Err(e) => return Err(decode_error_to_io(e)),
                }
            },
            _ => {}
        }
        Ok(())
    }

    fn process_outgoing(&mut self, now: Instant) -> io::Result<()> {
        let Some(Conn::Framed(channel, _)) = self.conn.as_mut() else {
            return Ok(());
        };
        if self.outbound.is_empty() {
            return Ok(());
        }
        let pending = self.outbound.take();
        match channel.write(&pending) {
            Ok(n) => {
                self.outbound.requeue_front(&pending[n..]);
                if n > 0 {
                    self.last_outgoing = Some(now);
                }
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.outbound.requeue_front(&pending);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Periodic tick: emit a heartbeat frame if the outgoing-heartbeat
    /// interval has passed since the last byte we sent.
    pub fn perform_action(&mut self, now: Instant, outgoing_heartbeat: Option<Duration>) {
        let Some(heartbeat) = outgoing_heartbeat else {
            return;
        };
        if self.state != ConnState::Open {
            return;
        }
        let due = self
            .last_outgoing
            .map(|last| now.saturating_duration_since(last) > heartbeat)
            .unwrap_or(true);
        if !due {
            return;
        }
        match self.conn.as_mut() {
            Some(Conn::Framed(_, _)) => {
                let payload = br#"{"jsonrpc":"2.0","method":"rpc.heartbeat","params":null}"#;
                if self.outbound.push(&crate::codec::length_prefixed::encode(payload)).is_ok() {
                    self.last_outgoing = Some(now);
                }
            }
            Some(Conn::WsOpen(ws)) => {
                if ws.send_ping().is_ok() {
                    self.last_outgoing = Some(now);
                }
            }
            _ => {}
        }
    }

    /// Mark this client `Closed`, releasing its socket and decoder buffers.
    pub fn close(&mut self) {
        self.conn = None;
        self.state = ConnState::Closed;
    }

    /// Register this client's socket with `registry` for both read and
    /// write readiness. Must be called exactly once, right after
    /// [`begin_connect`](Self::begin_connect) succeeds.
    pub(crate) fn register(&mut self, registry: &mio::Registry, token: mio::Token) -> io::Result<()> {
        let Some(Conn::Connecting(channel)) = self.conn.as_mut() else {
            return Err(io::Error::new(io::ErrorKind::Other, "register called outside Connecting state"));
        };
        registry.register(channel.raw(), token, mio::Interest::READABLE | mio::Interest::WRITABLE)
    }

    /// Deregister this client's socket before dropping it.
    pub(crate) fn deregister(&mut self, registry: &mio::Registry) {
        if let Some(conn) = self.conn.as_mut() {
            let raw = match conn {
                Conn::Connecting(ch) | Conn::Framed(ch, _) => Some(ch.raw()),
                Conn::WsOpen(_) | Conn::WsHandshaking(_) => None,
            };
            if let Some(raw) = raw {
                let _ = registry.deregister(raw);
            }
        }
    }
}

fn decode_error_to_io(e: DecodeError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

fn ws_handshake_call_error(e: DecodeError) -> CallError {
    CallError::ConnectionFailed(Arc::new(io::Error::new(io::ErrorKind::Other, e)))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn outbound_queue_rejects_past_cap() {
        let q = OutboundQueue::new(4);
        assert!(q.push(b"1234").is_ok());
        assert!(matches!(q.push(b"5"), Err(SendError::QueueFull)));
    }

    #[test]
    fn outbound_queue_requeue_preserves_order() {
        let q = OutboundQueue::new(1024);
        q.push(b"world").unwrap();
        q.requeue_front(b"hello ");
        assert_eq!(q.take(), b"hello world");
    }
}
