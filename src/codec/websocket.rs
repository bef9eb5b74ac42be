//! RFC-6455 WebSocket framing and client handshake, via `tungstenite` --
//! the same sync WebSocket library whose `tokio`-wrapped counterpart shows
//! up elsewhere in the corpus. Unlike the length-prefixed framing, this
//! isn't fed raw bytes by the caller: `tungstenite` reads and writes the
//! stream directly, which is why [`WebSocketDecoder`] is generic over any
//! `Read + Write` transport (a plain socket, or one already wrapped in TLS)
//! instead of owning a byte buffer itself.

use std::io::{Read, Write};

use tungstenite::client::IntoClientRequest;
use tungstenite::handshake::client::ClientHandshake;
use tungstenite::handshake::{HandshakeError, MidHandshake};
use tungstenite::{Message, WebSocket};

use super::DecodeStep;
use crate::error::DecodeError;

/// Assembles whole JSON messages out of RFC-6455 WebSocket frames,
/// including fragment reassembly and transparent ping/pong/close handling,
/// for a connection whose handshake has already completed.
pub struct WebSocketDecoder<S> {
    socket: WebSocket<S>,
}

impl<S: Read + Write> WebSocketDecoder<S> {
    fn from_socket(socket: WebSocket<S>) -> Self {
        Self { socket }
    }

    /// Send a JSON payload as a single text frame.
    pub fn send(&mut self, payload: &[u8]) -> Result<(), DecodeError> {
        let text = String::from_utf8(payload.to_vec()).map_err(|_| DecodeError::InvalidUtf8)?;
        self.socket
            .send(Message::Text(text))
            .map_err(|e| DecodeError::WebSocketProtocol(e.to_string()))
    }

    /// Queue a ping frame (used as the WebSocket heartbeat).
    pub fn send_ping(&mut self) -> Result<(), DecodeError> {
        self.socket
            .send(Message::Ping(Vec::new()))
            .map_err(|e| DecodeError::WebSocketProtocol(e.to_string()))
    }

    /// Pull the next whole application message out of buffered frames.
    /// `Ok(NeedMoreData)` means the underlying stream would have blocked.
    pub fn next_message(&mut self) -> Result<DecodeStep, DecodeError> {
        match self.socket.read() {
            Ok(Message::Text(text)) => Ok(DecodeStep::Message(text.into_bytes())),
            Ok(Message::Binary(data)) => Ok(DecodeStep::Message(data)),
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => {
                Ok(DecodeStep::ControlOnly)
            }
            Ok(Message::Close(_)) => Ok(DecodeStep::Closed),
            Err(tungstenite::Error::Io(e)) if e.kind() == std::io::ErrorKind::WouldBlock => {
                Ok(DecodeStep::NeedMoreData)
            }
            Err(tungstenite::Error::ConnectionClosed) | Err(tungstenite::Error::AlreadyClosed) => {
                Ok(DecodeStep::Closed)
            }
            Err(e) => Err(DecodeError::WebSocketProtocol(e.to_string())),
        }
    }
}

/// A handshake that would have blocked partway through and must be
/// retried once the stream is next readable/writable.
pub type PendingHandshake<S> = MidHandshake<ClientHandshake<S>>;

/// Result of one handshake step: either the upgrade completed and the
/// decoder is ready for application traffic, or the stream would have
/// blocked and must be retried once it's next readable/writable.
pub enum HandshakeOutcome<S> {
    Ready(WebSocketDecoder<S>),
    Pending(PendingHandshake<S>),
}

/// Begin a client WebSocket handshake on an already-connected (and, for
/// `WsTls`, already TLS-wrapped) non-blocking stream.
pub fn start_client_handshake<S: Read + Write>(
    stream: S,
    host: &str,
    path: &str,
) -> Result<HandshakeOutcome<S>, DecodeError> {
    let uri = format!("ws://{host}{path}");
    let request = uri
        .into_client_request()
        .map_err(|e| DecodeError::WebSocketProtocol(e.to_string()))?;
    handle_handshake_result(tungstenite::client(request, stream))
}

/// Advance a handshake that previously reported
/// [`HandshakeOutcome::Pending`].
pub fn continue_client_handshake<S: Read + Write>(
    mid: MidHandshake<ClientHandshake<S>>,
) -> Result<HandshakeOutcome<S>, DecodeError> {
    handle_handshake_result(mid.handshake())
}

fn handle_handshake_result<S: Read + Write>(
    result: Result<(WebSocket<S>, tungstenite::http::Response<Option<Vec<u8>>>), HandshakeError<ClientHandshake<S>>>,
) -> Result<HandshakeOutcome<S>, DecodeError> {
    match result {
        Ok((socket, _response)) => Ok(HandshakeOutcome::Ready(WebSocketDecoder::from_socket(socket))),
        Err(HandshakeError::Interrupted(mid)) => Ok(HandshakeOutcome::Pending(mid)),
        Err(HandshakeError::Failure(e)) => Err(DecodeError::WebSocketProtocol(e.to_string())),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::{self, Cursor};

    /// An in-memory loopback pair: writes to one side become readable from
    /// the other. Enough to drive a handshake and a few frames in tests
    /// without a real socket.
    struct Loopback {
        read: Cursor<Vec<u8>>,
        written: Vec<u8>,
    }

    impl Read for Loopback {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = Read::read(&mut self.read, buf)?;
            if n == 0 {
                return Err(io::Error::new(io::ErrorKind::WouldBlock, "no data"));
            }
            Ok(n)
        }
    }

    impl Write for Loopback {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn handshake_without_a_peer_reports_pending() {
        let stream = Loopback {
            read: Cursor::new(Vec::new()),
            written: Vec::new(),
        };
        let outcome = start_client_handshake(stream, "agent.example", "/rpc").unwrap();
        assert!(matches!(outcome, HandshakeOutcome::Pending(_)));
    }
}
