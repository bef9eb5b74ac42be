//! TLS wrapping for a non-blocking socket, driven directly against `rustls`
//! the way the crate's own examples drive it against `mio`: pull ciphertext
//! with `read_tls`, hand it to `process_new_packets`, push plaintext with
//! `writer().write`.
//!
//! Loading certificates, private keys, and trust anchors off disk is the
//! embedding binary's job; this module only ever sees an already-built
//! [`rustls::ClientConfig`].

use std::io::{self, Read, Write};
use std::sync::Arc;

use rustls_pki_types::ServerName;

/// A TLS session layered over a non-blocking byte stream.
///
/// Handshake and application data both flow through the same
/// read/write-ciphertext pump; callers drive it from the reactor's
/// readiness loop exactly like a plain socket, checking
/// [`wants_read`](Self::wants_read)/[`wants_write`](Self::wants_write) to
/// decide which interest to register next.
pub struct TlsStream<S> {
    conn: rustls::ClientConnection,
    sock: S,
    /// Plaintext decrypted but not yet handed to a caller, because the last
    /// `read()` call's buffer was smaller than what `rustls` had ready.
    /// Without this, bytes beyond the caller's buffer length would be
    /// silently dropped instead of carried over to the next `read()`.
    pending_plaintext: std::collections::VecDeque<u8>,
}

impl<S: Read + Write> TlsStream<S> {
    /// Start a new TLS session over `sock`, validating the peer against
    /// `config` and sending `server_name` as SNI.
    pub fn new(config: Arc<rustls::ClientConfig>, server_name: ServerName<'static>, sock: S) -> io::Result<Self> {
        let conn = rustls::ClientConnection::new(config, server_name)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        Ok(Self {
            conn,
            sock,
            pending_plaintext: std::collections::VecDeque::new(),
        })
    }

    /// Mutable access to the underlying socket, for registering it with a
    /// `mio::Poll` before any TLS state ever touches it.
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.sock
    }

    /// True while the handshake (or a renegotiation) is in progress.
    pub fn is_handshaking(&self) -> bool {
        self.conn.is_handshaking()
    }

    /// True if `rustls` has ciphertext it wants to read from the socket.
    pub fn wants_read(&self) -> bool {
        self.conn.wants_read()
    }

    /// True if `rustls` has ciphertext it wants to write to the socket.
    pub fn wants_write(&self) -> bool {
        self.conn.wants_write()
    }

    /// Pull ciphertext off the underlying socket and feed it to the
    /// session state machine. Returns the number of bytes read from the
    /// socket (zero means the peer closed the connection).
    pub fn read_tls_and_process(&mut self) -> io::Result<usize> {
        let n = self.conn.read_tls(&mut self.sock)?;
        if n > 0 {
            self.conn
                .process_new_packets()
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        }
        Ok(n)
    }

    /// Push any pending ciphertext (handshake flight or encrypted
    /// application data) out to the socket.
    pub fn write_tls(&mut self) -> io::Result<usize> {
        self.conn.write_tls(&mut self.sock)
    }

    /// Drain any plaintext the session has decrypted and buffered.
    pub fn read_plaintext(&mut self, out: &mut Vec<u8>) -> io::Result<usize> {
        let mut reader = self.conn.reader();
        let mut chunk = [0u8; 4096];
        let mut total = 0;
        loop {
            match reader.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    out.extend_from_slice(&chunk[..n]);
                    total += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }

    /// Hand plaintext application bytes to the session to be encrypted;
    /// call [`write_tls`](Self::write_tls) afterward to push the result.
    pub fn write_plaintext(&mut self, data: &[u8]) -> io::Result<usize> {
        self.conn.writer().write(data)
    }
}

/// Lets a `TlsStream` stand in directly for a plain socket anywhere a
/// `Read + Write` transport is expected (length-prefixed framing,
/// `tungstenite`'s WebSocket handshake and frame codec): each call pumps
/// the ciphertext layer before touching plaintext, so callers never need
/// to know TLS is involved.
impl<S: Read + Write> Read for TlsStream<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending_plaintext.is_empty() {
            let raw = self.read_tls_and_process()?;
            if raw == 0 {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed tls connection"));
            }
            let mut out = Vec::new();
            let n = self.read_plaintext(&mut out)?;
            if n == 0 {
                return Err(io::Error::new(io::ErrorKind::WouldBlock, "no plaintext ready"));
            }
            self.pending_plaintext.extend(out);
        }
        let n = self.pending_plaintext.len().min(buf.len());
        for (slot, byte) in buf[..n].iter_mut().zip(self.pending_plaintext.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl<S: Read + Write> Write for TlsStream<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.write_plaintext(buf)?;
        self.write_tls()?;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.write_tls()?;
        Ok(())
    }
}
