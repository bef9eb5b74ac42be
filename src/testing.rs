//! Helpers for this crate's own tests.

use std::io;

/// The type of stream returned by [`construct_socketpair`].
#[cfg(not(windows))]
pub(crate) type SocketpairStream = socketpair::SocketpairStream;
#[cfg(windows)]
pub(crate) type SocketpairStream = std::net::TcpStream;

/// Build a connected, in-memory duplex byte stream: useful for exercising
/// `Read + Write` consumers (the codecs, `TlsStream`) without a real socket.
pub(crate) fn construct_socketpair() -> io::Result<(SocketpairStream, SocketpairStream)> {
    #[cfg(not(windows))]
    {
        socketpair::socketpair_stream()
    }
    #[cfg(windows)]
    {
        // `socketpair` creates a named pipe on Windows rather than a true
        // AF_UNIX socket, which doesn't suit our non-blocking `Read + Write`
        // needs; loop back through a real TCP connection instead.
        let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        let s1 = std::net::TcpStream::connect(addr)?;
        let (s2, _) = listener.accept()?;
        Ok((s1, s2))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::{Read, Write};

    #[test]
    fn socketpair_is_duplex() {
        let (mut a, mut b) = construct_socketpair().expect("socketpair");
        a.write_all(b"hello").unwrap();
        let mut buf = [0u8; 5];
        b.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }
}
