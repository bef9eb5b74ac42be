//! 4-byte big-endian length-prefixed framing.

use crate::error::DecodeError;

enum State {
    AwaitingHeader,
    AwaitingBody(usize),
}

/// Two-state decoder for length-prefixed binary framing: a 4-byte
/// big-endian length header followed by exactly that many bytes of UTF-8
/// JSON, with no trailing delimiter.
pub struct LengthPrefixedDecoder {
    max_message_size: usize,
    buffer: Vec<u8>,
    state: State,
}

const HEADER_LEN: usize = 4;

impl LengthPrefixedDecoder {
    /// Build a decoder that rejects any message whose declared length
    /// exceeds `max_message_size`.
    pub fn new(max_message_size: usize) -> Self {
        Self {
            max_message_size,
            buffer: Vec::new(),
            state: State::AwaitingHeader,
        }
    }

    /// Append newly-received bytes to the internal buffer.
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Try to extract the next whole message. Returns `Ok(None)` if the
    /// buffer doesn't yet hold a complete header+body.
    pub fn next_message(&mut self) -> Result<Option<Vec<u8>>, DecodeError> {
        loop {
            match self.state {
                State::AwaitingHeader => {
                    if self.buffer.len() < HEADER_LEN {
                        return Ok(None);
                    }
                    let len = u32::from_be_bytes(
                        self.buffer[..HEADER_LEN]
                            .try_into()
                            .expect("slice of exactly HEADER_LEN bytes"),
                    ) as usize;
                    if len > self.max_message_size {
                        return Err(DecodeError::OversizeMessage {
                            len,
                            cap: self.max_message_size,
                        });
                    }
                    self.buffer.drain(..HEADER_LEN);
                    self.state = State::AwaitingBody(len);
                }
                State::AwaitingBody(len) => {
                    if self.buffer.len() < len {
                        return Ok(None);
                    }
                    let payload = self.buffer.drain(..len).collect();
                    self.state = State::AwaitingHeader;
                    return Ok(Some(payload));
                }
            }
        }
    }
}

/// Encode a JSON payload with its 4-byte big-endian length prefix.
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn decodes_one_message_fed_whole() {
        let mut dec = LengthPrefixedDecoder::new(1024);
        dec.feed(&encode(b"{}"));
        let msg = dec.next_message().unwrap().unwrap();
        assert_eq!(msg, b"{}");
        assert!(dec.next_message().unwrap().is_none());
    }

    #[test]
    fn decodes_message_fed_byte_by_byte() {
        let mut dec = LengthPrefixedDecoder::new(1024);
        let framed = encode(b"hello");
        for b in &framed {
            assert!(dec.next_message().unwrap().is_none());
            dec.feed(std::slice::from_ref(b));
        }
        let msg = dec.next_message().unwrap().unwrap();
        assert_eq!(msg, b"hello");
    }

    #[test]
    fn decodes_back_to_back_messages() {
        let mut dec = LengthPrefixedDecoder::new(1024);
        dec.feed(&encode(b"one"));
        dec.feed(&encode(b"two"));
        assert_eq!(dec.next_message().unwrap().unwrap(), b"one");
        assert_eq!(dec.next_message().unwrap().unwrap(), b"two");
        assert!(dec.next_message().unwrap().is_none());
    }

    #[test]
    fn rejects_oversize_message() {
        let mut dec = LengthPrefixedDecoder::new(4);
        dec.feed(&encode(b"too long"));
        let err = dec.next_message().unwrap_err();
        assert!(matches!(err, DecodeError::OversizeMessage { len: 8, cap: 4 }));
    }
}
