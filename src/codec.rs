//! Stream framing: turning a byte stream into whole JSON-RPC messages.
//!
//! The two framings this crate supports don't share a byte-level shape --
//! length-prefixed framing is fed raw bytes and handed back whole payloads,
//! while WebSocket framing is handled by `tungstenite` operating directly
//! on the socket -- so each lives in its own module rather than behind one
//! trait. [`DecodeStep`] is the common vocabulary both report back to
//! [`ReactorClient`](crate::transport::ReactorClient).

pub(crate) mod length_prefixed;
pub(crate) mod websocket;

pub use length_prefixed::LengthPrefixedDecoder;

/// Default cap on a single decoded message, shared by both framings unless
/// a caller configures something else.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Outcome of pulling at the next message out of a decoder.
pub enum DecodeStep {
    /// A complete JSON payload is ready.
    Message(Vec<u8>),
    /// The decoder consumed control-frame state (ping/pong) but produced no
    /// application message; the caller should loop again immediately rather
    /// than wait for more socket readiness.
    ControlOnly,
    /// The peer sent a WebSocket close frame: a graceful disconnect, not a
    /// [`DecodeError`](crate::error::DecodeError).
    Closed,
    /// Not enough bytes have arrived yet for another message.
    NeedMoreData,
}
