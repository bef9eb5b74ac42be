//! Crate-wide error types.
//!
//! Errors are layered the way the teacher crate layers its `ShutdownError` /
//! `ConnectError` / `ProtoError` hierarchy: a low-level IO/JSON failure gets
//! wrapped in `Arc` (via [`define_from_for_arc!`]) so that the *same* error
//! value can be cloned out to every in-flight call during issue dispatch,
//! and a higher-level enum names which part of the protocol fell over.

use std::{io, sync::Arc};

use crate::util::define_from_for_arc;

/// A JSON-RPC error code, either a standard one or one from our
/// implementation-defined internal range.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RpcErrorCode(pub i64);

impl RpcErrorCode {
    /// "Invalid JSON was received by the server."
    pub const PARSE_ERROR: RpcErrorCode = RpcErrorCode(-32700);
    /// "The JSON sent is not a valid Request object."
    pub const INVALID_REQUEST: RpcErrorCode = RpcErrorCode(-32600);
    /// "The method does not exist / is not available."
    pub const METHOD_NOT_FOUND: RpcErrorCode = RpcErrorCode(-32601);
    /// "Invalid method parameter(s)."
    pub const INVALID_PARAMS: RpcErrorCode = RpcErrorCode(-32602);
    /// "Internal JSON-RPC error."
    pub const INTERNAL_ERROR: RpcErrorCode = RpcErrorCode(-32603);
    /// Implementation-defined: a call was abandoned after exhausting its retries.
    pub const CALL_TIMEOUT: RpcErrorCode = RpcErrorCode(-32001);
    /// Implementation-defined: the connection carrying this call was lost.
    pub const CONNECTION_CLOSED: RpcErrorCode = RpcErrorCode(-32002);
}

impl std::fmt::Display for RpcErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An error reported by the remote peer, or synthesized locally for a
/// protocol-level fault (timeout, lost connection, and so on).
#[derive(Clone, Debug, PartialEq, thiserror::Error, serde::Deserialize, serde::Serialize)]
#[error("rpc error {code}: {message}")]
pub struct WireError {
    /// The error code.
    pub code: RpcErrorCode,
    /// A human-readable message.
    pub message: String,
    /// Optional structured data accompanying the error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl serde::Serialize for RpcErrorCode {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_i64(self.0)
    }
}
impl<'de> serde::Deserialize<'de> for RpcErrorCode {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        Ok(RpcErrorCode(i64::deserialize(d)?))
    }
}

impl WireError {
    /// Construct the error payload for an exhausted-retries timeout.
    pub fn call_timeout(request_id: &str) -> Self {
        WireError {
            code: RpcErrorCode::CALL_TIMEOUT,
            message: format!("call timed out after exhausting retries (request id {request_id})"),
            data: None,
        }
    }

    /// Construct the error payload delivered to calls whose connection closed.
    pub fn connection_closed(reason: &str) -> Self {
        WireError {
            code: RpcErrorCode::CONNECTION_CLOSED,
            message: format!("connection closed: {reason}"),
            data: None,
        }
    }
}

/// An error that can terminate an in-flight [`Call`](crate::client::Call).
///
/// This is the error type that a caller's future resolves to. It is `Clone`
/// so the tracker can hand the same value to every call affected by a single
/// fatal connection event (issue dispatch).
#[derive(Clone, Debug, thiserror::Error)]
#[non_exhaustive]
pub enum CallError {
    /// The socket could not be opened, or its handshake (TLS/WebSocket) failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(#[source] Arc<io::Error>),

    /// The connection was lost mid-session (IO error, heartbeat expiry, or
    /// the remote peer sent a fatal protocol-level error).
    #[error("connection lost: {0}")]
    ConnectionLost(WireError),

    /// Retries were exhausted without a response.
    #[error("call timed out: {0}")]
    CallTimeout(WireError),

    /// The client was closed by the caller, or by a `Reactor::shutdown()`.
    #[error("client closed")]
    ClientClosed,
}
define_from_for_arc!(io::Error => CallError [ConnectionFailed]);

/// A synchronous failure returned directly from [`JsonRpcClient::call`](crate::client::JsonRpcClient::call)
/// or [`JsonRpcClient::batch_call`](crate::client::JsonRpcClient::batch_call), before any tracker
/// entry observes the request.
#[derive(Clone, Debug, thiserror::Error)]
#[non_exhaustive]
pub enum SubmitError {
    /// We could not serialize the request to JSON.
    #[error("could not encode request: {0}")]
    EncodingFault(#[source] Arc<serde_json::Error>),

    /// A request with this id is already registered with the tracker.
    #[error("request id already in flight")]
    RequestAlreadyInFlight,

    /// The client is already `Closed`; submitting would just sit in the
    /// tracker until the retry budget expired for no reason, since nothing
    /// will ever deliver it.
    #[error("client connection failed: {0}")]
    ClientConnectionFailed(CallError),
}
define_from_for_arc!(serde_json::Error => SubmitError [EncodingFault]);

/// An error raised while appending a message to a client's outbound queue.
#[derive(Clone, Debug, thiserror::Error)]
#[non_exhaustive]
pub enum SendError {
    /// The client is `Closed` and policy does not allow an implicit reconnect.
    #[error("client connection failed: not open and reconnect is not permitted")]
    ClientConnectionFailed,

    /// The outbound queue has reached its configured byte cap.
    ///
    /// The reactor thread must never block on a slow caller, so once the
    /// queue is full we fail fast instead of buffering without bound.
    #[error("outbound queue is full")]
    QueueFull,
}

/// An error produced while decoding bytes off the wire into whole messages.
///
/// Always fatal to the connection: the decoder has lost synchronization
/// with the stream and cannot be trusted to find a message boundary again.
#[derive(Clone, Debug, thiserror::Error)]
#[non_exhaustive]
pub enum DecodeError {
    /// The stream claimed a message longer than the configured maximum.
    #[error("oversize message: {len} bytes exceeds cap of {cap} bytes")]
    OversizeMessage {
        /// The length claimed by the frame.
        len: usize,
        /// The configured cap.
        cap: usize,
    },

    /// The payload was not valid UTF-8.
    #[error("payload was not valid utf-8")]
    InvalidUtf8,

    /// A WebSocket-level protocol violation (bad frame, bad close code, etc).
    #[error("websocket protocol violation: {0}")]
    WebSocketProtocol(String),
}

/// The terminal outcome of a [`Call`](crate::tracker::Call): either the peer
/// answered with a JSON-RPC error object (a normal, addressed reply), or the
/// call never got a reply at all because something went wrong with the
/// connection or the retry budget.
#[derive(Clone, Debug, thiserror::Error)]
#[non_exhaustive]
pub enum CallFailure {
    /// The peer replied to this specific request id with an `error` object.
    #[error(transparent)]
    Rpc(#[from] WireError),

    /// No reply was ever addressed to this request id: the connection was
    /// lost, the call timed out, or the client was closed.
    #[error(transparent)]
    Call(#[from] CallError),
}

/// An error while validating or constructing a [`ClientPolicy`](crate::policy::ClientPolicy).
#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum PolicyError {
    /// `retry_timeout` must be nonzero.
    #[error("retry_timeout must be greater than zero")]
    ZeroRetryTimeout,

    /// A configured heartbeat interval was zero instead of `None`.
    #[error("heartbeat interval must be greater than zero, or omitted entirely")]
    ZeroHeartbeat,
}
