//! Wire encoding and decoding of JSON-RPC 2.0 messages.
//!
//! Every message exchanged with a host agent is either a [`request::OutboundRequest`]
//! we send, or a [`response::InboundResponse`] we receive. Batches are plain
//! JSON arrays of either.

pub(crate) mod request;
pub(crate) mod response;

use serde::{Deserialize, Serialize};

/// An identifier for a request, chosen by the sending [`JsonRpcClient`](crate::client::JsonRpcClient).
///
/// JSON-RPC allows either a string or a number here; we always generate
/// strings (see [`request::IdGenerator`]) but accept either on the wire,
/// since a caller-supplied request may use a numeric id.
#[derive(Serialize, Deserialize, Debug, Clone, Hash, Eq, PartialEq, derive_more::From)]
#[serde(untagged)]
pub enum RequestId {
    /// A numeric request id.
    Number(u64),
    /// A string request id.
    String(String),
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::String(s) => write!(f, "{s}"),
        }
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        RequestId::String(s.to_owned())
    }
}

const JSONRPC_VERSION: &str = "2.0";
