//! Outbound request encoding and request-id generation.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

use super::{RequestId, JSONRPC_VERSION};

/// A JSON-RPC 2.0 request, ready to be serialized onto the wire.
///
/// `id` is `None` for a notification (fire-and-forget; no response is
/// expected and none is tracked).
#[derive(Serialize, Debug, Clone)]
pub struct OutboundRequest {
    jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl OutboundRequest {
    /// Build a request that expects a response.
    pub fn call(id: RequestId, method: impl Into<String>, params: Option<serde_json::Value>) -> Self {
        OutboundRequest {
            jsonrpc: JSONRPC_VERSION,
            id: Some(id),
            method: method.into(),
            params,
        }
    }

    /// Build a notification: no id, no tracked response.
    pub fn notification(method: impl Into<String>, params: Option<serde_json::Value>) -> Self {
        OutboundRequest {
            jsonrpc: JSONRPC_VERSION,
            id: None,
            method: method.into(),
            params,
        }
    }

    /// Rebuild this request with a fresh id, for a retry attempt.
    ///
    /// Per the id-assignment rule, a retried call is sent again as a whole
    /// new request: the request id is never reused across attempts, even
    /// though the tracker's logical [`Call`](crate::client::Call) handle
    /// stays the same.
    pub fn with_id(&self, id: RequestId) -> Self {
        OutboundRequest {
            jsonrpc: self.jsonrpc,
            id: Some(id),
            method: self.method.clone(),
            params: self.params.clone(),
        }
    }

    /// Serialize this request to a JSON byte string.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Generates request ids that are monotonically increasing and unique for
/// the lifetime of a single [`JsonRpcClient`](crate::client::JsonRpcClient).
///
/// Ids are plain decimal strings (`"0"`, `"1"`, `"2"`, ...). A client may be
/// shared across threads, so the counter is atomic rather than `Cell`-based.
#[derive(Debug, Default)]
pub struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    /// Create a generator starting at zero.
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(0),
        }
    }

    /// Produce the next id in sequence.
    pub fn next_id(&self) -> RequestId {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        RequestId::String(n.to_string())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ids_increase_monotonically() {
        let gen = IdGenerator::new();
        assert_eq!(gen.next_id(), RequestId::String("0".into()));
        assert_eq!(gen.next_id(), RequestId::String("1".into()));
        assert_eq!(gen.next_id(), RequestId::String("2".into()));
    }

    #[test]
    fn call_encodes_with_id_and_params() {
        let req = OutboundRequest::call(
            RequestId::String("7".into()),
            "vm.start",
            Some(serde_json::json!({"name": "vm0"})),
        );
        let bytes = req.to_bytes().unwrap();
        let v: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(v["jsonrpc"], "2.0");
        assert_eq!(v["id"], "7");
        assert_eq!(v["method"], "vm.start");
        assert_eq!(v["params"]["name"], "vm0");
    }

    #[test]
    fn notification_omits_id() {
        let req = OutboundRequest::notification("vm.ping", None);
        let bytes = req.to_bytes().unwrap();
        let v: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert!(v.get("id").is_none());
        assert!(v.get("params").is_none());
    }

    #[test]
    fn with_id_preserves_method_and_params_but_changes_id() {
        let first = OutboundRequest::call(RequestId::String("0".into()), "m", Some(serde_json::json!(1)));
        let retried = first.with_id(RequestId::String("1".into()));
        assert_eq!(retried.method, first.method);
        assert_eq!(retried.params, first.params);
        assert_ne!(retried.id, first.id);
    }
}
