//! Inbound response parsing.

use serde::Deserialize;

use crate::error::WireError;

use super::RequestId;

/// A single parsed JSON-RPC 2.0 response.
///
/// `id` is `None` both for a response whose `id` field was JSON `null` --
/// which per the protocol means the server could not associate the error
/// with any particular request, and must be dispatched to every in-flight
/// call on the connection -- and is otherwise `Some` for a normal reply.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundResponse {
    pub id: Option<RequestId>,
    pub outcome: ResponseOutcome,
}

/// The payload half of a response: either a result value or an error.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseOutcome {
    Success(serde_json::Value),
    Error(WireError),
}

/// Wire shape used only for deserialization; JSON-RPC's `result`/`error`
/// mutual exclusivity isn't expressible as an ordinary struct.
#[derive(Deserialize)]
struct RawResponse {
    #[serde(default)]
    id: Option<RequestId>,
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<WireError>,
}

/// An error while decoding a parsed JSON value as a JSON-RPC response.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum ResponseParseError {
    /// Neither `result` nor `error` was present, or both were.
    #[error("response must contain exactly one of `result` or `error`")]
    AmbiguousOutcome,

    /// The JSON did not even have the shape of an object.
    #[error("malformed response: {0}")]
    Malformed(#[source] std::sync::Arc<serde_json::Error>),
}
crate::util::define_from_for_arc!(serde_json::Error => ResponseParseError [Malformed]);

impl InboundResponse {
    /// Parse one response object from its already-decoded JSON text.
    pub fn from_json(text: &str) -> Result<Self, ResponseParseError> {
        let raw: RawResponse = serde_json::from_str(text)?;
        let outcome = match (raw.result, raw.error) {
            (Some(result), None) => ResponseOutcome::Success(result),
            (None, Some(error)) => ResponseOutcome::Error(error),
            _ => return Err(ResponseParseError::AmbiguousOutcome),
        };
        Ok(InboundResponse { id: raw.id, outcome })
    }

    /// True if this response's id is JSON `null`: a connection-wide fault
    /// that must be fanned out to every call in flight on this client.
    pub fn is_issue_dispatch(&self) -> bool {
        self.id.is_none()
    }
}

/// Parse one decoded message as either a single response or a batch
/// (a JSON array of responses).
pub fn parse_message(text: &str) -> Result<Vec<InboundResponse>, ResponseParseError> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    match value {
        serde_json::Value::Array(items) => items
            .into_iter()
            .map(|item| InboundResponse::from_json(&item.to_string()))
            .collect(),
        other => Ok(vec![InboundResponse::from_json(&other.to_string())?]),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_success() {
        let resp = InboundResponse::from_json(r#"{"jsonrpc":"2.0","id":"3","result":{"ok":true}}"#).unwrap();
        assert_eq!(resp.id, Some(RequestId::String("3".into())));
        assert_eq!(resp.outcome, ResponseOutcome::Success(serde_json::json!({"ok": true})));
    }

    #[test]
    fn parses_error() {
        let resp = InboundResponse::from_json(
            r#"{"jsonrpc":"2.0","id":"3","error":{"code":-32601,"message":"no such method"}}"#,
        )
        .unwrap();
        assert!(matches!(resp.outcome, ResponseOutcome::Error(_)));
    }

    #[test]
    fn null_id_is_issue_dispatch() {
        let resp = InboundResponse::from_json(
            r#"{"jsonrpc":"2.0","id":null,"error":{"code":-32700,"message":"parse error"}}"#,
        )
        .unwrap();
        assert!(resp.is_issue_dispatch());
    }

    #[test]
    fn rejects_both_result_and_error() {
        let err = InboundResponse::from_json(
            r#"{"jsonrpc":"2.0","id":"1","result":1,"error":{"code":1,"message":"x"}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ResponseParseError::AmbiguousOutcome));
    }

    #[test]
    fn parses_batch() {
        let responses = parse_message(
            r#"[{"jsonrpc":"2.0","id":"1","result":1},{"jsonrpc":"2.0","id":"2","result":2}]"#,
        )
        .unwrap();
        assert_eq!(responses.len(), 2);
    }
}
