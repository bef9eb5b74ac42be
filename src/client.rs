//! `JsonRpcClient`: thin orchestration over a [`Reactor`]-managed connection
//! and a [`ResponseTracker`]. Encodes requests, registers calls, routes
//! responses, and exposes single and batched call operations returning
//! blocking handles -- the same "futures are just a handle you wait on"
//! shape as the teacher's `RequestHandle`/`RpcConn::execute`.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::{CallError, CallFailure, SubmitError, WireError};
use crate::msgs::request::{IdGenerator, OutboundRequest};
use crate::msgs::response::{parse_message, ResponseOutcome};
use crate::msgs::RequestId;
use crate::policy::ClientPolicy;
use crate::reactor::{ClientId, EventSink, Reactor};
use crate::tracker::{self, BatchCall, Call, ResponseTracker, ResponseTracking};
use crate::transport::{ClientEvent, TransportConfig, TransportKind};

/// Connection-open state tracked from `ReactorClient::process`'s
/// [`ClientEvent::Connected`]/[`ClientEvent::Disconnected`] events, so that
/// [`JsonRpcClient::wait_until_open`] and [`JsonRpcClient::is_open`] don't
/// need to reach onto the reactor thread to answer.
enum ConnState {
    Pending,
    Open,
    Closed(CallError),
}

struct ConnGate {
    state: Mutex<ConnState>,
    cv: Condvar,
}

/// One JSON-RPC connection to a host agent: a `ReactorClient` (owned by a
/// shared [`Reactor`]) plus the id-assignment and call-registration logic
/// that turns raw bytes into tracked, retried, timeout-bound calls.
pub struct JsonRpcClient {
    reactor: Reactor,
    client_id: ClientId,
    tracker: ResponseTracker,
    policy: ClientPolicy,
    ids: Arc<IdGenerator>,
    conn: Arc<ConnGate>,
}

impl JsonRpcClient {
    /// Create a client and ask the reactor to start connecting it
    /// immediately. Call [`wait_until_open`](Self::wait_until_open) to block
    /// until the handshake completes (or fails).
    pub fn connect(
        reactor: &Reactor,
        tracker: &ResponseTracker,
        kind: TransportKind,
        host: impl Into<String>,
        port: u16,
        config: TransportConfig,
        policy: ClientPolicy,
    ) -> Self {
        let conn = Arc::new(ConnGate {
            state: Mutex::new(ConnState::Pending),
            cv: Condvar::new(),
        });
        let sink = make_sink(tracker.clone(), conn.clone());
        let client_id = reactor.create_client(kind, host.into(), port, config, policy, sink);

        Self {
            reactor: reactor.clone(),
            client_id,
            tracker: tracker.clone(),
            policy,
            ids: Arc::new(IdGenerator::new()),
            conn,
        }
    }

    /// Block the calling thread until the socket is `Open`, a fatal
    /// connect/handshake error occurs, or `timeout` elapses, whichever
    /// happens first. Idempotent: returns immediately if already resolved.
    pub fn wait_until_open(&self, timeout: Duration) -> Result<(), CallError> {
        let guard = self.conn.state.lock().expect("conn mutex poisoned");
        let (guard, timed_out) = self
            .conn
            .cv
            .wait_timeout_while(guard, timeout, |s| matches!(*s, ConnState::Pending))
            .expect("conn mutex poisoned");
        match &*guard {
            ConnState::Open => Ok(()),
            ConnState::Closed(e) => Err(e.clone()),
            ConnState::Pending => {
                debug_assert!(timed_out.timed_out());
                Err(CallError::from(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "timed out waiting for connection to open",
                )))
            }
        }
    }

    /// `isOpen()`: true once the transport handshake has completed.
    pub fn is_open(&self) -> bool {
        matches!(&*self.conn.state.lock().expect("conn mutex poisoned"), ConnState::Open)
    }

    /// `isClosed() == !isOpen()`, exposed for symmetry with the source
    /// facade (see the open question recorded in `DESIGN.md`).
    pub fn is_closed(&self) -> bool {
        !self.is_open()
    }

    /// The error that closed this connection, if `ConnGate` has actually
    /// observed a `Disconnected` event. `None` while still `Pending` --
    /// submissions made before the handshake completes are buffered by the
    /// reactor, not rejected.
    fn closed_error(&self) -> Option<CallError> {
        match &*self.conn.state.lock().expect("conn mutex poisoned") {
            ConnState::Closed(e) => Some(e.clone()),
            ConnState::Pending | ConnState::Open => None,
        }
    }

    /// Submit a notification: sent like any other message, but never
    /// tracked, since no response is expected.
    pub fn notify(&self, method: impl Into<String>, params: Option<serde_json::Value>) -> Result<(), SubmitError> {
        let request = OutboundRequest::notification(method, params);
        let bytes = request.to_bytes()?;
        self.reactor.send_message(self.client_id, bytes);
        Ok(())
    }

    /// Submit a call with an automatically assigned, unique request id.
    pub fn call(&self, method: impl Into<String>, params: Option<serde_json::Value>) -> Result<Call, SubmitError> {
        self.call_with_id(self.ids.next_id(), method, params)
    }

    /// Submit a call under a caller-chosen id. Fails synchronously with
    /// [`SubmitError::RequestAlreadyInFlight`] if `id` is already tracked.
    pub fn call_with_id(
        &self,
        id: RequestId,
        method: impl Into<String>,
        params: Option<serde_json::Value>,
    ) -> Result<Call, SubmitError> {
        // A closed client is reaped from the reactor's client table on its
        // next tick, taking its `EventSink` with it: once that happens,
        // `Reactor::send_message` silently no-ops, and a call submitted
        // afterward would otherwise just sit in the tracker until the full
        // retry budget expired instead of failing fast.
        if let Some(err) = self.closed_error() {
            return Err(SubmitError::ClientConnectionFailed(err));
        }

        let request = OutboundRequest::call(id.clone(), method, params);
        let bytes = request.to_bytes()?;

        let (slot, inner) = tracker::new_single_slot();
        self.tracker.register_call(id.clone(), slot)?;

        // Enqueue-only: never blocks, and a failure here doesn't prevent the
        // tracking entry below from being installed -- the timeout sweep
        // drives the user-visible completion in that case (see DESIGN.md).
        self.reactor.send_message(self.client_id, bytes);

        self.tracker.install_tracking(
            id.clone(),
            ResponseTracking::new(request, &self.policy, self.client_id, self.reactor.clone(), self.ids.clone(), Instant::now()),
        );

        Ok(tracker::call_handle(inner, id))
    }

    /// Submit a batch of requests as a single JSON-RPC array. Each request
    /// gets its own tracking entry (and its own retry/timeout lifecycle),
    /// but all of them resolve one shared [`BatchCall`].
    pub fn batch_call(&self, items: Vec<(String, Option<serde_json::Value>)>) -> Result<BatchCall, SubmitError> {
        if let Some(err) = self.closed_error() {
            return Err(SubmitError::ClientConnectionFailed(err));
        }

        let mut ids = Vec::with_capacity(items.len());
        let mut requests = Vec::with_capacity(items.len());
        for (method, params) in items {
            let id = self.ids.next_id();
            requests.push(OutboundRequest::call(id.clone(), method, params));
            ids.push(id);
        }

        let (batch_state, slots) = tracker::new_batch(ids.clone());
        for (idx, (id, slot)) in ids.iter().zip(slots).enumerate() {
            if let Err(e) = self.tracker.register_call(id.clone(), slot) {
                for prev in &ids[..idx] {
                    self.tracker.remove_call(prev);
                }
                return Err(e);
            }
        }

        let bytes = serde_json::to_vec(&requests).map_err(Arc::new).map_err(SubmitError::EncodingFault)?;
        self.reactor.send_message(self.client_id, bytes);

        let now = Instant::now();
        for (id, request) in ids.into_iter().zip(requests) {
            self.tracker.install_tracking(
                id.clone(),
                ResponseTracking::new(request, &self.policy, self.client_id, self.reactor.clone(), self.ids.clone(), now),
            );
        }

        Ok(tracker::batch_handle(batch_state))
    }

    /// Schedule a disconnect. Every in-flight call on this client completes
    /// with [`CallError::ClientClosed`] once the reactor processes it.
    pub fn close(&self) {
        self.reactor.close_client(self.client_id);
    }
}

fn make_sink(tracker: ResponseTracker, conn: Arc<ConnGate>) -> EventSink {
    Arc::new(move |client_id, event| match event {
        ClientEvent::Connected => {
            *conn.state.lock().expect("conn mutex poisoned") = ConnState::Open;
            conn.cv.notify_all();
        }
        ClientEvent::Disconnected(err) => {
            {
                let mut state = conn.state.lock().expect("conn mutex poisoned");
                *state = ConnState::Closed(err.clone());
                conn.cv.notify_all();
            }
            tracker.process_issue(client_id, err);
        }
        ClientEvent::Message(bytes) => route_message(&tracker, client_id, &bytes),
    })
}

/// Decode a message off the wire and hand each response it contains either
/// to issue dispatch (null id) or to the tracker's normal per-id path.
fn route_message(tracker: &ResponseTracker, client_id: ClientId, bytes: &[u8]) {
    let text = match std::str::from_utf8(bytes) {
        Ok(t) => t,
        Err(_) => {
            warn!("dropping non-utf8 message");
            tracker.process_issue(client_id, CallError::ConnectionLost(WireError::connection_closed("non-utf8 message")));
            return;
        }
    };

    let responses = match parse_message(text) {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "malformed response, closing connection");
            tracker.process_issue(client_id, CallError::ConnectionLost(WireError::connection_closed(&e.to_string())));
            return;
        }
    };

    for response in responses {
        if response.is_issue_dispatch() {
            let error = match response.outcome {
                ResponseOutcome::Error(e) => e,
                ResponseOutcome::Success(_) => {
                    WireError::connection_closed("fatal error with null id carried no error payload")
                }
            };
            debug!(code = error.code.0, "issue dispatch from peer");
            tracker.process_issue(client_id, CallError::ConnectionLost(error));
            continue;
        }
        let id = response.id.expect("checked by is_issue_dispatch above");
        let result = match response.outcome {
            ResponseOutcome::Success(v) => Ok(v),
            ResponseOutcome::Error(e) => Err(CallFailure::Rpc(e)),
        };
        tracker.complete(&id, result);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn wire_error_with_null_id_becomes_issue_dispatch() {
        let tracker = ResponseTracker::start();
        let reactor = Reactor::start().expect("reactor starts");
        let (slot, inner) = tracker::new_single_slot();
        let id = RequestId::String("1".into());
        tracker.register_call(id.clone(), slot).unwrap();
        tracker.install_tracking(
            id.clone(),
            ResponseTracking::new(
                OutboundRequest::call(id.clone(), "m", None),
                &ClientPolicy::no_retries(Duration::from_secs(5)),
                ClientId::for_test(0),
                reactor.clone(),
                Arc::new(IdGenerator::new()),
                Instant::now(),
            ),
        );

        route_message(
            &tracker,
            ClientId::for_test(0),
            br#"{"jsonrpc":"2.0","id":null,"error":{"code":-32000,"message":"fatal"}}"#,
        );

        let call = tracker::call_handle(inner, id);
        let result = call.wait();
        assert!(matches!(result, Err(CallFailure::Call(CallError::ConnectionLost(_)))));
        reactor.shutdown();
        tracker.shutdown();
    }
}
