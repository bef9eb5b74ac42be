//! End-to-end tests against a plain-TCP mock peer: a real `Reactor` and
//! `JsonRpcClient` talking length-prefixed JSON-RPC to a `std::net`
//! listener on loopback, the way a unit test would exercise the teacher's
//! own `RpcConn` against a local test fixture rather than a live server.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::time::Duration;

use assert_matches::assert_matches;
use serde_json::{json, Value};
use vagent_rpc_core::{CallError, CallFailure, ClientPolicy, JsonRpcClient, Reactor, ResponseTracker, TransportConfig, TransportKind};

/// Read one length-prefixed frame off a blocking stream.
fn read_frame(stream: &mut TcpStream) -> Value {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).expect("read length header");
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).expect("read frame body");
    serde_json::from_slice(&body).expect("frame is valid json")
}

/// Write one value as a length-prefixed frame.
fn write_frame(stream: &mut TcpStream, value: &Value) {
    let body = serde_json::to_vec(value).unwrap();
    let mut out = Vec::with_capacity(4 + body.len());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(&body);
    stream.write_all(&out).expect("write frame");
}

fn listener() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind loopback listener");
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

fn connect_client(reactor: &Reactor, tracker: &ResponseTracker, port: u16, policy: ClientPolicy) -> JsonRpcClient {
    let client = JsonRpcClient::connect(reactor, tracker, TransportKind::Plain, "127.0.0.1", port, TransportConfig::default(), policy);
    client.wait_until_open(Duration::from_secs(5)).expect("connection opens");
    client
}

#[test]
fn simple_echo() {
    let (listener, port) = listener();
    let peer = std::thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("peer accepts");
        let req = read_frame(&mut stream);
        assert_eq!(req["method"], "ping");
        write_frame(&mut stream, &json!({"jsonrpc": "2.0", "id": req["id"], "result": "pong"}));
    });

    let reactor = Reactor::start().expect("reactor starts");
    let tracker = ResponseTracker::start();
    let client = connect_client(&reactor, &tracker, port, ClientPolicy::no_retries(Duration::from_secs(5)));

    let call = client.call("ping", None).expect("submit call");
    let result = call.wait().expect("peer answered");
    assert_eq!(result, json!("pong"));

    peer.join().unwrap();
    client.close();
    reactor.shutdown();
    tracker.shutdown();
}

#[test]
fn batch_resolves_in_submission_order_not_arrival_order() {
    let (listener, port) = listener();
    let peer = std::thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("peer accepts");
        let req = read_frame(&mut stream);
        let items = req.as_array().expect("batch is a json array");
        assert_eq!(items.len(), 2);
        let id_a = items[0]["id"].clone();
        let id_b = items[1]["id"].clone();
        // Reply in reverse order: the client must still hand results back
        // indexed by submission order, not arrival order.
        write_frame(
            &mut stream,
            &json!([
                {"jsonrpc": "2.0", "id": id_b, "result": 2},
                {"jsonrpc": "2.0", "id": id_a, "result": 1},
            ]),
        );
    });

    let reactor = Reactor::start().expect("reactor starts");
    let tracker = ResponseTracker::start();
    let client = connect_client(&reactor, &tracker, port, ClientPolicy::no_retries(Duration::from_secs(5)));

    let batch = client
        .batch_call(vec![("m".to_string(), Some(json!(1))), ("m".to_string(), Some(json!(2)))])
        .expect("submit batch");
    let results: Vec<Value> = batch.wait().into_iter().map(|r| r.unwrap()).collect();
    assert_eq!(results, vec![json!(1), json!(2)]);

    peer.join().unwrap();
    client.close();
    reactor.shutdown();
    tracker.shutdown();
}

#[test]
fn retry_resends_under_a_fresh_id_and_eventually_succeeds() {
    let (listener, port) = listener();
    let peer = std::thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("peer accepts");
        // Drop the first two deliveries (never reply), answer the third.
        let _first = read_frame(&mut stream);
        let _second = read_frame(&mut stream);
        let third = read_frame(&mut stream);
        write_frame(&mut stream, &json!({"jsonrpc": "2.0", "id": third["id"], "result": "ok"}));
    });

    let reactor = Reactor::start().expect("reactor starts");
    let tracker = ResponseTracker::start();
    let policy = ClientPolicy::new(2, Duration::from_millis(300), None, None).unwrap();
    let client = connect_client(&reactor, &tracker, port, policy);

    let call = client.call("m", None).expect("submit call");
    let result = call.wait().expect("peer eventually answered");
    assert_eq!(result, json!("ok"));

    peer.join().unwrap();
    client.close();
    reactor.shutdown();
    tracker.shutdown();
}

#[test]
fn call_times_out_once_retries_are_exhausted() {
    let (listener, port) = listener();
    let peer = std::thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("peer accepts");
        // Read every delivery but never answer any of them.
        for _ in 0..3 {
            let _ = read_frame(&mut stream);
        }
    });

    let reactor = Reactor::start().expect("reactor starts");
    let tracker = ResponseTracker::start();
    let policy = ClientPolicy::new(2, Duration::from_millis(200), None, None).unwrap();
    let client = connect_client(&reactor, &tracker, port, policy);

    let call = client.call("m", None).expect("submit call");
    let err = call.wait().expect_err("never answered, must time out");
    assert_matches!(err, CallFailure::Call(CallError::CallTimeout(_)));

    peer.join().unwrap();
    client.close();
    reactor.shutdown();
    tracker.shutdown();
}

#[test]
fn null_id_error_is_dispatched_to_every_in_flight_call() {
    let (listener, port) = listener();
    let peer = std::thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("peer accepts");
        let _first = read_frame(&mut stream);
        let _second = read_frame(&mut stream);
        write_frame(
            &mut stream,
            &json!({"jsonrpc": "2.0", "id": null, "error": {"code": -32000, "message": "fatal"}}),
        );
    });

    let reactor = Reactor::start().expect("reactor starts");
    let tracker = ResponseTracker::start();
    let client = connect_client(&reactor, &tracker, port, ClientPolicy::no_retries(Duration::from_secs(30)));

    let first = client.call("m", None).expect("submit first call");
    let second = client.call("m", None).expect("submit second call");

    let first_err = first.wait().expect_err("issue dispatch fails every in-flight call");
    let second_err = second.wait().expect_err("issue dispatch fails every in-flight call");
    assert_matches!(first_err, CallFailure::Call(CallError::ConnectionLost(_)));
    assert_matches!(second_err, CallFailure::Call(CallError::ConnectionLost(_)));

    peer.join().unwrap();
    client.close();
    reactor.shutdown();
    tracker.shutdown();
}

#[test]
fn duplicate_id_is_rejected_synchronously_and_first_call_stays_tracked() {
    let (listener, port) = listener();
    let peer = std::thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("peer accepts");
        let req = read_frame(&mut stream);
        write_frame(&mut stream, &json!({"jsonrpc": "2.0", "id": req["id"], "result": "fine"}));
    });

    let reactor = Reactor::start().expect("reactor starts");
    let tracker = ResponseTracker::start();
    let client = connect_client(&reactor, &tracker, port, ClientPolicy::no_retries(Duration::from_secs(5)));

    let id = vagent_rpc_core::RequestId::from("dup");
    let first = client.call_with_id(id.clone(), "m", None).expect("first submission succeeds");
    let err = client.call_with_id(id, "m", None).expect_err("duplicate id rejected");
    assert_matches!(err, vagent_rpc_core::SubmitError::RequestAlreadyInFlight);

    let result = first.wait().expect("original call still resolves normally");
    assert_eq!(result, json!("fine"));

    peer.join().unwrap();
    client.close();
    reactor.shutdown();
    tracker.shutdown();
}

#[test]
fn heartbeat_expiry_disconnects_a_silent_peer() {
    let (listener, port) = listener();
    let peer = std::thread::spawn(move || {
        // Accept and go silent: never reply, never close, for the
        // duration of the test.
        let (_stream, _) = listener.accept().expect("peer accepts");
        std::thread::sleep(Duration::from_secs(3));
    });

    let reactor = Reactor::start().expect("reactor starts");
    let tracker = ResponseTracker::start();
    let policy = ClientPolicy::new(0, Duration::from_secs(30), Some(Duration::from_millis(300)), None).unwrap();
    let client = connect_client(&reactor, &tracker, port, policy);

    let call = client.call("m", None).expect("submit call");
    let err = call.wait().expect_err("heartbeat silence must disconnect the call");
    assert_matches!(err, CallFailure::Call(CallError::ConnectionLost(_)));

    // The client is closed from the peer's perspective, but the caller
    // hasn't touched `client` again yet -- a subsequent `call` must fail
    // fast instead of being silently queued against a client the reactor
    // has already reaped.
    let err = client.call("m2", None).expect_err("call on a closed client must fail synchronously");
    assert_matches!(err, vagent_rpc_core::SubmitError::ClientConnectionFailed(CallError::ConnectionLost(_)));

    client.close();
    reactor.shutdown();
    tracker.shutdown();
    drop(peer); // peer thread times out its own sleep and exits on its own.
}

#[test]
fn peer_eof_is_treated_as_connection_lost() {
    let (listener, port) = listener();
    let peer = std::thread::spawn(move || {
        let (stream, _) = listener.accept().expect("peer accepts");
        // Close the socket immediately without ever replying: a graceful
        // TCP FIN, not a protocol-level error.
        drop(stream);
    });

    let reactor = Reactor::start().expect("reactor starts");
    let tracker = ResponseTracker::start();
    let client = connect_client(&reactor, &tracker, port, ClientPolicy::no_retries(Duration::from_secs(5)));

    let call = client.call("m", None).expect("submit call");
    let err = call.wait().expect_err("peer closed without answering");
    assert_matches!(err, CallFailure::Call(CallError::ConnectionLost(_)));

    peer.join().unwrap();
    client.close();
    reactor.shutdown();
    tracker.shutdown();
}

#[test]
fn reset_connection_on_retry_reconnects_before_resending() {
    let (listener, port) = listener();
    let peer = std::thread::spawn(move || {
        // First connection: accept, read one delivery, then go silent
        // (never answer, never close) so the retry fires.
        let (mut first, _) = listener.accept().expect("peer accepts first connection");
        let _first_req = read_frame(&mut first);

        // The client's retry must reconnect, producing a *second* accept.
        let (mut second, _) = listener.accept().expect("peer accepts reconnection");
        let retried = read_frame(&mut second);
        write_frame(&mut second, &json!({"jsonrpc": "2.0", "id": retried["id"], "result": "ok"}));
    });

    let reactor = Reactor::start().expect("reactor starts");
    let tracker = ResponseTracker::start();
    let policy = ClientPolicy::new(1, Duration::from_millis(300), None, None)
        .unwrap()
        .with_reset_connection_on_retry(true);
    let client = connect_client(&reactor, &tracker, port, policy);

    let call = client.call("m", None).expect("submit call");
    let result = call.wait().expect("retry reconnected and peer answered");
    assert_eq!(result, json!("ok"));

    peer.join().unwrap();
    client.close();
    reactor.shutdown();
    tracker.shutdown();
}
