//! `ResponseTracker`: correlates outgoing requests with incoming responses
//! by id, enforces per-call timeouts, retries according to policy, and
//! completes caller-visible [`Call`]/[`BatchCall`] handles.
//!
//! Modeled on the teacher's `Receiver` (`arti-rpc-client-core::conn::connimpl`):
//! a single mutex-guarded map from request id to pending state, with waiters
//! blocking on a condvar rather than polling. The teacher has its reading
//! thread double as the liveness mechanism; here that role is split out into
//! a dedicated sweep thread because responses arrive on the *reactor*
//! thread (shared across every client) rather than being read inline by
//! whichever caller happens to be waiting.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::{CallError, CallFailure, WireError};
use crate::msgs::request::{IdGenerator, OutboundRequest};
use crate::msgs::RequestId;
use crate::policy::{ClientPolicy, RetryContext};
use crate::reactor::{ClientId, Reactor};
use crate::util::Deadline;

/// The value a [`Call`] or one slot of a [`BatchCall`] eventually resolves
/// to: the peer's `result` value, or a [`CallFailure`] describing why no
/// result ever arrived.
pub type CallResult = Result<serde_json::Value, CallFailure>;

/// Latched single-assignment state shared between a [`Call`] and the
/// tracker entry that will eventually complete it.
pub(crate) struct SingleCallState {
    result: Mutex<Option<CallResult>>,
    cv: Condvar,
}

impl SingleCallState {
    fn new() -> Self {
        Self {
            result: Mutex::new(None),
            cv: Condvar::new(),
        }
    }

    /// Set the result if this call hasn't already terminated. Returns
    /// `true` if this call just transitioned to terminal.
    fn complete(&self, result: CallResult) -> bool {
        let mut guard = self.result.lock().expect("call mutex poisoned");
        if guard.is_some() {
            return false;
        }
        *guard = Some(result);
        self.cv.notify_all();
        true
    }

    fn is_done(&self) -> bool {
        self.result.lock().expect("call mutex poisoned").is_some()
    }
}

/// Shared state for a batch of requests sent together: each constituent
/// request completes its own slot independently; the batch as a whole is
/// done once every slot has a result.
pub(crate) struct BatchCallState {
    ids: Vec<RequestId>,
    slots: Mutex<Vec<Option<CallResult>>>,
    pending: AtomicUsize,
    cv: Condvar,
}

impl BatchCallState {
    fn new(ids: Vec<RequestId>) -> Self {
        let n = ids.len();
        Self {
            ids,
            slots: Mutex::new(vec![None; n]),
            pending: AtomicUsize::new(n),
            cv: Condvar::new(),
        }
    }

    fn complete_index(&self, index: usize, result: CallResult) -> bool {
        let mut guard = self.slots.lock().expect("batch mutex poisoned");
        if guard[index].is_some() {
            return false;
        }
        guard[index] = Some(result);
        drop(guard);
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.cv.notify_all();
        }
        true
    }

    fn is_index_done(&self, index: usize) -> bool {
        self.slots.lock().expect("batch mutex poisoned")[index].is_some()
    }
}

/// A single in-flight request, returned by [`JsonRpcClient::call`](crate::client::JsonRpcClient::call).
///
/// Retries happen transparently underneath this handle: the same `Call` is
/// used across every attempt, so a caller never observes a retry, only the
/// eventual terminal [`CallResult`].
pub struct Call {
    inner: Arc<SingleCallState>,
    request_id: RequestId,
}

impl Call {
    /// The request id this call was submitted under. If the call has since
    /// been retried, this is the *original* id; the tracker internally
    /// re-keys retried requests under fresh ids, invisibly to the caller.
    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    /// True if a result has already arrived.
    pub fn is_done(&self) -> bool {
        self.inner.is_done()
    }

    /// Block the calling thread until this call reaches a terminal state.
    pub fn wait(self) -> CallResult {
        let guard = self.inner.result.lock().expect("call mutex poisoned");
        let mut guard = self
            .inner
            .cv
            .wait_while(guard, |r| r.is_none())
            .expect("call mutex poisoned");
        guard.take().expect("condvar only wakes once a result is set")
    }
}

/// A batch of requests submitted together, returned by
/// [`JsonRpcClient::batch_call`](crate::client::JsonRpcClient::batch_call).
///
/// Resolves to one [`CallResult`] per input request, ordered to match the
/// order requests were given to `batch_call` -- regardless of the order in
/// which the peer's responses actually arrive.
pub struct BatchCall {
    inner: Arc<BatchCallState>,
}

impl BatchCall {
    /// The request ids in this batch, in submission order.
    pub fn ids(&self) -> &[RequestId] {
        &self.inner.ids
    }

    /// Block until every request in the batch has a terminal result, and
    /// return them indexed by submission order (not arrival order).
    pub fn wait(self) -> Vec<CallResult> {
        let guard = self.inner.slots.lock().expect("batch mutex poisoned");
        let mut guard = self
            .inner
            .cv
            .wait_while(guard, |_| self.inner.pending.load(Ordering::SeqCst) > 0)
            .expect("batch mutex poisoned");
        guard
            .iter_mut()
            .map(|slot| slot.take().expect("batch complete implies every slot filled"))
            .collect()
    }
}

/// Which kind of caller-visible handle a tracked request id ultimately
/// completes: a lone [`Call`], or one numbered slot of a [`BatchCall`].
pub(crate) enum CallSlot {
    Single(Arc<SingleCallState>),
    Batch(Arc<BatchCallState>, usize),
}

impl CallSlot {
    fn complete(&self, result: CallResult) -> bool {
        match self {
            CallSlot::Single(s) => s.complete(result),
            CallSlot::Batch(b, idx) => b.complete_index(*idx, result),
        }
    }

    fn is_done(&self) -> bool {
        match self {
            CallSlot::Single(s) => s.is_done(),
            CallSlot::Batch(b, idx) => b.is_index_done(*idx),
        }
    }
}

/// Build a fresh (slot, public-handle) pair for a single call.
pub(crate) fn new_single_slot() -> (CallSlot, Arc<SingleCallState>) {
    let state = Arc::new(SingleCallState::new());
    (CallSlot::Single(state.clone()), state)
}

pub(crate) fn call_handle(inner: Arc<SingleCallState>, request_id: RequestId) -> Call {
    Call { inner, request_id }
}

/// Build a fresh batch of slots sharing one `BatchCallState`.
pub(crate) fn new_batch(ids: Vec<RequestId>) -> (Arc<BatchCallState>, Vec<CallSlot>) {
    let state = Arc::new(BatchCallState::new(ids));
    let slots = (0..state.ids.len())
        .map(|idx| CallSlot::Batch(state.clone(), idx))
        .collect();
    (state, slots)
}

pub(crate) fn batch_handle(inner: Arc<BatchCallState>) -> BatchCall {
    BatchCall { inner }
}

/// A retry record: everything the sweep needs to resend a request and
/// re-arm its deadline, without reaching back into the `JsonRpcClient` that
/// created it.
pub(crate) struct ResponseTracking {
    pub request: OutboundRequest,
    pub retry: RetryContext,
    pub retry_timeout: Duration,
    pub deadline: Deadline,
    pub client: ClientId,
    pub reactor: Reactor,
    pub id_gen: Arc<IdGenerator>,
    /// Whether each retry should reconnect the client before resending,
    /// rather than simply resending on the existing connection. Copied from
    /// [`ClientPolicy::reset_connection_on_retry`] at construction time.
    pub reset_connection: bool,
}

impl ResponseTracking {
    pub(crate) fn new(request: OutboundRequest, policy: &ClientPolicy, client: ClientId, reactor: Reactor, id_gen: Arc<IdGenerator>, now: Instant) -> Self {
        Self {
            request,
            retry: RetryContext::new(policy),
            retry_timeout: policy.retry_timeout(),
            deadline: Deadline::after(now, policy.retry_timeout()),
            client,
            reactor,
            id_gen,
            reset_connection: policy.reset_connection_on_retry(),
        }
    }
}

struct TrackerState {
    calls_by_id: HashMap<RequestId, CallSlot>,
    tracking_by_request: HashMap<RequestId, ResponseTracking>,
}

struct TrackerInner {
    state: Mutex<TrackerState>,
    shutdown: AtomicBool,
}

/// How often the sweep thread re-examines the tracking table for expired
/// deadlines. Bounds how late an overdue retry or timeout is noticed.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Background timekeeper shared across every [`JsonRpcClient`](crate::client::JsonRpcClient)
/// that cares to register with it: indexes in-flight calls by id, enforces
/// timeouts, triggers retries, and completes abandoned calls with an error.
///
/// Cloning a `ResponseTracker` is cheap and shares the same background
/// thread and state, mirroring [`Reactor`]'s handle semantics.
#[derive(Clone)]
pub struct ResponseTracker {
    inner: Arc<TrackerInner>,
    thread: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl ResponseTracker {
    /// Start the sweep thread.
    pub fn start() -> Self {
        let inner = Arc::new(TrackerInner {
            state: Mutex::new(TrackerState {
                calls_by_id: HashMap::new(),
                tracking_by_request: HashMap::new(),
            }),
            shutdown: AtomicBool::new(false),
        });
        let thread_inner = inner.clone();
        let handle = std::thread::Builder::new()
            .name("vagent-rpc-tracker".into())
            .spawn(move || run_sweep_loop(thread_inner))
            .expect("failed to spawn tracker thread");
        Self {
            inner,
            thread: Arc::new(Mutex::new(Some(handle))),
        }
    }

    /// Register a request id's [`CallSlot`] before sending it. Fails
    /// synchronously with [`RequestAlreadyInFlight`](crate::error::SubmitError::RequestAlreadyInFlight)
    /// if the id is already tracked, without mutating any state.
    pub(crate) fn register_call(&self, id: RequestId, slot: CallSlot) -> Result<(), crate::error::SubmitError> {
        let mut state = self.inner.state.lock().expect("tracker mutex poisoned");
        if state.calls_by_id.contains_key(&id) {
            return Err(crate::error::SubmitError::RequestAlreadyInFlight);
        }
        state.calls_by_id.insert(id, slot);
        Ok(())
    }

    /// Undo a [`register_call`](Self::register_call) that will never get a
    /// tracking entry installed (used to roll back the earlier half of a
    /// batch when a later id in the same batch turns out to be a duplicate).
    pub(crate) fn remove_call(&self, id: &RequestId) {
        self.inner.state.lock().expect("tracker mutex poisoned").calls_by_id.remove(id);
    }

    /// Install the retry/timeout bookkeeping for a request id that has
    /// already been registered and sent. Installed unconditionally, even if
    /// the send itself failed: the timeout sweep is what drives the
    /// caller-visible completion in that case.
    pub(crate) fn install_tracking(&self, id: RequestId, tracking: ResponseTracking) {
        self.inner.state.lock().expect("tracker mutex poisoned").tracking_by_request.insert(id, tracking);
    }

    /// A response with a known, non-null id arrived: remove its tracking
    /// entry and complete the call it belongs to.
    pub(crate) fn complete(&self, id: &RequestId, result: CallResult) {
        let slot = {
            let mut state = self.inner.state.lock().expect("tracker mutex poisoned");
            state.tracking_by_request.remove(id);
            state.calls_by_id.remove(id)
        };
        if let Some(slot) = slot {
            slot.complete(result);
        }
    }

    /// Issue dispatch: a fatal, connection-wide error (a null-id response,
    /// a decoder fault, or a disconnect) fans out to every call still
    /// in-flight on `client` and clears them.
    pub(crate) fn process_issue(&self, client: ClientId, error: CallError) {
        let slots = {
            let mut state = self.inner.state.lock().expect("tracker mutex poisoned");
            let ids: Vec<RequestId> = state
                .tracking_by_request
                .iter()
                .filter(|(_, t)| t.client == client)
                .map(|(id, _)| id.clone())
                .collect();
            let mut slots = Vec::with_capacity(ids.len());
            for id in &ids {
                state.tracking_by_request.remove(id);
                if let Some(slot) = state.calls_by_id.remove(id) {
                    slots.push(slot);
                }
            }
            slots
        };
        for slot in slots {
            slot.complete(Err(CallFailure::Call(error.clone())));
        }
    }

    /// Stop the sweep thread. In-flight calls are left exactly as they
    /// were; callers are expected to `close()` their `JsonRpcClient`s (which
    /// drives issue dispatch) before tearing down the tracker.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.thread.lock().expect("tracker thread mutex poisoned").take() {
            let _ = handle.join();
        }
    }
}

fn run_sweep_loop(inner: Arc<TrackerInner>) {
    while !inner.shutdown.load(Ordering::SeqCst) {
        std::thread::sleep(POLL_INTERVAL);
        sweep(&inner);
    }
}

fn sweep(inner: &TrackerInner) {
    let now = Instant::now();
    let due: Vec<RequestId> = {
        let state = inner.state.lock().expect("tracker mutex poisoned");
        state
            .tracking_by_request
            .iter()
            .filter(|(_, t)| t.deadline.has_passed(now))
            .map(|(id, _)| id.clone())
            .collect()
    };
    for id in due {
        handle_due(inner, &id, now);
    }
}

fn handle_due(inner: &TrackerInner, id: &RequestId, now: Instant) {
    let mut state = inner.state.lock().expect("tracker mutex poisoned");

    let slot_done = state.calls_by_id.get(id).map(CallSlot::is_done).unwrap_or(true);
    if slot_done {
        state.tracking_by_request.remove(id);
        return;
    }

    let Some(mut tracking) = state.tracking_by_request.remove(id) else {
        return;
    };

    if tracking.retry.can_retry() {
        tracking.retry.consume_attempt();
        let new_id = tracking.id_gen.next_id();
        let new_request = tracking.request.with_id(new_id.clone());
        let Some(slot) = state.calls_by_id.remove(id) else {
            return;
        };
        state.calls_by_id.insert(new_id.clone(), slot);
        tracking.request = new_request.clone();
        tracking.deadline = Deadline::after(now, tracking.retry_timeout);
        let client = tracking.client;
        let reactor = tracking.reactor.clone();
        let reset_connection = tracking.reset_connection;
        state.tracking_by_request.insert(new_id.clone(), tracking);
        drop(state);

        if reset_connection {
            debug!(old_id = %id, new_id = %new_id, "resetting connection before retry");
            reactor.reconnect_client(client);
        }
        debug!(old_id = %id, new_id = %new_id, "retrying call");
        match new_request.to_bytes() {
            Ok(bytes) => reactor.send_message(client, bytes),
            Err(e) => warn!(error = %e, "failed to re-encode retried request"),
        }
    } else {
        let slot = state.calls_by_id.remove(id);
        drop(state);
        warn!(request_id = %id, "call timed out after exhausting retries");
        if let Some(slot) = slot {
            slot.complete(Err(CallFailure::Call(CallError::CallTimeout(WireError::call_timeout(&id.to_string())))));
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn single_call_latches_first_result() {
        let (slot, inner) = new_single_slot();
        assert!(!slot.is_done());
        assert!(slot.complete(Ok(serde_json::json!("pong"))));
        assert!(slot.is_done());
        // A second completion is ignored (terminal state is latched).
        assert!(!slot.complete(Ok(serde_json::json!("late"))));
        let call = call_handle(inner, RequestId::String("1".into()));
        assert_eq!(call.wait().unwrap(), serde_json::json!("pong"));
    }

    #[test]
    fn batch_completes_once_every_slot_is_filled() {
        let ids = vec![RequestId::String("a".into()), RequestId::String("b".into())];
        let (state, mut slots) = new_batch(ids);
        let b = slots.remove(1);
        let a = slots.remove(0);
        assert!(a.complete(Ok(serde_json::json!(1))));
        assert!(a.is_done());
        assert!(b.complete(Ok(serde_json::json!(2))));
        let batch = batch_handle(state);
        let results: Vec<_> = batch.wait().into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(results, vec![serde_json::json!(1), serde_json::json!(2)]);
    }

    #[test]
    fn duplicate_register_is_rejected_without_mutation() {
        let tracker = ResponseTracker::start();
        let id = RequestId::String("dup".into());
        let (slot1, _inner1) = new_single_slot();
        tracker.register_call(id.clone(), slot1).unwrap();
        let (slot2, _inner2) = new_single_slot();
        let err = tracker.register_call(id.clone(), slot2).unwrap_err();
        assert!(matches!(err, crate::error::SubmitError::RequestAlreadyInFlight));
        tracker.shutdown();
    }
}
