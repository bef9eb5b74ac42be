//! `Reactor`: the single selector thread that multiplexes non-blocking I/O
//! across every connection a process has open, the way the teacher's own
//! `PollingStream` drives one socket -- generalized here to own many.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use mio::{Events, Poll, Token};
use tracing::{debug, error, info};

use crate::error::CallError;
use crate::policy::ClientPolicy;
use crate::transport::{ClientEvent, ReactorClient, TransportConfig, TransportKind};

const WAKE_TOKEN: Token = Token(usize::MAX);
/// How often `performAction` fires even with nothing else to do, bounding
/// how late an overdue heartbeat can be noticed.
const MAX_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Identifies one connection owned by a [`Reactor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(usize);

impl ClientId {
    /// Construct an arbitrary `ClientId` for unit tests that exercise the
    /// tracker/client glue without a real `Reactor`.
    #[cfg(test)]
    pub(crate) fn for_test(n: usize) -> Self {
        ClientId(n)
    }
}

/// Callback invoked on the reactor thread whenever a client produces a
/// message or disconnects. Kept deliberately synchronous and cheap: the
/// facade layer (`JsonRpcClient`/tracker) is expected to do O(1) map work
/// and return.
pub type EventSink = Arc<dyn Fn(ClientId, ClientEvent) + Send + Sync>;

type Task = Box<dyn FnOnce(&mut Inner) + Send>;

struct Tracked {
    client: ReactorClient,
    policy: ClientPolicy,
    sink: EventSink,
}

struct Inner {
    poll: Poll,
    clients: HashMap<Token, Tracked>,
    next_token: usize,
    id_to_token: HashMap<ClientId, Token>,
}

/// A single-threaded event loop: registers clients, runs scheduled tasks,
/// and drives per-client `process`/`perform_action` on readiness and on a
/// bounded timer.
///
/// Cloning a `Reactor` handle is cheap and shares the same background
/// thread; dropping the last handle does not stop the thread -- call
/// [`shutdown`](Self::shutdown) explicitly.
#[derive(Clone)]
pub struct Reactor {
    tasks: Arc<Mutex<VecDeque<Task>>>,
    waker: Arc<mio::Waker>,
    shutdown: Arc<AtomicBool>,
    next_id: Arc<AtomicUsize>,
    thread: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Reactor {
    /// Start the reactor thread.
    pub fn start() -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(mio::Waker::new(poll.registry(), WAKE_TOKEN)?);
        let tasks: Arc<Mutex<VecDeque<Task>>> = Arc::new(Mutex::new(VecDeque::new()));
        let shutdown = Arc::new(AtomicBool::new(false));

        let inner = Inner {
            poll,
            clients: HashMap::new(),
            next_token: 0,
            id_to_token: HashMap::new(),
        };

        let thread_tasks = tasks.clone();
        let thread_shutdown = shutdown.clone();
        let handle = std::thread::Builder::new()
            .name("vagent-rpc-reactor".into())
            .spawn(move || run_loop(inner, thread_tasks, thread_shutdown))?;

        Ok(Self {
            tasks,
            waker,
            shutdown,
            next_id: Arc::new(AtomicUsize::new(0)),
            thread: Arc::new(Mutex::new(Some(handle))),
        })
    }

    /// Enqueue a task to run on the reactor thread and wake it. Returns
    /// immediately; never touches a socket itself.
    fn queue_future(&self, task: Task) {
        self.tasks.lock().expect("task queue mutex poisoned").push_back(task);
        let _ = self.waker.wake();
    }

    /// Create a client and schedule its connection. Thread-safe; does not
    /// block on the actual socket connect.
    pub fn create_client(
        &self,
        kind: TransportKind,
        host: String,
        port: u16,
        config: TransportConfig,
        policy: ClientPolicy,
        sink: EventSink,
    ) -> ClientId {
        let id = ClientId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.queue_future(Box::new(move |inner| {
            let token = Token(inner.next_token);
            inner.next_token += 1;
            let mut client = ReactorClient::new(kind, host, port, config);
            if let Err(e) = client.begin_connect() {
                sink(id, ClientEvent::Disconnected(e));
                return;
            }
            if let Err(e) = client.register(inner.poll.registry(), token) {
                sink(id, ClientEvent::Disconnected(CallError::ConnectionFailed(Arc::new(e))));
                return;
            }
            inner.clients.insert(
                token,
                Tracked {
                    client,
                    policy,
                    sink,
                },
            );
            inner.id_to_token.insert(id, token);
        }));
        id
    }

    /// Append an already-encoded payload to a client's outbound queue.
    /// Enqueue-only: returns immediately without waiting for the write.
    pub fn send_message(&self, id: ClientId, payload: Vec<u8>) {
        self.queue_future(Box::new(move |inner| {
            if let Some(token) = inner.id_to_token.get(&id).copied() {
                if let Some(tracked) = inner.clients.get_mut(&token) {
                    if let Err(_e) = tracked.client.send_message(&payload) {
                        (tracked.sink)(
                            id,
                            ClientEvent::Disconnected(CallError::ConnectionLost(
                                crate::error::WireError::connection_closed("outbound queue full"),
                            )),
                        );
                    }
                }
            }
        }));
    }

    /// Tear down and re-dial an already-registered client's socket in
    /// place, keeping its `ClientId`, policy, and `EventSink` -- used by the
    /// tracker's retry sweep when a call's `resetConnection` flag says the
    /// existing connection should not just be resent on, but cycled first.
    /// A no-op if the client has already been closed and reaped.
    pub fn reconnect_client(&self, id: ClientId) {
        self.queue_future(Box::new(move |inner| {
            let Some(token) = inner.id_to_token.get(&id).copied() else {
                return;
            };
            let registry = inner.poll.registry();
            let Some(tracked) = inner.clients.get_mut(&token) else {
                return;
            };
            tracked.client.deregister(registry);
            tracked.client.close();
            if let Err(e) = tracked.client.begin_connect() {
                (tracked.sink)(id, ClientEvent::Disconnected(e));
                return;
            }
            if let Err(e) = tracked.client.register(registry, token) {
                (tracked.sink)(id, ClientEvent::Disconnected(CallError::ConnectionFailed(Arc::new(e))));
            }
        }));
    }

    /// Schedule a disconnect; the client's `EventSink` observes a
    /// `ClientClosed`-flavored disconnect once it runs.
    pub fn close_client(&self, id: ClientId) {
        self.queue_future(Box::new(move |inner| {
            if let Some(token) = inner.id_to_token.remove(&id) {
                if let Some(mut tracked) = inner.clients.remove(&token) {
                    tracked.client.deregister(inner.poll.registry());
                    tracked.client.close();
                    (tracked.sink)(id, ClientEvent::Disconnected(CallError::ClientClosed));
                }
            }
        }));
    }

    /// Unblock the selector immediately (used by the tracker to re-check
    /// deadlines without waiting for the next poll timeout).
    pub fn wakeup(&self) {
        let _ = self.waker.wake();
    }

    /// Drain pending tasks, disconnect every registered client, and stop
    /// the reactor thread. Blocks until the thread exits.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let _ = self.waker.wake();
        if let Some(handle) = self.thread.lock().expect("reactor thread mutex poisoned").take() {
            let _ = handle.join();
        }
    }
}

use std::io;

fn run_loop(mut inner: Inner, tasks: Arc<Mutex<VecDeque<Task>>>, shutdown: Arc<AtomicBool>) {
    let mut events = Events::with_capacity(1024);
    info!("reactor loop starting");

    while !shutdown.load(Ordering::SeqCst) {
        drain_tasks(&mut inner, &tasks);

        let timeout = MAX_POLL_INTERVAL;
        if let Err(e) = inner.poll.poll(&mut events, Some(timeout)) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            error!(error = %e, "reactor poll failed");
            continue;
        }

        let now = Instant::now();

        // Every open client is processed on every tick, not only the ones
        // mio reported ready: `processIncoming`'s read is non-blocking and
        // cheaply no-ops on `WouldBlock`, and the incoming-heartbeat check
        // lives inside `process()` -- a client that never becomes readable
        // again (a peer that opened and then fell silent) still needs its
        // heartbeat clock checked at least once per `MAX_POLL_INTERVAL`.
        let tokens: Vec<Token> = inner.clients.keys().copied().collect();
        for token in &tokens {
            process_one(&mut inner, *token, now);
        }

        let tokens: Vec<Token> = inner.clients.keys().copied().collect();
        for token in tokens {
            if let Some(tracked) = inner.clients.get_mut(&token) {
                tracked.client.perform_action(now, tracked.policy.outgoing_heartbeat());
            }
        }

        reap_closed(&mut inner);
    }

    drain_tasks(&mut inner, &tasks);
    let tokens: Vec<Token> = inner.clients.keys().copied().collect();
    for token in tokens {
        if let Some(mut tracked) = inner.clients.remove(&token) {
            tracked.client.deregister(inner.poll.registry());
            tracked.client.close();
            (tracked.sink)(
                client_id_for_token(&inner, token),
                ClientEvent::Disconnected(CallError::ClientClosed),
            );
        }
    }
    info!("reactor loop stopped");
}

fn client_id_for_token(inner: &Inner, token: Token) -> ClientId {
    inner
        .id_to_token
        .iter()
        .find(|(_, t)| **t == token)
        .map(|(id, _)| *id)
        .unwrap_or(ClientId(usize::MAX))
}

fn process_one(inner: &mut Inner, token: Token, now: Instant) {
    // Resolve the id first: `client_id_for_token` needs an immutable borrow
    // of all of `inner`, which can't overlap the mutable borrow of
    // `inner.clients` that `tracked` holds below.
    let id = client_id_for_token(inner, token);
    let Some(tracked) = inner.clients.get_mut(&token) else {
        return;
    };
    let events = tracked.client.process(now, tracked.policy.incoming_heartbeat());
    let sink = tracked.sink.clone();
    for event in events {
        sink(id, event);
    }
}

fn reap_closed(inner: &mut Inner) {
    let closed: Vec<Token> = inner
        .clients
        .iter()
        .filter(|(_, t)| t.client.state() == crate::transport::ConnState::Closed)
        .map(|(token, _)| *token)
        .collect();
    for token in closed {
        if let Some(mut tracked) = inner.clients.remove(&token) {
            tracked.client.deregister(inner.poll.registry());
            debug!("reaped closed client");
        }
        inner.id_to_token.retain(|_, t| *t != token);
    }
}

fn drain_tasks(inner: &mut Inner, tasks: &Arc<Mutex<VecDeque<Task>>>) {
    loop {
        let task = tasks.lock().expect("task queue mutex poisoned").pop_front();
        match task {
            Some(task) => task(inner),
            None => break,
        }
    }
}
