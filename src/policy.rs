//! Retry, timeout, and heartbeat parameters for a [`JsonRpcClient`](crate::client::JsonRpcClient).

use std::time::Duration;

use crate::error::PolicyError;

/// Immutable retry/heartbeat/timeout parameters, installed on a client at
/// construction time and never changed afterward.
///
/// Validated up front (see [`ClientPolicy::new`]) so that every later
/// consumer -- the tracker's timeout sweep, the reactor's heartbeat tick --
/// can assume the numbers make sense without re-checking them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientPolicy {
    /// Number of retries to attempt after the first try fails to get a
    /// response in time. Zero means "one attempt, no retries".
    retries: u32,
    /// How long to wait for a response (or a retry) before acting again.
    retry_timeout: Duration,
    /// How long the client may go without receiving *anything* from the
    /// peer before we consider the connection dead. `None` disables this.
    incoming_heartbeat: Option<Duration>,
    /// How long the client may go without sending *anything* to the peer
    /// before we must emit a heartbeat frame ourselves. `None` disables this.
    outgoing_heartbeat: Option<Duration>,
    /// Whether a retry should tear down and re-dial the connection before
    /// resending, instead of just resending on the one that's there.
    reset_connection_on_retry: bool,
}

impl ClientPolicy {
    /// Construct and validate a new `ClientPolicy`.
    ///
    /// Returns [`PolicyError`] if `retry_timeout` is zero, or if either
    /// heartbeat interval is `Some(Duration::ZERO)` (use `None` to disable
    /// a heartbeat instead of a zero interval).
    pub fn new(
        retries: u32,
        retry_timeout: Duration,
        incoming_heartbeat: Option<Duration>,
        outgoing_heartbeat: Option<Duration>,
    ) -> Result<Self, PolicyError> {
        if retry_timeout.is_zero() {
            return Err(PolicyError::ZeroRetryTimeout);
        }
        if incoming_heartbeat.is_some_and(Duration::is_zero)
            || outgoing_heartbeat.is_some_and(Duration::is_zero)
        {
            return Err(PolicyError::ZeroHeartbeat);
        }
        Ok(Self {
            retries,
            retry_timeout,
            incoming_heartbeat,
            outgoing_heartbeat,
            reset_connection_on_retry: false,
        })
    }

    /// Opt into reconnecting the underlying socket before every retry,
    /// rather than simply resending on the existing connection. Off by
    /// default: a single unanswered request doesn't imply a bad
    /// connection, only a slow or busy peer.
    pub fn with_reset_connection_on_retry(mut self, reset: bool) -> Self {
        self.reset_connection_on_retry = reset;
        self
    }

    /// Whether retries reconnect before resending.
    pub fn reset_connection_on_retry(&self) -> bool {
        self.reset_connection_on_retry
    }

    /// A policy with no retries and a generous timeout; useful for tests and
    /// quick scripts that don't want to think about retry semantics.
    pub fn no_retries(retry_timeout: Duration) -> Self {
        Self::new(0, retry_timeout, None, None).expect("nonzero timeout, no heartbeats")
    }

    /// Number of retries permitted after the first attempt.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// The retry/initial-attempt timeout.
    pub fn retry_timeout(&self) -> Duration {
        self.retry_timeout
    }

    /// The incoming-heartbeat interval, if enabled.
    pub fn incoming_heartbeat(&self) -> Option<Duration> {
        self.incoming_heartbeat
    }

    /// The outgoing-heartbeat interval, if enabled.
    pub fn outgoing_heartbeat(&self) -> Option<Duration> {
        self.outgoing_heartbeat
    }

    /// Worst-case time a single call may take before it completes with
    /// `CallTimeout`: `retry_timeout * (retries + 1)`.
    pub fn worst_case_call_duration(&self) -> Duration {
        self.retry_timeout * (self.retries + 1)
    }
}

/// Per-attempt counter bound to a [`ClientPolicy`].
///
/// One `RetryContext` is created per [`ResponseTracking`](crate::tracker::ResponseTracking)
/// entry and consumed one attempt at a time as the tracker's timeout sweep
/// decides whether to retry or give up.
#[derive(Debug, Clone, Copy)]
pub struct RetryContext {
    attempts_remaining: u32,
}

impl RetryContext {
    /// Start a fresh retry context for a policy: `policy.retries()` attempts
    /// remain after the first (already-sent) attempt.
    pub fn new(policy: &ClientPolicy) -> Self {
        Self {
            attempts_remaining: policy.retries(),
        }
    }

    /// True if another attempt is still permitted.
    pub fn can_retry(&self) -> bool {
        self.attempts_remaining > 0
    }

    /// Consume one attempt. Panics if none remain; callers must check
    /// [`can_retry`](Self::can_retry) first.
    pub fn consume_attempt(&mut self) {
        assert!(self.attempts_remaining > 0, "no retry attempts remaining");
        self.attempts_remaining -= 1;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rejects_zero_timeout() {
        assert_eq!(
            ClientPolicy::new(3, Duration::ZERO, None, None).unwrap_err(),
            PolicyError::ZeroRetryTimeout
        );
    }

    #[test]
    fn rejects_zero_heartbeat() {
        assert_eq!(
            ClientPolicy::new(0, Duration::from_secs(1), Some(Duration::ZERO), None).unwrap_err(),
            PolicyError::ZeroHeartbeat
        );
    }

    #[test]
    fn worst_case_duration() {
        let p = ClientPolicy::new(2, Duration::from_millis(500), None, None).unwrap();
        assert_eq!(p.worst_case_call_duration(), Duration::from_millis(1500));
    }

    #[test]
    fn retry_context_exhausts() {
        let p = ClientPolicy::new(2, Duration::from_millis(1), None, None).unwrap();
        let mut ctx = RetryContext::new(&p);
        assert!(ctx.can_retry());
        ctx.consume_attempt();
        assert!(ctx.can_retry());
        ctx.consume_attempt();
        assert!(!ctx.can_retry());
    }
}
