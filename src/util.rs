//! Helper utilities shared across the crate.

use std::time::{Duration, Instant};

/// Define an `impl From<fromty> for toty` that wraps its input as
/// `toty::variant(Arc::new(e))`.
///
/// Used so that IO/JSON errors, which are not `Clone`, can be shared across
/// every in-flight call that a single fatal error needs to reach.
macro_rules! define_from_for_arc {
    { $fromty:ty => $toty:ty [$variant:ident] } => {
        impl From<$fromty> for $toty {
            fn from(e: $fromty) -> $toty {
                Self::$variant(std::sync::Arc::new(e))
            }
        }
    };
}
pub(crate) use define_from_for_arc;

/// A point in time as seen by the reactor and tracker threads.
///
/// Always derived from [`Instant`]: never wall-clock time, so that
/// retry/heartbeat math is immune to clock adjustments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Deadline(Instant);

impl Deadline {
    /// Return a `Deadline` that is `dur` in the future from `now`.
    pub fn after(now: Instant, dur: Duration) -> Self {
        Deadline(now + dur)
    }

    /// True if this deadline has passed as of `now`.
    pub fn has_passed(&self, now: Instant) -> bool {
        now >= self.0
    }

    /// Time remaining until this deadline, or `Duration::ZERO` if it has passed.
    pub fn remaining(&self, now: Instant) -> Duration {
        self.0.saturating_duration_since(now)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn deadline_math() {
        let now = Instant::now();
        let d = Deadline::after(now, Duration::from_millis(100));
        assert!(!d.has_passed(now));
        assert!(d.has_passed(now + Duration::from_millis(150)));
        assert_eq!(d.remaining(now + Duration::from_millis(200)), Duration::ZERO);
    }
}
