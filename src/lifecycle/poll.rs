//! Bounded polling of device-observed state.
//!
//! Devices never push completion events, so every wait in the lifecycle is a
//! [`PollPolicy::wait_until`]: check, sleep one interval, check again, until the
//! check is satisfied or the deadline passes.

use std::time::Duration;

use futures::future::BoxFuture;
use tokio::time::{sleep, Instant};
use tracing::trace;

/// Default cadence between checks. Status queries are network round-trips.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Deadline and cadence of a bounded wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub timeout: Duration,
    pub interval: Duration,
}

impl PollPolicy {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Checks `target` until `check` returns true or the timeout elapses.
    ///
    /// Returns `true` iff a check started before the deadline was satisfied.
    /// No check is issued at or after the deadline, and no sleep extends past
    /// it, so the wait overshoots by at most the duration of one check.
    pub async fn wait_until<T, F>(&self, target: &mut T, mut check: F) -> bool
    where
        T: ?Sized + Send,
        F: FnMut(&mut T) -> BoxFuture<'_, bool> + Send,
    {
        let deadline = Instant::now() + self.timeout;
        let mut attempts = 0u32;
        while Instant::now() < deadline {
            attempts += 1;
            if check(&mut *target).await {
                trace!(attempts, "Poll satisfied");
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            sleep(self.interval.min(deadline - now)).await;
        }
        trace!(attempts, timeout = ?self.timeout, "Poll deadline elapsed");
        false
    }
}
