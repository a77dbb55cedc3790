//! Sliding-window rate gate.
//!
//! A gate admits at most `capacity` calls in any trailing interval of length
//! `window`. It is built from a counting semaphore plus a FIFO of "exit"
//! instants:
//!
//! - A grant consumes one permit for good and pushes `now + window` onto the
//!   exit queue.
//! - A background drain task sleeps until the earliest exit instant, returns
//!   one permit per entry that is due, and goes back to sleep.
//!
//! `available + pending_exits <= capacity` holds at all times, and a permit
//! only comes back a full window after the grant that consumed it.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::error::RestError;

/// Longest accepted window.
pub const MAX_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

struct GateState {
    capacity: u32,
    window: Duration,
    permits: Semaphore,
    exits: Mutex<VecDeque<Instant>>,
}

impl GateState {
    fn record_exit(&self) {
        let mut exits = self.exits.lock();
        exits.push_back(Instant::now() + self.window);
    }

    /// Pop every due exit and return how many permits to release.
    fn take_due(&self, now: Instant) -> usize {
        let mut exits = self.exits.lock();
        let mut due = 0;
        while exits.front().is_some_and(|at| *at <= now) {
            exits.pop_front();
            due += 1;
        }
        due
    }

    fn next_exit(&self) -> Option<Instant> {
        self.exits.lock().front().copied()
    }
}

/// Admission control for one REST surface.
pub struct RateGate {
    state: Arc<GateState>,
    drain: tokio::task::JoinHandle<()>,
}

impl RateGate {
    /// Create a gate and start its drain task. Must be called from within a
    /// tokio runtime.
    pub fn new(capacity: u32, window: Duration) -> Result<Self, RestError> {
        if capacity == 0 {
            return Err(RestError::Config("rate gate capacity must be > 0".into()));
        }
        if window.is_zero() || window > MAX_WINDOW {
            return Err(RestError::Config(format!("rate gate window must be in (0, {MAX_WINDOW:?}]")));
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| RestError::Config("rate gate needs a tokio runtime".into()))?;

        let state = Arc::new(GateState {
            capacity,
            window,
            permits: Semaphore::new(capacity as usize),
            exits: Mutex::new(VecDeque::with_capacity(capacity as usize)),
        });
        let drain = runtime.spawn(drain_loop(Arc::clone(&state)));

        debug!("[rate-gate] {capacity} per {window:?}");
        Ok(Self { state, drain })
    }

    /// Wait for a permit.
    ///
    /// - `Some(Duration::ZERO)`: non-blocking test.
    /// - `Some(t)`: wait at most `t`.
    /// - `None`: wait indefinitely.
    ///
    /// Returns `false` on timeout or when the gate is closed.
    pub async fn acquire(&self, timeout: Option<Duration>) -> bool {
        let permits = &self.state.permits;
        let permit = match timeout {
            Some(t) if t.is_zero() => match permits.try_acquire() {
                Ok(p) => p,
                Err(_) => return false,
            },
            Some(t) => match tokio::time::timeout(t, permits.acquire()).await {
                Ok(Ok(p)) => p,
                Ok(Err(_)) | Err(_) => return false,
            },
            None => match permits.acquire().await {
                Ok(p) => p,
                Err(_) => return false,
            },
        };

        permit.forget();
        self.state.record_exit();
        true
    }

    /// Reject all current and future waiters and stop the drain task.
    pub fn close(&self) {
        self.state.permits.close();
        self.drain.abort();
    }

    pub fn is_closed(&self) -> bool {
        self.state.permits.is_closed()
    }

    pub fn capacity(&self) -> u32 {
        self.state.capacity
    }

    pub fn window(&self) -> Duration {
        self.state.window
    }

    /// Permits that can be granted right now.
    pub fn available(&self) -> usize {
        self.state.permits.available_permits()
    }

    /// Grants still inside their window.
    pub fn pending_exits(&self) -> usize {
        self.state.exits.lock().len()
    }
}

impl Drop for RateGate {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for RateGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateGate")
            .field("capacity", &self.state.capacity)
            .field("window", &self.state.window)
            .field("available", &self.available())
            .field("pending_exits", &self.pending_exits())
            .finish()
    }
}

async fn drain_loop(state: Arc<GateState>) {
    loop {
        let wake_at = state.next_exit().unwrap_or_else(|| Instant::now() + state.window);
        tokio::time::sleep_until(wake_at).await;

        let due = state.take_due(Instant::now());
        if due > 0 {
            trace!("[rate-gate] releasing {due} permit(s)");
            state.permits.add_permits(due);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms_since(start: Instant) -> u128 {
        (Instant::now() - start).as_millis()
    }

    #[tokio::test]
    async fn rejects_bad_parameters() {
        assert!(matches!(RateGate::new(0, Duration::from_secs(1)), Err(RestError::Config(_))));
        assert!(matches!(RateGate::new(1, Duration::ZERO), Err(RestError::Config(_))));
        assert!(RateGate::new(1, MAX_WINDOW + Duration::from_millis(1)).is_err());
        assert!(RateGate::new(1, MAX_WINDOW).is_ok());
    }

    #[test]
    fn needs_a_runtime() {
        assert!(matches!(RateGate::new(1, Duration::from_secs(1)), Err(RestError::Config(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn single_permit_spacing() {
        let gate = RateGate::new(1, Duration::from_millis(500)).unwrap();
        let start = Instant::now();

        assert!(gate.acquire(Some(Duration::ZERO)).await);
        assert_eq!(ms_since(start), 0);
        assert!(!gate.acquire(Some(Duration::ZERO)).await);

        assert!(gate.acquire(None).await);
        let first = ms_since(start);
        assert!((495..=505).contains(&first), "second grant at {first}ms");

        assert!(gate.acquire(None).await);
        let second = ms_since(start);
        assert!((995..=1005).contains(&second), "third grant at {second}ms");
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_waiters_follow_the_window() {
        let gate = Arc::new(RateGate::new(2, Duration::from_millis(1000)).unwrap());
        let start = Instant::now();

        let tasks: Vec<_> = (0..5)
            .map(|_| {
                let gate = Arc::clone(&gate);
                tokio::spawn(async move {
                    assert!(gate.acquire(Some(Duration::from_millis(5000))).await);
                    ms_since(start)
                })
            })
            .collect();

        let mut grants = Vec::new();
        for t in tasks {
            grants.push(t.await.unwrap());
        }
        grants.sort_unstable();

        for (got, want) in grants.iter().zip([0u128, 0, 1000, 1000, 2000]) {
            assert!(got.abs_diff(want) <= 5, "grants {grants:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn never_exceeds_capacity_in_any_window() {
        let window = Duration::from_millis(100);
        let gate = RateGate::new(3, window).unwrap();

        let mut grants = Vec::new();
        for _ in 0..10 {
            assert!(gate.acquire(None).await);
            grants.push(Instant::now());
            assert!(gate.available() + gate.pending_exits() <= 3);
        }
        for pair in grants.windows(4) {
            assert!(pair[3] - pair[0] >= window);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_wait_times_out() {
        let gate = RateGate::new(1, Duration::from_secs(10)).unwrap();
        assert!(gate.acquire(None).await);

        let start = Instant::now();
        assert!(!gate.acquire(Some(Duration::from_millis(100))).await);
        assert!(ms_since(start) >= 100);
        assert_eq!(gate.pending_exits(), 1);
    }

    #[tokio::test]
    async fn close_releases_blocked_waiters() {
        let gate = Arc::new(RateGate::new(1, Duration::from_secs(60)).unwrap());
        assert!(gate.acquire(None).await);

        let waiter = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move { gate.acquire(None).await })
        };
        tokio::task::yield_now().await;
        gate.close();

        assert!(!waiter.await.unwrap());
        assert!(gate.is_closed());
        assert!(!gate.acquire(Some(Duration::ZERO)).await);
    }
}
