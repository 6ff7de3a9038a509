//! Per-route FIFO queue with a token-and-reset-time quota model.
//!
//! Each bucket guarantees at most one in-flight call for its route. Calls
//! run in submission order, except that a priority call (a transparent
//! retry after a 429) is admitted at the front of the queue. After each
//! call the dispatcher reports the server's quota feedback; once the
//! remaining count reaches zero the next dequeue waits for the reset
//! deadline.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::{Notify, oneshot};
use tokio::time::Instant;
use tracing::{debug, trace};

/// One remote quota: a FIFO queue with at most one in-flight call.
#[derive(Debug)]
pub(crate) struct RateBucket {
    shared: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<State>,
    /// Wakes the runner when work arrives or quota feedback changes.
    wake: Notify,
    route: String,
}

#[derive(Debug)]
struct State {
    /// Quota size last reported by the server.
    limit: u64,
    /// Calls left in the current quota window.
    remaining: u64,
    /// When the quota window refills, if known.
    reset_at: Option<Instant>,
    /// Waiting calls, front first.
    queue: VecDeque<oneshot::Sender<SlotGuard>>,
}

/// Proof of holding a bucket's single in-flight slot.
///
/// The slot is released when the guard drops, on every exit path, so a
/// failed call can never deadlock the queue.
#[derive(Debug)]
pub(crate) struct SlotGuard {
    done: Option<oneshot::Sender<()>>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if let Some(done) = self.done.take() {
            let _ = done.send(());
        }
    }
}

impl RateBucket {
    /// Create a bucket with no server feedback yet: one in flight, no
    /// artificial delay. Spawns the runner task that drives the queue.
    pub(crate) fn new(route: String) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                limit: 1,
                remaining: 1,
                reset_at: None,
                queue: VecDeque::new(),
            }),
            wake: Notify::new(),
            route,
        });
        tokio::spawn(run_queue(Arc::clone(&shared)));
        Self { shared }
    }

    /// Wait for this route's in-flight slot.
    ///
    /// `priority` inserts the call at the front of the queue (used for
    /// transparent 429 retries, which may bypass normal ordering once).
    pub(crate) async fn acquire(&self, priority: bool) -> Option<SlotGuard> {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.shared.state.lock().ok()?;
            if priority {
                state.queue.push_front(tx);
            } else {
                state.queue.push_back(tx);
            }
        }
        self.shared.wake.notify_one();
        rx.await.ok()
    }

    /// Record the server's quota feedback for this route.
    pub(crate) fn update_quota(&self, limit: Option<u64>, remaining: u64, reset_at: Option<Instant>) {
        if let Ok(mut state) = self.shared.state.lock() {
            if let Some(limit) = limit {
                state.limit = limit;
            }
            state.remaining = remaining;
            if reset_at.is_some() {
                state.reset_at = reset_at;
            }
            trace!(
                route = %self.shared.route,
                remaining = state.remaining,
                limit = state.limit,
                "Quota updated"
            );
        }
        self.shared.wake.notify_one();
    }

    /// Quota size last reported by the server (1 before any feedback).
    pub(crate) fn known_limit(&self) -> u64 {
        self.shared.state.lock().map_or(1, |s| s.limit)
    }
}

/// What the runner should do next.
enum Step {
    /// Nothing queued; wait for a notification.
    Idle,
    /// Quota exhausted; wait until the deadline (or a notification).
    Throttled(Instant),
    /// A call was granted the slot; await its completion.
    Granted(oneshot::Receiver<()>),
}

/// Drives one bucket's queue: grants the slot to one call at a time and
/// defers dequeues while the quota is exhausted.
async fn run_queue(shared: Arc<Shared>) {
    loop {
        let step = next_step(&shared);
        match step {
            Step::Idle => shared.wake.notified().await,
            Step::Throttled(deadline) => {
                debug!(
                    route = %shared.route,
                    wait_ms = deadline.saturating_duration_since(Instant::now()).as_millis(),
                    "Quota exhausted, deferring dequeue"
                );
                tokio::select! {
                    () = tokio::time::sleep_until(deadline) => {},
                    () = shared.wake.notified() => {},
                }
            },
            Step::Granted(done) => {
                // The call holds the slot until its guard drops.
                let _ = done.await;
            },
        }
    }
}

fn next_step(shared: &Shared) -> Step {
    let Ok(mut state) = shared.state.lock() else {
        return Step::Idle;
    };
    if state.queue.is_empty() {
        return Step::Idle;
    }

    if state.remaining == 0 {
        match state.reset_at {
            Some(deadline) if deadline > Instant::now() => return Step::Throttled(deadline),
            _ => {
                // Window elapsed (or never reported): refill.
                state.remaining = state.limit.max(1);
                state.reset_at = None;
            },
        }
    }

    // Grant the slot to the front call. A receiver that was dropped
    // (caller gave up) just frees the slot for the next one.
    while let Some(tx) = state.queue.pop_front() {
        let (done_tx, done_rx) = oneshot::channel();
        let guard = SlotGuard {
            done: Some(done_tx),
        };
        if tx.send(guard).is_ok() {
            state.remaining = state.remaining.saturating_sub(1);
            return Step::Granted(done_rx);
        }
    }
    Step::Idle
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn second_call_waits_for_first_completion() {
        let bucket = Arc::new(RateBucket::new("GET /test".into()));

        let first = bucket.acquire(false).await.expect("slot");

        let bucket2 = Arc::clone(&bucket);
        let second = tokio::spawn(async move { bucket2.acquire(false).await });

        // The second call cannot start while the first holds the slot.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!second.is_finished());

        drop(first);
        let guard = tokio::time::timeout(Duration::from_secs(1), second)
            .await
            .expect("second call admitted")
            .expect("join");
        assert!(guard.is_some());
    }

    #[tokio::test]
    async fn exhausted_quota_defers_until_reset() {
        tokio::time::pause();
        let bucket = RateBucket::new("POST /test".into());

        let guard = bucket.acquire(false).await.expect("slot");
        bucket.update_quota(
            Some(5),
            0,
            Some(Instant::now() + Duration::from_millis(2000)),
        );
        drop(guard);

        let start = Instant::now();
        let _next = bucket.acquire(false).await.expect("slot after reset");
        let waited = start.elapsed();
        assert!(
            waited >= Duration::from_millis(1990),
            "dispatched after {waited:?}, expected ~2000ms"
        );
    }

    #[tokio::test]
    async fn priority_call_jumps_the_queue() {
        let bucket = Arc::new(RateBucket::new("GET /test".into()));
        let held = bucket.acquire(false).await.expect("slot");

        let (order_tx, mut order_rx) = tokio::sync::mpsc::unbounded_channel();

        let b = Arc::clone(&bucket);
        let tx = order_tx.clone();
        tokio::spawn(async move {
            let g = b.acquire(false).await;
            let _ = tx.send("normal");
            drop(g);
        });
        // Let the normal call enqueue first.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let b = Arc::clone(&bucket);
        tokio::spawn(async move {
            let g = b.acquire(true).await;
            let _ = order_tx.send("priority");
            drop(g);
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        drop(held);
        assert_eq!(order_rx.recv().await, Some("priority"));
        assert_eq!(order_rx.recv().await, Some("normal"));
    }

    #[tokio::test]
    async fn dropped_guard_releases_slot_even_without_feedback() {
        let bucket = RateBucket::new("GET /test".into());
        for _ in 0..5 {
            // Simulates a call that failed without reporting quota.
            let guard = bucket.acquire(false).await.expect("slot");
            drop(guard);
        }
    }

    #[tokio::test]
    async fn abandoned_waiter_does_not_wedge_queue() {
        let bucket = Arc::new(RateBucket::new("GET /test".into()));
        let held = bucket.acquire(false).await.expect("slot");

        let b = Arc::clone(&bucket);
        let abandoned = tokio::spawn(async move { b.acquire(false).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        abandoned.abort();

        drop(held);
        let guard = tokio::time::timeout(
            Duration::from_secs(1),
            bucket.acquire(false),
        )
        .await
        .expect("queue still serves");
        assert!(guard.is_some());
    }
}
