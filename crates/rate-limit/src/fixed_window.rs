//! Per-partition fixed window counter with a bounded waiting queue.
//!
//! A window opens on the first request after the previous one expired and
//! lasts exactly `window`. Requests beyond the permit limit wait in a queue
//! (if the policy allows one) until a later reset hands out fresh permits.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use crate::policy::{Limits, QueueOrder};

pub(crate) type SharedCounter = Arc<Mutex<WindowCounter>>;

pub(crate) fn lock(counter: &Mutex<WindowCounter>) -> MutexGuard<'_, WindowCounter> {
    counter.lock().unwrap_or_else(|e| e.into_inner())
}

/// Observable phase of a partition's window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowState {
    /// No request has been seen yet.
    Fresh,
    /// Permits remain in the current window.
    Open,
    /// Every permit of the current window has been handed out.
    Full,
    /// The window has elapsed; the next request starts a new one.
    Expired,
}

/// Terminal outcome delivered to a queued request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaiterOutcome {
    Admitted,
    /// A window reset ran out of permits before reaching this waiter.
    Displaced { retry_after: Duration },
    /// The counter went away without resolving the waiter.
    Cancelled,
}

/// Outcome sent to a waiter, tagged with the window it applies to.
#[derive(Debug)]
pub(crate) struct Resolution {
    outcome: WaiterOutcome,
    epoch: u64,
}

#[derive(Debug)]
struct Waiter {
    id: u64,
    enqueued_at: Instant,
    tx: oneshot::Sender<Resolution>,
}

/// Result of a single admission attempt against a counter.
#[derive(Debug)]
pub(crate) enum Decision {
    Admitted,
    Queued {
        id: u64,
        position: usize,
        rx: oneshot::Receiver<Resolution>,
    },
    Rejected {
        retry_after: Duration,
    },
}

/// Point-in-time view of a partition, used for introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionSnapshot {
    pub state: WindowState,
    pub count: u32,
    pub queued: usize,
    pub limits: Limits,
    /// Time left until the window resets; zero once it has expired.
    pub retry_after: Duration,
}

#[derive(Debug)]
pub struct WindowCounter {
    window_start: Option<Instant>,
    /// Bumped on every reset.
    epoch: u64,
    count: u32,
    waiters: VecDeque<Waiter>,
    limits: Limits,
    next_waiter_id: u64,
    last_seen: Instant,
    retired: bool,
}

impl WindowCounter {
    pub(crate) fn new(now: Instant, limits: Limits) -> Self {
        Self {
            window_start: None,
            epoch: 0,
            count: 0,
            waiters: VecDeque::new(),
            limits,
            next_waiter_id: 0,
            last_seen: now,
            retired: false,
        }
    }

    /// Run one admission attempt at `now`.
    ///
    /// `limits` are those of the current caller; they also govern how many
    /// queued requests later resets may promote.
    pub(crate) fn try_acquire(
        &mut self,
        now: Instant,
        window: Duration,
        limits: Limits,
        order: QueueOrder,
    ) -> Decision {
        self.limits = limits;
        self.last_seen = now;
        self.prune_abandoned();

        if self.is_expired(now, window) {
            self.reset(now, window, order);
        } else {
            // Queued requests go ahead of new arrivals whenever permits are
            // available in the current window.
            self.promote(order);
        }

        if self.count < limits.permit_limit {
            self.count += 1;
            return Decision::Admitted;
        }

        if self.waiters.len() < limits.queue_limit as usize {
            let (tx, rx) = oneshot::channel();
            let id = self.next_waiter_id;
            self.next_waiter_id += 1;
            self.waiters.push_back(Waiter {
                id,
                enqueued_at: now,
                tx,
            });
            let position = match order {
                QueueOrder::OldestFirst => self.waiters.len(),
                QueueOrder::NewestFirst => 1,
            };
            return Decision::Queued { id, position, rx };
        }

        Decision::Rejected {
            retry_after: self.remaining(now, window),
        }
    }

    /// Start a new window if the current one has expired and someone is
    /// waiting for it. Returns the number of queued requests admitted.
    pub(crate) fn replenish(&mut self, now: Instant, window: Duration, order: QueueOrder) -> usize {
        self.prune_abandoned();
        if self.waiters.is_empty() || !self.is_expired(now, window) {
            return 0;
        }
        self.reset(now, window, order);
        self.count as usize
    }

    /// Remove a waiter that gave up. Returns `false` if it was already
    /// resolved.
    pub(crate) fn cancel(&mut self, id: u64) -> bool {
        let before = self.waiters.len();
        self.waiters.retain(|w| w.id != id);
        self.waiters.len() != before
    }

    /// Give back a permit handed to a waiter that stopped listening before
    /// it saw the admission. Permits of an earlier window are not returned.
    pub(crate) fn release(&mut self, epoch: u64) -> bool {
        if epoch != self.epoch || self.count == 0 {
            return false;
        }
        self.count -= 1;
        true
    }

    pub(crate) fn snapshot(&self, now: Instant, window: Duration) -> PartitionSnapshot {
        let state = if self.window_start.is_none() {
            WindowState::Fresh
        } else if self.is_expired(now, window) {
            WindowState::Expired
        } else if self.count >= self.limits.permit_limit {
            WindowState::Full
        } else {
            WindowState::Open
        };

        let (count, retry_after) = match state {
            WindowState::Fresh | WindowState::Expired => (0, Duration::ZERO),
            WindowState::Open | WindowState::Full => (self.count, self.remaining(now, window)),
        };

        PartitionSnapshot {
            state,
            count,
            queued: self.waiters.len(),
            limits: self.limits,
            retry_after,
        }
    }

    /// A counter is idle once nobody waits on it, its window has expired and
    /// it has not been touched for `ttl`.
    pub(crate) fn is_idle(&self, now: Instant, window: Duration, ttl: Duration) -> bool {
        self.waiters.is_empty()
            && self.is_expired(now, window)
            && now.saturating_duration_since(self.last_seen) >= ttl
    }

    pub(crate) fn has_waiters(&self) -> bool {
        !self.waiters.is_empty()
    }

    pub(crate) fn retire(&mut self) {
        self.retired = true;
    }

    pub(crate) fn is_retired(&self) -> bool {
        self.retired
    }

    fn is_expired(&self, now: Instant, window: Duration) -> bool {
        match self.window_start {
            None => true,
            Some(start) => now.saturating_duration_since(start) >= window,
        }
    }

    fn remaining(&self, now: Instant, window: Duration) -> Duration {
        match self.window_start {
            None => Duration::ZERO,
            Some(start) => (start + window).saturating_duration_since(now),
        }
    }

    fn reset(&mut self, now: Instant, window: Duration, order: QueueOrder) {
        self.window_start = Some(now);
        self.epoch += 1;
        self.count = 0;
        self.promote(order);

        // Whoever is still queued missed this window entirely.
        for waiter in self.waiters.drain(..) {
            tracing::debug!(
                waited_ms = now.saturating_duration_since(waiter.enqueued_at).as_millis() as u64,
                "queued request displaced by window reset"
            );
            let _ = waiter.tx.send(Resolution {
                outcome: WaiterOutcome::Displaced {
                    retry_after: window,
                },
                epoch: self.epoch,
            });
        }
    }

    fn promote(&mut self, order: QueueOrder) {
        while self.count < self.limits.permit_limit {
            let next = match order {
                QueueOrder::OldestFirst => self.waiters.pop_front(),
                QueueOrder::NewestFirst => self.waiters.pop_back(),
            };
            let Some(waiter) = next else { break };
            let admitted = Resolution {
                outcome: WaiterOutcome::Admitted,
                epoch: self.epoch,
            };
            if waiter.tx.send(admitted).is_ok() {
                self.count += 1;
            }
        }
    }

    fn prune_abandoned(&mut self) {
        self.waiters.retain(|w| !w.tx.is_closed());
    }
}

/// Handle for a request waiting in a partition's queue.
///
/// Dropping the ticket before it resolves releases its queue slot.
#[derive(Debug)]
pub struct QueueTicket {
    id: u64,
    position: usize,
    rx: oneshot::Receiver<Resolution>,
    counter: SharedCounter,
    settled: bool,
}

impl QueueTicket {
    pub(crate) fn new(
        id: u64,
        position: usize,
        rx: oneshot::Receiver<Resolution>,
        counter: SharedCounter,
    ) -> Self {
        Self {
            id,
            position,
            rx,
            counter,
            settled: false,
        }
    }

    /// 1-based position in admission order at the time of queueing.
    pub fn position(&self) -> usize {
        self.position
    }

    /// Wait until a window reset admits or displaces this request.
    pub async fn wait(mut self) -> WaiterOutcome {
        let outcome = (&mut self.rx)
            .await
            .map(|resolution| resolution.outcome)
            .unwrap_or(WaiterOutcome::Cancelled);
        self.settled = true;
        outcome
    }

    /// Give up the queue slot without waiting.
    pub fn cancel(self) {}
}

impl Drop for QueueTicket {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut counter = lock(&self.counter);
        if counter.cancel(self.id) {
            tracing::debug!(waiter = self.id, "queued request abandoned");
            return;
        }
        // Admitted after the caller gave up (e.g. a timeout racing a reset).
        if let Ok(Resolution {
            outcome: WaiterOutcome::Admitted,
            epoch,
        }) = self.rx.try_recv()
        {
            if counter.release(epoch) {
                tracing::debug!(waiter = self.id, "unused permit returned");
            }
        }
    }
}
