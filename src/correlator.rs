//! Message correlation — match asynchronous replies to issued requests.
//!
//! ```text
//!  caller ──next_id()──▶ publish ──wait_for(id)──┐
//!                                                ▼ poll
//!  inbound ──resolve(id, ok)──▶ delivered (id awaited)
//!                           └──▶ ring[16] (nobody waiting yet)
//! ```
//!
//! Replies match strictly by id, never by arrival order. A result that
//! arrives before its waiter is parked in a fixed 16-slot ring; when the
//! ring is full the oldest parked result is evicted and can no longer be
//! claimed. Every wait carries its own deadline and optional
//! [`CancelToken`], so any number of waits may be in flight at once.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use heapless::Deque;
use log::{debug, warn};

use crate::error::Error;

/// Message identifier carried in every published envelope.
pub type MessageId = u64;

/// Parked results kept for ids nobody is waiting on yet.
pub const RESULT_RING_CAPACITY: usize = 16;

/// Default poll interval of the wait loop.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Cooperative cancellation flag for a single wait.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Default)]
struct State {
    waiting: HashSet<MessageId>,
    delivered: HashMap<MessageId, bool>,
    ring: Deque<(MessageId, bool), RESULT_RING_CAPACITY>,
}

impl State {
    /// Remove and return a parked result for `id`, keeping ring order.
    fn take_parked(&mut self, id: MessageId) -> Option<bool> {
        let mut found = None;
        for _ in 0..self.ring.len() {
            let Some((parked, ok)) = self.ring.pop_front() else {
                break;
            };
            if found.is_none() && parked == id {
                found = Some(ok);
            } else {
                // Cannot overflow: we just popped a slot.
                let _ = self.ring.push_back((parked, ok));
            }
        }
        found
    }
}

/// Issues message ids and waits for their replies.
pub struct MessageCorrelator {
    next_id: Mutex<MessageId>,
    state: Mutex<State>,
    poll_interval: Duration,
}

impl MessageCorrelator {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            next_id: Mutex::new(1),
            state: Mutex::new(State::default()),
            poll_interval: poll_interval.max(Duration::from_millis(1)),
        }
    }

    /// Fresh id, strictly increasing for the lifetime of this correlator.
    pub fn next_id(&self) -> MessageId {
        let mut next = self.next_id.lock().unwrap_or_else(PoisonError::into_inner);
        let id = *next;
        *next += 1;
        id
    }

    /// Block until `id` is resolved or `timeout` elapses.
    pub fn wait_for(&self, id: MessageId, timeout: Duration) -> Result<(), Error> {
        self.wait_until(id, Instant::now() + timeout, None)
    }

    /// Like [`wait_for`](Self::wait_for), but also gives up once `token`
    /// is cancelled.
    pub fn wait_cancellable(
        &self,
        id: MessageId,
        timeout: Duration,
        token: &CancelToken,
    ) -> Result<(), Error> {
        self.wait_until(id, Instant::now() + timeout, Some(token))
    }

    /// Record the outcome for `id`. Called from the inbound context.
    pub fn resolve(&self, id: MessageId, success: bool) {
        let mut state = self.state();
        if state.waiting.contains(&id) {
            state.delivered.insert(id, success);
            return;
        }

        // At most one parked result per id.
        state.take_parked(id);
        if state.ring.is_full() {
            if let Some((evicted, _)) = state.ring.pop_front() {
                debug!("correlator: ring full, evicting result for {}", evicted);
            }
        }
        let _ = state.ring.push_back((id, success));
    }

    /// Number of results parked in the ring.
    pub fn parked(&self) -> usize {
        self.state().ring.len()
    }

    /// Whether a wait for `id` is currently in flight.
    pub fn is_waiting(&self, id: MessageId) -> bool {
        self.state().waiting.contains(&id)
    }

    // ── Internal ──────────────────────────────────────────────

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait_until(
        &self,
        id: MessageId,
        deadline: Instant,
        token: Option<&CancelToken>,
    ) -> Result<(), Error> {
        {
            let mut state = self.state();
            if let Some(ok) = state.take_parked(id) {
                return outcome(id, ok);
            }
            if !state.waiting.insert(id) {
                return Err(Error::InvalidState("message id already awaited"));
            }
        }

        loop {
            {
                let mut state = self.state();
                if let Some(ok) = state.delivered.remove(&id) {
                    state.waiting.remove(&id);
                    return outcome(id, ok);
                }

                let cancelled = token.is_some_and(CancelToken::is_cancelled);
                if cancelled || Instant::now() >= deadline {
                    state.waiting.remove(&id);
                    warn!(
                        "correlator: wait for {} ended without reply{}",
                        id,
                        if cancelled { " (cancelled)" } else { "" }
                    );
                    return Err(Error::Timeout(id));
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            std::thread::sleep(self.poll_interval.min(remaining));
        }
    }
}

impl Default for MessageCorrelator {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL)
    }
}

fn outcome(id: MessageId, ok: bool) -> Result<(), Error> {
    if ok { Ok(()) } else { Err(Error::Rejected(id)) }
}
