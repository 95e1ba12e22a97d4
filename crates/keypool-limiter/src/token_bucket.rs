// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::BucketError;

/// Interval of the background refill, so queued waiters make progress even when no new callers
/// arrive.
pub const REFILL_TICK: Duration = Duration::from_millis(100);

/// How long a caller may sit in the wait queue before giving up.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Smallest burst a bucket is ever given, regardless of its rate.
pub const MIN_CAPACITY: u64 = 50;

/// A continuously refilling token bucket with a FIFO queue of callers blocked on a token.
///
/// The balance is recomputed lazily on every read or take, and also by a background task every
/// [`REFILL_TICK`], so correctness never depends on the timer firing before a read. The
/// background task is stopped by [`TokenBucket::teardown`] or when the bucket is dropped.
pub struct TokenBucket {
    inner: Arc<BucketInner>,
    cancel: CancellationToken,
}

struct BucketInner {
    capacity: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    capacity: f64,
    refill_rate: f64,
    last_refill: Instant,
    waiters: VecDeque<Waiter>,
    next_waiter_id: u64,
    closed: bool,
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<()>,
}

impl TokenBucket {
    /// Create a full bucket that refills `refill_rate` tokens per second up to `capacity`.
    ///
    /// Spawns the background refill task, so this must be called from within a tokio runtime.
    ///
    /// # Panics
    ///
    /// If either argument is negative, infinite or NaN.
    pub fn new(refill_rate: f64, capacity: f64) -> Self {
        assert!(
            refill_rate.is_finite() && refill_rate >= 0.0,
            "refill rate must be a non-negative number, got {refill_rate}"
        );
        assert!(
            capacity.is_finite() && capacity >= 0.0,
            "capacity must be a non-negative number, got {capacity}"
        );
        let inner = Arc::new(BucketInner {
            capacity,
            state: Mutex::new(BucketState {
                tokens: capacity,
                capacity,
                refill_rate,
                last_refill: Instant::now(),
                waiters: VecDeque::new(),
                next_waiter_id: 0,
                closed: false,
            }),
        });
        let cancel = CancellationToken::new();
        spawn_refill_task(Arc::downgrade(&inner), cancel.clone());
        Self { inner, cancel }
    }

    /// Bucket sized for an upstream budget of `requests_per_minute`: refills at
    /// `requests_per_minute / 60` tokens per second with a burst of
    /// `max(50, requests_per_minute / 5)`.
    pub fn with_requests_per_minute(requests_per_minute: u32) -> Self {
        let refill_rate = requests_per_minute as f64 / 60.0;
        let capacity = MIN_CAPACITY.max(requests_per_minute as u64 / 5);
        Self::new(refill_rate, capacity as f64)
    }

    /// Take a token if one is available right now.
    pub fn try_take(&self) -> bool {
        let mut state = self.inner.state.lock();
        if state.closed {
            return false;
        }
        state.refill(Instant::now());
        state.take()
    }

    /// Whole tokens currently available. Only refills, never consumes.
    pub fn peek_tokens(&self) -> u64 {
        let mut state = self.inner.state.lock();
        state.refill(Instant::now());
        state.tokens.floor() as u64
    }

    /// Maximum burst size of this bucket.
    pub fn capacity(&self) -> u64 {
        self.inner.capacity as u64
    }

    /// Number of callers currently queued in [`TokenBucket::wait_for_token`].
    pub fn waiting(&self) -> usize {
        self.inner.state.lock().waiters.len()
    }

    /// Take a token, waiting in line behind earlier callers if none is available.
    ///
    /// Fails with [`BucketError::Timeout`] after [`WAIT_TIMEOUT`], or with
    /// [`BucketError::Closed`] if the bucket is torn down while waiting. Dropping the returned
    /// future gives up the place in the queue; a token that was granted to it but never observed
    /// is put back into the bucket.
    pub async fn wait_for_token(&self) -> Result<(), BucketError> {
        let mut pending = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(BucketError::Closed);
            }
            state.refill(Instant::now());
            if state.take() {
                return Ok(());
            }

            let (tx, rx) = oneshot::channel();
            let id = state.next_waiter_id;
            state.next_waiter_id += 1;
            state.waiters.push_back(Waiter { id, tx });
            PendingWait {
                inner: &self.inner,
                id,
                rx,
                settled: false,
            }
        };

        let outcome = tokio::time::timeout(WAIT_TIMEOUT, pending.granted()).await;
        match outcome {
            Ok(result) => result,
            Err(_) => {
                // The grant may have landed in the same instant the timer fired.
                if pending.rx.try_recv().is_ok() {
                    pending.settled = true;
                    return Ok(());
                }
                debug!(waiter = pending.id, "Timed out waiting for token");
                Err(BucketError::Timeout(WAIT_TIMEOUT))
            }
        }
    }

    /// Stop the background refill and reject every queued waiter with [`BucketError::Closed`].
    pub fn teardown(&self) {
        self.cancel.cancel();
        let mut state = self.inner.state.lock();
        state.closed = true;
        let rejected = state.waiters.len();
        // Dropping the senders wakes the receivers with an error.
        state.waiters.clear();
        if rejected > 0 {
            debug!(rejected, "Token bucket torn down with queued waiters");
        }
    }

    #[cfg(test)]
    fn balance(&self) -> f64 {
        self.inner.state.lock().tokens
    }
}

impl Drop for TokenBucket {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl BucketState {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        let added = elapsed.as_secs_f64() * self.refill_rate;
        if added > 0.0 {
            self.tokens = (self.tokens + added).min(self.capacity);
            self.last_refill = now;
            self.serve_waiters();
        }
    }

    fn take(&mut self) -> bool {
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Hand out tokens to queued waiters in arrival order.
    fn serve_waiters(&mut self) {
        while self.tokens >= 1.0 {
            let Some(waiter) = self.waiters.pop_front() else {
                break;
            };
            // A waiter whose caller went away does not consume a token.
            if waiter.tx.send(()).is_ok() {
                self.tokens -= 1.0;
            }
        }
    }

    fn give_back(&mut self) {
        self.tokens = (self.tokens + 1.0).min(self.capacity);
        self.serve_waiters();
    }
}

/// A queued waiter, owned by the future waiting on it. On drop it either leaves the queue or,
/// if it had already been served, returns the unobserved token.
struct PendingWait<'a> {
    inner: &'a BucketInner,
    id: u64,
    rx: oneshot::Receiver<()>,
    settled: bool,
}

impl PendingWait<'_> {
    async fn granted(&mut self) -> Result<(), BucketError> {
        let result = (&mut self.rx).await;
        self.settled = true;
        result.map_err(|_| BucketError::Closed)
    }
}

impl Drop for PendingWait<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut state = self.inner.state.lock();
        if let Some(pos) = state.waiters.iter().position(|w| w.id == self.id) {
            state.waiters.remove(pos);
        } else if self.rx.try_recv().is_ok() {
            state.give_back();
        }
    }
}

fn spawn_refill_task(inner: Weak<BucketInner>, cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(REFILL_TICK);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let Some(inner) = inner.upgrade() else {
                        break;
                    };
                    inner.state.lock().refill(Instant::now());
                }
            }
        }
    });
}
