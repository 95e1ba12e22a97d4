// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::oneshot;

/// The job was removed from the backlog, or its task died, before it produced a value.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Job was dropped before it completed")]
pub struct JobDropped;

/// Bounded executor: at most `concurrency` jobs run at once, the rest wait in an unbounded FIFO
/// backlog and start in arrival order as slots free up.
///
/// Cloning gives another handle to the same queue.
#[derive(Clone)]
pub struct WorkQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    concurrency: usize,
    runtime: Handle,
    state: Mutex<QueueState>,
}

#[derive(Default)]
struct QueueState {
    backlog: VecDeque<BoxFuture<'static, ()>>,
    in_flight: usize,
    paused: bool,
}

/// Resolves to the job's output once it has run.
pub struct JobHandle<T> {
    rx: oneshot::Receiver<T>,
}

impl WorkQueue {
    /// Must be called from within a tokio runtime, which is where jobs will be spawned.
    ///
    /// # Panics
    ///
    /// If `concurrency` is 0.
    pub fn new(concurrency: usize) -> Self {
        assert!(concurrency > 0, "work queue needs at least one slot");
        Self {
            inner: Arc::new(QueueInner {
                concurrency,
                runtime: Handle::current(),
                state: Mutex::new(QueueState::default()),
            }),
        }
    }

    /// Append a job to the backlog, starting it straight away if a slot is free.
    pub fn add<F>(&self, job: F) -> JobHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job = async move {
            let _ = tx.send(job.await);
        }
        .boxed();
        self.inner.state.lock().backlog.push_back(job);
        self.inner.dispatch();
        JobHandle { rx }
    }

    pub fn concurrency(&self) -> usize {
        self.inner.concurrency
    }

    /// Jobs waiting for a slot.
    pub fn size(&self) -> usize {
        self.inner.state.lock().backlog.len()
    }

    /// Jobs currently running.
    pub fn pending(&self) -> usize {
        self.inner.state.lock().in_flight
    }

    pub fn is_paused(&self) -> bool {
        self.inner.state.lock().paused
    }

    /// Stop starting new jobs. Running jobs are unaffected.
    pub fn pause(&self) {
        self.inner.state.lock().paused = true;
    }

    pub fn resume(&self) {
        self.inner.state.lock().paused = false;
        self.inner.dispatch();
    }

    /// Drop every job that has not started yet, returning how many were dropped. Their handles
    /// resolve to [`JobDropped`].
    pub fn clear(&self) -> usize {
        let backlog = std::mem::take(&mut self.inner.state.lock().backlog);
        backlog.len()
    }
}

impl QueueInner {
    fn dispatch(self: &Arc<Self>) {
        let mut state = self.state.lock();
        while !state.paused && state.in_flight < self.concurrency {
            let Some(job) = state.backlog.pop_front() else {
                break;
            };
            state.in_flight += 1;
            let slot = Slot {
                queue: self.clone(),
            };
            self.runtime.spawn(async move {
                let _slot = slot;
                job.await;
            });
        }
    }
}

/// Occupies one in-flight slot for the lifetime of a running job, including when the job panics.
struct Slot {
    queue: Arc<QueueInner>,
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.queue.state.lock().in_flight -= 1;
        self.queue.dispatch();
    }
}

impl<T> Future for JobHandle<T> {
    type Output = Result<T, JobDropped>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.rx.poll_unpin(cx).map_err(|_| JobDropped)
    }
}
