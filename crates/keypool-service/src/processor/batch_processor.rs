// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use keypool_limiter::CredentialPool;
use prometheus::Registry;
use tap::TapOptional;
use tracing::{debug, info, warn};

use super::{FAILED, ProcessorConfig, WorkQueue};
use crate::errors::{AttemptError, BatchError, ProcessorConfigError};
use crate::metrics::ProcessorMetrics;
use crate::upstream::{UnitCall, Upstream};

/// Runs batches of upstream calls under the global concurrency ceiling, one credential admission
/// per attempt, retrying failed units with linear backoff.
pub struct BatchProcessor {
    inner: Arc<ProcessorInner>,
    queue: WorkQueue,
}

struct ProcessorInner {
    pool: Arc<CredentialPool>,
    upstream: Arc<dyn Upstream>,
    config: ProcessorConfig,
    metrics: ProcessorMetrics,
}

/// Lifecycle of one work unit. `attempt` counts from 0 for the first try.
#[derive(Debug)]
enum UnitState {
    Pending,
    Running { attempt: u32 },
    RetryScheduled { attempt: u32, delay: Duration },
    Succeeded(String),
    ExhaustedFailed,
}

impl BatchProcessor {
    /// Must be called from within a tokio runtime.
    pub fn new(
        pool: Arc<CredentialPool>,
        upstream: Arc<dyn Upstream>,
        config: ProcessorConfig,
        registry: &Registry,
    ) -> Result<Self, ProcessorConfigError> {
        config.validate()?;
        let queue = WorkQueue::new(config.concurrency);
        Ok(Self {
            inner: Arc::new(ProcessorInner {
                pool,
                upstream,
                config,
                metrics: ProcessorMetrics::new(registry),
            }),
            queue,
        })
    }

    /// Run `count` units for `batch_id` and return one outcome per unit, in index order.
    ///
    /// Individual failures never fail the batch: a unit that exhausts its retries, or is cleared
    /// from the backlog before it runs, reports [`FAILED`] in its slot.
    pub async fn process_batch(
        &self,
        batch_id: &str,
        count: usize,
    ) -> Result<Vec<String>, BatchError> {
        let max = self.inner.config.max_batch_size;
        if count > max {
            return Err(BatchError::InvalidCount { count, max });
        }

        let batch_id: Arc<str> = batch_id.into();
        info!(%batch_id, count, "Processing batch");
        self.inner.metrics.total_batches_started.inc();

        let handles: Vec<_> = (0..count)
            .map(|index| {
                let inner = self.inner.clone();
                let batch_id = batch_id.clone();
                self.queue
                    .add(async move { inner.run_unit(batch_id, index).await })
            })
            .collect();
        self.update_gauges();

        let results: Vec<String> = join_all(handles)
            .await
            .into_iter()
            .enumerate()
            .map(|(index, outcome)| {
                outcome.unwrap_or_else(|_| {
                    warn!(%batch_id, index, "Work unit dropped before it ran");
                    self.inner.metrics.total_units_failed.inc();
                    FAILED.to_owned()
                })
            })
            .collect();

        self.inner.metrics.total_batches_completed.inc();
        let failed = results.iter().filter(|outcome| *outcome == FAILED).count();
        info!(%batch_id, count, failed, "Batch complete");
        Ok(results)
    }

    pub fn pool(&self) -> &Arc<CredentialPool> {
        &self.inner.pool
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.inner.config
    }

    /// Units waiting for a concurrency slot.
    pub fn queue_size(&self) -> usize {
        self.queue.size()
    }

    /// Units currently running.
    pub fn pending_count(&self) -> usize {
        self.queue.pending()
    }

    pub fn pause(&self) {
        info!("Pausing work queue");
        self.queue.pause();
    }

    pub fn resume(&self) {
        info!("Resuming work queue");
        self.queue.resume();
    }

    /// Drop every unit still waiting for a slot; each settles as [`FAILED`] in its batch.
    pub fn clear_queue(&self) -> usize {
        let cleared = self.queue.clear();
        info!(cleared, "Cleared work queue backlog");
        cleared
    }

    /// Refresh the queue and token gauges.
    pub fn update_gauges(&self) {
        let metrics = &self.inner.metrics;
        metrics.work_queue_backlog.set(self.queue_size() as i64);
        metrics.work_queue_in_flight.set(self.pending_count() as i64);
        for status in self.inner.pool.status() {
            metrics
                .available_tokens
                .with_label_values(&[status.credential.as_str()])
                .set(status.tokens as i64);
        }
    }
}

impl ProcessorInner {
    async fn run_unit(&self, batch_id: Arc<str>, index: usize) -> String {
        let retry_attempts = self.config.retry_attempts;
        let mut state = UnitState::Pending;
        loop {
            state = match state {
                UnitState::Pending => UnitState::Running { attempt: 0 },

                UnitState::Running { attempt } => {
                    let call = UnitCall {
                        batch_id: batch_id.clone(),
                        index,
                        attempt,
                    };
                    match self.attempt(&call).await {
                        Ok(outcome) => UnitState::Succeeded(outcome),
                        Err(error) if attempt < retry_attempts => {
                            let next = attempt + 1;
                            let delay = self.config.retry_delay * next;
                            warn!(
                                %batch_id, index, attempt, %error, ?delay,
                                "Work unit attempt failed, retrying"
                            );
                            self.metrics.total_retries.inc();
                            UnitState::RetryScheduled {
                                attempt: next,
                                delay,
                            }
                        }
                        Err(error) => {
                            warn!(
                                %batch_id, index, attempt, %error,
                                "Work unit exhausted its retries"
                            );
                            UnitState::ExhaustedFailed
                        }
                    }
                }

                UnitState::RetryScheduled { attempt, delay } => {
                    tokio::time::sleep(delay).await;
                    UnitState::Running { attempt }
                }

                UnitState::Succeeded(outcome) => {
                    self.metrics.total_units_succeeded.inc();
                    return outcome;
                }

                UnitState::ExhaustedFailed => {
                    self.metrics.total_units_failed.inc();
                    return FAILED.to_owned();
                }
            }
        }
    }

    async fn attempt(&self, call: &UnitCall) -> Result<String, AttemptError> {
        self.metrics.total_attempts.inc();
        let credential = self
            .pool
            .acquire()
            .await
            .tap_none(|| {
                debug!(batch_id = %call.batch_id, index = call.index, "No credential available");
                self.metrics.total_admission_failures.inc();
            })
            .ok_or(AttemptError::NoCredentialAvailable)?;

        let _timer = self.metrics.upstream_latency.start_timer();
        Ok(self.upstream.invoke(&credential, call).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::UpstreamError;
    use crate::upstream::SUCCESS;
    use async_trait::async_trait;
    use keypool_limiter::{Credential, TokenBucket};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails every call whose attempt number is below `fail_attempts`, answers the rest with the
    /// unit index after `latency(index)`.
    struct ScriptedUpstream {
        fail_attempts: u32,
        latency: fn(usize) -> Duration,
        calls: AtomicUsize,
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    impl ScriptedUpstream {
        fn new(fail_attempts: u32, latency: fn(usize) -> Duration) -> Arc<Self> {
            Arc::new(Self {
                fail_attempts,
                latency,
                calls: AtomicUsize::new(0),
                running: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Upstream for ScriptedUpstream {
        async fn invoke(
            &self,
            credential: &Credential,
            call: &UnitCall,
        ) -> Result<String, UpstreamError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep((self.latency)(call.index)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);

            if call.attempt < self.fail_attempts {
                Err(UpstreamError::new(format!("scripted failure for {credential}")))
            } else {
                Ok(format!("{SUCCESS}-{}", call.index))
            }
        }
    }

    fn config(concurrency: usize, retry_attempts: u32) -> ProcessorConfig {
        ProcessorConfig {
            concurrency,
            retry_attempts,
            retry_delay: Duration::from_millis(10),
            max_batch_size: 1_000,
        }
    }

    fn processor(upstream: Arc<ScriptedUpstream>, config: ProcessorConfig) -> BatchProcessor {
        let pool = Arc::new(CredentialPool::new(["key1", "key2", "key3"], 60_000));
        BatchProcessor::new(pool, upstream, config, &Registry::new()).unwrap()
    }

    fn fixed(_: usize) -> Duration {
        Duration::from_millis(5)
    }

    #[tokio::test(start_paused = true)]
    async fn every_unit_settles_even_when_all_fail() {
        let upstream = ScriptedUpstream::new(u32::MAX, fixed);
        let processor = processor(upstream.clone(), config(4, 2));

        let results = processor.process_batch("all-fail", 10).await.unwrap();

        assert_eq!(results, vec![FAILED.to_owned(); 10]);
        // One first attempt plus two retries per unit.
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 30);
        assert_eq!(processor.inner.metrics.total_units_failed.get(), 10);
        assert_eq!(processor.inner.metrics.total_retries.get(), 20);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success_within_budget() {
        let upstream = ScriptedUpstream::new(3, fixed);
        let processor = processor(upstream.clone(), config(10, 3));

        let start = tokio::time::Instant::now();
        let results = processor.process_batch("flaky", 5).await.unwrap();

        let expected: Vec<_> = (0..5).map(|i| format!("{SUCCESS}-{i}")).collect();
        assert_eq!(results, expected);
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 20);
        // Four 5ms calls plus 10ms + 20ms + 30ms of backoff.
        assert!(start.elapsed() >= Duration::from_millis(80));
    }

    #[tokio::test(start_paused = true)]
    async fn results_follow_input_order() {
        // Later units finish first.
        let upstream = ScriptedUpstream::new(0, |index| Duration::from_millis(100 - index as u64));
        let processor = processor(upstream, config(100, 0));

        let results = processor.process_batch("ordered", 100).await.unwrap();

        let expected: Vec<_> = (0..100).map(|i| format!("{SUCCESS}-{i}")).collect();
        assert_eq!(results, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn never_exceeds_concurrency_ceiling() {
        let upstream = ScriptedUpstream::new(0, fixed);
        let processor = processor(upstream.clone(), config(5, 0));

        let results = processor.process_batch("ceiling", 50).await.unwrap();

        assert_eq!(results.len(), 50);
        assert_eq!(upstream.peak.load(Ordering::SeqCst), 5);
        assert_eq!(processor.pending_count(), 0);
        assert_eq!(processor.queue_size(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn admission_failures_are_retried_then_fail() {
        let bucket = TokenBucket::new(0.0, 50.0);
        while bucket.try_take() {}
        let pool = Arc::new(CredentialPool::from_buckets(vec![("dry".into(), bucket)]));
        let upstream = ScriptedUpstream::new(0, fixed);
        let processor =
            BatchProcessor::new(pool, upstream.clone(), config(1, 1), &Registry::new()).unwrap();

        let results = processor.process_batch("starved", 1).await.unwrap();

        assert_eq!(results, vec![FAILED.to_owned()]);
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 0);
        assert_eq!(processor.inner.metrics.total_admission_failures.get(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn rejects_zero_concurrency() {
        let pool = Arc::new(CredentialPool::new(["key1"], 60_000));
        let result = BatchProcessor::new(
            pool,
            ScriptedUpstream::new(0, fixed),
            config(0, 0),
            &Registry::new(),
        );
        assert_eq!(result.err(), Some(ProcessorConfigError::ZeroConcurrency));
    }

    #[tokio::test(start_paused = true)]
    async fn rejects_oversized_batches() {
        let processor = processor(ScriptedUpstream::new(0, fixed), config(1, 0));

        let err = processor.process_batch("huge", 1_001).await.unwrap_err();
        assert_eq!(
            err,
            BatchError::InvalidCount {
                count: 1_001,
                max: 1_000
            }
        );
        assert_eq!(processor.queue_size(), 0);
        assert_eq!(processor.process_batch("empty", 0).await.unwrap(), Vec::<String>::new());
    }

    #[tokio::test(start_paused = true)]
    async fn cleared_units_report_failed() {
        let upstream = ScriptedUpstream::new(0, fixed);
        let processor = Arc::new(processor(upstream.clone(), config(1, 0)));
        processor.pause();

        let batch = {
            let processor = processor.clone();
            tokio::spawn(async move { processor.process_batch("cleared", 3).await })
        };
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(processor.queue_size(), 3);

        assert_eq!(processor.clear_queue(), 3);
        processor.resume();

        let results = batch.await.unwrap().unwrap();
        assert_eq!(results, vec![FAILED.to_owned(); 3]);
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn gauges_track_queue_and_tokens() {
        let processor = processor(ScriptedUpstream::new(0, fixed), config(2, 0));
        processor.pool().try_acquire().unwrap();
        processor.update_gauges();

        let metrics = &processor.inner.metrics;
        assert_eq!(metrics.work_queue_backlog.get(), 0);
        assert_eq!(
            metrics.available_tokens.with_label_values(&["key1"]).get(),
            11_999
        );
        assert_eq!(
            metrics.available_tokens.with_label_values(&["key2"]).get(),
            12_000
        );
    }
}
