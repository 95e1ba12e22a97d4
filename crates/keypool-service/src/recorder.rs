// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Wall-clock span of one batch, in milliseconds.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BatchMetric {
    pub request_id: String,
    pub duration: u64,
    pub start_time: u64,
    pub end_time: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Summary {
    pub total: usize,
    pub min: u64,
    pub max: u64,
    pub avg: f64,
    pub median: f64,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct MetricsReport {
    pub requests: Vec<BatchMetric>,
    pub summary: Summary,
}

/// Records how long each batch took, keyed by batch id. Statistics are computed on demand.
#[derive(Default)]
pub struct BatchRecorder {
    inner: Mutex<RecorderState>,
    last_request_id: AtomicU64,
}

#[derive(Default)]
struct RecorderState {
    started: HashMap<String, (Instant, u64)>,
    completed: HashMap<String, BatchMetric>,
}

impl BatchRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Id for a batch whose caller didn't name it: the current epoch milliseconds, bumped past
    /// the last id handed out so batches arriving in the same millisecond stay distinct.
    pub fn next_request_id(&self) -> u64 {
        let now = epoch_millis();
        let previous = self
            .last_request_id
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or_else(|last| last);
        now.max(previous + 1)
    }

    pub fn start_batch(&self, request_id: &str) {
        self.inner
            .lock()
            .started
            .insert(request_id.to_owned(), (Instant::now(), epoch_millis()));
    }

    /// Close the span opened by [Self::start_batch] and return its duration. Returns 0, recording
    /// nothing, if the batch was never started.
    pub fn end_batch(&self, request_id: &str) -> u64 {
        let mut inner = self.inner.lock();
        let Some((started, start_time)) = inner.started.remove(request_id) else {
            return 0;
        };
        let duration = started.elapsed().as_millis() as u64;
        let metric = BatchMetric {
            request_id: request_id.to_owned(),
            duration,
            start_time,
            end_time: start_time + duration,
        };
        inner.completed.insert(request_id.to_owned(), metric);
        duration
    }

    /// Forget a started batch without recording it, e.g. when it was rejected.
    pub fn discard_batch(&self, request_id: &str) {
        self.inner.lock().started.remove(request_id);
    }

    /// Record a span measured elsewhere, as epoch milliseconds.
    pub fn record(&self, request_id: &str, start_time: u64, end_time: u64) {
        let metric = BatchMetric {
            request_id: request_id.to_owned(),
            duration: end_time.saturating_sub(start_time),
            start_time,
            end_time,
        };
        self.inner
            .lock()
            .completed
            .insert(request_id.to_owned(), metric);
    }

    pub fn batch_metrics(&self, request_id: &str) -> Option<BatchMetric> {
        self.inner.lock().completed.get(request_id).cloned()
    }

    /// Every completed batch, oldest first, with summary statistics over their durations.
    pub fn metrics(&self) -> MetricsReport {
        let mut requests: Vec<_> = self.inner.lock().completed.values().cloned().collect();
        requests.sort_by(|a, b| {
            (a.start_time, &a.request_id).cmp(&(b.start_time, &b.request_id))
        });
        let durations: Vec<_> = requests.iter().map(|metric| metric.duration).collect();
        MetricsReport {
            summary: summarize(durations),
            requests,
        }
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.started.clear();
        inner.completed.clear();
    }
}

fn summarize(mut durations: Vec<u64>) -> Summary {
    if durations.is_empty() {
        return Summary::default();
    }
    durations.sort_unstable();

    let total = durations.len();
    let sum: u64 = durations.iter().sum();
    let mid = total / 2;
    let median = if total % 2 == 0 {
        (durations[mid - 1] + durations[mid]) as f64 / 2.0
    } else {
        durations[mid] as f64
    };

    Summary {
        total,
        min: durations[0],
        max: durations[total - 1],
        avg: sum as f64 / total as f64,
        median,
    }
}

pub(crate) fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}
