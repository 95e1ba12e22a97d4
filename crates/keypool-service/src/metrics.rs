// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use prometheus::{
    Histogram, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Registry,
    register_histogram_vec_with_registry, register_histogram_with_registry,
    register_int_counter_vec_with_registry, register_int_counter_with_registry,
    register_int_gauge_vec_with_registry, register_int_gauge_with_registry,
};

/// Traffic on the batch API, labelled by route.
#[derive(Clone, Debug)]
pub struct RequestMetrics {
    pub(crate) requests_received: IntCounterVec,
    /// Labelled by route and how the request ended: ok, rejected, errored, shed or disconnected.
    pub(crate) requests_finished: IntCounterVec,
    pub(crate) requests_in_flight: IntGaugeVec,
    pub(crate) request_latency: HistogramVec,
    /// Units returned by served batches, labelled by their result slot.
    pub(crate) batch_units_returned: IntCounterVec,
    pub(crate) batch_failed_share: Histogram,
}

/// Metrics relevant to scheduling work units against the upstream
#[derive(Clone, Debug)]
pub struct ProcessorMetrics {
    pub(crate) total_batches_started: IntCounter,
    pub(crate) total_batches_completed: IntCounter,
    pub(crate) total_units_succeeded: IntCounter,
    pub(crate) total_units_failed: IntCounter,
    pub(crate) total_attempts: IntCounter,
    pub(crate) total_retries: IntCounter,
    pub(crate) total_admission_failures: IntCounter,
    pub(crate) upstream_latency: Histogram,
    pub(crate) work_queue_backlog: IntGauge,
    pub(crate) work_queue_in_flight: IntGauge,
    pub(crate) available_tokens: IntGaugeVec,
}

const LATENCY_SEC_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1., 2.5, 5., 10., 20., 30., 60., 90.,
];

const FAILED_SHARE_BUCKETS: &[f64] = &[0., 0.001, 0.01, 0.05, 0.1, 0.25, 0.5, 0.75, 1.];

const UPSTREAM_LATENCY_SEC_BUCKETS: &[f64] = &[
    0.01, 0.05, 0.1, 0.25, 0.5, 0.75, 1., 1.5, 2., 2.5, 3., 4., 5., 10.,
];

impl RequestMetrics {
    pub fn new(registry: &Registry) -> Self {
        Self {
            requests_received: register_int_counter_vec_with_registry!(
                "requests_received",
                "Batch API requests received, by route",
                &["route"],
                registry,
            )
            .unwrap(),
            requests_finished: register_int_counter_vec_with_registry!(
                "requests_finished",
                "Batch API requests finished, by route and outcome",
                &["route", "outcome"],
                registry,
            )
            .unwrap(),
            requests_in_flight: register_int_gauge_vec_with_registry!(
                "requests_in_flight",
                "Batch API requests currently being served, by route",
                &["route"],
                registry,
            )
            .unwrap(),
            request_latency: register_histogram_vec_with_registry!(
                "request_latency",
                "Time to serve a batch API request, by route",
                &["route"],
                LATENCY_SEC_BUCKETS.to_vec(),
                registry,
            )
            .unwrap(),
            batch_units_returned: register_int_counter_vec_with_registry!(
                "batch_units_returned",
                "Work units returned to callers in served batches, by result",
                &["result"],
                registry,
            )
            .unwrap(),
            batch_failed_share: register_histogram_with_registry!(
                "batch_failed_share",
                "Fraction of a served batch's units that came back failed",
                FAILED_SHARE_BUCKETS.to_vec(),
                registry,
            )
            .unwrap(),
        }
    }
}

impl ProcessorMetrics {
    pub fn new(registry: &Registry) -> Self {
        Self {
            total_batches_started: register_int_counter_with_registry!(
                "total_batches_started",
                "Total number of batches accepted for processing",
                registry,
            )
            .unwrap(),
            total_batches_completed: register_int_counter_with_registry!(
                "total_batches_completed",
                "Total number of batches whose units have all settled",
                registry,
            )
            .unwrap(),
            total_units_succeeded: register_int_counter_with_registry!(
                "total_units_succeeded",
                "Total number of work units that got a successful upstream response",
                registry,
            )
            .unwrap(),
            total_units_failed: register_int_counter_with_registry!(
                "total_units_failed",
                "Total number of work units that settled as failed",
                registry,
            )
            .unwrap(),
            total_attempts: register_int_counter_with_registry!(
                "total_attempts",
                "Total number of work unit attempts, including retries",
                registry,
            )
            .unwrap(),
            total_retries: register_int_counter_with_registry!(
                "total_retries",
                "Total number of retries scheduled after a failed attempt",
                registry,
            )
            .unwrap(),
            total_admission_failures: register_int_counter_with_registry!(
                "total_admission_failures",
                "Total number of attempts that could not obtain a credential",
                registry,
            )
            .unwrap(),
            upstream_latency: register_histogram_with_registry!(
                "upstream_latency",
                "Latency of a single upstream call",
                UPSTREAM_LATENCY_SEC_BUCKETS.to_vec(),
                registry,
            )
            .unwrap(),
            work_queue_backlog: register_int_gauge_with_registry!(
                "work_queue_backlog",
                "Number of work units waiting for a concurrency slot",
                registry,
            )
            .unwrap(),
            work_queue_in_flight: register_int_gauge_with_registry!(
                "work_queue_in_flight",
                "Number of work units currently running",
                registry,
            )
            .unwrap(),
            available_tokens: register_int_gauge_vec_with_registry!(
                "available_tokens",
                "Whole tokens currently available in each credential's bucket",
                &["credential"],
                registry,
            )
            .unwrap(),
        }
    }
}

/// Routes reported under their own label. Anything else is folded into "unknown".
pub(crate) fn route_label(path: &str) -> &'static str {
    match path {
        "/process-batch" => "/process-batch",
        "/metrics" => "/metrics",
        "/health" => "/health",
        _ => "unknown",
    }
}
