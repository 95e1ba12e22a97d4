// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use http::{Request, Response, StatusCode};
use prometheus::{HistogramTimer, Registry};
use tower::{BoxError, Layer, Service, load_shed::error::Overloaded};
use tracing::{debug, warn};

use crate::metrics::{RequestMetrics, route_label};
use crate::processor::FAILED;
use crate::upstream::SUCCESS;

/// Result mix of a served batch. The batch handler attaches it to its response so the unit
/// outcomes can be counted without reading the body back.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct BatchOutcome {
    pub units: usize,
    pub failed: usize,
}

impl BatchOutcome {
    pub(crate) fn of(results: &[String]) -> Self {
        Self {
            units: results.len(),
            failed: results.iter().filter(|result| *result == FAILED).count(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Outcome {
    Ok,
    Rejected,
    Errored,
    Shed,
    Disconnected,
}

impl Outcome {
    fn of_status(status: StatusCode) -> Self {
        if status.is_client_error() {
            Outcome::Rejected
        } else if status.is_server_error() {
            Outcome::Errored
        } else {
            Outcome::Ok
        }
    }

    fn label(self) -> &'static str {
        match self {
            Outcome::Ok => "ok",
            Outcome::Rejected => "rejected",
            Outcome::Errored => "errored",
            Outcome::Shed => "shed",
            Outcome::Disconnected => "disconnected",
        }
    }
}

/// Tower layer accounting for every batch API request in [`RequestMetrics`]: how it ended, how
/// long it took and, for served batches, how many of their units failed.
#[derive(Clone)]
pub struct RequestMetricsLayer {
    metrics: Arc<RequestMetrics>,
}

impl RequestMetricsLayer {
    pub fn new(registry: &Registry) -> Self {
        Self {
            metrics: Arc::new(RequestMetrics::new(registry)),
        }
    }
}

impl<S> Layer<S> for RequestMetricsLayer {
    type Service = RequestMetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequestMetricsService {
            inner,
            metrics: self.metrics.clone(),
        }
    }
}

#[derive(Clone)]
pub struct RequestMetricsService<S> {
    inner: S,
    metrics: Arc<RequestMetrics>,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for RequestMetricsService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>, Error = BoxError>,
    S::Future: Send + 'static,
    ResBody: 'static,
{
    type Response = Response<ResBody>;
    type Error = BoxError;
    type Future = BoxFuture<'static, Result<Self::Response, BoxError>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let span = RequestSpan::open(self.metrics.clone(), route_label(req.uri().path()));
        let response = self.inner.call(req);

        Box::pin(async move {
            let result = response.await;
            match &result {
                Ok(response) => {
                    if let Some(batch) = response.extensions().get::<BatchOutcome>() {
                        span.count_units(*batch);
                    }
                    span.close(Outcome::of_status(response.status()));
                }
                Err(e) if e.is::<Overloaded>() => span.close(Outcome::Shed),
                Err(e) => {
                    warn!(route = span.route, "Request failed: {e}");
                    span.close(Outcome::Errored);
                }
            }
            result
        })
    }
}

/// Open while a request is being served. Dropping it before [`RequestSpan::close`] means the
/// client went away first.
struct RequestSpan {
    metrics: Arc<RequestMetrics>,
    route: &'static str,
    timer: Option<HistogramTimer>,
}

impl RequestSpan {
    fn open(metrics: Arc<RequestMetrics>, route: &'static str) -> Self {
        metrics.requests_received.with_label_values(&[route]).inc();
        metrics.requests_in_flight.with_label_values(&[route]).inc();
        let timer = metrics.request_latency.with_label_values(&[route]).start_timer();
        Self {
            metrics,
            route,
            timer: Some(timer),
        }
    }

    fn count_units(&self, batch: BatchOutcome) {
        let units = &self.metrics.batch_units_returned;
        units
            .with_label_values(&[SUCCESS])
            .inc_by((batch.units - batch.failed) as u64);
        units
            .with_label_values(&[FAILED])
            .inc_by(batch.failed as u64);
        if batch.units > 0 {
            self.metrics
                .batch_failed_share
                .observe(batch.failed as f64 / batch.units as f64);
        }
    }

    fn close(mut self, outcome: Outcome) {
        self.finish(outcome);
    }

    fn finish(&mut self, outcome: Outcome) {
        let Some(timer) = self.timer.take() else {
            return;
        };
        let secs = timer.stop_and_record();
        self.metrics
            .requests_finished
            .with_label_values(&[self.route, outcome.label()])
            .inc();
        debug!(route = self.route, outcome = outcome.label(), secs, "Request finished");
    }
}

impl Drop for RequestSpan {
    fn drop(&mut self) {
        self.metrics
            .requests_in_flight
            .with_label_values(&[self.route])
            .dec();
        self.finish(Outcome::Disconnected);
    }
}
