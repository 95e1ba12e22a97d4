// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

mod config;
mod errors;
mod metrics;
mod metrics_layer;
mod metrics_service;
mod processor;
mod recorder;
mod requests;
mod responses;
mod server;
mod upstream;

pub use config::ServiceConfig;
pub use errors::{
    AttemptError, BatchError, ProcessorConfigError, UpstreamConfigError, UpstreamError,
};
pub use metrics::{ProcessorMetrics, RequestMetrics};
pub use metrics_layer::RequestMetricsLayer;
pub use metrics_service::{MetricsArgs, serve_metrics};
pub use processor::*;
pub use recorder::{BatchMetric, BatchRecorder, MetricsReport, Summary};
pub use requests::*;
pub use responses::*;
pub use server::{AppState, router};
pub use upstream::{SUCCESS, SimulatedUpstream, SimulatedUpstreamConfig, UnitCall, Upstream};
