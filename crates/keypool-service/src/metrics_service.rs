// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Extension, Router,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus::{Encoder, Registry, TextEncoder};
use tokio::{net::TcpListener, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::server::AppState;

#[derive(clap::Args, Debug, Clone)]
pub struct MetricsArgs {
    /// Address the Prometheus scrape endpoint listens on, apart from the batch API.
    #[arg(long, env = "METRICS_ADDRESS", default_value_t = Self::default().metrics_address)]
    pub metrics_address: SocketAddr,
}

impl Default for MetricsArgs {
    fn default() -> Self {
        Self {
            metrics_address: SocketAddr::from(([0, 0, 0, 0], 9184)),
        }
    }
}

/// Serve `registry` on `/metrics` at the configured address until `cancel` fires. Queue and token
/// gauges are brought up to date on every scrape.
pub async fn serve_metrics(
    args: &MetricsArgs,
    registry: Registry,
    state: Arc<AppState>,
    cancel: CancellationToken,
) -> anyhow::Result<JoinHandle<()>> {
    let listener = TcpListener::bind(args.metrics_address).await?;
    let addr = listener.local_addr()?;
    let app = metrics_router(registry, state);

    info!("Serving Prometheus metrics on {addr}");
    Ok(tokio::spawn(async move {
        let shutdown = cancel.cancelled_owned();
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
        {
            error!("Metrics listener on {addr} stopped: {e}");
        }
    }))
}

fn metrics_router(registry: Registry, state: Arc<AppState>) -> Router {
    Router::new()
        .route("/metrics", get(scrape))
        .layer(Extension(registry))
        .layer(Extension(state))
}

async fn scrape(
    Extension(registry): Extension<Registry>,
    Extension(state): Extension<Arc<AppState>>,
) -> Response {
    state.processor.update_gauges();

    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    match encoder.encode(&registry.gather(), &mut buffer) {
        Ok(()) => (
            [(header::CONTENT_TYPE, encoder.format_type().to_owned())],
            buffer,
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to encode metrics: {e}"),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::{BatchProcessor, ProcessorConfig};
    use crate::upstream::SimulatedUpstream;
    use axum::body::Body;
    use http::Request;
    use http_body_util::BodyExt;
    use keypool_limiter::CredentialPool;
    use tower::ServiceExt;

    #[tokio::test(start_paused = true)]
    async fn scrape_reports_current_token_balances() {
        let registry = Registry::new();
        let pool = Arc::new(CredentialPool::new(["key1"], 60));
        let upstream = Arc::new(SimulatedUpstream::new(Default::default()).unwrap());
        let processor =
            BatchProcessor::new(pool.clone(), upstream, ProcessorConfig::default(), &registry)
                .unwrap();
        let app = metrics_router(registry, Arc::new(AppState::new(processor)));
        assert!(pool.try_acquire().is_some());

        let response = app
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(
            response.headers()[header::CONTENT_TYPE]
                .to_str()
                .unwrap()
                .starts_with("text/plain")
        );
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains(r#"available_tokens{credential="key1"} 49"#), "{text}");
        assert!(text.contains("work_queue_backlog 0"), "{text}");
    }
}
