// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use clap::Parser;
use keypool_limiter::CredentialPool;
use keypool_service::{
    AppState, BatchProcessor, ServiceConfig, SimulatedUpstream, router, serve_metrics,
};
use prometheus::Registry;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::subscriber::set_global_default;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .finish();
    set_global_default(subscriber)?;

    let config = ServiceConfig::parse();
    config.validate()?;
    let credentials = config.credentials();
    info!(
        credentials = credentials.len(),
        requests_per_minute = config.requests_per_minute,
        concurrency = config.concurrency,
        "Starting keypool service"
    );

    let cancel = CancellationToken::new();
    let registry = Registry::new();
    let pool = Arc::new(CredentialPool::new(credentials, config.requests_per_minute));
    let upstream = Arc::new(SimulatedUpstream::new(config.upstream_config())?);
    let processor = BatchProcessor::new(
        pool.clone(),
        upstream,
        config.processor_config(),
        &registry,
    )?;
    let state = Arc::new(AppState::new(processor));
    let metrics_handle =
        serve_metrics(&config.metrics, registry.clone(), state.clone(), cancel.clone()).await?;

    let app = router(state, &registry, config.max_concurrent_requests);
    let addr = SocketAddr::new(IpAddr::V4(config.host_ip), config.port);
    let listener = TcpListener::bind(addr).await?;
    info!("listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown({
            let cancel = cancel.clone();
            async move {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received ctrl-c, shutting down"),
                    _ = cancel.cancelled() => {}
                }
            }
        })
        .await?;

    cancel.cancel();
    pool.teardown();
    let _ = metrics_handle.await;
    info!("Keypool service stopped");
    Ok(())
}
