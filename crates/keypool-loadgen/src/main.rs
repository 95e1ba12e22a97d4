// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use futures::future::join_all;
use keypool_service::{MetricsReport, ProcessBatchRequest, ProcessBatchResponse, SUCCESS};
use tracing::subscriber::set_global_default;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[clap(
    name = "Keypool Load Generator",
    version = "0.1",
    about = "Fires concurrent batches at a keypool service and reports how they fared"
)]
struct Opts {
    /// Base URL of the service.
    #[clap(long, default_value = "http://localhost:8000")]
    pub url: String,

    /// Batches sent at once.
    #[clap(long, default_value_t = 100)]
    pub concurrent_requests: usize,

    /// Units in each batch.
    #[clap(long, default_value_t = 2000)]
    pub requests_per_batch: usize,

    /// Give up on a batch after this long.
    #[clap(long, default_value_t = 600)]
    pub timeout_secs: u64,
}

struct BatchOutcome {
    request_id: String,
    time_taken: u64,
    succeeded: usize,
    total: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .finish();
    set_global_default(subscriber)?;

    let opts = Opts::parse();
    let base = opts.url.trim_end_matches('/').to_owned();
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(opts.timeout_secs))
        .build()?;

    info!(
        batches = opts.concurrent_requests,
        units = opts.requests_per_batch,
        "Starting stress test against {base}"
    );
    let start = Instant::now();
    let outcomes = join_all((0..opts.concurrent_requests).map(|n| {
        let request = ProcessBatchRequest::new(format!("stress-test-{n}"), opts.requests_per_batch);
        send_batch(&client, &base, request)
    }))
    .await;
    let elapsed = start.elapsed();

    let mut completed = Vec::new();
    for outcome in outcomes {
        match outcome {
            Ok(outcome) => {
                println!(
                    "{}: {}ms, {}/{} succeeded",
                    outcome.request_id, outcome.time_taken, outcome.succeeded, outcome.total
                );
                completed.push(outcome);
            }
            Err(e) => warn!("Batch failed: {e:#}"),
        }
    }

    println!();
    println!(
        "Completed {}/{} batches in {:.2}s",
        completed.len(),
        opts.concurrent_requests,
        elapsed.as_secs_f64()
    );
    if let Some((min, max, avg)) = time_taken_stats(&completed) {
        println!("Batch time: min {min}ms, max {max}ms, avg {avg:.2}ms");
    }
    let units: usize = completed.iter().map(|outcome| outcome.total).sum();
    let succeeded: usize = completed.iter().map(|outcome| outcome.succeeded).sum();
    println!("Units: {succeeded}/{units} succeeded");

    let report: MetricsReport = client
        .get(format!("{base}/metrics"))
        .send()
        .await?
        .error_for_status()?
        .json()
        .await
        .context("decoding service metrics")?;
    let summary = report.summary;
    println!(
        "Service summary: {} batches, min {}ms, max {}ms, avg {:.2}ms, median {:.2}ms",
        summary.total, summary.min, summary.max, summary.avg, summary.median
    );
    Ok(())
}

async fn send_batch(
    client: &reqwest::Client,
    base: &str,
    request: ProcessBatchRequest,
) -> Result<BatchOutcome> {
    let request_id = request.request_id_or_else(|| 0);
    let response: ProcessBatchResponse = client
        .post(format!("{base}/process-batch"))
        .json(&request)
        .send()
        .await
        .with_context(|| format!("sending {request_id}"))?
        .error_for_status()
        .with_context(|| format!("service rejected {request_id}"))?
        .json()
        .await
        .with_context(|| format!("decoding response to {request_id}"))?;

    Ok(BatchOutcome {
        succeeded: response
            .results
            .iter()
            .filter(|outcome| *outcome == SUCCESS)
            .count(),
        total: response.results.len(),
        request_id: response.request_id,
        time_taken: response.time_taken,
    })
}

fn time_taken_stats(outcomes: &[BatchOutcome]) -> Option<(u64, u64, f64)> {
    let min = outcomes.iter().map(|outcome| outcome.time_taken).min()?;
    let max = outcomes.iter().map(|outcome| outcome.time_taken).max()?;
    let sum: u64 = outcomes.iter().map(|outcome| outcome.time_taken).sum();
    Some((min, max, sum as f64 / outcomes.len() as f64))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(time_taken: u64) -> BatchOutcome {
        BatchOutcome {
            request_id: format!("stress-test-{time_taken}"),
            time_taken,
            succeeded: 1,
            total: 1,
        }
    }

    #[test]
    fn stats_over_completed_batches() {
        assert!(time_taken_stats(&[]).is_none());

        let outcomes = [outcome(300), outcome(100), outcome(200)];
        assert_eq!(time_taken_stats(&outcomes), Some((100, 300, 200.0)));
    }
}
