// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::net::Ipv4Addr;
use std::time::Duration;

use anyhow::ensure;
use clap::Parser;

use crate::metrics_service::MetricsArgs;
use crate::processor::ProcessorConfig;
use crate::upstream::SimulatedUpstreamConfig;

#[derive(Parser, Clone, Debug)]
#[clap(
    name = "Keypool Service",
    about = "Runs batches of rate-limited upstream calls across a pool of API keys",
    rename_all = "kebab-case"
)]
pub struct ServiceConfig {
    #[clap(long, env = "PORT", default_value_t = 8000)]
    pub port: u16,

    #[clap(long, env = "HOST_IP", default_value = "0.0.0.0")]
    pub host_ip: Ipv4Addr,

    /// Credentials used against the upstream, comma separated.
    #[clap(
        long,
        env = "API_KEYS",
        value_delimiter = ',',
        default_value = "key1,key2,key3"
    )]
    pub api_keys: Vec<String>,

    /// Rate budget of each credential.
    #[clap(long, env = "REQUESTS_PER_MINUTE", default_value_t = 1000)]
    pub requests_per_minute: u32,

    /// Work units running at once across all batches.
    #[clap(long, env = "CONCURRENCY", default_value_t = 200)]
    pub concurrency: usize,

    #[clap(long, env = "RETRY_ATTEMPTS", default_value_t = 3)]
    pub retry_attempts: u32,

    #[clap(long, env = "RETRY_DELAY_MS", default_value_t = 100)]
    pub retry_delay_ms: u64,

    #[clap(long, env = "MAX_BATCH_SIZE", default_value_t = 100_000)]
    pub max_batch_size: usize,

    /// HTTP requests served at once before new ones are shed with 503.
    #[clap(long, env = "MAX_CONCURRENT_REQUESTS", default_value_t = 1024)]
    pub max_concurrent_requests: usize,

    #[clap(long, default_value_t = 500)]
    pub upstream_min_latency_ms: u64,

    #[clap(long, default_value_t = 3000)]
    pub upstream_max_latency_ms: u64,

    #[clap(long, default_value_t = 0.99)]
    pub upstream_success_rate: f64,

    #[clap(flatten)]
    pub metrics: MetricsArgs,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            port: 8000,
            host_ip: Ipv4Addr::UNSPECIFIED,
            api_keys: vec!["key1".into(), "key2".into(), "key3".into()],
            requests_per_minute: 1000,
            concurrency: 200,
            retry_attempts: 3,
            retry_delay_ms: 100,
            max_batch_size: 100_000,
            max_concurrent_requests: 1024,
            upstream_min_latency_ms: 500,
            upstream_max_latency_ms: 3000,
            upstream_success_rate: 0.99,
            metrics: MetricsArgs::default(),
        }
    }
}

impl ServiceConfig {
    /// Reject settings the service can't run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(
            self.api_keys.iter().any(|key| !key.trim().is_empty()),
            "at least one API key is required"
        );
        ensure!(self.requests_per_minute > 0, "requests-per-minute must be positive");
        ensure!(
            self.max_concurrent_requests > 0,
            "max-concurrent-requests must be positive"
        );
        self.processor_config().validate()?;
        self.upstream_config().validate()?;
        Ok(())
    }

    /// Configured credentials, trimmed, with blanks dropped.
    pub fn credentials(&self) -> Vec<String> {
        self.api_keys
            .iter()
            .map(|key| key.trim())
            .filter(|key| !key.is_empty())
            .map(str::to_owned)
            .collect()
    }

    pub fn processor_config(&self) -> ProcessorConfig {
        ProcessorConfig {
            concurrency: self.concurrency,
            retry_attempts: self.retry_attempts,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            max_batch_size: self.max_batch_size,
        }
    }

    pub fn upstream_config(&self) -> SimulatedUpstreamConfig {
        SimulatedUpstreamConfig {
            min_latency: Duration::from_millis(self.upstream_min_latency_ms),
            max_latency: Duration::from_millis(self.upstream_max_latency_ms),
            success_rate: self.upstream_success_rate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_parsed_defaults() {
        let parsed = ServiceConfig::try_parse_from(["keypool-service"]).unwrap();
        let default = ServiceConfig::default();

        assert_eq!(parsed.port, default.port);
        assert_eq!(parsed.host_ip, default.host_ip);
        assert_eq!(parsed.api_keys, default.api_keys);
        assert_eq!(parsed.processor_config(), default.processor_config());
        assert_eq!(parsed.metrics.metrics_address, default.metrics.metrics_address);
        parsed.validate().unwrap();
    }

    #[test]
    fn parses_comma_separated_keys() {
        let config = ServiceConfig::try_parse_from([
            "keypool-service",
            "--api-keys",
            "alpha, beta,,gamma",
            "--retry-delay-ms",
            "250",
        ])
        .unwrap();

        assert_eq!(config.credentials(), vec!["alpha", "beta", "gamma"]);
        assert_eq!(
            config.processor_config().retry_delay,
            Duration::from_millis(250)
        );
    }

    #[test]
    fn rejects_unusable_settings() {
        let no_keys = ServiceConfig {
            api_keys: vec![" ".into()],
            ..Default::default()
        };
        assert!(no_keys.validate().is_err());

        let no_rate = ServiceConfig {
            requests_per_minute: 0,
            ..Default::default()
        };
        assert!(no_rate.validate().is_err());

        let no_slots = ServiceConfig {
            concurrency: 0,
            ..Default::default()
        };
        assert!(no_slots.validate().is_err());

        let bad_rate = ServiceConfig {
            upstream_success_rate: 1.5,
            ..Default::default()
        };
        assert!(bad_rate.validate().is_err());

        let inverted = ServiceConfig {
            upstream_min_latency_ms: 10,
            upstream_max_latency_ms: 5,
            ..Default::default()
        };
        assert!(inverted.validate().is_err());
    }
}
