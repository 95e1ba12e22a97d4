// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use keypool_limiter::Credential;
use parking_lot::RwLock;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::errors::{UpstreamConfigError, UpstreamError};

/// Outcome string returned by a successful upstream call.
pub const SUCCESS: &str = "success";

/// Identifies which attempt of which work unit an upstream call belongs to.
#[derive(Debug, Clone)]
pub struct UnitCall {
    pub batch_id: Arc<str>,
    pub index: usize,
    pub attempt: u32,
}

/// The rate-limited remote operation that work units call out to.
///
/// Latency and failure rate are unknown to the caller; the scheduler bounds neither beyond its own
/// retry policy.
#[async_trait]
pub trait Upstream: Send + Sync + 'static {
    async fn invoke(&self, credential: &Credential, call: &UnitCall)
    -> Result<String, UpstreamError>;
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SimulatedUpstreamConfig {
    pub min_latency: Duration,
    pub max_latency: Duration,
    pub success_rate: f64,
}

impl Default for SimulatedUpstreamConfig {
    fn default() -> Self {
        Self {
            min_latency: Duration::from_millis(500),
            max_latency: Duration::from_millis(3000),
            success_rate: 0.99,
        }
    }
}

impl SimulatedUpstreamConfig {
    pub fn validate(&self) -> Result<(), UpstreamConfigError> {
        check_success_rate(self.success_rate)?;
        check_latency_range(self.min_latency, self.max_latency)
    }
}

/// Stand-in upstream that answers after a random delay and fails a configurable fraction of calls.
pub struct SimulatedUpstream {
    config: RwLock<SimulatedUpstreamConfig>,
}

impl SimulatedUpstream {
    pub fn new(config: SimulatedUpstreamConfig) -> Result<Self, UpstreamConfigError> {
        config.validate()?;
        Ok(Self {
            config: RwLock::new(config),
        })
    }

    pub fn set_success_rate(&self, rate: f64) -> Result<(), UpstreamConfigError> {
        check_success_rate(rate)?;
        self.config.write().success_rate = rate;
        Ok(())
    }

    pub fn set_latency_range(&self, min: Duration, max: Duration) -> Result<(), UpstreamConfigError> {
        check_latency_range(min, max)?;
        let mut config = self.config.write();
        config.min_latency = min;
        config.max_latency = max;
        Ok(())
    }

    pub fn config(&self) -> SimulatedUpstreamConfig {
        self.config.read().clone()
    }
}

#[async_trait]
impl Upstream for SimulatedUpstream {
    async fn invoke(
        &self,
        credential: &Credential,
        _call: &UnitCall,
    ) -> Result<String, UpstreamError> {
        let (latency, succeeds) = {
            let config = self.config.read();
            let mut rng = rand::thread_rng();
            let latency = rng.gen_range(config.min_latency..=config.max_latency);
            (latency, rng.gen_bool(config.success_rate))
        };

        tokio::time::sleep(latency).await;
        if succeeds {
            Ok(SUCCESS.to_owned())
        } else {
            Err(UpstreamError::new(format!(
                "Third-party API request failed for key {credential}"
            )))
        }
    }
}

fn check_success_rate(rate: f64) -> Result<(), UpstreamConfigError> {
    if (0.0..=1.0).contains(&rate) {
        Ok(())
    } else {
        Err(UpstreamConfigError::InvalidSuccessRate(rate))
    }
}

fn check_latency_range(min: Duration, max: Duration) -> Result<(), UpstreamConfigError> {
    if max < min {
        return Err(UpstreamConfigError::InvalidLatencyRange {
            min_ms: min.as_millis() as u64,
            max_ms: max.as_millis() as u64,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call() -> UnitCall {
        UnitCall {
            batch_id: "test".into(),
            index: 0,
            attempt: 0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn always_succeeds_at_full_success_rate() {
        let upstream = SimulatedUpstream::new(SimulatedUpstreamConfig {
            min_latency: Duration::from_millis(10),
            max_latency: Duration::from_millis(20),
            success_rate: 1.0,
        })
        .unwrap();

        let start = tokio::time::Instant::now();
        for _ in 0..20 {
            let outcome = upstream.invoke(&"key1".into(), &call()).await.unwrap();
            assert_eq!(outcome, SUCCESS);
        }
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(200) && elapsed <= Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn failures_name_the_credential() {
        let upstream = SimulatedUpstream::new(SimulatedUpstreamConfig {
            success_rate: 0.0,
            ..Default::default()
        })
        .unwrap();

        let err = upstream.invoke(&"key7".into(), &call()).await.unwrap_err();
        assert!(err.to_string().contains("key7"), "{err}");
    }

    #[test]
    fn rejects_invalid_settings() {
        let upstream = SimulatedUpstream::new(Default::default()).unwrap();

        assert_eq!(
            upstream.set_success_rate(1.5),
            Err(UpstreamConfigError::InvalidSuccessRate(1.5))
        );
        assert_eq!(
            upstream.set_latency_range(Duration::from_millis(10), Duration::from_millis(5)),
            Err(UpstreamConfigError::InvalidLatencyRange {
                min_ms: 10,
                max_ms: 5
            })
        );
        // Unchanged after rejected updates.
        assert_eq!(upstream.config().success_rate, 0.99);

        upstream.set_success_rate(0.5).unwrap();
        upstream
            .set_latency_range(Duration::ZERO, Duration::from_millis(1))
            .unwrap();
        let config = upstream.config();
        assert_eq!(config.success_rate, 0.5);
        assert_eq!(config.max_latency, Duration::from_millis(1));
    }

    #[test]
    fn rejects_invalid_construction() {
        let result = SimulatedUpstream::new(SimulatedUpstreamConfig {
            success_rate: -0.1,
            ..Default::default()
        });
        assert!(result.is_err());
    }
}
