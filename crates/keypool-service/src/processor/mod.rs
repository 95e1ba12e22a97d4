// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::ProcessorConfigError;

mod batch_processor;
mod work_queue;

pub use batch_processor::BatchProcessor;
pub use work_queue::{JobDropped, JobHandle, WorkQueue};

/// Result slot of a unit that ran out of attempts or never got to run.
pub const FAILED: &str = "failed";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ProcessorConfig {
    /// Work units allowed to run at once, across every batch. Must be at least 1.
    pub concurrency: usize,
    /// Retries after the first attempt of a unit.
    pub retry_attempts: u32,
    /// Backoff base. The n-th retry waits `retry_delay * n`.
    pub retry_delay: Duration,
    pub max_batch_size: usize,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            concurrency: 200,
            retry_attempts: 3,
            retry_delay: Duration::from_millis(100),
            max_batch_size: 100_000,
        }
    }
}

impl ProcessorConfig {
    pub fn validate(&self) -> Result<(), ProcessorConfigError> {
        if self.concurrency == 0 {
            return Err(ProcessorConfigError::ZeroConcurrency);
        }
        Ok(())
    }
}
