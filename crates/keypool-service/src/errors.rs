// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

/// The upstream rejected a call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Upstream request failed: {0}")]
pub struct UpstreamError(pub String);

impl UpstreamError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Why a single attempt of a work unit failed. Every variant is retryable.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AttemptError {
    #[error("No credential available")]
    NoCredentialAvailable,

    #[error(transparent)]
    Upstream(#[from] UpstreamError),
}

/// Failure of a whole batch call, as opposed to the `"failed"` marker of a single unit.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BatchError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Batch of {count} requests exceeds the maximum of {max}")]
    InvalidCount { count: usize, max: usize },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BatchError {
    pub(crate) fn internal(e: impl ToString) -> Self {
        BatchError::Internal(e.to_string())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcessorConfigError {
    #[error("Concurrency must be at least 1")]
    ZeroConcurrency,
}

/// Rejected runtime change to the simulated upstream.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum UpstreamConfigError {
    #[error("Success rate must be between 0 and 1, got {0}")]
    InvalidSuccessRate(f64),

    #[error("Invalid latency range: {min_ms}ms..{max_ms}ms")]
    InvalidLatencyRange { min_ms: u64, max_ms: u64 },
}
