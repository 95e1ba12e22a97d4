// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use keypool_limiter::CredentialStatus;
use serde::{Deserialize, Serialize, Serializer, ser::SerializeMap};

use crate::errors::BatchError;

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ProcessBatchResponse {
    pub request_id: String,
    /// Milliseconds from batch start to the last unit settling.
    pub time_taken: u64,
    pub results: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl From<BatchError> for ErrorResponse {
    fn from(e: BatchError) -> Self {
        Self {
            error: "Failed to process request batch".to_owned(),
            message: e.to_string(),
        }
    }
}

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    /// Keyed by credential, in configuration order.
    #[serde(serialize_with = "serialize_credentials")]
    pub api_keys: Vec<CredentialStatus>,
    pub queue_size: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TokenBalance {
    tokens: u64,
    max_tokens: u64,
}

fn serialize_credentials<S: Serializer>(
    statuses: &[CredentialStatus],
    serializer: S,
) -> Result<S::Ok, S::Error> {
    let mut map = serializer.serialize_map(Some(statuses.len()))?;
    for status in statuses {
        map.serialize_entry(
            status.credential.as_str(),
            &TokenBalance {
                tokens: status.tokens,
                max_tokens: status.max_tokens,
            },
        )?;
    }
    map.end()
}
