// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};

/// Units per batch when the caller doesn't say.
pub const DEFAULT_REQUESTS_COUNT: usize = 2000;

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProcessBatchRequest {
    pub request_id: Option<String>,
    pub requests_count: Option<usize>,
}

impl ProcessBatchRequest {
    pub fn new(request_id: impl Into<String>, requests_count: usize) -> Self {
        Self {
            request_id: Some(request_id.into()),
            requests_count: Some(requests_count),
        }
    }

    /// The caller's id, or a generated one when missing or blank.
    pub fn request_id_or_else(&self, generate: impl FnOnce() -> u64) -> String {
        match &self.request_id {
            Some(id) if !id.trim().is_empty() => id.clone(),
            _ => generate().to_string(),
        }
    }

    pub fn requests_count(&self) -> usize {
        self.requests_count.unwrap_or(DEFAULT_REQUESTS_COUNT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let request: ProcessBatchRequest = serde_json::from_str("{}").unwrap();
        assert_eq!(request.request_id_or_else(|| 1_700_000_000_000), "1700000000000");
        assert_eq!(request.requests_count(), DEFAULT_REQUESTS_COUNT);

        let blank: ProcessBatchRequest = serde_json::from_str(r#"{"requestId": "  "}"#).unwrap();
        assert_eq!(blank.request_id_or_else(|| 42), "42");
    }

    #[test]
    fn reads_camel_case_fields() {
        let request: ProcessBatchRequest =
            serde_json::from_str(r#"{"requestId": "batch-1", "requestsCount": 10}"#).unwrap();
        assert_eq!(request.request_id_or_else(|| unreachable!()), "batch-1");
        assert_eq!(request.requests_count(), 10);
    }
}
