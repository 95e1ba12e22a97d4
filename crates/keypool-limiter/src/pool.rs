// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures::FutureExt;
use futures::future::select_ok;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::TokenBucket;

/// Opaque identifier used to authenticate against the upstream. Each one carries its own rate
/// budget.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Credential(Arc<str>);

impl Credential {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Credential {
    fn from(value: &str) -> Self {
        Self(value.into())
    }
}

impl From<String> for Credential {
    fn from(value: String) -> Self {
        Self(value.into())
    }
}

impl AsRef<str> for Credential {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Point-in-time view of one credential's bucket.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CredentialStatus {
    pub credential: Credential,
    pub tokens: u64,
    pub max_tokens: u64,
}

/// Owns one [`TokenBucket`] per credential and decides which credential a caller may use next.
///
/// The round-robin cursor is shared by every caller and advances by exactly one position per scan
/// step, so no credential is starved by always winning the scan.
pub struct CredentialPool {
    entries: Vec<(Credential, TokenBucket)>,
    cursor: AtomicUsize,
}

impl CredentialPool {
    /// Build a pool that gives every credential a bucket sized for `requests_per_minute`.
    /// Duplicate credentials are ignored after their first occurrence.
    ///
    /// Must be called from within a tokio runtime, as each bucket spawns its refill task.
    pub fn new<I, C>(credentials: I, requests_per_minute: u32) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<Credential>,
    {
        let mut seen = HashSet::new();
        let entries = credentials
            .into_iter()
            .map(Into::<Credential>::into)
            .filter(|credential| {
                let fresh = seen.insert(credential.clone());
                if !fresh {
                    warn!(%credential, "Ignoring duplicate credential");
                }
                fresh
            })
            .map(|credential| {
                let bucket = TokenBucket::with_requests_per_minute(requests_per_minute);
                (credential, bucket)
            })
            .collect();
        Self::from_buckets(entries)
    }

    /// Build a pool from pre-configured buckets, scanned in the order given.
    pub fn from_buckets(entries: Vec<(Credential, TokenBucket)>) -> Self {
        Self {
            entries,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn credentials(&self) -> impl Iterator<Item = &Credential> {
        self.entries.iter().map(|(credential, _)| credential)
    }

    /// Obtain a credential with a token reserved for the caller.
    ///
    /// Scans the credentials once in round-robin order and takes the first available token. If
    /// every bucket is empty, waits on all of them at once and returns whichever yields a token
    /// first; the other waits are abandoned. Returns `None` if no bucket produced a token before
    /// the wait timed out, which callers should treat as a retryable admission failure.
    pub async fn acquire(&self) -> Option<Credential> {
        if let Some(credential) = self.try_acquire() {
            return Some(credential);
        }
        if self.entries.is_empty() {
            return None;
        }

        debug!(
            credentials = self.entries.len(),
            "All buckets empty, waiting on every credential"
        );
        let waits = self.entries.iter().map(|(credential, bucket)| {
            async move {
                bucket.wait_for_token().await?;
                Ok::<_, crate::BucketError>(credential.clone())
            }
            .boxed()
        });

        match select_ok(waits).await {
            Ok((credential, _abandoned)) => Some(credential),
            Err(error) => {
                debug!(%error, "No credential became available");
                None
            }
        }
    }

    /// A single non-blocking round-robin scan over every credential.
    pub fn try_acquire(&self) -> Option<Credential> {
        let len = self.entries.len();
        for _ in 0..len {
            let index = self.cursor.fetch_add(1, Ordering::Relaxed) % len;
            let (credential, bucket) = &self.entries[index];
            if bucket.try_take() {
                return Some(credential.clone());
            }
        }
        None
    }

    /// Sum of whole tokens available across every credential.
    pub fn total_available_tokens(&self) -> u64 {
        self.entries
            .iter()
            .map(|(_, bucket)| bucket.peek_tokens())
            .sum()
    }

    /// Current balance and capacity of every credential, in configuration order.
    pub fn status(&self) -> Vec<CredentialStatus> {
        self.entries
            .iter()
            .map(|(credential, bucket)| CredentialStatus {
                credential: credential.clone(),
                tokens: bucket.peek_tokens(),
                max_tokens: bucket.capacity(),
            })
            .collect()
    }

    /// Stop every bucket's refill task and reject anyone still waiting on a token.
    pub fn teardown(&self) {
        for (_, bucket) in &self.entries {
            bucket.teardown();
        }
    }
}
