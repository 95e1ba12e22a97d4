// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Per-credential rate limiting for calls to a shared upstream.
//!
//! Every credential gets its own [`TokenBucket`]. A [`CredentialPool`] hands out credentials in
//! round-robin order while any of them has a token to spare, and otherwise waits on all of them at
//! once and takes whichever frees up first.

mod pool;
mod token_bucket;

use std::time::Duration;

use thiserror::Error;

pub use pool::{Credential, CredentialPool, CredentialStatus};
pub use token_bucket::{MIN_CAPACITY, REFILL_TICK, TokenBucket, WAIT_TIMEOUT};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BucketError {
    #[error("Timed out after {0:?} waiting for token")]
    Timeout(Duration),

    #[error("Token bucket has been torn down")]
    Closed,
}
