// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Exponential back-off retry for transient store faults.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::error::{classify, ErrorClass, StoreError};

/// Back-off shape for retrying transient store faults: base 1s, cap 10s,
/// full jitter, 3 attempts by default (spec.md §4.1).
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(10),
            max_attempts: 3,
        }
    }
}

impl RetryPolicy {
    fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.base.as_millis().saturating_mul(1u128 << attempt.min(16));
        let capped = exp.min(self.cap.as_millis());
        let jittered = rand::thread_rng().gen_range(0..=capped.max(1));
        Duration::from_millis(jittered as u64)
    }
}

/// Run `op`, retrying under `policy` whenever the returned `sqlx::Error` (or
/// whatever the caller maps into a `StoreError::StoreUnavailable`) classifies
/// as transient. Permanent errors and `StoreUnavailable` exhaustion propagate
/// immediately — the gateway never swallows an error.
pub async fn retry_transient<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, sqlx::Error>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let class = classify(&err);
                attempt += 1;
                if class == ErrorClass::Permanent || attempt >= policy.max_attempts {
                    return Err(StoreError::from(err));
                }
                let delay = policy.delay_for(attempt);
                warn!(
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient store error, retrying after back-off"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
