// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The `QueueStore` trait: pooled/retrying/probing access plus the typed
//! queue operations that implement the claim-and-process protocol.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::record::QueueRecord;

/// Result of a store reachability probe (spec.md §4.1 `probe()`).
#[derive(Debug, Clone)]
pub struct Probe {
    pub reachable: bool,
    pub round_trip_ms: f64,
    pub schema_version: Option<String>,
}

/// Typed operations on the `processing_queue` table, implemented once per
/// SQL dialect. Implementations are stateless beyond their connection pool
/// and must be safe to call concurrently from many tasks sharing that pool.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Run a trivial query under a short timeout; report reachability,
    /// round-trip time, and the applied migration head version.
    async fn probe(&self, timeout: std::time::Duration) -> Probe;

    /// Apply any pending versioned migrations in ascending order, returning
    /// the set of migration versions present in the schema afterward.
    async fn migrate(&self) -> Result<Vec<i64>, StoreError>;

    /// Insert new pending records for `flow_name`. Returns the number
    /// inserted.
    async fn insert_pending(
        &self,
        flow_name: &str,
        payloads: &[serde_json::Value],
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    /// Claim up to `batch_size` pending records for `flow_name`, FIFO by
    /// `created_at`, skipping rows already locked by another claimant
    /// (spec.md §4.3.1). Returns an empty `Vec` if there is nothing pending —
    /// never an error.
    async fn claim_batch(
        &self,
        flow_name: &str,
        batch_size: u32,
        instance_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueueRecord>, StoreError>;

    /// Transition a `processing` record to `completed`, merging `result`
    /// into its payload under the `"result"` key. Fails with
    /// [`StoreError::AlreadyFinalized`] if the record is not currently
    /// `processing`.
    async fn mark_completed(
        &self,
        id: i64,
        result: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Transition a `processing` record to `failed`, recording `error`
    /// (truncated to 4 KiB) and incrementing `retry_count`. Fails with
    /// [`StoreError::AlreadyFinalized`] if the record is not currently
    /// `processing`.
    async fn mark_failed(
        &self,
        id: i64,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Reset every `processing` record whose `claimed_at` is older than
    /// `before` back to `pending`, incrementing `retry_count`. Idempotent:
    /// running it twice in succession returns 0 the second time.
    async fn reset_orphaned(
        &self,
        before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    /// Promote `failed` records with `retry_count < max_retries` for
    /// `flow_name` back to `pending`, clearing `completed_at` and
    /// `error_message`.
    async fn reset_failed(
        &self,
        flow_name: &str,
        max_retries: i32,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    /// Count records by status, optionally scoped to one flow.
    async fn counts_by_status(
        &self,
        flow_name: Option<&str>,
    ) -> Result<BTreeMap<String, i64>, StoreError>;
}
