// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The Distributed Processor: the component that enforces the
//! claim-and-process protocol's invariants (spec.md §4.3).

use std::sync::Arc;

use chrono::Utc;
use queue_store::{QueueRecord, QueueStore, StoreError};

/// Owns a queue store and this process's identity, and exposes the
/// protocol operations with `now` supplied internally (callers never pass
/// timestamps — that would let two callers disagree about "now").
pub struct DistributedProcessor {
    store: Arc<dyn QueueStore>,
    flow_name: String,
    instance_id: String,
}

impl DistributedProcessor {
    pub fn new(store: Arc<dyn QueueStore>, flow_name: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self {
            store,
            flow_name: flow_name.into(),
            instance_id: instance_id.into(),
        }
    }

    pub fn flow_name(&self) -> &str {
        &self.flow_name
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn store(&self) -> &Arc<dyn QueueStore> {
        &self.store
    }

    /// Claim up to `batch_size` pending records for this processor's flow
    /// (spec.md §4.3.1). Returns `[]`, never an error, when nothing is
    /// pending.
    pub async fn claim_batch(&self, batch_size: u32) -> Result<Vec<QueueRecord>, StoreError> {
        self.store
            .claim_batch(&self.flow_name, batch_size, &self.instance_id, Utc::now())
            .await
    }

    /// Transition a claimed record to `completed` (spec.md §4.3.2).
    pub async fn mark_completed(&self, id: i64, result: serde_json::Value) -> Result<(), StoreError> {
        self.store.mark_completed(id, result, Utc::now()).await
    }

    /// Transition a claimed record to `failed` (spec.md §4.3.2).
    pub async fn mark_failed(&self, id: i64, error: &str) -> Result<(), StoreError> {
        self.store.mark_failed(id, error, Utc::now()).await
    }

    /// Reset `processing` records orphaned longer than `timeout` back to
    /// `pending` (spec.md §4.3.3). Idempotent.
    pub async fn reset_orphaned(&self, timeout: std::time::Duration) -> Result<u64, StoreError> {
        let now = Utc::now();
        let before = now - chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::zero());
        self.store.reset_orphaned(before, now).await
    }

    /// Promote `failed` records under the retry ceiling back to `pending`
    /// (spec.md §4.3.4).
    pub async fn reset_failed(&self, max_retries: i32) -> Result<u64, StoreError> {
        self.store
            .reset_failed(&self.flow_name, max_retries, Utc::now())
            .await
    }

    /// Insert new pending records for this processor's flow.
    pub async fn insert_pending(&self, payloads: &[serde_json::Value]) -> Result<u64, StoreError> {
        self.store
            .insert_pending(&self.flow_name, payloads, Utc::now())
            .await
    }

    /// Count records by status for this processor's flow.
    pub async fn counts_by_status(&self) -> Result<std::collections::BTreeMap<String, i64>, StoreError> {
        self.store.counts_by_status(Some(&self.flow_name)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use queue_store::{Dialect, SqliteStore, StoreDescriptor};
    use std::time::Duration;

    async fn test_processor() -> DistributedProcessor {
        let descriptor = StoreDescriptor {
            dialect: Dialect::Sqlite,
            connection_string: "sqlite::memory:".to_string(),
            pool_size: 1,
            max_overflow: 0,
            query_timeout: Duration::from_secs(5),
            read_only: false,
        };
        let store = SqliteStore::connect(&descriptor).await.unwrap();
        store.migrate().await.unwrap();
        DistributedProcessor::new(Arc::new(store), "demo", "worker-test")
    }

    #[tokio::test]
    async fn claim_then_complete_updates_counts() {
        let processor = test_processor().await;
        processor
            .insert_pending(&[serde_json::json!({"n": 1})])
            .await
            .unwrap();

        let claimed = processor.claim_batch(10).await.unwrap();
        assert_eq!(claimed.len(), 1);

        processor
            .mark_completed(claimed[0].id, serde_json::json!({"ok": true}))
            .await
            .unwrap();

        let counts = processor.counts_by_status().await.unwrap();
        assert_eq!(counts.get("completed"), Some(&1));
    }

    #[tokio::test]
    async fn failed_record_increments_retry_count() {
        let processor = test_processor().await;
        processor
            .insert_pending(&[serde_json::json!({})])
            .await
            .unwrap();
        let claimed = processor.claim_batch(1).await.unwrap();

        processor.mark_failed(claimed[0].id, "boom").await.unwrap();

        let reset = processor.reset_failed(5).await.unwrap();
        assert_eq!(reset, 1);
    }
}
