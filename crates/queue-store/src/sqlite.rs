// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed [`QueueStore`] implementation.
//!
//! SQLite has no `SKIP LOCKED`; a single writer lock serializes the whole
//! database. Claims instead open a `BEGIN IMMEDIATE` transaction, which
//! acquires that writer lock up front rather than on first write, so two
//! claimants racing for the same batch serialize instead of one discovering
//! a write conflict mid-transaction (spec.md §4.3.1, dialect portability).

use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tracing::debug;

use crate::error::StoreError;
use crate::record::{QueueRecord, StoreDescriptor, Status};
use crate::retry::{retry_transient, RetryPolicy};
use crate::store::{Probe, QueueStore};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

const MAX_BATCH_SIZE: u32 = 1000;
const MAX_RESULT_BYTES: usize = 1024 * 1024;
const MAX_ERROR_BYTES: usize = 4096;

#[derive(sqlx::FromRow)]
struct QueueRow {
    id: i64,
    flow_name: String,
    payload: String,
    status: String,
    flow_instance_id: Option<String>,
    claimed_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
    retry_count: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<QueueRow> for QueueRecord {
    type Error = StoreError;

    fn try_from(row: QueueRow) -> Result<Self, Self::Error> {
        let payload: serde_json::Value =
            serde_json::from_str(&row.payload).map_err(|e| StoreError::StoreErrorKind {
                kind: "invalid_payload",
                detail: e.to_string(),
            })?;
        let status = Status::from_str(&row.status).map_err(|e| StoreError::StoreErrorKind {
            kind: "invalid_status",
            detail: e.to_string(),
        })?;
        Ok(QueueRecord {
            id: row.id,
            flow_name: row.flow_name,
            payload,
            status,
            flow_instance_id: row.flow_instance_id,
            claimed_at: row.claimed_at,
            completed_at: row.completed_at,
            error_message: row.error_message,
            retry_count: row.retry_count,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Pooled, retrying access to a SQLite queue store — used for single-node
/// deployments and in tests in place of a live Postgres instance.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    retry_policy: RetryPolicy,
}

impl SqliteStore {
    pub async fn connect(descriptor: &StoreDescriptor) -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(descriptor.pool_size + descriptor.max_overflow)
            .acquire_timeout(descriptor.query_timeout)
            .connect(&descriptor.connection_string)
            .await?;

        Ok(Self {
            pool,
            retry_policy: RetryPolicy::default(),
        })
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            retry_policy: RetryPolicy::default(),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl QueueStore for SqliteStore {
    async fn probe(&self, timeout: Duration) -> Probe {
        let start = Instant::now();
        let reachable = tokio::time::timeout(timeout, sqlx::query("SELECT 1").execute(&self.pool))
            .await
            .map(|res| res.is_ok())
            .unwrap_or(false);
        let round_trip_ms = start.elapsed().as_secs_f64() * 1000.0;

        let schema_version = if reachable {
            sqlx::query_scalar::<_, Option<i64>>(
                "SELECT MAX(version) FROM _sqlx_migrations WHERE success",
            )
            .fetch_one(&self.pool)
            .await
            .ok()
            .flatten()
            .map(|v| format!("V{:03}", v))
        } else {
            None
        };

        Probe {
            reachable,
            round_trip_ms,
            schema_version,
        }
    }

    async fn migrate(&self) -> Result<Vec<i64>, StoreError> {
        MIGRATOR.run(&self.pool).await?;
        let versions: Vec<i64> = sqlx::query_scalar(
            "SELECT version FROM _sqlx_migrations WHERE success ORDER BY version ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(versions)
    }

    async fn insert_pending(
        &self,
        flow_name: &str,
        payloads: &[serde_json::Value],
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        if payloads.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        for payload in payloads {
            let payload_text = serde_json::to_string(payload).map_err(|e| {
                StoreError::StoreErrorKind {
                    kind: "invalid_payload",
                    detail: e.to_string(),
                }
            })?;
            sqlx::query(
                r#"
                INSERT INTO processing_queue (flow_name, payload, status, retry_count, created_at, updated_at)
                VALUES (?, ?, 'pending', 0, ?, ?)
                "#,
            )
            .bind(flow_name)
            .bind(payload_text)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        Ok(payloads.len() as u64)
    }

    async fn claim_batch(
        &self,
        flow_name: &str,
        batch_size: u32,
        instance_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueueRecord>, StoreError> {
        if batch_size == 0 {
            return Ok(Vec::new());
        }
        let limit = batch_size.min(MAX_BATCH_SIZE) as i64;

        let rows: Vec<QueueRow> = retry_transient(&self.retry_policy, || async {
            // `pool.begin()` issues a plain `BEGIN`; the writer lock is only
            // acquired lazily on first write, which would let two claimants
            // both read the same candidate rows before either writes. Grab
            // a raw connection and start the transaction as IMMEDIATE so the
            // lock is held from the start.
            let mut conn = self.pool.acquire().await?;
            sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

            let result = claim_within_transaction(&mut conn, flow_name, limit, instance_id, now).await;

            match result {
                Ok(claimed) => {
                    sqlx::query("COMMIT").execute(&mut *conn).await?;
                    Ok(claimed)
                }
                Err(err) => {
                    sqlx::query("ROLLBACK").execute(&mut *conn).await.ok();
                    Err(err)
                }
            }
        })
        .await?;

        rows.into_iter().map(TryFrom::try_from).collect()
    }

    async fn mark_completed(
        &self,
        id: i64,
        result: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let size = serde_json::to_vec(&result).map(|v| v.len()).unwrap_or(0);
        if size > MAX_RESULT_BYTES {
            return Err(StoreError::ResultTooLarge {
                id,
                size,
                limit: MAX_RESULT_BYTES,
            });
        }

        let outcome = retry_transient(&self.retry_policy, || async {
            let mut tx = self.pool.begin().await?;
            let current: Option<String> =
                sqlx::query_scalar("SELECT payload FROM processing_queue WHERE id = ? AND status = 'processing'")
                    .bind(id)
                    .fetch_optional(&mut *tx)
                    .await?;

            let Some(current) = current else {
                return Ok(false);
            };
            let mut merged: serde_json::Value =
                serde_json::from_str(&current).unwrap_or(serde_json::Value::Null);
            if let serde_json::Value::Object(ref mut map) = merged {
                map.insert("result".to_string(), result.clone());
            }
            let merged_text = serde_json::to_string(&merged).unwrap_or_default();

            let res = sqlx::query(
                r#"
                UPDATE processing_queue
                SET status = 'completed', completed_at = ?, payload = ?, updated_at = ?
                WHERE id = ? AND status = 'processing'
                "#,
            )
            .bind(now)
            .bind(merged_text)
            .bind(now)
            .bind(id)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            Ok(res.rows_affected() > 0)
        })
        .await?;

        if !outcome {
            return Err(StoreError::AlreadyFinalized { id });
        }
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: i64,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let truncated = truncate_utf8(error, MAX_ERROR_BYTES).to_string();

        let result = retry_transient(&self.retry_policy, || {
            sqlx::query(
                r#"
                UPDATE processing_queue
                SET status = 'failed', completed_at = ?, error_message = ?,
                    retry_count = retry_count + 1, updated_at = ?
                WHERE id = ? AND status = 'processing'
                "#,
            )
            .bind(now)
            .bind(truncated.clone())
            .bind(now)
            .bind(id)
            .execute(&self.pool)
        })
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::AlreadyFinalized { id });
        }
        Ok(())
    }

    async fn reset_orphaned(
        &self,
        before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result = retry_transient(&self.retry_policy, || {
            sqlx::query(
                r#"
                UPDATE processing_queue
                SET status = 'pending', flow_instance_id = NULL, claimed_at = NULL,
                    retry_count = retry_count + 1, updated_at = ?
                WHERE status = 'processing' AND claimed_at < ?
                "#,
            )
            .bind(now)
            .bind(before)
            .execute(&self.pool)
        })
        .await?;

        let count = result.rows_affected();
        if count > 0 {
            debug!(count, "reset orphaned records to pending");
        }
        Ok(count)
    }

    async fn reset_failed(
        &self,
        flow_name: &str,
        max_retries: i32,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result = retry_transient(&self.retry_policy, || {
            sqlx::query(
                r#"
                UPDATE processing_queue
                SET status = 'pending', completed_at = NULL, error_message = NULL, updated_at = ?
                WHERE flow_name = ? AND status = 'failed' AND retry_count < ?
                "#,
            )
            .bind(now)
            .bind(flow_name)
            .bind(max_retries)
            .execute(&self.pool)
        })
        .await?;

        Ok(result.rows_affected())
    }

    async fn counts_by_status(
        &self,
        flow_name: Option<&str>,
    ) -> Result<BTreeMap<String, i64>, StoreError> {
        let rows = retry_transient(&self.retry_policy, || {
            sqlx::query(
                r#"
                SELECT status, COUNT(*) AS count
                FROM processing_queue
                WHERE ?1 IS NULL OR flow_name = ?1
                GROUP BY status
                "#,
            )
            .bind(flow_name)
            .fetch_all(&self.pool)
        })
        .await?;

        let mut counts = BTreeMap::new();
        for row in rows {
            let status: String = row.try_get("status").map_err(StoreError::from)?;
            let count: i64 = row.try_get("count").map_err(StoreError::from)?;
            counts.insert(status, count);
        }
        Ok(counts)
    }
}

async fn claim_within_transaction(
    conn: &mut sqlx::SqliteConnection,
    flow_name: &str,
    limit: i64,
    instance_id: &str,
    now: DateTime<Utc>,
) -> Result<Vec<QueueRow>, sqlx::Error> {
    let ids: Vec<i64> = sqlx::query_scalar(
        r#"
        SELECT id FROM processing_queue
        WHERE flow_name = ? AND status = 'pending'
        ORDER BY created_at ASC, id ASC
        LIMIT ?
        "#,
    )
    .bind(flow_name)
    .bind(limit)
    .fetch_all(&mut *conn)
    .await?;

    let mut claimed = Vec::with_capacity(ids.len());
    for id in &ids {
        sqlx::query(
            r#"
            UPDATE processing_queue
            SET status = 'processing', flow_instance_id = ?, claimed_at = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(instance_id)
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&mut *conn)
        .await?;

        let row: QueueRow = sqlx::query_as(
            r#"
            SELECT id, flow_name, payload, status, flow_instance_id, claimed_at,
                   completed_at, error_message, retry_count, created_at, updated_at
            FROM processing_queue WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_one(&mut *conn)
        .await?;
        claimed.push(row);
    }

    Ok(claimed)
}

fn truncate_utf8(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Dialect;
    use std::time::Duration as StdDuration;

    async fn test_store() -> SqliteStore {
        let descriptor = StoreDescriptor {
            dialect: Dialect::Sqlite,
            connection_string: "sqlite::memory:".to_string(),
            pool_size: 1,
            max_overflow: 0,
            query_timeout: StdDuration::from_secs(5),
            read_only: false,
        };
        let store = SqliteStore::connect(&descriptor).await.unwrap();
        store.migrate().await.unwrap();
        store
    }

    #[tokio::test]
    async fn insert_then_claim_round_trip() {
        let store = test_store().await;
        let now = chrono::Utc::now();
        store
            .insert_pending("demo", &[serde_json::json!({"n": 1})], now)
            .await
            .unwrap();

        let claimed = store.claim_batch("demo", 10, "worker-1", now).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].status, Status::Processing);

        let again = store.claim_batch("demo", 10, "worker-2", now).await.unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn mark_completed_rejects_non_processing_record() {
        let store = test_store().await;
        let now = chrono::Utc::now();
        store
            .insert_pending("demo", &[serde_json::json!({})], now)
            .await
            .unwrap();

        let err = store
            .mark_completed(1, serde_json::json!({"ok": true}), now)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyFinalized { id: 1 }));
    }

    #[tokio::test]
    async fn reset_orphaned_is_idempotent() {
        let store = test_store().await;
        let now = chrono::Utc::now();
        store
            .insert_pending("demo", &[serde_json::json!({})], now)
            .await
            .unwrap();
        store.claim_batch("demo", 1, "worker-1", now).await.unwrap();

        let later = now + chrono::Duration::minutes(10);
        let reset_count = store.reset_orphaned(later, later).await.unwrap();
        assert_eq!(reset_count, 1);

        let reset_again = store.reset_orphaned(later, later).await.unwrap();
        assert_eq!(reset_again, 0);
    }

    /// Two claimants racing `claim_batch` against one shared store must
    /// never see the same record twice (exactly-once claim, spec.md §4.3.1
    /// P1), and together must drain the whole pending set (FIFO fairness
    /// across workers, P2) rather than one worker starving the other.
    #[tokio::test]
    async fn concurrent_claim_batches_are_disjoint_and_exhaustive() {
        let descriptor = StoreDescriptor {
            dialect: Dialect::Sqlite,
            connection_string: "file:concurrent_claim_test?mode=memory&cache=shared".to_string(),
            pool_size: 4,
            max_overflow: 0,
            query_timeout: StdDuration::from_secs(5),
            read_only: false,
        };
        let store = SqliteStore::connect(&descriptor).await.unwrap();
        store.migrate().await.unwrap();

        let now = chrono::Utc::now();
        let total = 40;
        let payloads: Vec<serde_json::Value> = (0..total).map(|n| serde_json::json!({"n": n})).collect();
        store.insert_pending("demo", &payloads, now).await.unwrap();

        let store_a = store.clone();
        let store_b = store.clone();
        let batches_per_worker = 4;
        let batch_size = (total as u32) / (batches_per_worker * 2) + 1;

        let worker = |store: SqliteStore, name: &'static str| async move {
            let mut claimed = Vec::new();
            for _ in 0..batches_per_worker {
                let batch = store.claim_batch("demo", batch_size, name, now).await.unwrap();
                if batch.is_empty() {
                    break;
                }
                claimed.extend(batch.into_iter().map(|r| r.id));
            }
            claimed
        };

        let (claimed_a, claimed_b) =
            tokio::join!(worker(store_a, "worker-a"), worker(store_b, "worker-b"));

        let set_a: std::collections::HashSet<i64> = claimed_a.iter().copied().collect();
        let set_b: std::collections::HashSet<i64> = claimed_b.iter().copied().collect();
        assert_eq!(set_a.len(), claimed_a.len(), "worker-a claimed a record twice");
        assert_eq!(set_b.len(), claimed_b.len(), "worker-b claimed a record twice");
        assert!(set_a.is_disjoint(&set_b), "both workers claimed the same record");

        let mut union: Vec<i64> = set_a.union(&set_b).copied().collect();
        union.sort_unstable();
        let expected: Vec<i64> = (1..=total as i64).collect();
        assert_eq!(union, expected, "claimed ids did not cover the full pending set");
    }
}
