// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed [`QueueStore`] implementation.
//!
//! Claims use a `FOR UPDATE SKIP LOCKED` CTE folded into a single
//! `UPDATE ... FROM ... RETURNING` statement, so the select-lock-update
//! sequence is one round trip and one implicit transaction — no transaction
//! handle is held across the call.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use tracing::debug;

use crate::error::StoreError;
use crate::record::{QueueRecord, StoreDescriptor, Status};
use crate::retry::{retry_transient, RetryPolicy};
use crate::store::{Probe, QueueStore};

/// Migrations embedded for the Postgres dialect (spec.md §6.6).
static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/postgresql");

/// Claim batch size is clamped to this ceiling regardless of the caller's
/// request, to bound transaction duration (spec.md §4.3.1).
const MAX_BATCH_SIZE: u32 = 1000;

/// The maximum size, in bytes, of a completion result payload (spec.md §9
/// Open Question: bounded rather than silently truncated).
const MAX_RESULT_BYTES: usize = 1024 * 1024;

/// Error messages are truncated to this many bytes before being stored.
const MAX_ERROR_BYTES: usize = 4096;

#[derive(sqlx::FromRow)]
struct QueueRow {
    id: i64,
    flow_name: String,
    payload: sqlx::types::Json<serde_json::Value>,
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
    type Error = crate::record::ParseStatusError;

    fn try_from(row: QueueRow) -> Result<Self, Self::Error> {
        Ok(QueueRecord {
            id: row.id,
            flow_name: row.flow_name,
            payload: row.payload.0,
            status: Status::from_str(&row.status)?,
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

/// Pooled, retrying access to a writable or read-only Postgres queue store.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
    retry_policy: RetryPolicy,
}

impl PostgresStore {
    /// Build a connection pool from a [`StoreDescriptor`] and return a new
    /// store. Connections are validated on checkout; pool size is
    /// `pool_size + max_overflow` (spec.md §4.1 "Pooling").
    pub async fn connect(descriptor: &StoreDescriptor) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(descriptor.pool_size + descriptor.max_overflow)
            .acquire_timeout(descriptor.query_timeout)
            .test_before_acquire(true)
            .connect(&descriptor.connection_string)
            .await?;

        Ok(Self {
            pool,
            retry_policy: RetryPolicy::default(),
        })
    }

    /// Wrap an already-constructed pool (used by tests and by callers that
    /// manage their own pool lifecycle).
    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            retry_policy: RetryPolicy::default(),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl QueueStore for PostgresStore {
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
            sqlx::query(
                r#"
                INSERT INTO processing_queue (flow_name, payload, status, retry_count, created_at, updated_at)
                VALUES ($1, $2, 'pending', 0, $3, $3)
                "#,
            )
            .bind(flow_name)
            .bind(sqlx::types::Json(payload))
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

        let rows: Vec<QueueRow> = retry_transient(&self.retry_policy, || {
            sqlx::query_as(
                r#"
                WITH candidates AS (
                    SELECT id
                    FROM processing_queue
                    WHERE flow_name = $1 AND status = 'pending'
                    ORDER BY created_at ASC, id ASC
                    LIMIT $2
                    FOR UPDATE SKIP LOCKED
                )
                UPDATE processing_queue AS q
                SET status = 'processing',
                    flow_instance_id = $3,
                    claimed_at = $4,
                    updated_at = $4
                FROM candidates
                WHERE q.id = candidates.id
                RETURNING q.id, q.flow_name, q.payload, q.status, q.flow_instance_id,
                          q.claimed_at, q.completed_at, q.error_message, q.retry_count,
                          q.created_at, q.updated_at
                "#,
            )
            .bind(flow_name)
            .bind(limit)
            .bind(instance_id)
            .bind(now)
            .fetch_all(&self.pool)
        })
        .await?;

        rows.into_iter()
            .map(|row: QueueRow| {
                QueueRecord::try_from(row).map_err(|e| StoreError::StoreErrorKind {
                    kind: "invalid_status",
                    detail: e.to_string(),
                })
            })
            .collect()
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

        let result = retry_transient(&self.retry_policy, || {
            sqlx::query(
                r#"
                UPDATE processing_queue
                SET status = 'completed',
                    completed_at = $2,
                    payload = payload || jsonb_build_object('result', $3::jsonb),
                    updated_at = $2
                WHERE id = $1 AND status = 'processing'
                "#,
            )
            .bind(id)
            .bind(now)
            .bind(sqlx::types::Json(&result))
            .execute(&self.pool)
        })
        .await?;

        if result.rows_affected() == 0 {
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
        let truncated = truncate_utf8(error, MAX_ERROR_BYTES);

        let result = retry_transient(&self.retry_policy, || {
            sqlx::query(
                r#"
                UPDATE processing_queue
                SET status = 'failed',
                    completed_at = $2,
                    error_message = $3,
                    retry_count = retry_count + 1,
                    updated_at = $2
                WHERE id = $1 AND status = 'processing'
                "#,
            )
            .bind(id)
            .bind(now)
            .bind(truncated)
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
                SET status = 'pending',
                    flow_instance_id = NULL,
                    claimed_at = NULL,
                    retry_count = retry_count + 1,
                    updated_at = $2
                WHERE status = 'processing' AND claimed_at < $1
                "#,
            )
            .bind(before)
            .bind(now)
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
                SET status = 'pending',
                    completed_at = NULL,
                    error_message = NULL,
                    updated_at = $3
                WHERE flow_name = $1 AND status = 'failed' AND retry_count < $2
                "#,
            )
            .bind(flow_name)
            .bind(max_retries)
            .bind(now)
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
                WHERE $1::text IS NULL OR flow_name = $1
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

/// Truncate a string to at most `max_bytes` bytes, never splitting a UTF-8
/// character.
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

    #[test]
    fn truncate_utf8_respects_char_boundaries() {
        let s = "héllo wörld";
        let truncated = truncate_utf8(s, 4);
        assert!(s.len() >= truncated.len());
        assert!(std::str::from_utf8(truncated.as_bytes()).is_ok());
    }

    #[test]
    fn truncate_utf8_noop_when_short() {
        assert_eq!(truncate_utf8("short", 4096), "short");
    }
}
