// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Builds a [`QueueStore`] from a connection string, dispatching on the
//! URL scheme the way a multi-database router needs to (spec.md §4.2).

use std::sync::Arc;
use std::time::Duration;

use queue_store::{Dialect, PostgresStore, QueueStore, SqliteStore, StoreDescriptor};

use crate::error::WorkerError;

/// Connect a store for `dsn`, choosing the Postgres or SQLite backend by
/// scheme. `read_only` marks source stores the worker must never write to.
pub async fn connect(
    dsn: &str,
    pool_size: u32,
    pool_overflow: u32,
    query_timeout: Duration,
    read_only: bool,
) -> Result<Arc<dyn QueueStore>, WorkerError> {
    let dialect = if dsn.starts_with("postgres://") || dsn.starts_with("postgresql://") {
        Dialect::Postgres
    } else if dsn.starts_with("sqlite:") {
        Dialect::Sqlite
    } else {
        return Err(WorkerError::UnrecognizedDsn(dsn.to_string()));
    };

    let descriptor = StoreDescriptor {
        dialect,
        connection_string: dsn.to_string(),
        pool_size,
        max_overflow: pool_overflow,
        query_timeout,
        read_only,
    };

    let store: Arc<dyn QueueStore> = match dialect {
        Dialect::Postgres => Arc::new(
            PostgresStore::connect(&descriptor)
                .await
                .map_err(queue_core::FatalError::from)?,
        ),
        Dialect::Sqlite => Arc::new(
            SqliteStore::connect(&descriptor)
                .await
                .map_err(queue_core::FatalError::from)?,
        ),
    };

    Ok(store)
}
