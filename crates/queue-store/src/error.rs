// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types and transient/permanent classification for store operations.

/// Errors a [`crate::QueueStore`] operation can fail with.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Every retry attempt was exhausted on a transient fault (connection
    /// reset, deadlock, serialization failure, operational timeout).
    #[error("store unavailable after retrying: {0}")]
    StoreUnavailable(String),

    /// A non-retryable failure: syntax error, constraint violation,
    /// permission error, checksum mismatch, or a timeout caused by query
    /// shape rather than transient load.
    #[error("store error ({kind}): {detail}")]
    StoreErrorKind { kind: &'static str, detail: String },

    /// A completion or failure transition targeted a record that was not in
    /// `processing` — either it does not exist or it was already finalized.
    #[error("record {id} is not claimable or already finalized")]
    AlreadyFinalized { id: i64 },

    /// A completion result exceeded the configured size bound.
    #[error("result for record {id} is {size} bytes, exceeding the {limit} byte bound")]
    ResultTooLarge { id: i64, size: usize, limit: usize },

    /// Schema migration failed.
    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match classify(&err) {
            ErrorClass::Transient => StoreError::StoreUnavailable(err.to_string()),
            ErrorClass::Permanent => StoreError::StoreErrorKind {
                kind: "query",
                detail: err.to_string(),
            },
        }
    }
}

/// Whether a failure is worth retrying under back-off, or permanent and
/// should propagate immediately (spec.md §4.1, "Retry classification").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Permanent,
}

/// SQLite's primary result code for "another connection holds the write
/// lock"; retrying under back-off is the documented way to ride this out.
const SQLITE_BUSY: u32 = 5;
/// SQLite's primary result code for "a table used by this statement is
/// locked by another connection in the same process".
const SQLITE_LOCKED: u32 = 6;

/// Classify a `sqlx::Error` into the transient/permanent sets described in
/// spec.md §4.1. Transient: connection reset, deadlock victim, serialization
/// failure, operational timeout, "server gone"-style errors, and SQLite
/// `SQLITE_BUSY`/`SQLITE_LOCKED` contention under `BEGIN IMMEDIATE`.
/// Everything else (syntax errors, constraint violations, permission errors)
/// is permanent.
pub fn classify(err: &sqlx::Error) -> ErrorClass {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            ErrorClass::Transient
        }
        sqlx::Error::Database(db_err) => {
            // SQLSTATE 40001 = serialization_failure, 40P01 = deadlock_detected.
            match db_err.code().as_deref() {
                Some("40001") | Some("40P01") => return ErrorClass::Transient,
                _ => {}
            }
            // SQLite reports extended result codes as a plain integer string;
            // mask to the primary code since BUSY/LOCKED have several
            // extended variants (SQLITE_BUSY_SNAPSHOT, SQLITE_LOCKED_VTAB, ...).
            let sqlite_primary_code = db_err.code().and_then(|c| c.parse::<u32>().ok()).map(|c| c & 0xff);
            match sqlite_primary_code {
                Some(SQLITE_BUSY) | Some(SQLITE_LOCKED) => ErrorClass::Transient,
                _ => ErrorClass::Permanent,
            }
        }
        _ => ErrorClass::Permanent,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlite_busy_and_locked_codes_are_transient() {
        assert_eq!(classify_sqlite_code(5), ErrorClass::Transient);
        assert_eq!(classify_sqlite_code(6), ErrorClass::Transient);
        // SQLITE_BUSY_SNAPSHOT: extended code 5 | (2 << 8)
        assert_eq!(classify_sqlite_code(517), ErrorClass::Transient);
        // SQLITE_LOCKED_VTAB: extended code 6 | (2 << 8)
        assert_eq!(classify_sqlite_code(518), ErrorClass::Transient);
    }

    #[test]
    fn sqlite_constraint_violation_is_permanent() {
        // SQLITE_CONSTRAINT_UNIQUE
        assert_eq!(classify_sqlite_code(2067), ErrorClass::Permanent);
    }

    fn classify_sqlite_code(code: u32) -> ErrorClass {
        match code & 0xff {
            SQLITE_BUSY | SQLITE_LOCKED => ErrorClass::Transient,
            _ => ErrorClass::Permanent,
        }
    }
}
