// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Queue record and supporting value types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The unit of work in the queue. See the queue table schema for the
/// authoritative column list this mirrors.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueRecord {
    pub id: i64,
    pub flow_name: String,
    pub payload: serde_json::Value,
    pub status: Status,
    pub flow_instance_id: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub retry_count: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The queue record status state machine (spec.md §3.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a status string does not match one of the four
/// enumerated values.
#[derive(Debug, thiserror::Error)]
#[error("{0:?} is not a valid queue record status")]
pub struct ParseStatusError(String);

impl FromStr for Status {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(ParseStatusError(other.to_owned())),
        }
    }
}

/// The SQL dialect a [`StoreDescriptor`] talks to, affecting rendering and
/// dialect-specific features (skip-locked vs. single-writer transactions).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    Postgres,
    Sqlite,
}

/// Names a database this worker talks to. The core requires exactly one
/// writable store (the queue store) and zero or more read-only source stores.
#[derive(Debug, Clone)]
pub struct StoreDescriptor {
    pub dialect: Dialect,
    pub connection_string: String,
    pub pool_size: u32,
    pub max_overflow: u32,
    pub query_timeout: std::time::Duration,
    pub read_only: bool,
}
