// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for the worker binary.

use thiserror::Error;

/// Errors that can occur while wiring up or running a worker process, on
/// top of the `FatalError` cases `queue-core` already maps to exit codes.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// A DSN did not carry a recognized `postgres://`/`postgresql://`/`sqlite:` scheme.
    #[error("unrecognized database URL scheme in {0:?}")]
    UnrecognizedDsn(String),

    /// Core protocol, lifecycle, or health error.
    #[error(transparent)]
    Core(#[from] queue_core::FatalError),

    /// HTTP server failed to bind or serve.
    #[error("health server error: {0}")]
    Http(#[from] std::io::Error),
}

impl WorkerError {
    /// Map this error to the process exit code (spec.md §6.5). Errors that
    /// originate outside `queue-core`'s own taxonomy exit 1, matching a
    /// configuration failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Core(inner) => inner.exit_code(),
            Self::UnrecognizedDsn(_) | Self::Http(_) => 1,
        }
    }
}
