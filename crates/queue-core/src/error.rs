// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for the core protocol, lifecycle, and health components.

use crate::config::ConfigError;

/// Errors raised while bringing a worker from `Initializing` to `Running`,
/// or while deciding whether to restart after `Failed` (spec.md §4.5).
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("startup validation failed: {0}")]
    Validation(String),

    #[error("dependency {name} did not become ready within {timeout_sec}s")]
    DependencyTimeout { name: String, timeout_sec: u64 },

    #[error("restart policy denies further restarts after {attempts} attempts")]
    RestartDenied { attempts: u32 },
}

/// The top-level error a worker process can fail with, used by the binary
/// entry point to select an exit code (spec.md §6.5).
#[derive(Debug, thiserror::Error)]
pub enum FatalError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error(transparent)]
    Store(#[from] queue_store::StoreError),
}

impl FatalError {
    /// Map this error to the process exit code in spec.md §6.5.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => 1,
            Self::Lifecycle(LifecycleError::Validation(_)) => 1,
            Self::Lifecycle(LifecycleError::DependencyTimeout { .. }) => 2,
            Self::Lifecycle(LifecycleError::RestartDenied { .. }) => 4,
            Self::Store(_) => 3,
        }
    }
}
