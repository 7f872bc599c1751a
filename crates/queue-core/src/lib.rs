// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Distributed work-queue processor core.
//!
//! This crate implements the claim-and-process protocol over a relational
//! queue table, the worker lifecycle state machine, and the health/queue-
//! status aggregation that drives external orchestrators' probes. It is
//! database-agnostic: [`queue_store::QueueStore`] implementations supply the
//! Postgres and SQLite backends.
//!
//! # Modules
//!
//! - [`config`]: process configuration loaded from `APP_*` environment
//!   variables.
//! - [`identity`]: worker instance id generation.
//! - [`processor`]: the Distributed Processor — claim, complete, fail,
//!   orphan recovery, failed-record retry.
//! - [`worker_loop`]: drives the processor batch after batch.
//! - [`lifecycle`]: the worker lifecycle state machine, startup validation,
//!   dependency waiting, and restart policy.
//! - [`health`]: aggregates store probes, queue counts, and lifecycle state
//!   into a `HealthReport`.
//! - [`error`]: error types and the process exit-code mapping.

pub mod config;
pub mod error;
pub mod health;
pub mod identity;
pub mod lifecycle;
pub mod processor;
pub mod worker_loop;

pub use config::{Config, ConfigError, RestartPolicy};
pub use error::{FatalError, LifecycleError};
pub use health::{HealthReport, HealthSurface, NamedStore, Status as HealthStatus};
pub use identity::worker_instance_id;
pub use lifecycle::{LifecycleEvent, LifecycleManager, LifecycleState};
pub use processor::DistributedProcessor;
pub use worker_loop::{BatchSummary, EchoFlowProcessor, FlowProcessor, WorkerLoop, WorkerLoopConfig};
