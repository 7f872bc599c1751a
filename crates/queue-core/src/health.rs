// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The Health Surface: aggregates store probes, queue counts, and
//! lifecycle state into a single report (spec.md §4.6).

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use queue_store::QueueStore;
use serde::Serialize;

use crate::lifecycle::{LifecycleManager, LifecycleState};
use crate::processor::DistributedProcessor;

/// Overall health classification (spec.md §4.6, "Composition").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct InstanceInfo {
    pub id: String,
    pub host: String,
    pub flow: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreHealth {
    pub reachable: bool,
    pub round_trip_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FlowCounts {
    pub pending: i64,
    pub processing: i64,
    pub failed: i64,
    pub completed_recent: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    pub pending: i64,
    pub processing: i64,
    pub failed: i64,
    pub completed_recent: i64,
    pub by_flow: BTreeMap<String, FlowCounts>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LifecycleInfo {
    pub state: LifecycleState,
    pub uptime_sec: u64,
    pub restart_count: u32,
}

/// The full health report served at `GET /health` (spec.md §6.3).
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: Status,
    pub instance: InstanceInfo,
    pub stores: BTreeMap<String, StoreHealth>,
    pub queue: QueueSnapshot,
    pub lifecycle: LifecycleInfo,
    pub ts: DateTime<Utc>,
}

/// A named dependency store the surface probes, distinguishing required
/// stores (failing these means `unhealthy`) from optional ones (failing
/// these only degrades).
pub struct NamedStore {
    pub name: String,
    pub store: Arc<dyn QueueStore>,
    pub required: bool,
}

pub struct HealthSurface {
    processor: Arc<DistributedProcessor>,
    sources: Vec<NamedStore>,
    lifecycle: Arc<LifecycleManager>,
    host: String,
    slow_threshold: Duration,
    alert_depth: i64,
    probe_timeout: Duration,
}

impl HealthSurface {
    pub fn new(
        processor: Arc<DistributedProcessor>,
        sources: Vec<NamedStore>,
        lifecycle: Arc<LifecycleManager>,
        slow_threshold: Duration,
        alert_depth: i64,
        probe_timeout: Duration,
    ) -> Self {
        let host = gethostname::gethostname()
            .into_string()
            .unwrap_or_else(|_| "unknown-host".to_string());
        Self {
            processor,
            sources,
            lifecycle,
            host,
            slow_threshold,
            alert_depth,
            probe_timeout,
        }
    }

    /// Live iff the lifecycle state is one of the "still running" states.
    pub fn is_live(&self) -> bool {
        self.lifecycle.is_live()
    }

    /// Ready iff the lifecycle is `Running` and every required store is
    /// reachable.
    pub async fn is_ready(&self) -> bool {
        if self.lifecycle.state() != LifecycleState::Running {
            return false;
        }
        let queue_probe = self.processor.store().probe(self.probe_timeout).await;
        if !queue_probe.reachable {
            return false;
        }
        for source in self.sources.iter().filter(|s| s.required) {
            if !source.store.probe(self.probe_timeout).await.reachable {
                return false;
            }
        }
        true
    }

    /// Build the full report, bounding the whole aggregation by `budget`
    /// even if a store hangs (spec.md §4.6, "Latency budget").
    pub async fn report(&self, budget: Duration) -> HealthReport {
        match tokio::time::timeout(budget, self.build_report()).await {
            Ok(report) => report,
            Err(_) => self.timed_out_report(),
        }
    }

    async fn build_report(&self) -> HealthReport {
        let queue_probe = self.processor.store().probe(self.probe_timeout).await;
        let mut stores = BTreeMap::new();
        stores.insert(
            "queue".to_string(),
            StoreHealth {
                reachable: queue_probe.reachable,
                round_trip_ms: queue_probe.round_trip_ms,
                schema_version: queue_probe.schema_version.clone(),
            },
        );

        let mut any_required_unreachable = !queue_probe.reachable;
        let mut any_slow = queue_probe.reachable && queue_probe.round_trip_ms > self.slow_threshold.as_secs_f64() * 1000.0;
        let mut any_optional_unreachable = false;

        for source in &self.sources {
            let probe = source.store.probe(self.probe_timeout).await;
            if source.required && !probe.reachable {
                any_required_unreachable = true;
            }
            if !source.required && !probe.reachable {
                any_optional_unreachable = true;
            }
            if probe.reachable && source.required && probe.round_trip_ms > self.slow_threshold.as_secs_f64() * 1000.0 {
                any_slow = true;
            }
            stores.insert(
                source.name.clone(),
                StoreHealth {
                    reachable: probe.reachable,
                    round_trip_ms: probe.round_trip_ms,
                    schema_version: probe.schema_version.clone(),
                },
            );
        }

        let counts = self.processor.counts_by_status().await.unwrap_or_default();
        let pending = *counts.get("pending").unwrap_or(&0);
        let processing = *counts.get("processing").unwrap_or(&0);
        let failed = *counts.get("failed").unwrap_or(&0);
        let completed_recent = *counts.get("completed").unwrap_or(&0);

        let mut by_flow = BTreeMap::new();
        by_flow.insert(
            self.processor.flow_name().to_string(),
            FlowCounts {
                pending,
                processing,
                failed,
                completed_recent,
            },
        );

        let depth_alert = pending + processing > self.alert_depth;

        let status = if any_required_unreachable {
            Status::Unhealthy
        } else if any_slow || any_optional_unreachable || depth_alert {
            Status::Degraded
        } else {
            Status::Healthy
        };

        HealthReport {
            status,
            instance: InstanceInfo {
                id: self.processor.instance_id().to_string(),
                host: self.host.clone(),
                flow: self.processor.flow_name().to_string(),
            },
            stores,
            queue: QueueSnapshot {
                pending,
                processing,
                failed,
                completed_recent,
                by_flow,
            },
            lifecycle: LifecycleInfo {
                state: self.lifecycle.state(),
                uptime_sec: self.lifecycle.uptime().as_secs(),
                restart_count: self.lifecycle.restart_count(),
            },
            ts: Utc::now(),
        }
    }

    fn timed_out_report(&self) -> HealthReport {
        HealthReport {
            status: Status::Degraded,
            instance: InstanceInfo {
                id: self.processor.instance_id().to_string(),
                host: self.host.clone(),
                flow: self.processor.flow_name().to_string(),
            },
            stores: BTreeMap::new(),
            queue: QueueSnapshot {
                pending: 0,
                processing: 0,
                failed: 0,
                completed_recent: 0,
                by_flow: BTreeMap::new(),
            },
            lifecycle: LifecycleInfo {
                state: self.lifecycle.state(),
                uptime_sec: self.lifecycle.uptime().as_secs(),
                restart_count: self.lifecycle.restart_count(),
            },
            ts: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use queue_store::{Dialect, SqliteStore, StoreDescriptor};

    async fn test_surface() -> HealthSurface {
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
        let processor = Arc::new(DistributedProcessor::new(Arc::new(store), "demo", "worker-test"));
        let lifecycle = Arc::new(LifecycleManager::new(10));
        lifecycle.transition(LifecycleState::Starting, "validate_env");
        lifecycle.transition(LifecycleState::Running, "all_dependencies_ready");

        HealthSurface::new(
            processor,
            Vec::new(),
            lifecycle,
            Duration::from_millis(500),
            10_000,
            Duration::from_secs(2),
        )
    }

    #[tokio::test]
    async fn healthy_store_with_no_backlog_reports_healthy() {
        let surface = test_surface().await;
        let report = surface.report(Duration::from_secs(2)).await;
        assert_eq!(report.status, Status::Healthy);
        assert_eq!(report.queue.pending, 0);
        assert!(surface.is_ready().await);
        assert!(surface.is_live());
    }

    #[tokio::test]
    async fn deep_backlog_degrades_status() {
        let surface = test_surface().await;
        surface
            .processor
            .insert_pending(&vec![serde_json::json!({}); 5])
            .await
            .unwrap();

        let mut degraded_surface = surface;
        degraded_surface.alert_depth = 2;
        let report = degraded_surface.report(Duration::from_secs(2)).await;
        assert_eq!(report.status, Status::Degraded);
    }
}
