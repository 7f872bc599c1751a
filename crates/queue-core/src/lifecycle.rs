// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The Lifecycle Manager: brings a worker from process start to serving,
//! and back to a clean exit (spec.md §4.5).

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use queue_store::QueueStore;
use tokio::sync::watch;
use tracing::info;

use crate::config::Config;
use crate::error::LifecycleError;

/// States of the worker lifecycle state machine (spec.md §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "PascalCase")]
pub enum LifecycleState {
    Initializing,
    Starting,
    Running,
    Remediating,
    Stopping,
    Stopped,
    Failed,
    Restarting,
}

/// A single recorded transition (spec.md §4.5, "Event log").
#[derive(Debug, Clone, serde::Serialize)]
pub struct LifecycleEvent {
    pub ts: DateTime<Utc>,
    pub from: LifecycleState,
    pub to: LifecycleState,
    pub trigger: String,
    pub duration_ms: u64,
}

pub struct LifecycleManager {
    state_tx: watch::Sender<LifecycleState>,
    events: Mutex<VecDeque<LifecycleEvent>>,
    event_log_capacity: usize,
    started_at: Instant,
    restart_count: std::sync::atomic::AtomicU32,
    last_transition_at: Mutex<Instant>,
}

impl LifecycleManager {
    pub fn new(event_log_capacity: usize) -> Self {
        let (state_tx, _rx) = watch::channel(LifecycleState::Initializing);
        Self {
            state_tx,
            events: Mutex::new(VecDeque::with_capacity(event_log_capacity.min(1024))),
            event_log_capacity,
            started_at: Instant::now(),
            restart_count: std::sync::atomic::AtomicU32::new(0),
            last_transition_at: Mutex::new(Instant::now()),
        }
    }

    pub fn state(&self) -> LifecycleState {
        *self.state_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.state_tx.subscribe()
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn restart_count(&self) -> u32 {
        self.restart_count.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events.lock().unwrap().iter().cloned().collect()
    }

    /// Record a transition and broadcast the new state to every subscriber
    /// (worker loop, health probe tick, orphan tick, signal handler).
    pub fn transition(&self, to: LifecycleState, trigger: &str) {
        let from = self.state();
        let mut last = self.last_transition_at.lock().unwrap();
        let duration_ms = last.elapsed().as_millis() as u64;
        *last = Instant::now();
        drop(last);

        if to == LifecycleState::Restarting {
            self.restart_count.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }

        let event = LifecycleEvent {
            ts: Utc::now(),
            from,
            to,
            trigger: trigger.to_string(),
            duration_ms,
        };
        info!(?from, ?to, trigger, duration_ms, "lifecycle transition");

        let mut events = self.events.lock().unwrap();
        if events.len() >= self.event_log_capacity {
            events.pop_front();
        }
        events.push_back(event);
        drop(events);

        self.state_tx.send_replace(to);
    }

    /// Live iff the lifecycle is in any of the "the process is still doing
    /// something" states (spec.md §4.6).
    pub fn is_live(&self) -> bool {
        matches!(
            self.state(),
            LifecycleState::Starting
                | LifecycleState::Running
                | LifecycleState::Remediating
                | LifecycleState::Stopping
        )
    }

    /// Startup validation (spec.md §4.5, "Startup validation"): required
    /// config is already guaranteed by `Config::from_env`'s fail-fast
    /// parsing; this additionally checks the flow name is non-empty,
    /// ensures a working directory, and checks free disk space.
    pub fn validate_startup(&self, config: &Config, work_dir: &std::path::Path) -> Result<(), LifecycleError> {
        if config.flow_name.trim().is_empty() {
            return Err(LifecycleError::Validation("APP_FLOW_NAME must not be empty".to_string()));
        }

        std::fs::create_dir_all(work_dir).map_err(|e| {
            LifecycleError::Validation(format!("could not create working directory {work_dir:?}: {e}"))
        })?;

        const MIN_FREE_BYTES: u64 = 64 * 1024 * 1024;
        match fs2::available_space(work_dir) {
            Ok(free) if free < MIN_FREE_BYTES => {
                return Err(LifecycleError::Validation(format!(
                    "only {free} bytes free at {work_dir:?}, below the {MIN_FREE_BYTES} byte minimum"
                )));
            }
            Ok(_) => {}
            Err(_) => {
                // Not every platform/filesystem answers this query; treat as non-fatal.
            }
        }

        Ok(())
    }

    /// Wait for every required dependency to probe reachable, with
    /// exponential back-off between probes (1s -> 10s cap), under
    /// `timeout` per dependency (spec.md §4.5, "Dependency wait").
    pub async fn wait_for_dependency(
        &self,
        name: &str,
        store: &dyn QueueStore,
        timeout: Duration,
        probe_timeout: Duration,
    ) -> Result<(), LifecycleError> {
        let deadline = Instant::now() + timeout;
        let mut delay = Duration::from_secs(1);

        loop {
            let probe = store.probe(probe_timeout).await;
            if probe.reachable {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(LifecycleError::DependencyTimeout {
                    name: name.to_string(),
                    timeout_sec: timeout.as_secs(),
                });
            }
            tokio::time::sleep(delay.min(deadline.saturating_duration_since(Instant::now()))).await;
            delay = (delay * 2).min(Duration::from_secs(10));
        }
    }

    /// Back-off delay before the next restart attempt (spec.md §4.5,
    /// "Restart policy"): `base * 2^restart_count`, capped.
    pub fn restart_delay(&self, base: Duration, cap: Duration) -> Duration {
        let exp = base.as_millis().saturating_mul(1u128 << self.restart_count().min(16));
        Duration::from_millis(exp.min(cap.as_millis()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_are_recorded_in_order() {
        let manager = LifecycleManager::new(10);
        manager.transition(LifecycleState::Starting, "validate_env");
        manager.transition(LifecycleState::Running, "all_dependencies_ready");

        let events = manager.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].to, LifecycleState::Starting);
        assert_eq!(events[1].to, LifecycleState::Running);
        assert_eq!(manager.state(), LifecycleState::Running);
    }

    #[test]
    fn event_log_is_capped() {
        let manager = LifecycleManager::new(2);
        manager.transition(LifecycleState::Starting, "a");
        manager.transition(LifecycleState::Running, "b");
        manager.transition(LifecycleState::Remediating, "c");

        let events = manager.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].trigger, "b");
        assert_eq!(events[1].trigger, "c");
    }

    #[test]
    fn liveness_follows_spec_state_set() {
        let manager = LifecycleManager::new(10);
        assert!(!manager.is_live());
        manager.transition(LifecycleState::Starting, "x");
        assert!(manager.is_live());
        manager.transition(LifecycleState::Stopped, "y");
        assert!(!manager.is_live());
    }

    #[test]
    fn restart_delay_grows_exponentially_and_caps() {
        let manager = LifecycleManager::new(10);
        manager.transition(LifecycleState::Restarting, "r1");
        let first = manager.restart_delay(Duration::from_secs(10), Duration::from_secs(300));
        manager.transition(LifecycleState::Restarting, "r2");
        let second = manager.restart_delay(Duration::from_secs(10), Duration::from_secs(300));
        assert!(second > first);
        assert!(second <= Duration::from_secs(300));
    }
}
