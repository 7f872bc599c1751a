// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker process entry point: loads configuration, brings the lifecycle
//! from `Initializing` to `Running`, and drives the worker loop, orphan
//! recovery tick, health monitor, and health HTTP surface concurrently
//! until a shutdown signal arrives (spec.md §4, §6.4).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use queue_core::{
    Config, DistributedProcessor, FatalError, HealthSurface, LifecycleError, LifecycleManager,
    LifecycleState, NamedStore, WorkerLoop, WorkerLoopConfig,
};
use queue_worker::error::WorkerError;
use queue_worker::{http, store_factory};
use tokio::sync::watch;
use tracing::{error, info, warn};

/// How long the worker waits for each required dependency to become
/// reachable during startup, before failing with exit code 2 (spec.md §6.5).
const STARTUP_DEPENDENCY_TIMEOUT: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() {
    std::process::exit(run().await);
}

async fn run() -> i32 {
    dotenvy::dotenv().ok();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            return FatalError::from(err).exit_code();
        }
    };

    init_tracing(&config);

    let lifecycle = Arc::new(LifecycleManager::new(config.event_log_capacity));

    loop {
        match run_worker(&config, Arc::clone(&lifecycle)).await {
            Ok(Outcome::Shutdown) => return 0,
            Ok(Outcome::Failed) => match restart_or_exit(&config, &lifecycle).await {
                Some(code) => return code,
                None => continue,
            },
            Err(err) => {
                error!(error = %err, "worker exiting with error");
                return err.exit_code();
            }
        }
    }
}

/// After a `Failed` transition, consult the restart policy and either sleep
/// the back-off delay and return `None` (caller re-enters `Starting`), or
/// transition to `Stopped` and return the exit code (spec.md §4.5,
/// "Restart policy").
async fn restart_or_exit(config: &Config, lifecycle: &Arc<LifecycleManager>) -> Option<i32> {
    let attempts = lifecycle.restart_count();
    let permitted = config.restart_policy.permits_restart(true) && attempts < config.max_restarts;

    if !permitted {
        let err = FatalError::from(LifecycleError::RestartDenied { attempts });
        error!(attempts, "restart policy denies further restarts, exiting");
        lifecycle.transition(LifecycleState::Stopped, "restart_denied");
        return Some(err.exit_code());
    }

    let delay = lifecycle.restart_delay(config.restart_base, config.restart_cap);
    lifecycle.transition(LifecycleState::Restarting, "restart_policy_permits");
    info!(attempt = attempts + 1, delay_ms = delay.as_millis() as u64, "restarting worker");
    tokio::time::sleep(delay).await;
    None
}

fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_level.clone()));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if config.log_format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// How `run_worker` ended: a normal shutdown signal, or the health monitor
/// escalating to `Failed` after too many consecutive probe failures.
enum Outcome {
    Shutdown,
    Failed,
}

async fn run_worker(config: &Config, lifecycle: Arc<LifecycleManager>) -> Result<Outcome, WorkerError> {
    lifecycle.transition(LifecycleState::Starting, "process_start");

    let work_dir = PathBuf::from(std::env::var("APP_WORK_DIR").unwrap_or_else(|_| ".worker".to_string()));
    lifecycle
        .validate_startup(config, &work_dir)
        .map_err(FatalError::from)?;

    info!(
        flow_name = %config.flow_name,
        batch_size = config.batch_size,
        concurrency = config.worker_concurrency,
        "starting worker"
    );

    let queue_store = store_factory::connect(
        &config.queue_dsn,
        config.pool_size,
        config.pool_overflow,
        config.query_timeout,
        false,
    )
    .await?;
    lifecycle
        .wait_for_dependency("queue", queue_store.as_ref(), STARTUP_DEPENDENCY_TIMEOUT, config.health_timeout)
        .await
        .map_err(FatalError::from)?;
    queue_store.migrate().await.map_err(FatalError::from)?;

    let mut named_sources = Vec::new();
    for (i, dsn) in config.source_dsns.iter().enumerate() {
        let name = format!("source_{i}");
        let store = store_factory::connect(
            dsn,
            config.pool_size,
            config.pool_overflow,
            config.query_timeout,
            true,
        )
        .await?;
        lifecycle
            .wait_for_dependency(&name, store.as_ref(), STARTUP_DEPENDENCY_TIMEOUT, config.health_timeout)
            .await
            .map_err(FatalError::from)?;
        named_sources.push(NamedStore {
            name,
            store,
            required: true,
        });
    }

    let instance_id = queue_core::worker_instance_id(config.instance_id_override.as_deref());
    let processor = Arc::new(DistributedProcessor::new(
        queue_store,
        config.flow_name.clone(),
        instance_id.clone(),
    ));

    let health_surface = Arc::new(HealthSurface::new(
        Arc::clone(&processor),
        named_sources,
        Arc::clone(&lifecycle),
        config.slow_threshold,
        config.alert_depth,
        config.health_timeout,
    ));

    let worker_loop = Arc::new(WorkerLoop::new(
        Arc::clone(&processor),
        Arc::new(queue_core::EchoFlowProcessor),
        WorkerLoopConfig {
            batch_size: config.batch_size,
            concurrency: config.worker_concurrency,
            idle_backoff_min: Duration::from_secs(1),
            idle_backoff_max: Duration::from_secs(5),
            max_batches: None,
            backlog_watermark: config.backlog_watermark,
            pool_saturation_threshold: config.pool_saturation_threshold,
        },
    ));

    lifecycle.transition(LifecycleState::Running, "all_dependencies_ready");
    info!(instance_id = %instance_id, "worker running");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let loop_task = tokio::spawn({
        let worker_loop = Arc::clone(&worker_loop);
        let shutdown_rx = shutdown_rx.clone();
        async move { worker_loop.run(shutdown_rx).await }
    });

    let orphan_task = tokio::spawn(orphan_recovery_tick(
        Arc::clone(&processor),
        config.orphan_timeout,
        config.orphan_check_interval,
        config.max_retries,
        shutdown_rx.clone(),
    ));

    let monitor_task = tokio::spawn(health_monitor_tick(
        Arc::clone(&health_surface),
        Arc::clone(&lifecycle),
        config.health_interval,
        config.health_timeout,
        config.health_failure_threshold,
        shutdown_rx.clone(),
    ));
    let monitor_abort = monitor_task.abort_handle();

    let router = http::router(Arc::clone(&health_surface), config.health_timeout);
    let health_port = config.health_port;
    let mut http_shutdown_rx = shutdown_rx.clone();
    let http_task = tokio::spawn(http::serve(router, health_port, async move {
        let _ = http_shutdown_rx.changed().await;
    }));

    let outcome = tokio::select! {
        biased;
        trigger = wait_for_shutdown_signal() => {
            info!(?trigger, "shutdown signal received");
            lifecycle.transition(LifecycleState::Stopping, "shutdown_signal");
            monitor_abort.abort();
            RunEnd::Signal(trigger)
        }
        _ = monitor_task => {
            info!("health monitor escalated to Failed, stopping for restart");
            RunEnd::HealthFailed
        }
    };
    let _ = shutdown_tx.send(true);

    let grace = match &outcome {
        RunEnd::Signal(ShutdownTrigger::Immediate) => Duration::from_secs(0),
        RunEnd::Signal(ShutdownTrigger::Graceful) => config.grace_period,
        RunEnd::HealthFailed => Duration::from_secs(0),
    };

    if tokio::time::timeout(grace, loop_task).await.is_err() {
        warn!("worker loop did not stop within the grace period");
    }
    orphan_task.abort();
    if let Err(err) = http_task.await
        && !err.is_cancelled() {
            warn!(error = %err, "health server task ended unexpectedly");
        }

    match outcome {
        RunEnd::Signal(_) => {
            lifecycle.transition(LifecycleState::Stopped, "shutdown_complete");
            Ok(Outcome::Shutdown)
        }
        RunEnd::HealthFailed => Ok(Outcome::Failed),
    }
}

enum RunEnd {
    Signal(ShutdownTrigger),
    HealthFailed,
}

async fn orphan_recovery_tick(
    processor: Arc<DistributedProcessor>,
    orphan_timeout: Duration,
    check_interval: Duration,
    max_retries: i32,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(check_interval);
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = interval.tick() => {}
        }
        match processor.reset_orphaned(orphan_timeout).await {
            Ok(n) if n > 0 => info!(reset = n, "reclaimed orphaned records"),
            Ok(_) => {}
            Err(err) => warn!(error = %err, "reset_orphaned failed"),
        }
        match processor.reset_failed(max_retries).await {
            Ok(n) if n > 0 => info!(retried = n, "requeued failed records under the retry ceiling"),
            Ok(_) => {}
            Err(err) => warn!(error = %err, "reset_failed failed"),
        }
    }
}

/// Probes health every `interval`; a probe failure moves `Running` to
/// `Remediating`, and after `failure_threshold` consecutive failures moves
/// `Remediating` to `Failed` and returns, ending the task (spec.md §4.5,
/// "Running health"). A healthy probe while `Remediating` resets the
/// counter and returns to `Running`.
async fn health_monitor_tick(
    surface: Arc<HealthSurface>,
    lifecycle: Arc<LifecycleManager>,
    interval: Duration,
    timeout: Duration,
    failure_threshold: u32,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    let mut consecutive_failures = 0u32;
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => return,
            _ = ticker.tick() => {}
        }
        let report = surface.report(timeout).await;
        match report.status {
            queue_core::HealthStatus::Unhealthy => {
                consecutive_failures += 1;
                if lifecycle.state() == LifecycleState::Running {
                    lifecycle.transition(LifecycleState::Remediating, "health_check_unhealthy");
                }
                if consecutive_failures >= failure_threshold {
                    lifecycle.transition(LifecycleState::Failed, "health_check_unrecoverable");
                    return;
                }
            }
            queue_core::HealthStatus::Healthy => {
                consecutive_failures = 0;
                if lifecycle.state() == LifecycleState::Remediating {
                    lifecycle.transition(LifecycleState::Running, "health_check_recovered");
                }
            }
            queue_core::HealthStatus::Degraded => {}
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum ShutdownTrigger {
    Graceful,
    Immediate,
}

/// Waits for SIGTERM or SIGINT (graceful: finish the in-flight batch, then
/// stop) or SIGQUIT (immediate: stop waiting on the grace period) per
/// spec.md §6.4.
async fn wait_for_shutdown_signal() -> ShutdownTrigger {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
        let mut sigquit = signal(SignalKind::quit()).expect("failed to install SIGQUIT handler");
        tokio::select! {
            _ = sigterm.recv() => ShutdownTrigger::Graceful,
            _ = sigint.recv() => ShutdownTrigger::Graceful,
            _ = sigquit.recv() => ShutdownTrigger::Immediate,
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        ShutdownTrigger::Graceful
    }
}
