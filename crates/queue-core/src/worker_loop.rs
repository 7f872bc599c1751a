// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The Worker Loop: drives the processor, batch after batch, until shutdown
//! (spec.md §4.4).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use queue_store::QueueRecord;
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::processor::DistributedProcessor;

/// The capability business logic plugs in through — an explicit
/// registration rather than a decorator-discovered handler (spec.md §9).
#[async_trait]
pub trait FlowProcessor: Send + Sync {
    async fn process(&self, record: &QueueRecord) -> Result<serde_json::Value, String>;
}

/// Echoes the record's payload back as the result. Serves as the worker's
/// default processor until a real `FlowProcessor` is registered by an
/// embedding application.
pub struct EchoFlowProcessor;

#[async_trait]
impl FlowProcessor for EchoFlowProcessor {
    async fn process(&self, record: &QueueRecord) -> Result<serde_json::Value, String> {
        Ok(record.payload.clone())
    }
}

#[derive(Debug, Clone)]
pub struct WorkerLoopConfig {
    pub batch_size: u32,
    pub concurrency: usize,
    pub idle_backoff_min: Duration,
    pub idle_backoff_max: Duration,
    /// Stop claiming new batches after this many, to support rolling
    /// restarts (spec.md §4.4). `None` means unbounded.
    pub max_batches: Option<u64>,
    /// Pending backlog at or above which idle back-off collapses to
    /// `idle_backoff_min` instead of the jittered range (spec.md §5,
    /// "Back-pressure").
    pub backlog_watermark: i64,
    /// `claim_batch` duration at or above which idle back-off widens to
    /// `idle_backoff_max`, treating a slow claim as a saturated pool/store
    /// (spec.md §5, "Back-pressure").
    pub pool_saturation_threshold: Duration,
}

impl Default for WorkerLoopConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            concurrency: 1,
            idle_backoff_min: Duration::from_secs(1),
            idle_backoff_max: Duration::from_secs(5),
            max_batches: None,
            backlog_watermark: 500,
            pool_saturation_threshold: Duration::from_millis(250),
        }
    }
}

/// Structured summary emitted at the end of every batch (spec.md §4.4).
#[derive(Debug, Clone, serde::Serialize)]
pub struct BatchSummary {
    pub claimed: usize,
    pub completed: usize,
    pub failed: usize,
    pub duration_ms: u64,
    pub instance_id: String,
}

pub struct WorkerLoop {
    processor: Arc<DistributedProcessor>,
    flow_processor: Arc<dyn FlowProcessor>,
    config: WorkerLoopConfig,
    batches_run: AtomicU64,
}

impl WorkerLoop {
    pub fn new(
        processor: Arc<DistributedProcessor>,
        flow_processor: Arc<dyn FlowProcessor>,
        config: WorkerLoopConfig,
    ) -> Self {
        Self {
            processor,
            flow_processor,
            config,
            batches_run: AtomicU64::new(0),
        }
    }

    /// Run batches until `shutdown` reports true, or `max_batches` is
    /// reached. Claiming never happens mid-record: shutdown is checked
    /// between batches, and in-flight records always finish or are left
    /// in `processing` for orphan recovery (spec.md §5, "Cancellation").
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Some(max) = self.config.max_batches
                && self.batches_run.load(Ordering::Relaxed) >= max {
                    info!("max_batches reached, worker loop stopping for rolling restart");
                    break;
                }

            let (summary, claim_duration) = self.run_one_batch_timed().await;
            self.batches_run.fetch_add(1, Ordering::Relaxed);

            if summary.claimed == 0 {
                let backoff = self.idle_backoff(claim_duration).await;
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
        }
    }

    /// Pick the next idle back-off: widen toward `idle_backoff_max` when
    /// `claim_batch` itself was slow (a saturated pool/store), collapse to
    /// `idle_backoff_min` when the pending backlog is deep, otherwise use
    /// the full jittered range (spec.md §5, "Back-pressure").
    async fn idle_backoff(&self, claim_duration: Duration) -> Duration {
        if claim_duration >= self.config.pool_saturation_threshold {
            return self.config.idle_backoff_max;
        }
        let backlog = self
            .processor
            .counts_by_status()
            .await
            .ok()
            .and_then(|counts| counts.get("pending").copied())
            .unwrap_or(0);
        if backlog >= self.config.backlog_watermark {
            self.config.idle_backoff_min
        } else {
            jittered_backoff(self.config.idle_backoff_min, self.config.idle_backoff_max)
        }
    }

    /// Claim one batch and drive it to completion, with per-record
    /// isolation, honoring `concurrency` (spec.md §4.4).
    pub async fn run_one_batch(&self) -> BatchSummary {
        self.run_one_batch_timed().await.0
    }

    /// Same as [`Self::run_one_batch`], additionally returning how long the
    /// `claim_batch` call itself took, for the idle back-off feedback loop.
    async fn run_one_batch_timed(&self) -> (BatchSummary, Duration) {
        let start = Instant::now();
        let records = match self.processor.claim_batch(self.config.batch_size).await {
            Ok(records) => records,
            Err(err) => {
                warn!(error = %err, "claim_batch failed, will retry after idle backoff");
                Vec::new()
            }
        };
        let claim_duration = start.elapsed();

        if records.is_empty() {
            let summary = BatchSummary {
                claimed: 0,
                completed: 0,
                failed: 0,
                duration_ms: start.elapsed().as_millis() as u64,
                instance_id: self.processor.instance_id().to_string(),
            };
            return (summary, claim_duration);
        }

        let claimed = records.len();
        let mut completed = 0usize;
        let mut failed = 0usize;

        if self.config.concurrency <= 1 {
            for record in &records {
                if self.process_one(record).await {
                    completed += 1;
                } else {
                    failed += 1;
                }
            }
        } else {
            let mut join_set = JoinSet::new();
            let mut iter = records.iter().cloned();
            let mut in_flight = 0usize;

            loop {
                while in_flight < self.config.concurrency {
                    let Some(record) = iter.next() else { break };
                    let processor = Arc::clone(&self.processor);
                    let flow_processor = Arc::clone(&self.flow_processor);
                    join_set.spawn(async move { process_record(&processor, &flow_processor, &record).await });
                    in_flight += 1;
                }
                let Some(result) = join_set.join_next().await else { break };
                in_flight -= 1;
                match result {
                    Ok(true) => completed += 1,
                    Ok(false) => failed += 1,
                    Err(join_err) => {
                        warn!(error = %join_err, "worker task panicked; record left processing for orphan recovery");
                        failed += 1;
                    }
                }
            }
        }

        let summary = BatchSummary {
            claimed,
            completed,
            failed,
            duration_ms: start.elapsed().as_millis() as u64,
            instance_id: self.processor.instance_id().to_string(),
        };
        info!(
            claimed = summary.claimed,
            completed = summary.completed,
            failed = summary.failed,
            duration_ms = summary.duration_ms,
            instance_id = %summary.instance_id,
            "batch complete"
        );
        (summary, claim_duration)
    }

    async fn process_one(&self, record: &QueueRecord) -> bool {
        process_record(&self.processor, &self.flow_processor, record).await
    }
}

/// Runs one record's business logic and applies the resulting transition.
/// An exception in business logic never propagates past this point — it
/// becomes a `mark_failed` call (spec.md §4.4, "No workflow-engine
/// retries"). Returns `true` on completion, `false` on failure.
async fn process_record(
    processor: &DistributedProcessor,
    flow_processor: &Arc<dyn FlowProcessor>,
    record: &QueueRecord,
) -> bool {
    match flow_processor.process(record).await {
        Ok(result) => {
            if let Err(err) = processor.mark_completed(record.id, result).await {
                warn!(id = record.id, error = %err, "mark_completed failed");
                false
            } else {
                true
            }
        }
        Err(message) => {
            if let Err(err) = processor.mark_failed(record.id, &message).await {
                warn!(id = record.id, error = %err, "mark_failed failed");
            }
            false
        }
    }
}

fn jittered_backoff(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    rand::thread_rng().gen_range(min..max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use queue_store::{Dialect, QueueStore, SqliteStore, StoreDescriptor};

    struct AlwaysFails;

    #[async_trait]
    impl FlowProcessor for AlwaysFails {
        async fn process(&self, _record: &QueueRecord) -> Result<serde_json::Value, String> {
            Err("business logic exploded".to_string())
        }
    }

    struct FailsOnFlag;

    #[async_trait]
    impl FlowProcessor for FailsOnFlag {
        async fn process(&self, record: &QueueRecord) -> Result<serde_json::Value, String> {
            if record.payload.get("bad").and_then(|v| v.as_bool()) == Some(true) {
                Err("bad record".to_string())
            } else {
                Ok(record.payload.clone())
            }
        }
    }

    async fn test_processor() -> Arc<DistributedProcessor> {
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
        Arc::new(DistributedProcessor::new(Arc::new(store), "demo", "worker-test"))
    }

    #[tokio::test]
    async fn empty_queue_produces_empty_summary() {
        let processor = test_processor().await;
        let worker_loop = WorkerLoop::new(processor, Arc::new(EchoFlowProcessor), WorkerLoopConfig::default());
        let summary = worker_loop.run_one_batch().await;
        assert_eq!(summary.claimed, 0);
        assert_eq!(summary.completed, 0);
        assert_eq!(summary.failed, 0);
    }

    #[tokio::test]
    async fn failing_record_does_not_abort_the_batch() {
        let processor = test_processor().await;
        processor
            .insert_pending(&[
                serde_json::json!({"ok": 1}),
                serde_json::json!({"bad": true}),
                serde_json::json!({"ok": 2}),
                serde_json::json!({"ok": 3}),
            ])
            .await
            .unwrap();

        let worker_loop = WorkerLoop::new(processor, Arc::new(FailsOnFlag), WorkerLoopConfig::default());
        let summary = worker_loop.run_one_batch().await;

        assert_eq!(summary.claimed, 4);
        assert_eq!(summary.completed, 3);
        assert_eq!(summary.failed, 1);
    }

    #[tokio::test]
    async fn idle_backoff_collapses_to_minimum_under_deep_backlog() {
        let processor = test_processor().await;
        processor
            .insert_pending(&vec![serde_json::json!({}); 10])
            .await
            .unwrap();
        // Leave the backlog as `pending` by never claiming it; exercise the
        // backoff decision directly.
        let worker_loop = WorkerLoop::new(
            processor,
            Arc::new(EchoFlowProcessor),
            WorkerLoopConfig {
                backlog_watermark: 5,
                idle_backoff_min: Duration::from_millis(10),
                idle_backoff_max: Duration::from_secs(5),
                ..WorkerLoopConfig::default()
            },
        );

        let backoff = worker_loop.idle_backoff(Duration::from_millis(1)).await;
        assert_eq!(backoff, Duration::from_millis(10));
    }

    #[tokio::test]
    async fn idle_backoff_widens_to_maximum_when_claim_is_slow() {
        let processor = test_processor().await;
        let worker_loop = WorkerLoop::new(
            processor,
            Arc::new(EchoFlowProcessor),
            WorkerLoopConfig {
                pool_saturation_threshold: Duration::from_millis(50),
                idle_backoff_min: Duration::from_millis(10),
                idle_backoff_max: Duration::from_secs(5),
                ..WorkerLoopConfig::default()
            },
        );

        let backoff = worker_loop.idle_backoff(Duration::from_millis(100)).await;
        assert_eq!(backoff, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn all_records_fail_but_batch_still_reports() {
        let processor = test_processor().await;
        processor
            .insert_pending(&[serde_json::json!({}), serde_json::json!({})])
            .await
            .unwrap();

        let worker_loop = WorkerLoop::new(processor, Arc::new(AlwaysFails), WorkerLoopConfig::default());
        let summary = worker_loop.run_one_batch().await;

        assert_eq!(summary.claimed, 2);
        assert_eq!(summary.completed, 0);
        assert_eq!(summary.failed, 2);
    }
}
