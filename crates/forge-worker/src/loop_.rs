//! The worker loop: drains PENDING rows the ledger is holding for background execution,
//! claims them atomically, resolves a handler via the registry, runs it, and updates status.

use std::sync::Arc;
use std::time::Duration;

use forge_core::error::Result;
use forge_core::model::{EventType, RunStatus};
use forge_store::ledger::Ledger;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn};

use crate::poller::{PollerConfig, TaskPoller};
use crate::worker_info::WorkerStats;

const SOURCE: &str = "worker";

#[derive(Debug, Clone)]
pub struct WorkerLoopConfig {
    pub worker_id: String,
    pub poller: PollerConfig,
    pub max_concurrency: usize,
    pub shutdown_timeout: Duration,
}

impl Default for WorkerLoopConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", uuid::Uuid::now_v7()),
            poller: PollerConfig::default(),
            max_concurrency: 10,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Drives the PENDING -> RUNNING -> terminal lifecycle for rows the ledger is holding as
/// background work. Runs until `shutdown()` is called or the owning future is dropped.
pub struct WorkerLoop {
    ledger: Arc<dyn Ledger>,
    registry: Arc<forge_registry::Registry>,
    config: WorkerLoopConfig,
    stats: Arc<WorkerStats>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    semaphore: Arc<Semaphore>,
}

impl WorkerLoop {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        registry: Arc<forge_registry::Registry>,
        config: WorkerLoopConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(WorkerStats::new(config.worker_id.clone()));
        let semaphore = Arc::new(Semaphore::new(config.max_concurrency));
        Self {
            ledger,
            registry,
            config,
            stats,
            shutdown_tx,
            shutdown_rx,
            semaphore,
        }
    }

    pub fn stats(&self) -> Arc<WorkerStats> {
        self.stats.clone()
    }

    /// Runs the poll-claim-dispatch-update tick loop until shutdown is requested.
    pub async fn run(&self) {
        let mut poller = TaskPoller::new(self.config.poller.clone(), self.shutdown_rx.clone());
        info!(worker_id = %self.config.worker_id, "worker loop starting");

        loop {
            if poller.is_shutdown() {
                break;
            }

            let claimed = self.tick(poller.batch_size()).await;
            poller.record(claimed);

            if poller.wait().await {
                break;
            }
        }

        self.drain(self.config.shutdown_timeout).await;
        info!(worker_id = %self.config.worker_id, "worker loop stopped");
    }

    /// One poll: fetch up to `batch_size` PENDING rows, attempt to claim each, and hand
    /// winners off to the bounded pool. Returns how many rows this worker claimed.
    async fn tick(&self, batch_size: usize) -> usize {
        let pending = match self.ledger.list_pending(batch_size).await {
            Ok(rows) => rows,
            Err(err) => {
                error!(error = %err, "failed to list pending executions");
                return 0;
            }
        };

        let mut claimed_count = 0;
        for record in pending {
            match self.ledger.claim_pending(record.run_id, &self.config.worker_id).await {
                Ok(Some(claimed)) => {
                    claimed_count += 1;
                    self.spawn_execution(claimed.run_id, claimed.spec.handler_key());
                }
                Ok(None) => {
                    debug!(run_id = %record.run_id, "lost claim race to another worker");
                }
                Err(err) => {
                    error!(run_id = %record.run_id, error = %err, "claim failed");
                }
            }
        }
        claimed_count
    }

    fn spawn_execution(&self, run_id: uuid::Uuid, handler_key: String) {
        let ledger = self.ledger.clone();
        let registry = self.registry.clone();
        let stats = self.stats.clone();
        let semaphore = self.semaphore.clone();
        let worker_id = self.config.worker_id.clone();

        tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore never closed");
            stats.set_current_run(Some(run_id));

            if let Err(err) = ledger
                .record_event(
                    run_id,
                    EventType::Started,
                    serde_json::json!({ "worker_id": worker_id }),
                    SOURCE,
                )
                .await
            {
                warn!(%run_id, error = %err, "failed to record started event");
            }

            let outcome = execute_one(&ledger, &registry, run_id, &handler_key).await;
            match outcome {
                Ok(()) => stats.record_processed(),
                Err(err) => {
                    warn!(%run_id, error = %err, "execution failed");
                    stats.record_failed();
                }
            }
            stats.set_current_run(None);
        });
    }

    /// Signals the poll loop to stop and waits (up to `timeout`) for in-flight executions
    /// to drain, mirroring the teacher's watch-channel stop signal plus timed permit drain.
    pub async fn shutdown(&self, timeout: Duration) {
        let _ = self.shutdown_tx.send(true);
        self.drain(timeout).await;
    }

    async fn drain(&self, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.semaphore.available_permits() == self.config.max_concurrency {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(worker_id = %self.config.worker_id, "shutdown timeout reached with tasks still in flight");
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

async fn execute_one(
    ledger: &Arc<dyn Ledger>,
    registry: &Arc<forge_registry::Registry>,
    run_id: uuid::Uuid,
    handler_key: &str,
) -> Result<()> {
    let record = ledger
        .get_execution(run_id)
        .await?
        .ok_or(forge_core::error::ForgeError::RunNotFound(run_id))?;

    let handler = match registry.get_by_handler_key(handler_key) {
        Ok(h) => h,
        Err(err) => {
            ledger
                .update_status(run_id, RunStatus::Failed, None, Some(err.to_string()))
                .await?;
            return Err(err);
        }
    };

    match handler.call(record.spec.params.clone()).await {
        Ok(result) => {
            ledger
                .update_status(run_id, RunStatus::Completed, Some(result), None)
                .await?;
            Ok(())
        }
        Err(err) => {
            ledger
                .update_status(run_id, RunStatus::Failed, None, Some(err.to_string()))
                .await?;
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_core::model::{WorkKind as WK, WorkSpec};
    use forge_registry::Registry;
    use forge_store::memory_ledger::InMemoryLedger;

    fn registry() -> Arc<Registry> {
        let reg = Registry::new();
        reg.register_fn(WK::Task, "double", |p| {
            let x = p.get("x").and_then(|v| v.as_i64()).unwrap_or(0);
            Ok(serde_json::json!({ "out": x * 2 }))
        })
        .unwrap();
        Arc::new(reg)
    }

    #[tokio::test]
    async fn tick_claims_and_completes_pending_work() {
        let ledger: Arc<dyn Ledger> = Arc::new(InMemoryLedger::new());
        let spec = WorkSpec::new(WK::Task, "double", serde_json::json!({"x": 5}));
        let record = forge_core::model::RunRecord::new(spec);
        let run_id = record.run_id;
        ledger.create_execution(record).await.unwrap();

        let worker = WorkerLoop::new(
            ledger.clone(),
            registry(),
            WorkerLoopConfig {
                worker_id: "w1".to_string(),
                ..WorkerLoopConfig::default()
            },
        );
        let claimed = worker.tick(10).await;
        assert_eq!(claimed, 1);

        worker.shutdown(Duration::from_secs(2)).await;

        let final_record = ledger.get_execution(run_id).await.unwrap().unwrap();
        assert_eq!(final_record.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn two_workers_racing_the_same_row_only_one_claims_it() {
        let ledger: Arc<dyn Ledger> = Arc::new(InMemoryLedger::new());
        let spec = WorkSpec::new(WK::Task, "double", serde_json::json!({"x": 1}));
        let record = forge_core::model::RunRecord::new(spec);
        ledger.create_execution(record).await.unwrap();

        let worker_a = WorkerLoop::new(
            ledger.clone(),
            registry(),
            WorkerLoopConfig {
                worker_id: "a".to_string(),
                ..WorkerLoopConfig::default()
            },
        );
        let worker_b = WorkerLoop::new(
            ledger.clone(),
            registry(),
            WorkerLoopConfig {
                worker_id: "b".to_string(),
                ..WorkerLoopConfig::default()
            },
        );

        let (claimed_a, claimed_b) = tokio::join!(worker_a.tick(10), worker_b.tick(10));
        assert_eq!(claimed_a + claimed_b, 1);
    }
}
