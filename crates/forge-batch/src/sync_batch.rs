//! Fixed-worker-count thread pool for fanning out independent pipeline runs and collecting
//! their results as one report. Each item runs through a [`TrackedExecution`] so a failure
//! flows to the DLQ exactly the way a dispatcher-submitted run would.

use std::sync::Arc;
use std::time::{Duration, Instant};

use forge_core::error::Result;
use forge_core::model::{WorkKind, WorkSpec};
use forge_registry::Registry;
use forge_store::concurrency_guard::ConcurrencyGuard;
use forge_store::dlq::DlqManager;
use forge_store::ledger::Ledger;
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::tracked::{TrackedExecution, TrackedOutcome};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemStatus {
    Pending,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone)]
pub struct BatchItemResult {
    pub item_id: Uuid,
    pub name: String,
    pub status: ItemStatus,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

/// Aggregate report returned by [`SyncBatchExecutor::run_all`].
#[derive(Debug, Clone)]
pub struct BatchResult {
    pub items: Vec<BatchItemResult>,
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub pending: usize,
    pub duration: Duration,
}

impl BatchResult {
    fn from_items(items: Vec<BatchItemResult>, duration: Duration) -> Self {
        let total = items.len();
        let successful = items.iter().filter(|i| i.status == ItemStatus::Succeeded).count();
        let failed = items.iter().filter(|i| i.status == ItemStatus::Failed).count();
        let pending = items.iter().filter(|i| i.status == ItemStatus::Pending).count();
        Self {
            items,
            total,
            successful,
            failed,
            pending,
            duration,
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        self.successful as f64 / self.total as f64
    }
}

/// Callback invoked after each item completes, given the running `(completed, total)` counts.
pub type ProgressCallback = Arc<dyn Fn(usize, usize) + Send + Sync>;

struct BatchItem {
    item_id: Uuid,
    spec: WorkSpec,
}

/// Runs a fixed batch of pipeline invocations against a bounded worker pool.
pub struct SyncBatchExecutor {
    ledger: Arc<dyn Ledger>,
    registry: Arc<Registry>,
    guard: Option<Arc<dyn ConcurrencyGuard>>,
    dlq: Option<Arc<dyn DlqManager>>,
    max_workers: usize,
    items: Vec<BatchItem>,
    on_progress: Option<ProgressCallback>,
}

impl SyncBatchExecutor {
    pub fn new(ledger: Arc<dyn Ledger>, registry: Arc<Registry>, max_workers: usize) -> Self {
        Self {
            ledger,
            registry,
            guard: None,
            dlq: None,
            max_workers: max_workers.max(1),
            items: Vec::new(),
            on_progress: None,
        }
    }

    pub fn with_concurrency_guard(mut self, guard: Arc<dyn ConcurrencyGuard>) -> Self {
        self.guard = Some(guard);
        self
    }

    pub fn with_dlq(mut self, dlq: Arc<dyn DlqManager>) -> Self {
        self.dlq = Some(dlq);
        self
    }

    pub fn with_progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.on_progress = Some(cb);
        self
    }

    /// Enqueues a pipeline invocation, returning an item id the caller can correlate in the
    /// returned [`BatchResult`].
    pub fn add(&mut self, pipeline: impl Into<String>, params: serde_json::Value) -> Uuid {
        let spec = WorkSpec::new(WorkKind::Pipeline, pipeline, params);
        let item_id = Uuid::now_v7();
        self.items.push(BatchItem { item_id, spec });
        item_id
    }

    async fn run_one(
        ledger: Arc<dyn Ledger>,
        registry: Arc<Registry>,
        guard: Option<Arc<dyn ConcurrencyGuard>>,
        dlq: Option<Arc<dyn DlqManager>>,
        item: BatchItem,
    ) -> BatchItemResult {
        let name = item.spec.name.clone();
        let item_id = item.item_id;
        let params = item.spec.params.clone();

        let begun = TrackedExecution::begin(ledger, guard, dlq, item.spec).await;
        let tracked = match begun {
            Ok(TrackedOutcome::Started(t)) => t,
            Ok(TrackedOutcome::AlreadyRecorded(record)) => {
                return BatchItemResult {
                    item_id,
                    name,
                    status: if record.status.is_terminal() && record.error.is_none() {
                        ItemStatus::Succeeded
                    } else {
                        ItemStatus::Failed
                    },
                    result: record.result,
                    error: record.error,
                }
            }
            Err(err) => {
                return BatchItemResult {
                    item_id,
                    name,
                    status: ItemStatus::Failed,
                    result: None,
                    error: Some(err.to_string()),
                }
            }
        };

        let handler = match registry.get(WorkKind::Pipeline, &name) {
            Ok(h) => h,
            Err(err) => {
                let record = tracked.finish(Err(err.to_string())).await;
                return BatchItemResult {
                    item_id,
                    name,
                    status: ItemStatus::Failed,
                    result: None,
                    error: record.ok().and_then(|r| r.error),
                };
            }
        };

        match handler.call(params).await {
            Ok(value) => {
                let record = tracked.finish(Ok(value.clone())).await;
                BatchItemResult {
                    item_id,
                    name,
                    status: ItemStatus::Succeeded,
                    result: record.ok().and_then(|r| r.result).or(Some(value)),
                    error: None,
                }
            }
            Err(err) => {
                let record = tracked.finish(Err(err.to_string())).await;
                BatchItemResult {
                    item_id,
                    name,
                    status: ItemStatus::Failed,
                    result: None,
                    error: record.ok().and_then(|r| r.error),
                }
            }
        }
    }

    /// Runs every enqueued item concurrently, bounded by `max_workers`.
    pub async fn run_all(self) -> Result<BatchResult> {
        let started = Instant::now();
        let semaphore = Arc::new(Semaphore::new(self.max_workers));
        let total = self.items.len();
        let mut handles = Vec::with_capacity(total);

        for item in self.items {
            let semaphore = semaphore.clone();
            let ledger = self.ledger.clone();
            let registry = self.registry.clone();
            let guard = self.guard.clone();
            let dlq = self.dlq.clone();
            let on_progress = self.on_progress.clone();
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore never closed");
                let result = Self::run_one(ledger, registry, guard, dlq, item).await;
                if let Some(cb) = on_progress {
                    cb(1, total);
                }
                result
            }));
        }

        let mut items = Vec::with_capacity(total);
        for handle in handles {
            items.push(handle.await.expect("batch item task panicked"));
        }

        Ok(BatchResult::from_items(items, started.elapsed()))
    }

    /// Runs items one at a time in enqueue order, stopping at the first failure when
    /// `stop_on_failure` is set.
    pub async fn run_sequential(self, stop_on_failure: bool) -> Result<BatchResult> {
        let started = Instant::now();
        let total = self.items.len();
        let mut items = Vec::with_capacity(total);
        let mut stopped_early = false;

        for item in self.items {
            if stopped_early {
                items.push(BatchItemResult {
                    item_id: item.item_id,
                    name: item.spec.name,
                    status: ItemStatus::Pending,
                    result: None,
                    error: None,
                });
                continue;
            }
            let result = Self::run_one(
                self.ledger.clone(),
                self.registry.clone(),
                self.guard.clone(),
                self.dlq.clone(),
                item,
            )
            .await;
            if let Some(cb) = &self.on_progress {
                cb(1, total);
            }
            if stop_on_failure && result.status == ItemStatus::Failed {
                stopped_early = true;
            }
            items.push(result);
        }

        Ok(BatchResult::from_items(items, started.elapsed()))
    }
}

/// Fluent builder composing adds, parallelism, and a progress callback before dispatch.
pub struct SyncBatchBuilder {
    executor: SyncBatchExecutor,
    parallel: bool,
    stop_on_failure: bool,
}

impl SyncBatchBuilder {
    pub fn new(ledger: Arc<dyn Ledger>, registry: Arc<Registry>, max_workers: usize) -> Self {
        Self {
            executor: SyncBatchExecutor::new(ledger, registry, max_workers),
            parallel: true,
            stop_on_failure: false,
        }
    }

    pub fn add(mut self, pipeline: impl Into<String>, params: serde_json::Value) -> Self {
        self.executor.add(pipeline, params);
        self
    }

    pub fn with_dlq(mut self, dlq: Arc<dyn DlqManager>) -> Self {
        self.executor = self.executor.with_dlq(dlq);
        self
    }

    pub fn with_concurrency_guard(mut self, guard: Arc<dyn ConcurrencyGuard>) -> Self {
        self.executor = self.executor.with_concurrency_guard(guard);
        self
    }

    pub fn with_progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.executor = self.executor.with_progress_callback(cb);
        self
    }

    pub fn sequential(mut self, stop_on_failure: bool) -> Self {
        self.parallel = false;
        self.stop_on_failure = stop_on_failure;
        self
    }

    pub async fn run(self) -> Result<BatchResult> {
        if self.parallel {
            self.executor.run_all().await
        } else {
            self.executor.run_sequential(self.stop_on_failure).await
        }
    }
}
