//! The single public submission API. Everything else in the engine — the worker loop, the
//! scheduler, the batch executors, the tracked-execution context — calls through here rather
//! than touching the ledger or an executor directly.

use std::sync::Arc;

use forge_core::error::{ForgeError, Result};
use forge_core::model::{EventType, RunRecord, RunStatus, TriggerSource, WorkKind, WorkSpec};
use forge_executor::executor::{Executor, ExternalStatus};
use forge_store::concurrency_guard::ConcurrencyGuard;
use forge_store::ledger::{Ledger, RunFilter};
use forge_store::memory_ledger::InMemoryLedger;
use uuid::Uuid;

const SOURCE: &str = "dispatcher";

/// Coordinates the ledger, an executor, and (optionally) a concurrency guard behind the
/// single public submission API. Generic over the executor so callers can swap in-memory,
/// thread-pool, or distributed executors without changing call sites.
pub struct Dispatcher<E: Executor> {
    executor: Arc<E>,
    ledger: Arc<dyn Ledger>,
    concurrency_guard: Option<Arc<dyn ConcurrencyGuard>>,
}

impl<E: Executor> Dispatcher<E> {
    pub fn new(executor: Arc<E>, ledger: Arc<dyn Ledger>) -> Self {
        Self {
            executor,
            ledger,
            concurrency_guard: None,
        }
    }

    /// Convenience constructor backed by an in-memory ledger, for tests and embedding
    /// without a separate backing store.
    pub fn in_memory(executor: Arc<E>) -> Self {
        Self::new(executor, Arc::new(InMemoryLedger::new()))
    }

    pub fn with_concurrency_guard(mut self, guard: Arc<dyn ConcurrencyGuard>) -> Self {
        self.concurrency_guard = Some(guard);
        self
    }

    pub fn ledger(&self) -> &Arc<dyn Ledger> {
        &self.ledger
    }

    /// Idempotent submission: returns the existing run unchanged if `spec.idempotency_key`
    /// already maps to one, otherwise creates a PENDING record, submits it to the executor,
    /// and advances status as far as the executor reports synchronously.
    #[tracing::instrument(skip(self, spec), fields(kind = %spec.kind, name = %spec.name))]
    pub async fn submit(&self, spec: WorkSpec) -> Result<Uuid> {
        if let Some(key) = &spec.idempotency_key {
            if let Some(existing) = self.ledger.get_by_idempotency_key(key).await? {
                tracing::debug!(run_id = %existing.run_id, "idempotent submission returned existing run");
                return Ok(existing.run_id);
            }
        }

        let record = RunRecord::new(spec.clone());
        let run_id = record.run_id;
        self.ledger.create_execution(record).await?;

        match self.executor.submit(&spec).await {
            Ok(external_ref) => {
                self.ledger
                    .update_status(run_id, RunStatus::Queued, None, None)
                    .await?;
                self.ledger.set_external_ref(run_id, &external_ref).await?;
                self.record_external_ref_event(run_id, &external_ref).await;
                self.reconcile_synchronous(run_id, &external_ref).await?;
                Ok(run_id)
            }
            Err(err) => {
                self.mark_submission_failed(run_id, &err).await?;
                Err(err)
            }
        }
    }

    async fn record_external_ref_event(&self, run_id: Uuid, external_ref: &str) {
        if let Err(err) = self
            .ledger
            .record_event(
                run_id,
                EventType::Queued,
                serde_json::json!({ "external_ref": external_ref }),
                SOURCE,
            )
            .await
        {
            tracing::warn!(%run_id, error = %err, "failed to record external_ref event");
        }
    }

    /// A run that never made it past submission still needs a terminal status. `Pending ->
    /// Failed` isn't a legal edge (only `Running -> Failed` is), so this walks through
    /// `Running` first, the same way [`Self::reconcile_synchronous`] does for executors that
    /// report a terminal status synchronously.
    async fn mark_submission_failed(&self, run_id: Uuid, err: &ForgeError) -> Result<()> {
        self.ledger
            .update_status(run_id, RunStatus::Running, None, None)
            .await?;
        self.ledger
            .update_status(
                run_id,
                RunStatus::Failed,
                None,
                Some(format!("executor submission failed: {err}")),
            )
            .await?;
        Ok(())
    }

    /// Synchronous executors (e.g. the in-memory one) already have a terminal status by the
    /// time `submit` returns. Poll once and, if so, walk QUEUED -> RUNNING -> terminal so the
    /// state machine never sees a skipped edge.
    async fn reconcile_synchronous(&self, run_id: Uuid, external_ref: &str) -> Result<()> {
        let status = self.executor.get_status(external_ref).await?;
        match status {
            Some(ExternalStatus::Completed) => {
                self.mark_started(run_id).await?;
                let result = self.executor.get_result(external_ref).await?;
                self.mark_completed(run_id, result.unwrap_or(serde_json::Value::Null))
                    .await?;
            }
            Some(ExternalStatus::Failed) => {
                self.mark_started(run_id).await?;
                let error = self
                    .executor
                    .get_error(external_ref)
                    .await?
                    .unwrap_or_else(|| "unknown executor error".to_string());
                self.mark_failed(run_id, error).await?;
            }
            _ => {}
        }
        Ok(())
    }

    pub async fn submit_task(&self, name: impl Into<String>, params: serde_json::Value) -> Result<Uuid> {
        self.submit(WorkSpec::new(WorkKind::Task, name, params)).await
    }

    pub async fn submit_pipeline(&self, name: impl Into<String>, params: serde_json::Value) -> Result<Uuid> {
        self.submit(WorkSpec::new(WorkKind::Pipeline, name, params)).await
    }

    pub async fn submit_workflow(&self, name: impl Into<String>, params: serde_json::Value) -> Result<Uuid> {
        self.submit(WorkSpec::new(WorkKind::Workflow, name, params)).await
    }

    /// Copies `parent_run_id` into `correlation_id` when the caller leaves it unset, linking
    /// the step to the rest of its workflow.
    pub async fn submit_step(&self, mut spec: WorkSpec) -> Result<Uuid> {
        spec.kind = WorkKind::Step;
        if spec.correlation_id.is_none() {
            spec.correlation_id = spec.parent_run_id;
        }
        self.submit(spec).await
    }

    pub async fn get_run(&self, run_id: Uuid) -> Result<Option<RunRecord>> {
        self.ledger.get_execution(run_id).await
    }

    pub async fn list_runs(&self, filter: RunFilter) -> Result<Vec<RunRecord>> {
        self.ledger.list_executions(filter).await
    }

    pub async fn get_events(&self, run_id: Uuid) -> Result<Vec<forge_core::model::RunEvent>> {
        self.ledger.get_events(run_id).await
    }

    pub async fn get_children(&self, parent_run_id: Uuid) -> Result<Vec<RunRecord>> {
        let mut filter = RunFilter::new();
        filter.parent_run_id = Some(parent_run_id);
        self.ledger.list_executions(filter).await
    }

    /// Refuses on terminal runs; otherwise delegates to the executor and, on success,
    /// transitions the record and emits CANCELLED.
    pub async fn cancel(&self, run_id: Uuid) -> Result<bool> {
        let record = self
            .ledger
            .get_execution(run_id)
            .await?
            .ok_or(ForgeError::RunNotFound(run_id))?;
        if record.status.is_terminal() {
            return Ok(false);
        }
        let external_ref = record
            .external_ref
            .as_deref()
            .ok_or_else(|| ForgeError::store("run has no external_ref to cancel"))?;
        let cancelled = self.executor.cancel(external_ref).await?;
        if cancelled {
            self.ledger
                .update_status(run_id, RunStatus::Cancelled, None, None)
                .await?;
        }
        Ok(cancelled)
    }

    /// A retry is a new submission, never a resurrection of the failed row: the spec's
    /// idempotency key is cleared and `trigger_source` becomes `retry`. The new run links
    /// back via `retry_of_run_id`; the original gets a RETRIED event and a bumped attempt.
    pub async fn retry(&self, run_id: Uuid) -> Result<Uuid> {
        let original = self
            .ledger
            .get_execution(run_id)
            .await?
            .ok_or(ForgeError::RunNotFound(run_id))?;
        if !matches!(original.status, RunStatus::Failed | RunStatus::TimedOut) {
            return Err(ForgeError::invalid_transition(original.status, RunStatus::Pending));
        }

        let mut retry_spec = original.spec.as_retry();
        retry_spec.trigger_source = TriggerSource::Retry;

        let mut new_record = RunRecord::new(retry_spec.clone());
        new_record.retry_of_run_id = Some(run_id);
        new_record.attempt = original.attempt + 1;
        let new_run_id = new_record.run_id;
        self.ledger.create_execution(new_record).await?;

        self.ledger.increment_retry(run_id).await?;

        match self.executor.submit(&retry_spec).await {
            Ok(external_ref) => {
                self.ledger
                    .update_status(new_run_id, RunStatus::Queued, None, None)
                    .await?;
                self.ledger.set_external_ref(new_run_id, &external_ref).await?;
                self.record_external_ref_event(new_run_id, &external_ref).await;
                self.reconcile_synchronous(new_run_id, &external_ref).await?;
            }
            Err(err) => {
                self.mark_submission_failed(new_run_id, &err).await?;
            }
        }
        Ok(new_run_id)
    }

    pub async fn mark_started(&self, run_id: Uuid) -> Result<RunRecord> {
        self.ledger
            .update_status(run_id, RunStatus::Running, None, None)
            .await
    }

    pub async fn mark_completed(&self, run_id: Uuid, result: serde_json::Value) -> Result<RunRecord> {
        self.ledger
            .update_status(run_id, RunStatus::Completed, Some(result), None)
            .await
    }

    pub async fn mark_failed(&self, run_id: Uuid, error: impl Into<String>) -> Result<RunRecord> {
        self.ledger
            .update_status(run_id, RunStatus::Failed, None, Some(error.into()))
            .await
    }

    pub async fn record_progress(&self, run_id: Uuid, data: serde_json::Value) -> Result<()> {
        self.ledger
            .record_event(run_id, EventType::Progress, data, SOURCE)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_core::model::WorkKind;
    use forge_executor::in_memory::InMemoryExecutor;
    use forge_executor::stub::StubExecutor;
    use forge_registry::Registry;

    /// Always fails submission, to exercise the path the in-memory and stub executors can't:
    /// `InMemoryExecutor::submit` never returns `Err`, and `StubExecutor::submit` always
    /// succeeds.
    #[derive(Default)]
    struct FailingExecutor;

    #[async_trait::async_trait]
    impl Executor for FailingExecutor {
        async fn submit(&self, _spec: &WorkSpec) -> Result<String> {
            Err(ForgeError::handler("executor unavailable"))
        }

        async fn cancel(&self, _external_ref: &str) -> Result<bool> {
            Ok(false)
        }

        async fn get_status(&self, _external_ref: &str) -> Result<Option<ExternalStatus>> {
            Ok(None)
        }

        async fn get_result(&self, _external_ref: &str) -> Result<Option<serde_json::Value>> {
            Ok(None)
        }

        async fn get_error(&self, _external_ref: &str) -> Result<Option<String>> {
            Ok(None)
        }
    }

    fn registry() -> Arc<Registry> {
        let reg = Registry::new();
        reg.register_fn(WorkKind::Task, "double", |p| {
            let x = p.get("x").and_then(|v| v.as_i64()).unwrap_or(0);
            Ok(serde_json::json!({ "out": x * 2 }))
        })
        .unwrap();
        reg.register_fn(WorkKind::Task, "boom", |_p| {
            Err(ForgeError::handler("always fails"))
        })
        .unwrap();
        Arc::new(reg)
    }

    #[tokio::test]
    async fn submit_with_sync_executor_reaches_completed() {
        let executor = Arc::new(InMemoryExecutor::new(registry()));
        let dispatcher = Dispatcher::in_memory(executor);
        let run_id = dispatcher
            .submit_task("double", serde_json::json!({"x": 21}))
            .await
            .unwrap();
        let record = dispatcher.get_run(run_id).await.unwrap().unwrap();
        assert_eq!(record.status, RunStatus::Completed);
        assert_eq!(record.result, Some(serde_json::json!({"out": 42})));
    }

    #[tokio::test]
    async fn submit_with_sync_executor_records_failure() {
        let executor = Arc::new(InMemoryExecutor::new(registry()));
        let dispatcher = Dispatcher::in_memory(executor);
        let run_id = dispatcher.submit_task("boom", serde_json::json!({})).await.unwrap();
        let record = dispatcher.get_run(run_id).await.unwrap().unwrap();
        assert_eq!(record.status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn idempotent_resubmission_returns_same_run() {
        let executor = Arc::new(InMemoryExecutor::new(registry()));
        let dispatcher = Dispatcher::in_memory(executor);
        let mut spec = WorkSpec::new(WorkKind::Task, "double", serde_json::json!({"x": 1}));
        spec.idempotency_key = Some("key-1".to_string());

        let first = dispatcher.submit(spec.clone()).await.unwrap();
        let second = dispatcher.submit(spec).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn retry_creates_new_run_linked_to_original() {
        let executor = Arc::new(InMemoryExecutor::new(registry()));
        let dispatcher = Dispatcher::in_memory(executor);
        let run_id = dispatcher.submit_task("boom", serde_json::json!({})).await.unwrap();

        let retried_id = dispatcher.retry(run_id).await.unwrap();
        assert_ne!(run_id, retried_id);

        let retried_record = dispatcher.get_run(retried_id).await.unwrap().unwrap();
        assert_eq!(retried_record.retry_of_run_id, Some(run_id));
        assert_eq!(retried_record.attempt, 2);
    }

    #[tokio::test]
    async fn retry_of_non_terminal_run_is_rejected() {
        let executor = Arc::new(StubExecutor::new());
        let dispatcher = Dispatcher::in_memory(executor);
        let run_id = dispatcher.submit_task("whatever", serde_json::json!({})).await.unwrap();
        // The stub executor never reports a terminal status, so the run stays QUEUED.
        assert!(dispatcher.retry(run_id).await.is_err());
    }

    #[tokio::test]
    async fn submit_step_copies_parent_run_id_into_correlation_id() {
        let executor = Arc::new(InMemoryExecutor::new(registry()));
        let dispatcher = Dispatcher::in_memory(executor);
        let parent_id = Uuid::now_v7();
        let mut spec = WorkSpec::new(WorkKind::Task, "double", serde_json::json!({"x": 2}));
        spec.parent_run_id = Some(parent_id);

        let run_id = dispatcher.submit_step(spec).await.unwrap();
        let record = dispatcher.get_run(run_id).await.unwrap().unwrap();
        assert_eq!(record.spec.correlation_id, Some(parent_id));
    }

    #[tokio::test]
    async fn submit_records_failed_not_stuck_pending_when_executor_submission_fails() {
        let executor = Arc::new(FailingExecutor);
        let dispatcher = Dispatcher::in_memory(executor);
        // submit() itself surfaces the executor's error; the record it left behind is the
        // interesting part, recovered here via list_runs since the run_id isn't returned.
        assert!(dispatcher.submit_task("whatever", serde_json::json!({})).await.is_err());

        let records = dispatcher.list_runs(RunFilter::new()).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, RunStatus::Failed);
        assert!(records[0].error.as_deref().unwrap().contains("executor unavailable"));
    }

    #[tokio::test]
    async fn submit_persists_external_ref_so_cancel_can_address_it() {
        let executor = Arc::new(StubExecutor::new());
        let dispatcher = Dispatcher::in_memory(executor);
        let run_id = dispatcher.submit_task("whatever", serde_json::json!({})).await.unwrap();

        let record = dispatcher.get_run(run_id).await.unwrap().unwrap();
        assert!(record.external_ref.is_some());

        // cancel() no longer hits the "no external_ref to cancel" branch.
        let result = dispatcher.cancel(run_id).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn get_children_filters_by_parent_run_id() {
        let executor = Arc::new(InMemoryExecutor::new(registry()));
        let dispatcher = Dispatcher::in_memory(executor);
        let parent_id = Uuid::now_v7();
        let mut spec = WorkSpec::new(WorkKind::Task, "double", serde_json::json!({"x": 1}));
        spec.parent_run_id = Some(parent_id);
        dispatcher.submit_step(spec).await.unwrap();

        let children = dispatcher.get_children(parent_id).await.unwrap();
        assert_eq!(children.len(), 1);
    }
}
