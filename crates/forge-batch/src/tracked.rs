//! The common acquire-lock -> run -> release (+ DLQ-on-failure) shape, as a scoped handle
//! instead of raw dispatcher calls. Mirrors the Dispatcher's own lifecycle transitions but
//! lets a caller drive them directly without submitting through an [`forge_executor::Executor`].

use std::sync::Arc;

use forge_core::error::{ForgeError, Result};
use forge_core::model::{EventType, RunRecord, RunStatus, WorkSpec};
use forge_store::concurrency_guard::ConcurrencyGuard;
use forge_store::dlq::DlqManager;
use forge_store::ledger::Ledger;
use uuid::Uuid;

const SOURCE: &str = "tracked_execution";
const DEFAULT_LOCK_TTL_SECONDS: i64 = 300;

fn lock_key_for(name: &str) -> String {
    format!("workflow:{name}")
}

/// Result of [`TrackedExecution::begin`]: either a prior terminal record (idempotent replay)
/// or a freshly started handle the caller drives to completion.
pub enum TrackedOutcome {
    AlreadyRecorded(RunRecord),
    Started(TrackedExecution),
}

/// A scoped handle over one in-flight execution. The caller calls [`Self::record_progress`]
/// zero or more times, then consumes the handle with [`Self::finish`] — there is no safe
/// partial-drop path, by design, since releasing the lock is an async operation Rust's `Drop`
/// cannot perform directly.
pub struct TrackedExecution {
    ledger: Arc<dyn Ledger>,
    guard: Option<Arc<dyn ConcurrencyGuard>>,
    dlq: Option<Arc<dyn DlqManager>>,
    run_id: Uuid,
    name: String,
    params: serde_json::Value,
    max_retries: u32,
    lock_key: Option<String>,
}

impl TrackedExecution {
    pub async fn begin(
        ledger: Arc<dyn Ledger>,
        guard: Option<Arc<dyn ConcurrencyGuard>>,
        dlq: Option<Arc<dyn DlqManager>>,
        spec: WorkSpec,
    ) -> Result<TrackedOutcome> {
        if let Some(key) = &spec.idempotency_key {
            if let Some(prior) = ledger.get_by_idempotency_key(key).await? {
                if prior.status.is_terminal() {
                    return Ok(TrackedOutcome::AlreadyRecorded(prior));
                }
            }
        }

        let record = RunRecord::new(spec.clone());
        let run_id = record.run_id;
        ledger.create_execution(record).await?;
        ledger
            .record_event(run_id, EventType::Created, serde_json::json!({"name": spec.name}), SOURCE)
            .await?;

        let lock_key = if guard.is_some() {
            Some(lock_key_for(&spec.name))
        } else {
            None
        };

        if let (Some(guard), Some(key)) = (&guard, &lock_key) {
            let acquired = guard.acquire(key, run_id, DEFAULT_LOCK_TTL_SECONDS).await?;
            if !acquired {
                ledger
                    .update_status(run_id, RunStatus::Cancelled, None, Some(format!("lock conflict: {key}")))
                    .await?;
                return Err(ForgeError::ExecutionLockError { lock_key: key.clone() });
            }
        }

        ledger.update_status(run_id, RunStatus::Running, None, None).await?;

        Ok(TrackedOutcome::Started(Self {
            ledger,
            guard,
            dlq,
            run_id,
            name: spec.name,
            params: spec.params,
            max_retries: spec.max_retries,
            lock_key,
        }))
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub async fn record_progress(&self, data: serde_json::Value) -> Result<()> {
        self.ledger
            .record_event(self.run_id, EventType::Progress, data, SOURCE)
            .await
    }

    /// Transitions to COMPLETED or FAILED (pushing a DLQ entry on failure if configured) and
    /// always releases the lock, even if the transition itself errors.
    ///
    /// A panic unwinding through this call still releases the lock: the `scopeguard` closure
    /// below is synchronous (as `Drop` must be), so on an unexpected unwind it fires off a
    /// detached release task rather than awaiting one directly.
    pub async fn finish(self, outcome: std::result::Result<serde_json::Value, String>) -> Result<RunRecord> {
        let Self {
            ledger,
            guard,
            dlq,
            run_id,
            name,
            params,
            max_retries,
            lock_key,
        } = self;

        let panic_guard = {
            let guard = guard.clone();
            let lock_key = lock_key.clone();
            scopeguard::guard(true, move |armed| {
                if armed {
                    if let (Some(guard), Some(key)) = (guard, lock_key) {
                        tracing::warn!(lock_key = %key, "releasing lock after unwind during finish()");
                        tokio::spawn(async move {
                            let _ = guard.release(&key, Some(run_id)).await;
                        });
                    }
                }
            })
        };

        let result = match outcome {
            Ok(value) => ledger.update_status(run_id, RunStatus::Completed, Some(value), None).await,
            Err(error) => {
                if let Some(dlq) = &dlq {
                    let retry_count = ledger
                        .get_execution(run_id)
                        .await?
                        .map(|r| r.attempt)
                        .unwrap_or(0);
                    dlq.add_to_dlq(run_id, &name, params.clone(), &error, retry_count, max_retries)
                        .await?;
                }
                ledger.update_status(run_id, RunStatus::Failed, None, Some(error)).await
            }
        };

        if let (Some(guard), Some(key)) = (&guard, &lock_key) {
            if let Err(err) = guard.release(key, Some(run_id)).await {
                tracing::warn!(%err, lock_key = %key, "failed to release lock in finish()");
            }
        }

        let mut panic_guard = panic_guard;
        *scopeguard::ScopeGuard::get_mut(&mut panic_guard) = false;

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_core::model::WorkKind;
    use forge_store::concurrency_guard::InMemoryConcurrencyGuard;
    use forge_store::dlq::InMemoryDlqManager;
    use forge_store::memory_ledger::InMemoryLedger;

    fn spec(name: &str) -> WorkSpec {
        WorkSpec::new(WorkKind::Task, name, serde_json::json!({}))
    }

    #[tokio::test]
    async fn begin_then_finish_completed_transitions_record() {
        let ledger: Arc<dyn Ledger> = Arc::new(InMemoryLedger::new());
        let outcome = TrackedExecution::begin(ledger.clone(), None, None, spec("reports.nightly"))
            .await
            .unwrap();
        let tracked = match outcome {
            TrackedOutcome::Started(t) => t,
            TrackedOutcome::AlreadyRecorded(_) => panic!("expected a fresh start"),
        };
        let run_id = tracked.run_id();

        let record = tracked.finish(Ok(serde_json::json!({"rows": 3}))).await.unwrap();
        assert_eq!(record.status, RunStatus::Completed);
        assert_eq!(ledger.get_execution(run_id).await.unwrap().unwrap().status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn finish_failure_pushes_dlq_entry() {
        let ledger: Arc<dyn Ledger> = Arc::new(InMemoryLedger::new());
        let dlq: Arc<dyn DlqManager> = Arc::new(InMemoryDlqManager::new());
        let outcome = TrackedExecution::begin(ledger.clone(), None, Some(dlq.clone()), spec("reports.nightly"))
            .await
            .unwrap();
        let tracked = match outcome {
            TrackedOutcome::Started(t) => t,
            TrackedOutcome::AlreadyRecorded(_) => panic!("expected a fresh start"),
        };

        let record = tracked.finish(Err("boom".to_string())).await.unwrap();
        assert_eq!(record.status, RunStatus::Failed);
        assert_eq!(dlq.list_unresolved(None, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn lock_conflict_cancels_and_returns_execution_lock_error() {
        let ledger: Arc<dyn Ledger> = Arc::new(InMemoryLedger::new());
        let concurrency: Arc<dyn ConcurrencyGuard> = Arc::new(InMemoryConcurrencyGuard::new());

        // Hold the lock out-of-band first, simulating a concurrent run of the same workflow.
        concurrency
            .acquire(&lock_key_for("reports.nightly"), Uuid::now_v7(), 60)
            .await
            .unwrap();

        let result = TrackedExecution::begin(ledger, Some(concurrency), None, spec("reports.nightly")).await;
        assert!(matches!(result, Err(ForgeError::ExecutionLockError { .. })));
    }

    #[tokio::test]
    async fn idempotent_replay_of_terminal_run_skips_relocking() {
        let ledger: Arc<dyn Ledger> = Arc::new(InMemoryLedger::new());
        let mut first_spec = spec("reports.nightly");
        first_spec.idempotency_key = Some("nightly-2026-07-30".to_string());

        let outcome = TrackedExecution::begin(ledger.clone(), None, None, first_spec.clone())
            .await
            .unwrap();
        let tracked = match outcome {
            TrackedOutcome::Started(t) => t,
            TrackedOutcome::AlreadyRecorded(_) => panic!("expected a fresh start"),
        };
        tracked.finish(Ok(serde_json::json!({}))).await.unwrap();

        let replay = TrackedExecution::begin(ledger, None, None, first_spec).await.unwrap();
        assert!(matches!(replay, TrackedOutcome::AlreadyRecorded(_)));
    }
}
