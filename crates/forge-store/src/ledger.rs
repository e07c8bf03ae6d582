//! The execution ledger: single source of truth for RunRecords and their event streams.

use async_trait::async_trait;
use forge_core::prelude::*;
use forge_core::model::WorkKind;
use uuid::Uuid;

/// Filter accepted by [`Ledger::list_executions`]. All fields are optional narrowing clauses.
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub kind: Option<WorkKind>,
    pub status: Option<RunStatus>,
    pub name: Option<String>,
    pub parent_run_id: Option<Uuid>,
    pub limit: usize,
    pub offset: usize,
}

impl RunFilter {
    pub fn new() -> Self {
        Self {
            limit: 100,
            ..Default::default()
        }
    }

    fn matches(&self, record: &RunRecord) -> bool {
        if let Some(kind) = self.kind {
            if record.spec.kind != kind {
                return false;
            }
        }
        if let Some(status) = self.status {
            if record.status != status {
                return false;
            }
        }
        if let Some(name) = &self.name {
            if &record.spec.name != name {
                return false;
            }
        }
        if let Some(parent) = self.parent_run_id {
            if record.spec.parent_run_id != Some(parent) {
                return false;
            }
        }
        true
    }
}

/// Single source of truth for execution state. `create_execution` and every status
/// transition are expected to emit their corresponding event atomically — the in-memory
/// implementation does so under one lock; the SQL implementation does so in one transaction.
#[async_trait]
pub trait Ledger: Send + Sync {
    async fn create_execution(&self, record: RunRecord) -> Result<()>;

    async fn get_execution(&self, run_id: Uuid) -> Result<Option<RunRecord>>;

    async fn get_by_idempotency_key(&self, key: &str) -> Result<Option<RunRecord>>;

    /// Validates the transition against [`RunStatus::can_transition_to`], sets
    /// `started_at`/`completed_at` as appropriate, and appends the derived event.
    async fn update_status(
        &self,
        run_id: Uuid,
        status: RunStatus,
        result: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Result<RunRecord>;

    /// Atomic claim used by the worker loop: `UPDATE ... WHERE status = Pending`.
    /// Returns `Ok(None)` (not an error) when another worker already claimed the row.
    async fn claim_pending(&self, run_id: Uuid, worker_id: &str) -> Result<Option<RunRecord>>;

    /// Persists the executor's opaque handle onto the record so a later `cancel` can address
    /// it. Called once, right after a successful executor submission.
    async fn set_external_ref(&self, run_id: Uuid, external_ref: &str) -> Result<()>;

    /// Bumps the attempt counter and emits `RETRIED` on the given run.
    async fn increment_retry(&self, run_id: Uuid) -> Result<u32>;

    async fn record_event(
        &self,
        run_id: Uuid,
        event_type: EventType,
        data: serde_json::Value,
        source: &str,
    ) -> Result<()>;

    /// Chronological, ordered by `(timestamp, insertion_order)` per the ordering guarantee.
    async fn get_events(&self, run_id: Uuid) -> Result<Vec<RunEvent>>;

    async fn list_executions(&self, filter: RunFilter) -> Result<Vec<RunRecord>>;

    /// Every PENDING row, oldest first — the worker loop's poll query.
    async fn list_pending(&self, batch_size: usize) -> Result<Vec<RunRecord>> {
        let mut filter = RunFilter::new();
        filter.status = Some(RunStatus::Pending);
        filter.limit = batch_size;
        self.list_executions(filter).await
    }
}
