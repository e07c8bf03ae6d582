//! In-memory reference [`Ledger`]. Used by tests and by the in-memory executor; provides the
//! same semantics as [`crate::sql::SqlLedger`] without requiring a backing store.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use forge_core::prelude::*;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::ledger::{Ledger, RunFilter};

struct State {
    records: HashMap<Uuid, RunRecord>,
    events: HashMap<Uuid, Vec<RunEvent>>,
    idempotency_index: HashMap<String, Uuid>,
}

/// `RwLock`-protected in-process ledger. The idempotency index is a second map guarded by
/// the same lock as the main table — deliberately not an independently-maintained structure,
/// so the two can never drift apart.
pub struct InMemoryLedger {
    state: RwLock<State>,
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State {
                records: HashMap::new(),
                events: HashMap::new(),
                idempotency_index: HashMap::new(),
            }),
        }
    }

    fn event_for_status(status: RunStatus) -> EventType {
        match status {
            RunStatus::Pending => EventType::Created,
            RunStatus::Queued => EventType::Queued,
            RunStatus::Running => EventType::Started,
            RunStatus::Completed => EventType::Completed,
            RunStatus::Failed => EventType::Failed,
            RunStatus::Cancelled => EventType::Cancelled,
            RunStatus::TimedOut => EventType::TimedOut,
        }
    }
}

#[async_trait]
impl Ledger for InMemoryLedger {
    async fn create_execution(&self, record: RunRecord) -> Result<()> {
        let mut state = self.state.write();
        if let Some(key) = &record.spec.idempotency_key {
            state.idempotency_index.insert(key.clone(), record.run_id);
        }
        let event = RunEvent::new(record.run_id, EventType::Created, serde_json::json!({}), "ledger");
        state.events.entry(record.run_id).or_default().push(event);
        tracing::debug!(run_id = %record.run_id, "execution created");
        state.records.insert(record.run_id, record);
        Ok(())
    }

    async fn get_execution(&self, run_id: Uuid) -> Result<Option<RunRecord>> {
        Ok(self.state.read().records.get(&run_id).cloned())
    }

    async fn get_by_idempotency_key(&self, key: &str) -> Result<Option<RunRecord>> {
        let state = self.state.read();
        Ok(state
            .idempotency_index
            .get(key)
            .and_then(|id| state.records.get(id))
            .cloned())
    }

    async fn update_status(
        &self,
        run_id: Uuid,
        status: RunStatus,
        result: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Result<RunRecord> {
        let mut state = self.state.write();
        let current = state
            .records
            .get(&run_id)
            .ok_or(ForgeError::RunNotFound(run_id))?
            .status;
        if !current.can_transition_to(status) {
            return Err(ForgeError::invalid_transition(current, status));
        }
        let now = Utc::now();
        {
            let record = state.records.get_mut(&run_id).expect("checked above");
            record.status = status;
            if status == RunStatus::Running && record.started_at.is_none() {
                record.started_at = Some(now);
            }
            if status.is_terminal() {
                record.completed_at = Some(now);
                if let Some(started) = record.started_at {
                    record.duration_seconds = Some((now - started).num_milliseconds() as f64 / 1000.0);
                }
            }
            if result.is_some() {
                record.result = result.clone();
            }
            if let Some(err) = &error {
                record.error = Some(err.clone());
            }
        }
        let event = RunEvent::new(
            run_id,
            Self::event_for_status(status),
            serde_json::json!({ "result": result, "error": error }),
            "ledger",
        );
        state.events.entry(run_id).or_default().push(event);
        tracing::debug!(run_id = %run_id, %status, "status updated");
        Ok(state.records.get(&run_id).expect("checked above").clone())
    }

    async fn claim_pending(&self, run_id: Uuid, worker_id: &str) -> Result<Option<RunRecord>> {
        let mut state = self.state.write();
        let is_pending = matches!(state.records.get(&run_id), Some(r) if r.status == RunStatus::Pending);
        if !is_pending {
            return Ok(None);
        }
        let now = Utc::now();
        {
            let record = state.records.get_mut(&run_id).expect("checked above");
            record.status = RunStatus::Running;
            record.started_at = Some(now);
        }
        let event = RunEvent::new(
            run_id,
            EventType::Started,
            serde_json::json!({ "worker_id": worker_id }),
            "worker",
        );
        state.events.entry(run_id).or_default().push(event);
        Ok(state.records.get(&run_id).cloned())
    }

    async fn set_external_ref(&self, run_id: Uuid, external_ref: &str) -> Result<()> {
        let mut state = self.state.write();
        let record = state
            .records
            .get_mut(&run_id)
            .ok_or(ForgeError::RunNotFound(run_id))?;
        record.external_ref = Some(external_ref.to_string());
        Ok(())
    }

    async fn increment_retry(&self, run_id: Uuid) -> Result<u32> {
        let mut state = self.state.write();
        let attempt = {
            let record = state
                .records
                .get_mut(&run_id)
                .ok_or(ForgeError::RunNotFound(run_id))?;
            record.attempt += 1;
            record.attempt
        };
        let event = RunEvent::new(run_id, EventType::Retried, serde_json::json!({ "attempt": attempt }), "ledger");
        state.events.entry(run_id).or_default().push(event);
        Ok(attempt)
    }

    async fn record_event(
        &self,
        run_id: Uuid,
        event_type: EventType,
        data: serde_json::Value,
        source: &str,
    ) -> Result<()> {
        let event = RunEvent::new(run_id, event_type, data, source);
        self.state.write().events.entry(run_id).or_default().push(event);
        Ok(())
    }

    async fn get_events(&self, run_id: Uuid) -> Result<Vec<RunEvent>> {
        let mut events = self
            .state
            .read()
            .events
            .get(&run_id)
            .cloned()
            .unwrap_or_default();
        events.sort_by_key(|e| e.timestamp);
        Ok(events)
    }

    async fn list_executions(&self, filter: RunFilter) -> Result<Vec<RunRecord>> {
        let state = self.state.read();
        let mut matched: Vec<RunRecord> = state
            .records
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        matched.sort_by_key(|r| r.created_at);
        let matched = matched
            .into_iter()
            .skip(filter.offset)
            .take(if filter.limit == 0 { usize::MAX } else { filter.limit })
            .collect();
        Ok(matched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_core::model::{TriggerSource, WorkKind, WorkSpec};

    fn spec() -> WorkSpec {
        let mut s = WorkSpec::new(WorkKind::Task, "double", serde_json::json!({"x": 21}));
        s.trigger_source = TriggerSource::Api;
        s
    }

    #[tokio::test]
    async fn create_emits_created_event() {
        let ledger = InMemoryLedger::new();
        let record = RunRecord::new(spec());
        let run_id = record.run_id;
        ledger.create_execution(record).await.unwrap();

        let events = ledger.get_events(run_id).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::Created);
    }

    #[tokio::test]
    async fn idempotency_key_returns_same_record() {
        let ledger = InMemoryLedger::new();
        let mut s = spec();
        s.idempotency_key = Some("K".into());
        let record = RunRecord::new(s);
        let run_id = record.run_id;
        ledger.create_execution(record).await.unwrap();

        let found = ledger.get_by_idempotency_key("K").await.unwrap().unwrap();
        assert_eq!(found.run_id, run_id);
    }

    #[tokio::test]
    async fn illegal_transition_rejected() {
        let ledger = InMemoryLedger::new();
        let record = RunRecord::new(spec());
        let run_id = record.run_id;
        ledger.create_execution(record).await.unwrap();

        let err = ledger
            .update_status(run_id, RunStatus::Completed, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ForgeError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn claim_race_only_one_winner() {
        let ledger = InMemoryLedger::new();
        let record = RunRecord::new(spec());
        let run_id = record.run_id;
        ledger.create_execution(record).await.unwrap();

        let first = ledger.claim_pending(run_id, "worker-a").await.unwrap();
        let second = ledger.claim_pending(run_id, "worker-b").await.unwrap();
        assert!(first.is_some());
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn list_executions_filters_by_status() {
        let ledger = InMemoryLedger::new();
        let a = RunRecord::new(spec());
        let b = RunRecord::new(spec());
        let b_id = b.run_id;
        ledger.create_execution(a).await.unwrap();
        ledger.create_execution(b).await.unwrap();
        ledger.claim_pending(b_id, "w").await.unwrap();

        let mut filter = RunFilter::new();
        filter.status = Some(RunStatus::Pending);
        let pending = ledger.list_executions(filter).await.unwrap();
        assert_eq!(pending.len(), 1);
    }
}
