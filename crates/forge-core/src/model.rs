//! Core entities: WorkSpec, RunRecord, RunEvent, DeadLetter, ConcurrencyLock, Schedule, ScheduleRun

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ForgeError;

/// The unit-of-work category a [`WorkSpec`] belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkKind {
    Task,
    Pipeline,
    Workflow,
    Step,
}

impl std::fmt::Display for WorkKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Task => write!(f, "task"),
            Self::Pipeline => write!(f, "pipeline"),
            Self::Workflow => write!(f, "workflow"),
            Self::Step => write!(f, "step"),
        }
    }
}

impl std::str::FromStr for WorkKind {
    type Err = ForgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "task" => Ok(Self::Task),
            "pipeline" => Ok(Self::Pipeline),
            "workflow" => Ok(Self::Workflow),
            "step" => Ok(Self::Step),
            other => Err(ForgeError::store(format!("unknown work kind: {other}"))),
        }
    }
}

/// Routing priority hint passed to executors; interpretation is executor-specific
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Realtime,
    High,
    Normal,
    Low,
    Slow,
}

impl Default for Priority {
    fn default() -> Self {
        Self::Normal
    }
}

/// Audit tag recording who asked for a run to happen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    Api,
    Cli,
    Schedule,
    Retry,
    Workflow,
    Internal,
}

/// Immutable submission request. Cloning a `WorkSpec` to build a retry is intentional —
/// see `WorkSpec::as_retry`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkSpec {
    pub kind: WorkKind,
    pub name: String,
    #[serde(default)]
    pub params: serde_json::Value,
    pub idempotency_key: Option<String>,
    pub correlation_id: Option<Uuid>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default = "default_lane")]
    pub lane: String,
    pub parent_run_id: Option<Uuid>,
    pub trigger_source: TriggerSource,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_seconds: f64,
}

fn default_lane() -> String {
    "default".to_string()
}

fn default_max_retries() -> u32 {
    0
}

fn default_retry_delay() -> f64 {
    1.0
}

impl WorkSpec {
    pub fn new(kind: WorkKind, name: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            kind,
            name: name.into(),
            params,
            idempotency_key: None,
            correlation_id: None,
            priority: Priority::default(),
            lane: default_lane(),
            parent_run_id: None,
            trigger_source: TriggerSource::Internal,
            metadata: HashMap::new(),
            max_retries: default_max_retries(),
            retry_delay_seconds: default_retry_delay(),
        }
    }

    /// The `"<kind>:<name>"` convention the worker loop parses to resolve a handler
    pub fn handler_key(&self) -> String {
        format!("{}:{}", self.kind, self.name)
    }

    /// A retry is a new submission: same kind/name/params, no idempotency key, tagged
    /// `trigger_source=retry`.
    pub fn as_retry(&self) -> Self {
        let mut spec = self.clone();
        spec.idempotency_key = None;
        spec.trigger_source = TriggerSource::Retry;
        spec
    }
}

/// The state a [`RunRecord`] may occupy. This is the single status enum used throughout the
/// crate (earlier revisions of the upstream system had two slightly different sets; this one
/// always uses the richer one).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::TimedOut
        )
    }

    /// Whether `self -> target` is a legal edge in the fixed transition table.
    ///
    /// PENDING -> {QUEUED, RUNNING, CANCELLED}
    /// QUEUED -> {RUNNING, CANCELLED}
    /// RUNNING -> {COMPLETED, FAILED, CANCELLED, TIMED_OUT}
    /// {FAILED, TIMED_OUT} -> PENDING is intentionally NOT legal here: a retry always
    /// creates a *new* RunRecord rather than resurrecting this one.
    pub fn can_transition_to(self, target: RunStatus) -> bool {
        use RunStatus::*;
        matches!(
            (self, target),
            (Pending, Queued)
                | (Pending, Running)
                | (Pending, Cancelled)
                | (Queued, Running)
                | (Queued, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Running, TimedOut)
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::TimedOut => "timed_out",
        };
        write!(f, "{s}")
    }
}

/// Mutable execution state for one attempt at a [`WorkSpec`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub spec: WorkSpec,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub error_type: Option<String>,
    pub external_ref: Option<String>,
    pub executor_name: Option<String>,
    pub attempt: u32,
    pub retry_of_run_id: Option<Uuid>,
    pub duration_seconds: Option<f64>,
    pub tags: HashMap<String, String>,
}

impl RunRecord {
    pub fn new(spec: WorkSpec) -> Self {
        Self {
            run_id: Uuid::now_v7(),
            spec,
            status: RunStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            error_type: None,
            external_ref: None,
            executor_name: None,
            attempt: 1,
            retry_of_run_id: None,
            duration_seconds: None,
            tags: HashMap::new(),
        }
    }
}

/// Append-only event type tags, per §3/§8 of the design notes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    Created,
    Queued,
    Started,
    Progress,
    Heartbeat,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
    RetryScheduled,
    Retried,
    DeadLettered,
    Reprocessed,
    StepStarted,
    StepCompleted,
    StepFailed,
}

/// One append-only entry in a run's event stream. Never mutated after insertion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    pub event_id: Uuid,
    pub run_id: Uuid,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub data: serde_json::Value,
    pub source: String,
}

impl RunEvent {
    pub fn new(
        run_id: Uuid,
        event_type: EventType,
        data: serde_json::Value,
        source: impl Into<String>,
    ) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            run_id,
            event_type,
            timestamp: Utc::now(),
            data,
            source: source.into(),
        }
    }
}

/// A captured failure awaiting manual inspection or replay
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: Uuid,
    pub run_id: Uuid,
    pub name: String,
    pub params: serde_json::Value,
    pub error: String,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub last_retry_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
}

impl DeadLetter {
    pub fn can_retry(&self) -> bool {
        self.resolved_at.is_none() && self.retry_count < self.max_retries
    }
}

/// A DB-backed advisory lock row. Uniqueness on `lock_key`; self-healing via `expires_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencyLock {
    pub lock_key: String,
    pub run_id: Uuid,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ConcurrencyLock {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

/// How a [`Schedule`] computes its firing times
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleType {
    Cron,
    Interval,
    Date,
}

/// A recurring or one-shot dispatch rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: Uuid,
    pub name: String,
    pub target_type: WorkKind,
    pub target_name: String,
    pub schedule_type: ScheduleType,
    pub cron_expression: Option<String>,
    pub interval_seconds: Option<i64>,
    pub run_at: Option<DateTime<Utc>>,
    pub timezone: String,
    pub params: serde_json::Value,
    pub enabled: bool,
    pub max_instances: u32,
    pub misfire_grace_seconds: i64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_status: Option<String>,
    pub version: u64,
}

/// Outcome of one schedule firing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleRunStatus {
    Running,
    Completed,
    Failed,
    Skipped,
    Missed,
}

/// One recorded firing of a [`Schedule`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleRun {
    pub id: Uuid,
    pub schedule_id: Uuid,
    pub schedule_name: String,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: ScheduleRunStatus,
    pub run_id: Option<Uuid>,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_table_matches_spec() {
        use RunStatus::*;
        assert!(Pending.can_transition_to(Queued));
        assert!(Pending.can_transition_to(Running));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Queued.can_transition_to(Running));
        assert!(Queued.can_transition_to(Cancelled));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));
        assert!(Running.can_transition_to(Cancelled));
        assert!(Running.can_transition_to(TimedOut));

        assert!(!Pending.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Pending));
        assert!(!Cancelled.can_transition_to(Running));
    }

    #[test]
    fn terminal_states() {
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(RunStatus::TimedOut.is_terminal());
        assert!(!RunStatus::Pending.is_terminal());
        assert!(!RunStatus::Queued.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
    }

    #[test]
    fn handler_key_convention() {
        let spec = WorkSpec::new(WorkKind::Task, "double", serde_json::json!({"x": 1}));
        assert_eq!(spec.handler_key(), "task:double");
    }

    #[test]
    fn retry_clears_idempotency_key() {
        let mut spec = WorkSpec::new(WorkKind::Task, "noop", serde_json::json!({}));
        spec.idempotency_key = Some("K".into());
        let retried = spec.as_retry();
        assert!(retried.idempotency_key.is_none());
        assert_eq!(retried.trigger_source, TriggerSource::Retry);
    }

    #[test]
    fn dead_letter_can_retry_respects_resolved_and_count() {
        let mut dl = DeadLetter {
            id: Uuid::now_v7(),
            run_id: Uuid::now_v7(),
            name: "task:x".into(),
            params: serde_json::json!({}),
            error: "boom".into(),
            retry_count: 0,
            max_retries: 3,
            created_at: Utc::now(),
            last_retry_at: None,
            resolved_at: None,
            resolved_by: None,
        };
        assert!(dl.can_retry());
        dl.retry_count = 3;
        assert!(!dl.can_retry());
        dl.retry_count = 0;
        dl.resolved_at = Some(Utc::now());
        assert!(!dl.can_retry());
    }
}
