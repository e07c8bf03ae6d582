//! Error taxonomy for the forge execution engine

use crate::model::RunStatus;

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, ForgeError>;

/// Error type shared across the dispatcher, worker loop, scheduler, and resilience layers
#[derive(Debug, thiserror::Error)]
pub enum ForgeError {
    /// A RunRecord was asked to move along an edge the state machine doesn't allow
    #[error("invalid transition: {current:?} -> {target:?}")]
    InvalidTransition {
        current: RunStatus,
        target: RunStatus,
    },

    /// Registry lookup for `(kind, name)` found nothing registered
    #[error("unknown handler: {kind}:{name}")]
    UnknownHandler { kind: String, name: String },

    /// A handler was already registered under this key
    #[error("handler already registered: {kind}:{name}")]
    HandlerAlreadyRegistered { kind: String, name: String },

    /// The concurrency guard refused to grant a lock. Not fatal by itself — callers decide.
    #[error("concurrency lock conflict: {lock_key}")]
    ConcurrencyLockConflict { lock_key: String },

    /// The tracked-execution helper could not acquire its lock
    #[error("execution lock error: {lock_key}")]
    ExecutionLockError { lock_key: String },

    /// A deadline was exceeded
    #[error("timeout expired after {elapsed_ms}ms (deadline {deadline_ms}ms)")]
    TimeoutExpired { elapsed_ms: u64, deadline_ms: u64 },

    /// A circuit breaker rejected the call
    #[error("circuit breaker '{name}' is open")]
    CircuitOpen { name: String },

    /// A non-blocking rate-limiter acquire failed
    #[error("rate limit exceeded, retry after {retry_after_ms}ms")]
    RateLimitExceeded { retry_after_ms: u64 },

    /// A handler raised an error while executing
    #[error("handler error: {0}")]
    Handler(String),

    /// The executor itself failed to accept or run a submission
    #[error("executor error: {0}")]
    Executor(String),

    /// Run was not found in the ledger
    #[error("run not found: {0}")]
    RunNotFound(uuid::Uuid),

    /// Schedule was not found
    #[error("schedule not found: {0}")]
    ScheduleNotFound(String),

    /// The backing store returned an error
    #[error("backing store error: {0}")]
    Store(String),

    /// Serialization/deserialization of a persisted payload failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Catch-all for errors from downstream crates we don't model explicitly
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ForgeError {
    pub fn invalid_transition(current: RunStatus, target: RunStatus) -> Self {
        Self::InvalidTransition { current, target }
    }

    pub fn unknown_handler(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::UnknownHandler {
            kind: kind.into(),
            name: name.into(),
        }
    }

    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    pub fn handler(msg: impl Into<String>) -> Self {
        Self::Handler(msg.into())
    }
}
