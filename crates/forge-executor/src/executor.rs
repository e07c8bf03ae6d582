//! The narrow protocol every execution backend implements.

use async_trait::async_trait;
use forge_core::model::WorkSpec;

/// Coarse status string an executor may report back for an `external_ref`. Not every
/// implementation supports every field — see the per-variant docs on [`Executor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl std::fmt::Display for ExternalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Uniform contract the dispatcher drives regardless of the concurrency model behind it.
///
/// Every implementation is called the same way, whether it runs the handler inline on
/// `submit` (in-memory) or hands it off to a pool/process/broker. `get_status`/`get_result`/
/// `get_error` are best-effort: an executor with no concept of post-hoc polling (e.g. one
/// that calls back through the ledger directly) can return `None` unconditionally.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Begin or enqueue execution of `spec`. Must return promptly; long work happens
    /// elsewhere. Returns an opaque `external_ref` the caller can use for later queries.
    async fn submit(&self, spec: &WorkSpec) -> forge_core::error::Result<String>;

    /// Best-effort cancellation. Returns whether cancellation took effect.
    async fn cancel(&self, external_ref: &str) -> forge_core::error::Result<bool>;

    /// Current status as last observed by the executor, if it tracks one.
    async fn get_status(&self, external_ref: &str) -> forge_core::error::Result<Option<ExternalStatus>>;

    /// The result payload, if the executor retains one.
    async fn get_result(&self, external_ref: &str) -> forge_core::error::Result<Option<serde_json::Value>>;

    /// The error string, if the executor retains one.
    async fn get_error(&self, external_ref: &str) -> forge_core::error::Result<Option<String>>;
}
