//! Fan-out helpers for callers that want to run a batch of independent pipeline invocations
//! and collect their results, plus the tracked-execution lifecycle helper they build on.

pub mod cooperative_batch;
pub mod sync_batch;
pub mod tracked;

pub mod prelude {
    pub use crate::cooperative_batch::{BatchCallable, CooperativeBatchExecutor, CooperativeBatchItemResult};
    pub use crate::sync_batch::{BatchItemResult, BatchResult, ItemStatus, SyncBatchBuilder, SyncBatchExecutor};
    pub use crate::tracked::{TrackedExecution, TrackedOutcome};
}
