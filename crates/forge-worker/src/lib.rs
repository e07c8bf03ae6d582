//! Poll-claim-dispatch-update against the execution ledger, for work the dispatcher queued
//! but did not run synchronously.

pub mod loop_;
pub mod poller;
pub mod worker_info;

pub mod prelude {
    pub use crate::loop_::{WorkerLoop, WorkerLoopConfig};
    pub use crate::poller::{PollerConfig, TaskPoller};
    pub use crate::worker_info::{WorkerInfo, WorkerStats};
}
