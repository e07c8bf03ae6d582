//! The [`Executor`] protocol and its six implementations.

pub mod broker;
pub mod cooperative;
pub mod executor;
pub mod in_memory;
pub mod process_pool;
pub mod stub;
pub mod thread_pool;

pub mod prelude {
    pub use crate::broker::{BrokerExecutor, BrokerMessage, DistributedExecutor, InMemoryBroker};
    pub use crate::cooperative::CooperativeExecutor;
    pub use crate::executor::{Executor, ExternalStatus};
    pub use crate::in_memory::InMemoryExecutor;
    pub use crate::process_pool::ProcessPoolExecutor;
    pub use crate::stub::StubExecutor;
    pub use crate::thread_pool::ThreadPoolExecutor;
}
