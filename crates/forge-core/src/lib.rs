//! Data model, state machine, error taxonomy, and backing-store contract shared by every
//! other `forge-*` crate.
//!
//! This crate never imports a database driver. Anything that talks SQL does so through
//! [`backing_store::Connection`] and [`backing_store::SqlDialect`]; concrete engines are
//! peripheral (see `forge-postgres`).

pub mod backing_store;
pub mod config;
pub mod error;
pub mod model;

pub mod prelude {
    pub use crate::backing_store::{Connection, IntervalUnit, Row, SqlDialect, SqlValue};
    pub use crate::config::RetentionConfig;
    pub use crate::error::{ForgeError, Result};
    pub use crate::model::{
        ConcurrencyLock, DeadLetter, EventType, Priority, RunEvent, RunRecord, RunStatus,
        Schedule, ScheduleRun, ScheduleRunStatus, ScheduleType, TriggerSource, WorkKind, WorkSpec,
    };
}
