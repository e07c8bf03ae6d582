//! Concrete Postgres adapter for the core `Connection`/`SqlDialect` contract. Depended on only
//! by binaries that actually talk to a database — domain crates stay driver-agnostic.

pub mod connection;
pub mod dialect;

pub use connection::PgConnection;
pub use dialect::PostgresDialect;
