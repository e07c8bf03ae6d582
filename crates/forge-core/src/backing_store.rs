//! The narrow backing-store contract. Domain crates (forge-store, forge-scheduler) compose
//! SQL against `Connection` and `SqlDialect` only — neither trait nor any implementation here
//! names a concrete database driver. Concrete dialects live in peripheral crates, e.g.
//! `forge-postgres`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::ForgeError;

/// A value bound into a parameterized SQL statement
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
    Json(serde_json::Value),
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}
impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}
impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Int(v)
    }
}
impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Bool(v)
    }
}
impl From<DateTime<Utc>> for SqlValue {
    fn from(v: DateTime<Utc>) -> Self {
        SqlValue::Timestamp(v)
    }
}
impl From<serde_json::Value> for SqlValue {
    fn from(v: serde_json::Value) -> Self {
        SqlValue::Json(v)
    }
}
impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(inner) => inner.into(),
            None => SqlValue::Null,
        }
    }
}

/// One returned row. Column access is by name to keep callers resilient to column reordering.
pub trait Row: Send + Sync {
    fn get_text(&self, column: &str) -> Result<Option<String>, ForgeError>;
    fn get_int(&self, column: &str) -> Result<Option<i64>, ForgeError>;
    fn get_bool(&self, column: &str) -> Result<Option<bool>, ForgeError>;
    fn get_timestamp(&self, column: &str) -> Result<Option<DateTime<Utc>>, ForgeError>;
    fn get_json(&self, column: &str) -> Result<Option<serde_json::Value>, ForgeError>;
}

/// The narrow connection abstraction core consumes. Implementations live outside core
/// (an in-process test double, or a peripheral crate wrapping a real driver).
#[async_trait]
pub trait Connection: Send + Sync {
    /// Execute a statement that doesn't return rows; returns affected row count.
    async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64, ForgeError>;

    /// Execute the same statement for each parameter set in `batches`.
    async fn execute_many(&self, sql: &str, batches: &[Vec<SqlValue>]) -> Result<u64, ForgeError>;

    /// Execute a query expected to return at most one row.
    async fn fetch_one(
        &self,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<Option<Box<dyn Row>>, ForgeError>;

    /// Execute a query and return every row.
    async fn fetch_all(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Box<dyn Row>>, ForgeError>;

    /// Begin a transaction. Implementations that don't support explicit transactions may
    /// treat this as a no-op paired with a no-op commit.
    async fn begin(&self) -> Result<(), ForgeError>;
    async fn commit(&self) -> Result<(), ForgeError>;
    async fn rollback(&self) -> Result<(), ForgeError>;
}

/// Unit of time for `SqlDialect::interval`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntervalUnit {
    Seconds,
    Minutes,
    Hours,
    Days,
}

/// SQL-fragment generation contract. Every method returns a string valid for the target
/// engine; domain code interpolates these fragments rather than hardcoding dialect-specific
/// syntax. Modeled one-to-one on the narrow `Connection`/dialect contract this system's
/// original implementation already had.
pub trait SqlDialect: Send + Sync {
    /// Human-readable dialect name, e.g. `"postgres"`.
    fn name(&self) -> &'static str;

    /// Single positional placeholder, 0-based `index`. Ignored by dialects using anonymous
    /// placeholders, required by numbered styles (`$1`, `:1`).
    fn placeholder(&self, index: usize) -> String;

    /// Comma-separated placeholder list, e.g. `"$1, $2, $3"`.
    fn placeholders(&self, count: usize) -> String {
        (0..count)
            .map(|i| self.placeholder(i))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// SQL expression for the current UTC timestamp.
    fn now(&self) -> String;

    /// SQL expression for date/time arithmetic relative to now.
    fn interval(&self, value: i64, unit: IntervalUnit) -> String;

    /// `INSERT ... ON CONFLICT DO NOTHING` (or equivalent); full statement with placeholders.
    fn insert_or_ignore(&self, table: &str, columns: &[&str]) -> String;

    /// `UPSERT`: insert or overwrite on conflict of `key_columns`; full statement.
    fn upsert(&self, table: &str, columns: &[&str], key_columns: &[&str]) -> String;

    /// SQL fragment to set a value inside a JSON column at `path`.
    fn json_set(&self, column: &str, path: &str, param_placeholder: &str) -> String;

    /// DDL fragment for an auto-incrementing primary key column type.
    fn auto_increment(&self) -> &'static str;

    /// DDL `DEFAULT` clause for a timestamp column defaulting to "now".
    fn timestamp_default_now(&self) -> String;

    fn boolean_true(&self) -> &'static str;
    fn boolean_false(&self) -> &'static str;

    /// Query returning matching table names; accepts one placeholder for the table name.
    fn table_exists_query(&self) -> &'static str;
}
