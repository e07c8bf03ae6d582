//! [`Connection`] over a real `sqlx::PgPool`, grounded in the teacher's
//! `PostgresWorkflowEventStore`: one pool, dynamic SQL text with positional `$N` parameters,
//! and `SELECT ... FOR UPDATE SKIP LOCKED` for contention-free row claiming.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use forge_core::backing_store::{Connection, Row, SqlValue};
use forge_core::error::ForgeError;
use sqlx::postgres::PgArguments;
use sqlx::query::Query;
use sqlx::{PgPool, Postgres, Row as SqlxRow};
use tokio::sync::Mutex;

fn map_err(err: sqlx::Error) -> ForgeError {
    ForgeError::store(err.to_string())
}

fn bind<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    params: &'q [SqlValue],
) -> Query<'q, Postgres, PgArguments> {
    for value in params {
        query = match value {
            SqlValue::Null => query.bind(Option::<String>::None),
            SqlValue::Bool(b) => query.bind(*b),
            SqlValue::Int(i) => query.bind(*i),
            SqlValue::Float(f) => query.bind(*f),
            SqlValue::Text(s) => query.bind(s.as_str()),
            SqlValue::Timestamp(t) => query.bind(*t),
            SqlValue::Json(v) => query.bind(v.clone()),
        };
    }
    query
}

struct PgRowWrapper(sqlx::postgres::PgRow);

impl Row for PgRowWrapper {
    fn get_text(&self, column: &str) -> Result<Option<String>, ForgeError> {
        self.0.try_get::<Option<String>, _>(column).map_err(map_err)
    }

    fn get_int(&self, column: &str) -> Result<Option<i64>, ForgeError> {
        self.0.try_get::<Option<i64>, _>(column).map_err(map_err)
    }

    fn get_bool(&self, column: &str) -> Result<Option<bool>, ForgeError> {
        self.0.try_get::<Option<bool>, _>(column).map_err(map_err)
    }

    fn get_timestamp(&self, column: &str) -> Result<Option<DateTime<Utc>>, ForgeError> {
        self.0.try_get::<Option<DateTime<Utc>>, _>(column).map_err(map_err)
    }

    fn get_json(&self, column: &str) -> Result<Option<serde_json::Value>, ForgeError> {
        self.0.try_get::<Option<serde_json::Value>, _>(column).map_err(map_err)
    }
}

/// Wraps a connection pool; an in-flight transaction (started by `begin`) is held behind a
/// `tokio::sync::Mutex` so `execute`/`fetch_*` transparently run against it until `commit` or
/// `rollback` clears it.
pub struct PgConnection {
    pool: PgPool,
    txn: Mutex<Option<sqlx::Transaction<'static, Postgres>>>,
}

impl PgConnection {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            txn: Mutex::new(None),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Claims up to `limit` rows with `status_column = pending_value`, skipping rows another
    /// connection already has locked — the row-claiming idiom raw `UPDATE ... WHERE status =`
    /// can't express portably but Postgres can via `FOR UPDATE SKIP LOCKED`.
    pub async fn claim_locked_rows(
        &self,
        table: &str,
        status_column: &str,
        pending_value: &str,
        limit: i64,
    ) -> Result<Vec<Box<dyn Row>>, ForgeError> {
        let sql = format!(
            "SELECT * FROM {table} WHERE {status_column} = $1 ORDER BY created_at ASC LIMIT $2 FOR UPDATE SKIP LOCKED"
        );
        self.fetch_all(
            &sql,
            &[SqlValue::Text(pending_value.to_string()), SqlValue::Int(limit)],
        )
        .await
    }
}

#[async_trait]
impl Connection for PgConnection {
    async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64, ForgeError> {
        let query = bind(sqlx::query(sql), params);
        let mut txn = self.txn.lock().await;
        let result = if let Some(txn) = txn.as_mut() {
            query.execute(&mut **txn).await
        } else {
            query.execute(&self.pool).await
        };
        result.map(|r| r.rows_affected()).map_err(map_err)
    }

    async fn execute_many(&self, sql: &str, batches: &[Vec<SqlValue>]) -> Result<u64, ForgeError> {
        let mut total = 0;
        for params in batches {
            total += self.execute(sql, params).await?;
        }
        Ok(total)
    }

    async fn fetch_one(&self, sql: &str, params: &[SqlValue]) -> Result<Option<Box<dyn Row>>, ForgeError> {
        let query = bind(sqlx::query(sql), params);
        let mut txn = self.txn.lock().await;
        let row = if let Some(txn) = txn.as_mut() {
            query.fetch_optional(&mut **txn).await
        } else {
            query.fetch_optional(&self.pool).await
        }
        .map_err(map_err)?;
        Ok(row.map(|r| Box::new(PgRowWrapper(r)) as Box<dyn Row>))
    }

    async fn fetch_all(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Box<dyn Row>>, ForgeError> {
        let query = bind(sqlx::query(sql), params);
        let mut txn = self.txn.lock().await;
        let rows = if let Some(txn) = txn.as_mut() {
            query.fetch_all(&mut **txn).await
        } else {
            query.fetch_all(&self.pool).await
        }
        .map_err(map_err)?;
        Ok(rows.into_iter().map(|r| Box::new(PgRowWrapper(r)) as Box<dyn Row>).collect())
    }

    async fn begin(&self) -> Result<(), ForgeError> {
        let mut guard = self.txn.lock().await;
        if guard.is_some() {
            return Ok(());
        }
        let txn = self.pool.begin().await.map_err(map_err)?;
        *guard = Some(txn);
        Ok(())
    }

    async fn commit(&self) -> Result<(), ForgeError> {
        let mut guard = self.txn.lock().await;
        if let Some(txn) = guard.take() {
            txn.commit().await.map_err(map_err)?;
        }
        Ok(())
    }

    async fn rollback(&self) -> Result<(), ForgeError> {
        let mut guard = self.txn.lock().await;
        if let Some(txn) = guard.take() {
            txn.rollback().await.map_err(map_err)?;
        }
        Ok(())
    }
}
