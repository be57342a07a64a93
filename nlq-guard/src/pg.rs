use std::time::Duration;

use async_trait::async_trait;
use nlq_types::{ExecutionPlan, PlanSource};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Row, Transaction};

use crate::backend::{DbError, DbErrorCategory, QueryRows, SqlBackend, SqlTransaction, TxnMode};
use crate::plan::parse_explain;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PgSettings {
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
    /// Applied with `SET LOCAL statement_timeout` in every transaction.
    pub statement_timeout_secs: u64,
    /// Applied with `SET LOCAL idle_in_transaction_session_timeout`.
    pub idle_txn_timeout_secs: u64,
}

impl Default for PgSettings {
    fn default() -> Self {
        Self {
            max_connections: 8,
            acquire_timeout_secs: 5,
            statement_timeout_secs: 30,
            idle_txn_timeout_secs: 60,
        }
    }
}

/// PostgreSQL backend over a sqlx pool.
#[derive(Clone)]
pub struct PgBackend {
    pool: PgPool,
    settings: PgSettings,
}

impl PgBackend {
    pub async fn connect(database_url: &str, settings: PgSettings) -> Result<Self, DbError> {
        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .acquire_timeout(Duration::from_secs(settings.acquire_timeout_secs))
            .connect(database_url)
            .await
            .map_err(db_error)?;
        tracing::info!(max_connections = settings.max_connections, "connected to postgres");
        Ok(Self { pool, settings })
    }

    pub fn from_pool(pool: PgPool, settings: PgSettings) -> Self {
        Self { pool, settings }
    }

    async fn open(&self, mode: TxnMode) -> Result<Transaction<'static, Postgres>, DbError> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;
        if mode == TxnMode::ReadOnly {
            sqlx::query("SET TRANSACTION READ ONLY")
                .execute(&mut *tx)
                .await
                .map_err(db_error)?;
        }
        sqlx::query(&format!(
            "SET LOCAL statement_timeout = {}",
            self.settings.statement_timeout_secs * 1000
        ))
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;
        sqlx::query(&format!(
            "SET LOCAL idle_in_transaction_session_timeout = {}",
            self.settings.idle_txn_timeout_secs * 1000
        ))
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;
        Ok(tx)
    }
}

pub(crate) fn db_error(e: sqlx::Error) -> DbError {
    let category = match &e {
        sqlx::Error::Database(d) => d
            .code()
            .map(|c| DbErrorCategory::from_sqlstate(&c))
            .unwrap_or(DbErrorCategory::Other),
        sqlx::Error::PoolTimedOut => DbErrorCategory::Timeout,
        sqlx::Error::Io(_) | sqlx::Error::Tls(_) | sqlx::Error::PoolClosed => DbErrorCategory::Connection,
        _ => DbErrorCategory::Other,
    };
    DbError::new(category, e.to_string())
}

#[async_trait]
impl SqlBackend for PgBackend {
    async fn explain(&self, sql: &str) -> Result<ExecutionPlan, DbError> {
        let row = sqlx::query(&format!("EXPLAIN (FORMAT JSON) {sql}"))
            .fetch_one(&self.pool)
            .await
            .map_err(db_error)?;
        let raw: serde_json::Value = row.try_get(0).map_err(db_error)?;
        parse_explain(&raw, PlanSource::Declared).map_err(|m| DbError::new(DbErrorCategory::Other, m))
    }

    async fn runtime_stats(&self, sql: &str) -> Result<ExecutionPlan, DbError> {
        let mut tx = self.open(TxnMode::ReadOnly).await?;
        let result = sqlx::query(&format!("EXPLAIN (ANALYZE, FORMAT JSON) {sql}"))
            .fetch_one(&mut *tx)
            .await;
        tx.rollback().await.map_err(db_error)?;
        let raw: serde_json::Value = result.map_err(db_error)?.try_get(0).map_err(db_error)?;
        parse_explain(&raw, PlanSource::RuntimeStatistics).map_err(|m| DbError::new(DbErrorCategory::Other, m))
    }

    async fn begin(&self, mode: TxnMode) -> Result<Box<dyn SqlTransaction>, DbError> {
        let tx = self.open(mode).await?;
        Ok(Box::new(PgTransaction { tx }))
    }
}

/// sqlx rolls the transaction back when it is dropped unfinished.
pub struct PgTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl SqlTransaction for PgTransaction {
    async fn fetch(&mut self, sql: &str) -> Result<QueryRows, DbError> {
        // row_to_json keeps column order and renders every type, NUMERIC included.
        let wrapped = format!("SELECT row_to_json(q)::text AS row FROM ({sql}) AS q");
        let rows = sqlx::query(&wrapped)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(db_error)?;
        let mut out = QueryRows::default();
        for row in rows {
            let text: String = row.try_get("row").map_err(db_error)?;
            let value: serde_json::Value = serde_json::from_str(&text)
                .map_err(|e| DbError::new(DbErrorCategory::Other, format!("row decode: {e}")))?;
            if let serde_json::Value::Object(map) = value {
                if out.columns.is_empty() {
                    out.columns = map.keys().cloned().collect();
                }
                out.rows.push(map.into_iter().map(|(_, v)| v).collect());
            }
        }
        Ok(out)
    }

    async fn execute(&mut self, sql: &str) -> Result<u64, DbError> {
        let done = sqlx::query(sql)
            .execute(&mut *self.tx)
            .await
            .map_err(db_error)?;
        Ok(done.rows_affected())
    }

    async fn commit(self: Box<Self>) -> Result<(), DbError> {
        self.tx.commit().await.map_err(db_error)
    }

    async fn rollback(self: Box<Self>) -> Result<(), DbError> {
        self.tx.rollback().await.map_err(db_error)
    }
}
