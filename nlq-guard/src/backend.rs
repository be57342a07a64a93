use std::fmt;

use async_trait::async_trait;
use nlq_types::ExecutionPlan;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxnMode {
    ReadOnly,
    ReadWrite,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DbErrorCategory {
    Connection,
    Syntax,
    Permission,
    Constraint,
    Timeout,
    Other,
}

impl DbErrorCategory {
    /// Map a SQLSTATE code onto a category.
    pub fn from_sqlstate(code: &str) -> Self {
        match code {
            "42501" => DbErrorCategory::Permission,
            "57014" | "25P03" | "55P03" => DbErrorCategory::Timeout,
            c if c.starts_with("08") || c.starts_with("57P") => DbErrorCategory::Connection,
            c if c.starts_with("42") || c.starts_with("22") => DbErrorCategory::Syntax,
            c if c.starts_with("23") => DbErrorCategory::Constraint,
            _ => DbErrorCategory::Other,
        }
    }
}

impl fmt::Display for DbErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DbErrorCategory::Connection => "connection",
            DbErrorCategory::Syntax => "syntax",
            DbErrorCategory::Permission => "permission",
            DbErrorCategory::Constraint => "constraint",
            DbErrorCategory::Timeout => "timeout",
            DbErrorCategory::Other => "other",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{category}: {message}")]
pub struct DbError {
    pub category: DbErrorCategory,
    pub message: String,
}

impl DbError {
    pub fn new(category: DbErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
        }
    }
}

/// Column names plus rows of JSON values, in result order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueryRows {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
}

/// Relational store seam.
#[async_trait]
pub trait SqlBackend: Send + Sync {
    /// Declared (estimated) plan; never executes the statement.
    async fn explain(&self, sql: &str) -> Result<ExecutionPlan, DbError>;

    /// Plan with runtime statistics. Runs the statement inside a transaction
    /// that is rolled back; only called for read statements.
    async fn runtime_stats(&self, sql: &str) -> Result<ExecutionPlan, DbError>;

    async fn begin(&self, mode: TxnMode) -> Result<Box<dyn SqlTransaction>, DbError>;
}

/// An open transaction. Dropping it without `commit` must roll it back.
#[async_trait]
pub trait SqlTransaction: Send {
    async fn fetch(&mut self, sql: &str) -> Result<QueryRows, DbError>;

    /// Run a modifying statement; returns the affected row count.
    async fn execute(&mut self, sql: &str) -> Result<u64, DbError>;

    async fn commit(self: Box<Self>) -> Result<(), DbError>;

    async fn rollback(self: Box<Self>) -> Result<(), DbError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlstate_categories() {
        assert_eq!(DbErrorCategory::from_sqlstate("42P01"), DbErrorCategory::Syntax);
        assert_eq!(DbErrorCategory::from_sqlstate("42501"), DbErrorCategory::Permission);
        assert_eq!(DbErrorCategory::from_sqlstate("23505"), DbErrorCategory::Constraint);
        assert_eq!(DbErrorCategory::from_sqlstate("57014"), DbErrorCategory::Timeout);
        assert_eq!(DbErrorCategory::from_sqlstate("08006"), DbErrorCategory::Connection);
        assert_eq!(DbErrorCategory::from_sqlstate("XX000"), DbErrorCategory::Other);
    }
}
