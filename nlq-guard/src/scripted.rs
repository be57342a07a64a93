//! In-process [`SqlBackend`] with configurable plans and row counts. Every
//! call is journaled so callers can assert on transaction handling.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use nlq_types::{ExecutionPlan, PlanSource};

use crate::backend::{DbError, DbErrorCategory, QueryRows, SqlBackend, SqlTransaction, TxnMode};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BackendEvent {
    Explain(String),
    RuntimeStats(String),
    Begin(TxnMode),
    Fetch(String),
    Execute(String),
    Commit,
    Rollback,
}

#[derive(Default)]
struct ScriptState {
    declared: Option<ExecutionPlan>,
    runtime: Option<ExecutionPlan>,
    /// Rows matched by any statement or count query naming this table.
    matching_rows: HashMap<String, u64>,
    rows: QueryRows,
    fail_execute: Option<DbError>,
    rollback_delay: Option<Duration>,
    journal: Vec<BackendEvent>,
    /// Modifying statements whose transaction committed.
    applied: Vec<String>,
}

#[derive(Clone, Default)]
pub struct ScriptedBackend {
    state: Arc<Mutex<ScriptState>>,
}

fn lock_err() -> DbError {
    DbError::new(DbErrorCategory::Other, "scripted backend lock poisoned")
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declared plan with the given cost; `None` makes `explain` fail.
    pub fn with_declared_cost(self, cost: Option<f64>) -> Self {
        self.update(|s| {
            s.declared = cost.map(|c| ExecutionPlan {
                declared_cost: Some(c),
                warnings: Vec::new(),
                affected_tables: Vec::new(),
                full_scans: 0,
                cartesian: false,
                source: PlanSource::Declared,
            })
        })
    }

    /// Runtime-statistics plan with the given cost; `None` makes it fail.
    pub fn with_runtime_cost(self, cost: Option<f64>) -> Self {
        self.update(|s| {
            s.runtime = cost.map(|c| ExecutionPlan {
                declared_cost: Some(c),
                warnings: Vec::new(),
                affected_tables: Vec::new(),
                full_scans: 0,
                cartesian: false,
                source: PlanSource::RuntimeStatistics,
            })
        })
    }

    pub fn with_matching_rows(self, table: &str, rows: u64) -> Self {
        self.update(|s| {
            s.matching_rows.insert(table.to_ascii_uppercase(), rows);
        })
    }

    pub fn with_rows(self, columns: &[&str], rows: Vec<Vec<serde_json::Value>>) -> Self {
        self.update(|s| {
            s.rows = QueryRows {
                columns: columns.iter().map(|c| c.to_string()).collect(),
                rows,
            }
        })
    }

    pub fn failing_execute(self, err: DbError) -> Self {
        self.update(|s| s.fail_execute = Some(err))
    }

    /// Rollbacks take this long to complete.
    pub fn with_rollback_delay(self, delay: Duration) -> Self {
        self.update(|s| s.rollback_delay = Some(delay))
    }

    pub fn journal(&self) -> Vec<BackendEvent> {
        self.state.lock().map(|s| s.journal.clone()).unwrap_or_default()
    }

    pub fn applied(&self) -> Vec<String> {
        self.state.lock().map(|s| s.applied.clone()).unwrap_or_default()
    }

    fn update(self, f: impl FnOnce(&mut ScriptState)) -> Self {
        if let Ok(mut s) = self.state.lock() {
            f(&mut s);
        }
        self
    }

    fn record(&self, event: BackendEvent) -> Result<(), DbError> {
        self.state.lock().map_err(|_| lock_err())?.journal.push(event);
        Ok(())
    }
}

#[async_trait]
impl SqlBackend for ScriptedBackend {
    async fn explain(&self, sql: &str) -> Result<ExecutionPlan, DbError> {
        self.record(BackendEvent::Explain(sql.to_string()))?;
        let state = self.state.lock().map_err(|_| lock_err())?;
        state
            .declared
            .clone()
            .ok_or_else(|| DbError::new(DbErrorCategory::Permission, "EXPLAIN not permitted"))
    }

    async fn runtime_stats(&self, sql: &str) -> Result<ExecutionPlan, DbError> {
        self.record(BackendEvent::RuntimeStats(sql.to_string()))?;
        let state = self.state.lock().map_err(|_| lock_err())?;
        state
            .runtime
            .clone()
            .ok_or_else(|| DbError::new(DbErrorCategory::Permission, "statistics views not readable"))
    }

    async fn begin(&self, mode: TxnMode) -> Result<Box<dyn SqlTransaction>, DbError> {
        self.record(BackendEvent::Begin(mode))?;
        Ok(Box::new(ScriptedTransaction {
            backend: self.clone(),
            mode,
            pending: Vec::new(),
            finished: false,
        }))
    }
}

struct ScriptedTransaction {
    backend: ScriptedBackend,
    mode: TxnMode,
    pending: Vec<String>,
    finished: bool,
}

impl ScriptedTransaction {
    fn matching(&self, sql: &str) -> Result<u64, DbError> {
        let state = self.backend.state.lock().map_err(|_| lock_err())?;
        Ok(nlq_policy::referenced_tables(sql)
            .iter()
            .find_map(|t| state.matching_rows.get(t).copied())
            .unwrap_or(0))
    }
}

#[async_trait]
impl SqlTransaction for ScriptedTransaction {
    async fn fetch(&mut self, sql: &str) -> Result<QueryRows, DbError> {
        self.backend.record(BackendEvent::Fetch(sql.to_string()))?;
        if sql.contains("preview_rows") {
            let n = self.matching(sql)?;
            return Ok(QueryRows {
                columns: vec!["preview_rows".into()],
                rows: vec![vec![serde_json::json!(n)]],
            });
        }
        let state = self.backend.state.lock().map_err(|_| lock_err())?;
        Ok(state.rows.clone())
    }

    async fn execute(&mut self, sql: &str) -> Result<u64, DbError> {
        self.backend.record(BackendEvent::Execute(sql.to_string()))?;
        if self.mode == TxnMode::ReadOnly {
            return Err(DbError::new(
                DbErrorCategory::Permission,
                "cannot execute in a read-only transaction",
            ));
        }
        if let Some(err) = self.backend.state.lock().map_err(|_| lock_err())?.fail_execute.clone() {
            return Err(err);
        }
        self.pending.push(sql.to_string());
        self.matching(sql)
    }

    async fn commit(mut self: Box<Self>) -> Result<(), DbError> {
        self.finished = true;
        self.backend.record(BackendEvent::Commit)?;
        let pending = std::mem::take(&mut self.pending);
        self.backend
            .state
            .lock()
            .map_err(|_| lock_err())?
            .applied
            .extend(pending);
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> Result<(), DbError> {
        self.finished = true;
        let delay = self.backend.state.lock().map_err(|_| lock_err())?.rollback_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.backend.record(BackendEvent::Rollback)
    }
}

impl Drop for ScriptedTransaction {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.backend.record(BackendEvent::Rollback);
        }
    }
}
