//! Execution guard: the only path from a generated statement to the database.
//!
//! Reads are planned and risk-gated, then run in a read-only transaction.
//! Modifying statements are previewed with a counting rewrite, always held for
//! confirmation, and executed inside a transaction the caller must commit.

use std::time::Duration;

use thiserror::Error;

pub mod backend;
pub mod guard;
pub mod pg;
pub mod plan;
pub mod preview;
pub mod scripted;

pub use backend::{DbError, DbErrorCategory, QueryRows, SqlBackend, SqlTransaction, TxnMode};
pub use guard::{
    Execution, ExecutionGuard, ExecutionOutcome, GuardConfig, GuardState, PendingConfirmation, PlanCheck, Preview,
    Validation,
};
pub use pg::{PgBackend, PgSettings};
pub use scripted::{BackendEvent, ScriptedBackend};

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("validation failed: {0}")]
    ValidationFailed(String),
    #[error("not applicable: {0}")]
    NotApplicable(String),
    #[error("database error ({category}): {message}")]
    Database {
        category: DbErrorCategory,
        message: String,
    },
    #[error("transaction idle longer than {0:?}; rolled back")]
    TransactionExpired(Duration),
    #[error("transaction already closed")]
    TransactionClosed,
}

impl From<DbError> for ExecutionError {
    fn from(e: DbError) -> Self {
        ExecutionError::Database {
            category: e.category,
            message: e.message,
        }
    }
}
