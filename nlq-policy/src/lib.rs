//! Query policy: statement recognition, the versioned rule catalog used to
//! validate and repair generated statements, and plan-cost risk gating.

use thiserror::Error;

pub mod period;
pub mod risk;
pub mod rules;
pub mod statement;

pub use period::extract_period;
pub use risk::{assess, decide_gate, GateDecision, RiskAssessment, RiskThresholds};
pub use rules::{ForbiddenPattern, Intent, Review, RuleCatalog, RuleSet};
pub use statement::{classify, extract_statement, referenced_tables, statement_count, strip_terminator};

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("rule set io: {0}")]
    Io(String),
    #[error("rule set yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("forbidden pattern '{id}' does not compile: {message}")]
    Pattern { id: String, message: String },
}
