use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::knowledge::{RetrievalResult, SchemaDoc};

/// Grounding material for one request. Built per request, never shared.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GenerationContext {
    pub question: String,
    pub ranked_examples: Vec<RetrievalResult>,
    /// Keyed by upper-cased object name.
    pub referenced_schema_docs: BTreeMap<String, SchemaDoc>,
}

impl GenerationContext {
    pub fn schema_less(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            ..Self::default()
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ValidationStatus {
    Valid,
    /// A forbidden pattern matched and a canonical template replaced the output.
    Repaired { rule: String, intent: String },
    Invalid { reason: String },
    /// Resolved from the knowledge base without calling the model.
    Duplicate { example_id: Uuid },
}

/// Output of guarded generation.
///
/// `sanitized_sql`, when present, holds exactly one statement that starts with
/// SELECT/WITH/INSERT/UPDATE/DELETE and carries no trailing terminator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeneratedQuery {
    pub raw_model_output: String,
    pub sanitized_sql: Option<String>,
    pub validation_status: ValidationStatus,
    pub risk_hints: Vec<String>,
}

impl GeneratedQuery {
    pub fn is_usable(&self) -> bool {
        self.sanitized_sql.is_some() && !matches!(self.validation_status, ValidationStatus::Invalid { .. })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatementKind {
    Read,
    Modifying,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Elevated,
    High,
    Critical,
}

impl RiskLevel {
    pub fn requires_confirmation(&self) -> bool {
        matches!(self, RiskLevel::High | RiskLevel::Critical)
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RiskLevel::Low => "low",
            RiskLevel::Elevated => "elevated",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// Where the cost figure of an [`ExecutionPlan`] came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanSource {
    Declared,
    RuntimeStatistics,
    Unavailable,
}

/// Advisory plan summary. Produced for inspection only.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub declared_cost: Option<f64>,
    pub warnings: Vec<String>,
    pub affected_tables: Vec<String>,
    pub full_scans: u32,
    pub cartesian: bool,
    pub source: PlanSource,
}

impl ExecutionPlan {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            declared_cost: None,
            warnings: vec![reason.into()],
            affected_tables: Vec::new(),
            full_scans: 0,
            cartesian: false,
            source: PlanSource::Unavailable,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RowsOrCount {
    Rows {
        columns: Vec<String>,
        rows: Vec<Vec<serde_json::Value>>,
    },
    Count { affected: u64 },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub rows_or_count: RowsOrCount,
    pub committed: bool,
    pub rolled_back: bool,
}
