use std::sync::Arc;
use std::time::{Duration, Instant};

use nlq_policy::risk::{assess, decide_gate, GateDecision, RiskAssessment, RiskThresholds};
use nlq_policy::statement::{self, find_top_level, lex};
use nlq_receipts::{Receipt, ReceiptAction, ReceiptLog};
use nlq_types::{
    ExecutionPlan, ExecutionResult, RequestContext, RiskLevel, RowsOrCount, StatementKind,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::backend::{SqlBackend, SqlTransaction, TxnMode};
use crate::preview::{rewrite, PreviewQuery};
use crate::ExecutionError;

/// Keywords a statement handed to the guard may start with.
pub const EXECUTABLE_KEYWORDS: [&str; 6] = ["SELECT", "WITH", "INSERT", "UPDATE", "DELETE", "MERGE"];

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    pub thresholds: RiskThresholds,
    /// Held transactions idle longer than this are rolled back on next access.
    #[serde(with = "secs")]
    pub idle_txn_timeout: Duration,
    /// Read results beyond this many rows are dropped with a warning.
    pub max_rows: usize,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            thresholds: RiskThresholds::default(),
            idle_txn_timeout: Duration::from_secs(60),
            max_rows: 1000,
        }
    }
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardState {
    Received,
    Classified,
    Validated,
    PlanChecked,
    Previewed,
    AwaitingConfirmation,
    AutoExecuted,
    Executed,
    ExecutedInTxn,
    Committed,
    RolledBack,
    Cancelled,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Validation {
    pub ok: bool,
    pub error: Option<String>,
    pub warnings: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Preview {
    pub estimated_rows: u64,
    pub affected_tables: Vec<String>,
    /// Count query that produced the estimate; absent for literal counts.
    pub count_sql: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlanCheck {
    pub plan: ExecutionPlan,
    pub assessment: RiskAssessment,
}

/// A statement held back until the caller confirms it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PendingConfirmation {
    pub sql: String,
    pub kind: StatementKind,
    pub risk: RiskLevel,
    pub reason: String,
    pub warnings: Vec<String>,
    pub plan: Option<ExecutionPlan>,
    pub preview: Option<Preview>,
    pub trail: Vec<GuardState>,
}

#[derive(Debug)]
pub enum ExecutionOutcome {
    AwaitingConfirmation(PendingConfirmation),
    Executed(Execution),
}

/// Classifies, previews, gates and runs statements against a [`SqlBackend`].
pub struct ExecutionGuard {
    backend: Arc<dyn SqlBackend>,
    config: GuardConfig,
    receipts: Option<Arc<ReceiptLog>>,
}

impl ExecutionGuard {
    pub fn new(backend: Arc<dyn SqlBackend>, config: GuardConfig) -> Self {
        Self {
            backend,
            config,
            receipts: None,
        }
    }

    pub fn with_receipts(mut self, log: Option<Arc<ReceiptLog>>) -> Self {
        self.receipts = log;
        self
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    pub fn classify(&self, sql: &str) -> StatementKind {
        statement::classify(sql)
    }

    /// Single statement, allowed leading keyword, balanced quoting.
    pub fn validate(&self, sql: &str) -> Validation {
        let sql = statement::strip_terminator(sql);
        let fail = |error: String| Validation {
            ok: false,
            error: Some(error),
            warnings: Vec::new(),
        };
        if sql.is_empty() {
            return fail("empty statement".into());
        }
        let tokens = match lex(sql) {
            Ok(tokens) => tokens,
            Err(e) => return fail(e.to_string()),
        };
        match statement::statement_count(sql) {
            Ok(1) => {}
            Ok(n) => return fail(format!("expected exactly one statement, found {n}")),
            Err(e) => return fail(e.to_string()),
        }
        let lead = tokens.first().map(|t| t.text.to_ascii_uppercase()).unwrap_or_default();
        if !EXECUTABLE_KEYWORDS.contains(&lead.as_str()) {
            return fail(format!(
                "statement must start with one of {}, found '{lead}'",
                EXECUTABLE_KEYWORDS.join("/")
            ));
        }

        let mut warnings = Vec::new();
        if (lead == "DELETE" || lead == "UPDATE") && find_top_level(&tokens, "WHERE", 1).is_none() {
            let target = statement::referenced_tables(sql)
                .into_iter()
                .next()
                .unwrap_or_else(|| "the target table".into());
            warnings.push(format!("{lead} without WHERE affects every row of {target}"));
        }
        Validation {
            ok: true,
            error: None,
            warnings,
        }
    }

    fn require_valid(&self, sql: &str) -> Result<(), ExecutionError> {
        match self.validate(sql).error {
            Some(error) => Err(ExecutionError::ValidationFailed(error)),
            None => Ok(()),
        }
    }

    /// Declared plan, else runtime statistics, else an unavailable plan.
    /// Only meaningful for reads.
    pub async fn plan_check(&self, sql: &str) -> Result<PlanCheck, ExecutionError> {
        let sql = statement::strip_terminator(sql);
        self.require_valid(sql)?;
        if statement::classify(sql) != StatementKind::Read {
            return Err(ExecutionError::NotApplicable("plan check runs on read statements only".into()));
        }
        let mut plan = match self.backend.explain(sql).await {
            Ok(plan) => plan,
            Err(declared_err) => {
                tracing::warn!(error = %declared_err, "declared plan unavailable; trying runtime statistics");
                match self.backend.runtime_stats(sql).await {
                    Ok(mut plan) => {
                        plan.warnings
                            .insert(0, format!("declared plan unavailable ({declared_err}); using runtime statistics"));
                        plan
                    }
                    Err(stats_err) => {
                        tracing::warn!(error = %stats_err, "runtime statistics unavailable; running unguarded");
                        ExecutionPlan::unavailable(format!(
                            "plan unavailable: {declared_err}; runtime statistics unavailable: {stats_err}"
                        ))
                    }
                }
            }
        };
        if plan.affected_tables.is_empty() {
            plan.affected_tables = statement::referenced_tables(sql);
        }
        let assessment = assess(&plan, &self.config.thresholds);
        Ok(PlanCheck { plan, assessment })
    }

    /// Count the rows a modifying statement would touch. Runs in a read-only
    /// transaction that is always rolled back.
    pub async fn preview(&self, sql: &str) -> Result<Preview, ExecutionError> {
        let sql = statement::strip_terminator(sql);
        self.require_valid(sql)?;
        if statement::classify(sql) != StatementKind::Modifying {
            return Err(ExecutionError::NotApplicable("preview runs on modifying statements only".into()));
        }
        let query = rewrite(sql).map_err(ExecutionError::NotApplicable)?;
        let target = query.target().to_string();
        let (estimated_rows, count_sql) = match query {
            PreviewQuery::Literal { rows, .. } => (rows, None),
            PreviewQuery::Count { sql: count_sql, .. } => {
                let mut txn = self.backend.begin(TxnMode::ReadOnly).await?;
                let fetched = txn.fetch(&count_sql).await;
                if let Err(e) = txn.rollback().await {
                    tracing::warn!(error = %e, "preview rollback failed");
                }
                let rows = fetched?;
                let n = rows
                    .rows
                    .first()
                    .and_then(|r| r.first())
                    .and_then(|v| v.as_u64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
                    .unwrap_or(0);
                (n, Some(count_sql))
            }
        };
        let mut affected_tables = vec![target.to_ascii_uppercase()];
        for t in statement::referenced_tables(sql) {
            if !affected_tables.contains(&t) {
                affected_tables.push(t);
            }
        }
        tracing::info!(estimated_rows, target = %target, "previewed modifying statement");
        Ok(Preview {
            estimated_rows,
            affected_tables,
            count_sql,
        })
    }

    /// Run `sql` through the full gate. Unconfirmed high-risk reads and every
    /// unconfirmed modifying statement come back as `AwaitingConfirmation`.
    pub async fn execute(
        &self,
        sql: &str,
        confirmed: bool,
        ctx: &RequestContext,
    ) -> Result<ExecutionOutcome, ExecutionError> {
        let sql = statement::strip_terminator(sql).to_string();
        let mut trail = vec![GuardState::Received];

        let kind = self.classify(&sql);
        trail.push(GuardState::Classified);

        let validation = self.validate(&sql);
        if let Some(error) = validation.error {
            self.receipt(Receipt::new(ReceiptAction::Reject, &sql, "invalid").with_detail(error.clone()), ctx);
            return Err(ExecutionError::ValidationFailed(error));
        }
        trail.push(GuardState::Validated);
        let mut warnings = validation.warnings;

        match kind {
            StatementKind::Read => self.execute_read(sql, confirmed, ctx, trail, warnings).await,
            StatementKind::Modifying => {
                let preview = match self.preview(&sql).await {
                    Ok(preview) => {
                        trail.push(GuardState::Previewed);
                        Some(preview)
                    }
                    Err(ExecutionError::NotApplicable(reason)) => {
                        warnings.push(format!("no dry-run preview: {reason}"));
                        None
                    }
                    Err(e) => return Err(e),
                };
                if let Some(p) = &preview {
                    warnings.push(format!(
                        "modifies about {} row(s) in {}",
                        p.estimated_rows,
                        p.affected_tables.join(", ")
                    ));
                }
                if !confirmed {
                    trail.push(GuardState::AwaitingConfirmation);
                    let reason = "modifying statement requires confirmation".to_string();
                    self.receipt(
                        Receipt::new(ReceiptAction::AwaitConfirmation, &sql, RiskLevel::High.to_string())
                            .with_detail(reason.clone()),
                        ctx,
                    );
                    return Ok(ExecutionOutcome::AwaitingConfirmation(PendingConfirmation {
                        sql,
                        kind,
                        risk: RiskLevel::High,
                        reason,
                        warnings,
                        plan: None,
                        preview,
                        trail,
                    }));
                }
                self.execute_modifying(sql, ctx, trail, warnings, preview).await
            }
        }
    }

    async fn execute_read(
        &self,
        sql: String,
        confirmed: bool,
        ctx: &RequestContext,
        mut trail: Vec<GuardState>,
        mut warnings: Vec<String>,
    ) -> Result<ExecutionOutcome, ExecutionError> {
        let check = self.plan_check(&sql).await?;
        trail.push(GuardState::PlanChecked);
        warnings.extend(check.assessment.warnings.iter().cloned());
        let risk = check.assessment.level;

        if let GateDecision::AwaitConfirmation(reason) = decide_gate(&check.assessment, confirmed) {
            trail.push(GuardState::AwaitingConfirmation);
            self.receipt(
                Receipt::new(ReceiptAction::AwaitConfirmation, &sql, risk.to_string()).with_detail(reason.clone()),
                ctx,
            );
            tracing::info!(%risk, "read held for confirmation");
            return Ok(ExecutionOutcome::AwaitingConfirmation(PendingConfirmation {
                sql,
                kind: StatementKind::Read,
                risk,
                reason,
                warnings,
                plan: Some(check.plan),
                preview: None,
                trail,
            }));
        }

        let mut txn = self.backend.begin(TxnMode::ReadOnly).await?;
        let mut rows = match txn.fetch(&sql).await {
            Ok(rows) => rows,
            Err(e) => {
                if let Err(rb) = txn.rollback().await {
                    tracing::warn!(error = %rb, "rollback after failed read");
                }
                self.receipt(
                    Receipt::new(ReceiptAction::Rollback, &sql, e.category.to_string()).with_detail(e.message.clone()),
                    ctx,
                );
                return Err(e.into());
            }
        };
        txn.commit().await?;
        if rows.rows.len() > self.config.max_rows {
            warnings.push(format!(
                "result truncated to {} of {} rows",
                self.config.max_rows,
                rows.rows.len()
            ));
            rows.rows.truncate(self.config.max_rows);
        }
        trail.push(if confirmed && risk.requires_confirmation() {
            GuardState::Executed
        } else {
            GuardState::AutoExecuted
        });
        self.receipt(
            Receipt::new(ReceiptAction::Execute, &sql, risk.to_string()).with_detail(format!("{} row(s)", rows.rows.len())),
            ctx,
        );
        tracing::info!(rows = rows.rows.len(), %risk, "read executed");
        Ok(ExecutionOutcome::Executed(Execution {
            id: Uuid::new_v4(),
            request_id: ctx.request_id,
            sql,
            kind: StatementKind::Read,
            risk,
            warnings,
            preview: None,
            trail,
            result: ExecutionResult {
                rows_or_count: RowsOrCount::Rows {
                    columns: rows.columns,
                    rows: rows.rows,
                },
                committed: true,
                rolled_back: false,
            },
            txn: None,
            last_access: Instant::now(),
            idle_timeout: self.config.idle_txn_timeout,
            receipts: self.receipts.clone(),
        }))
    }

    async fn execute_modifying(
        &self,
        sql: String,
        ctx: &RequestContext,
        mut trail: Vec<GuardState>,
        warnings: Vec<String>,
        preview: Option<Preview>,
    ) -> Result<ExecutionOutcome, ExecutionError> {
        let mut txn = self.backend.begin(TxnMode::ReadWrite).await?;
        let affected = match txn.execute(&sql).await {
            Ok(n) => n,
            Err(e) => {
                if let Err(rb) = txn.rollback().await {
                    tracing::warn!(error = %rb, "rollback after failed statement");
                }
                self.receipt(
                    Receipt::new(ReceiptAction::Rollback, &sql, e.category.to_string()).with_detail(e.message.clone()),
                    ctx,
                );
                return Err(e.into());
            }
        };
        trail.push(GuardState::ExecutedInTxn);
        self.receipt(
            Receipt::new(ReceiptAction::Execute, &sql, "pending_commit").with_detail(format!("{affected} row(s)")),
            ctx,
        );
        tracing::info!(affected, "modifying statement executed; transaction held");
        Ok(ExecutionOutcome::Executed(Execution {
            id: Uuid::new_v4(),
            request_id: ctx.request_id,
            sql,
            kind: StatementKind::Modifying,
            risk: RiskLevel::High,
            warnings,
            preview,
            trail,
            result: ExecutionResult {
                rows_or_count: RowsOrCount::Count { affected },
                committed: false,
                rolled_back: false,
            },
            txn: Some(txn),
            last_access: Instant::now(),
            idle_timeout: self.config.idle_txn_timeout,
            receipts: self.receipts.clone(),
        }))
    }

    /// Drop a pending statement. Returns the closed trail.
    pub fn cancel(&self, pending: PendingConfirmation, ctx: &RequestContext) -> Vec<GuardState> {
        let mut trail = pending.trail;
        trail.push(GuardState::Cancelled);
        self.receipt(
            Receipt::new(ReceiptAction::Reject, &pending.sql, pending.risk.to_string()).with_detail("cancelled by caller"),
            ctx,
        );
        trail
    }

    fn receipt(&self, receipt: Receipt, ctx: &RequestContext) {
        write_receipt(self.receipts.as_deref(), receipt.with_request(ctx.request_id));
    }
}

fn write_receipt(log: Option<&ReceiptLog>, receipt: Receipt) {
    if let Some(log) = log {
        if let Err(e) = log.append(receipt) {
            tracing::error!(error = %e, "failed to append receipt");
        }
    }
}

/// An executed statement. Modifying statements keep their transaction open
/// until [`Execution::commit`] or [`Execution::rollback`]; dropping an open
/// execution rolls it back.
pub struct Execution {
    pub id: Uuid,
    pub request_id: Uuid,
    pub sql: String,
    pub kind: StatementKind,
    pub risk: RiskLevel,
    pub warnings: Vec<String>,
    pub preview: Option<Preview>,
    trail: Vec<GuardState>,
    result: ExecutionResult,
    txn: Option<Box<dyn SqlTransaction>>,
    last_access: Instant,
    idle_timeout: Duration,
    receipts: Option<Arc<ReceiptLog>>,
}

impl Execution {
    pub fn result(&self) -> &ExecutionResult {
        &self.result
    }

    pub fn trail(&self) -> &[GuardState] {
        &self.trail
    }

    pub fn is_open(&self) -> bool {
        self.txn.is_some()
    }

    pub fn is_expired(&self) -> bool {
        self.txn.is_some() && self.last_access.elapsed() > self.idle_timeout
    }

    /// Roll back an expired transaction. Returns true if one was rolled back.
    pub async fn expire_if_idle(&mut self) -> bool {
        if !self.is_expired() {
            return false;
        }
        tracing::warn!(execution = %self.id, "held transaction idle too long; rolling back");
        self.finish_rollback("idle timeout").await;
        true
    }

    pub async fn commit(&mut self) -> Result<&ExecutionResult, ExecutionError> {
        if self.expire_if_idle().await {
            return Err(ExecutionError::TransactionExpired(self.idle_timeout));
        }
        let Some(txn) = self.txn.take() else {
            return Err(ExecutionError::TransactionClosed);
        };
        if let Err(e) = txn.commit().await {
            self.result.rolled_back = true;
            self.trail.push(GuardState::RolledBack);
            self.audit(ReceiptAction::Rollback, &format!("commit failed: {e}"));
            return Err(e.into());
        }
        self.result.committed = true;
        self.trail.push(GuardState::Committed);
        self.audit(ReceiptAction::Commit, "committed");
        tracing::info!(execution = %self.id, "transaction committed");
        Ok(&self.result)
    }

    pub async fn rollback(&mut self) -> Result<&ExecutionResult, ExecutionError> {
        if self.txn.is_none() {
            return if self.result.rolled_back {
                Ok(&self.result)
            } else {
                Err(ExecutionError::TransactionClosed)
            };
        }
        self.finish_rollback("rolled back by caller").await;
        Ok(&self.result)
    }

    async fn finish_rollback(&mut self, detail: &str) {
        if let Some(txn) = self.txn.take() {
            if let Err(e) = txn.rollback().await {
                tracing::warn!(error = %e, "rollback failed; connection will discard the transaction");
            }
            self.result.rolled_back = true;
            self.trail.push(GuardState::RolledBack);
            self.audit(ReceiptAction::Rollback, detail);
        }
    }

    fn audit(&self, action: ReceiptAction, detail: &str) {
        write_receipt(
            self.receipts.as_deref(),
            Receipt::new(action, &self.sql, self.risk.to_string())
                .with_request(self.request_id)
                .with_detail(detail),
        );
    }
}

impl Drop for Execution {
    fn drop(&mut self) {
        if self.txn.take().is_some() {
            tracing::warn!(execution = %self.id, "execution dropped with open transaction; rolled back");
            self.audit(ReceiptAction::Rollback, "dropped without commit");
        }
    }
}

impl std::fmt::Debug for Execution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Execution")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("risk", &self.risk)
            .field("open", &self.is_open())
            .field("result", &self.result)
            .finish()
    }
}
