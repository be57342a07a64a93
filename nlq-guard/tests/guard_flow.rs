use std::sync::Arc;
use std::time::Duration;

use nlq_guard::*;
use nlq_receipts::{verify_log, ReceiptAction, ReceiptLog};
use nlq_types::{PlanSource, RequestContext, RiskLevel, RowsOrCount, StatementKind};
use serde_json::json;

fn guard(backend: &ScriptedBackend) -> ExecutionGuard {
    ExecutionGuard::new(Arc::new(backend.clone()), GuardConfig::default())
}

fn executed(outcome: ExecutionOutcome) -> Execution {
    match outcome {
        ExecutionOutcome::Executed(e) => e,
        ExecutionOutcome::AwaitingConfirmation(p) => panic!("unexpected confirmation request: {}", p.reason),
    }
}

fn pending(outcome: ExecutionOutcome) -> PendingConfirmation {
    match outcome {
        ExecutionOutcome::AwaitingConfirmation(p) => p,
        ExecutionOutcome::Executed(e) => panic!("unexpected execution: {e:?}"),
    }
}

#[test]
fn validation_rejects_batches_and_foreign_statements() {
    let g = guard(&ScriptedBackend::new());
    assert!(g.validate("SELECT 1;").ok);
    assert!(!g.validate("SELECT 1; DROP TABLE clients").ok);
    assert!(!g.validate("DROP TABLE clients").ok);
    assert!(!g.validate("   ").ok);
    assert!(!g.validate("SELECT 'open").ok);

    let v = g.validate("DELETE FROM TEMP_LOAD");
    assert!(v.ok);
    assert!(v.warnings[0].contains("without WHERE"));
}

#[tokio::test]
async fn preview_never_mutates() {
    let backend = ScriptedBackend::new().with_matching_rows("TEMP_LOAD", 42);
    let g = guard(&backend);

    let preview = g.preview("DELETE FROM TEMP_LOAD WHERE period = '2025-09'").await.unwrap();
    assert_eq!(preview.estimated_rows, 42);
    assert_eq!(preview.affected_tables, vec!["TEMP_LOAD"]);

    let journal = backend.journal();
    assert_eq!(journal.first(), Some(&BackendEvent::Begin(TxnMode::ReadOnly)));
    assert!(matches!(journal[1], BackendEvent::Fetch(_)));
    assert_eq!(journal.last(), Some(&BackendEvent::Rollback));
    assert!(!journal.iter().any(|e| matches!(e, BackendEvent::Execute(_))));
    assert!(backend.applied().is_empty());
}

#[tokio::test]
async fn insert_values_preview_is_literal() {
    let backend = ScriptedBackend::new();
    let preview = guard(&backend)
        .preview("INSERT INTO notes (a) VALUES (1), (2)")
        .await
        .unwrap();
    assert_eq!(preview.estimated_rows, 2);
    assert!(preview.count_sql.is_none());
    assert!(backend.journal().is_empty());
}

#[tokio::test]
async fn preview_refuses_reads() {
    let g = guard(&ScriptedBackend::new());
    assert!(matches!(g.preview("SELECT 1").await, Err(ExecutionError::NotApplicable(_))));
}

#[tokio::test]
async fn plan_and_preview_reject_batches_before_the_database() {
    let backend = ScriptedBackend::new()
        .with_declared_cost(Some(10.0))
        .with_matching_rows("TEMP_LOAD", 3);
    let g = guard(&backend);
    assert!(matches!(
        g.plan_check("SELECT * FROM CLIENTS; DROP TABLE CLIENTS").await,
        Err(ExecutionError::ValidationFailed(_))
    ));
    assert!(matches!(
        g.preview("DELETE FROM TEMP_LOAD WHERE id = 1; DELETE FROM CLIENTS").await,
        Err(ExecutionError::ValidationFailed(_))
    ));
    assert!(backend.journal().is_empty());
}

#[tokio::test]
async fn cheap_read_runs_unattended() {
    let backend = ScriptedBackend::new()
        .with_declared_cost(Some(120.0))
        .with_rows(&["CLIENT_ID", "PROFIT_RUB"], vec![vec![json!(7), json!(-1200.5)]]);
    let ctx = RequestContext::new();
    let exec = executed(
        guard(&backend)
            .execute("SELECT CLIENT_ID, PROFIT_RUB FROM V_UNPROFITABLE_CUSTOMERS;", false, &ctx)
            .await
            .unwrap(),
    );
    assert_eq!(exec.kind, StatementKind::Read);
    assert_eq!(exec.risk, RiskLevel::Low);
    assert!(exec.result().committed);
    assert!(!exec.is_open());
    assert_eq!(exec.trail().last(), Some(&GuardState::AutoExecuted));
    match &exec.result().rows_or_count {
        RowsOrCount::Rows { columns, rows } => {
            assert_eq!(columns, &vec!["CLIENT_ID".to_string(), "PROFIT_RUB".to_string()]);
            assert_eq!(rows.len(), 1);
        }
        other => panic!("expected rows, got {other:?}"),
    }
}

#[tokio::test]
async fn expensive_read_waits_for_confirmation() {
    let backend = ScriptedBackend::new().with_declared_cost(Some(15_000_000.0));
    let g = guard(&backend);
    let ctx = RequestContext::new();
    let sql = "SELECT * FROM TRAFFIC_RAW";

    let p = pending(g.execute(sql, false, &ctx).await.unwrap());
    assert_eq!(p.risk, RiskLevel::Critical);
    assert!(p.warnings.iter().any(|w| w.contains("15000000")));
    assert_eq!(p.trail.last(), Some(&GuardState::AwaitingConfirmation));
    assert!(!backend.journal().iter().any(|e| matches!(e, BackendEvent::Fetch(_))));

    let exec = executed(g.execute(sql, true, &ctx).await.unwrap());
    assert_eq!(exec.risk, RiskLevel::Critical);
    assert_eq!(exec.trail().last(), Some(&GuardState::Executed));
}

#[tokio::test]
async fn plan_degrades_to_runtime_statistics_then_unavailable() {
    let backend = ScriptedBackend::new().with_declared_cost(None).with_runtime_cost(Some(2_000_000.0));
    let check = guard(&backend).plan_check("SELECT * FROM CLIENTS").await.unwrap();
    assert_eq!(check.plan.source, PlanSource::RuntimeStatistics);
    assert_eq!(check.assessment.level, RiskLevel::High);
    assert!(check.plan.warnings[0].contains("declared plan unavailable"));
    assert_eq!(check.plan.affected_tables, vec!["CLIENTS"]);

    let backend = ScriptedBackend::new();
    let check = guard(&backend).plan_check("SELECT * FROM CLIENTS").await.unwrap();
    assert_eq!(check.plan.source, PlanSource::Unavailable);
    assert_eq!(check.assessment.level, RiskLevel::Low);
    assert!(check.assessment.warnings.iter().any(|w| w.contains("no cost estimate")));
}

#[tokio::test]
async fn delete_requires_confirmation_and_explicit_commit() {
    let backend = ScriptedBackend::new().with_matching_rows("TEMP_LOAD", 3);
    let g = guard(&backend);
    let ctx = RequestContext::new();
    let sql = "DELETE FROM TEMP_LOAD WHERE period = '2025-09'";

    let p = pending(g.execute(sql, false, &ctx).await.unwrap());
    assert_eq!(p.kind, StatementKind::Modifying);
    assert_eq!(p.preview.as_ref().map(|p| p.estimated_rows), Some(3));
    assert!(backend.applied().is_empty());

    let mut exec = executed(g.execute(sql, true, &ctx).await.unwrap());
    assert!(exec.is_open());
    assert!(!exec.result().committed);
    assert_eq!(exec.result().rows_or_count, RowsOrCount::Count { affected: 3 });
    assert!(backend.applied().is_empty());

    let result = exec.commit().await.unwrap();
    assert!(result.committed);
    assert_eq!(backend.applied(), vec![sql.to_string()]);
    assert_eq!(exec.trail().last(), Some(&GuardState::Committed));
    assert!(matches!(exec.commit().await, Err(ExecutionError::TransactionClosed)));
}

#[tokio::test]
async fn rollback_discards_changes() {
    let backend = ScriptedBackend::new().with_matching_rows("TARIFF_EL", 10);
    let ctx = RequestContext::new();
    let mut exec = executed(
        guard(&backend)
            .execute("UPDATE TARIFF_EL SET rate = rate * 1.1 WHERE region = 5", true, &ctx)
            .await
            .unwrap(),
    );
    let result = exec.rollback().await.unwrap();
    assert!(result.rolled_back && !result.committed);
    assert!(backend.applied().is_empty());
}

#[tokio::test]
async fn dropping_open_execution_rolls_back() {
    let backend = ScriptedBackend::new().with_matching_rows("TEMP_LOAD", 1);
    let ctx = RequestContext::new();
    let exec = executed(
        guard(&backend)
            .execute("DELETE FROM TEMP_LOAD WHERE id = 1", true, &ctx)
            .await
            .unwrap(),
    );
    drop(exec);
    assert_eq!(backend.journal().last(), Some(&BackendEvent::Rollback));
    assert!(backend.applied().is_empty());
}

#[tokio::test]
async fn idle_transaction_expires() {
    let backend = ScriptedBackend::new().with_matching_rows("TEMP_LOAD", 1);
    let config = GuardConfig {
        idle_txn_timeout: Duration::from_millis(20),
        ..GuardConfig::default()
    };
    let g = ExecutionGuard::new(Arc::new(backend.clone()), config);
    let mut exec = executed(
        g.execute("DELETE FROM TEMP_LOAD WHERE id = 1", true, &RequestContext::new())
            .await
            .unwrap(),
    );
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(exec.is_expired());
    assert!(matches!(exec.commit().await, Err(ExecutionError::TransactionExpired(_))));
    assert!(exec.result().rolled_back);
    assert!(backend.applied().is_empty());
}

#[tokio::test]
async fn database_error_rolls_back() {
    let backend = ScriptedBackend::new()
        .with_matching_rows("CLIENTS", 1)
        .failing_execute(DbError::new(DbErrorCategory::Constraint, "violates foreign key"));
    let err = guard(&backend)
        .execute("DELETE FROM CLIENTS WHERE id = 1", true, &RequestContext::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ExecutionError::Database {
            category: DbErrorCategory::Constraint,
            ..
        }
    ));
    assert_eq!(backend.journal().last(), Some(&BackendEvent::Rollback));
}

#[tokio::test]
async fn receipts_record_each_decision() {
    let dir = tempfile::tempdir().unwrap();
    let log = Arc::new(ReceiptLog::open(dir.path().join("receipts.jsonl")).unwrap());
    let backend = ScriptedBackend::new().with_matching_rows("TEMP_LOAD", 2);
    let g = guard(&backend).with_receipts(Some(log.clone()));
    let ctx = RequestContext::new();
    let sql = "DELETE FROM TEMP_LOAD WHERE id < 3";

    let p = pending(g.execute(sql, false, &ctx).await.unwrap());
    let trail = g.cancel(p, &ctx);
    assert_eq!(trail.last(), Some(&GuardState::Cancelled));

    let mut exec = executed(g.execute(sql, true, &ctx).await.unwrap());
    exec.commit().await.unwrap();
    assert!(g.execute("DROP TABLE x", true, &ctx).await.is_err());

    let actions: Vec<_> = log.tail(10).unwrap().into_iter().map(|r| r.action).collect();
    assert_eq!(
        actions,
        vec![
            ReceiptAction::AwaitConfirmation,
            ReceiptAction::Reject,
            ReceiptAction::Execute,
            ReceiptAction::Commit,
            ReceiptAction::Reject,
        ]
    );
    assert_eq!(verify_log(log.path()).unwrap(), 5);
}
