use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nlq_context::Retriever;
use nlq_core::*;
use nlq_embed::{Embedder, HashEmbedder};
use nlq_guard::{ExecutionGuard, ExecutionOutcome, GuardConfig, ScriptedBackend};
use nlq_infer::{CompletionRequest, LlmEngine, LlmError, ScriptedLlmEngine, TokenStream};
use nlq_policy::RuleCatalog;
use nlq_store::{InMemoryIndex, Indexer, SourceKind};
use nlq_types::{IndexCollection, RequestContext, RowsOrCount, ValidationStatus};
use serde_json::json;

const DIM: usize = 256;

struct SlowEngine;

#[async_trait]
impl LlmEngine for SlowEngine {
    async fn generate(&self, _req: CompletionRequest) -> Result<TokenStream, LlmError> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Err(LlmError::new(nlq_infer::LlmErrorKind::Other, "too slow"))
    }
}

async fn kernel(llm: Arc<dyn LlmEngine>, backend: Option<ScriptedBackend>) -> NlqKernel {
    let index = Arc::new(InMemoryIndex::new());
    let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::new(DIM));
    let indexer = Indexer::new(index.clone(), embedder.clone(), IndexCollection::cosine("kb", DIM));
    indexer.rebuild(true).await.unwrap();
    let examples = json!([
        {"question": "Выручка по клиентам за сентябрь", "sql": "SELECT CLIENT_ID, SUM(AMOUNT_RUB) FROM REVENUE WHERE PERIOD = '2025-09' GROUP BY CLIENT_ID;", "category": "finance"},
        {"question": "Тарифы на электроэнергию", "sql": "SELECT * FROM TARIFF_EL", "category": "tariffs"}
    ]);
    indexer.ingest(SourceKind::Examples, &examples, "examples.json").await.unwrap();
    indexer
        .ingest(SourceKind::Tables, &json!({"name": "REVENUE", "description": "monthly revenue"}), "tables.json")
        .await
        .unwrap();

    let retriever = Retriever::new(index, embedder, "kb");
    let generator = Generator::new(llm, GenerationSettings::default());
    let guard = backend.map(|b| ExecutionGuard::new(Arc::new(b), GuardConfig::default()));
    NlqKernel::new(indexer, retriever, generator, Arc::new(RuleCatalog::builtin().unwrap()), guard)
}

#[tokio::test]
async fn duplicate_question_skips_the_model() {
    let engine = Arc::new(ScriptedLlmEngine::new(Vec::new()));
    let k = kernel(engine.clone(), None).await;
    let outcome = k
        .ask("выручка по клиентам за  сентябрь", &AskOptions::default(), &RequestContext::new())
        .await
        .unwrap();
    match &outcome {
        AskOutcome::Duplicate { query, example } => {
            assert!(matches!(query.validation_status, ValidationStatus::Duplicate { .. }));
            assert_eq!(example.similarity_score, 1.0);
        }
        other => panic!("expected duplicate, got {other:?}"),
    }
    assert_eq!(
        outcome.sql(),
        Some("SELECT CLIENT_ID, SUM(AMOUNT_RUB) FROM REVENUE WHERE PERIOD = '2025-09' GROUP BY CLIENT_ID")
    );
    assert!(engine.requests().is_empty());
}

#[tokio::test]
async fn unclean_stored_example_goes_to_the_model() {
    let engine = Arc::new(ScriptedLlmEngine::reply("SELECT * FROM TARIFF_EL"));
    let k = kernel(engine.clone(), None).await;
    let batch = json!({"question": "Тарифы на электроэнергию и газ", "sql": "-- vetted\nSELECT * FROM TARIFF_EL; SELECT * FROM TARIFF_GAS"});
    k.indexer.ingest(SourceKind::Examples, &batch, "examples.json").await.unwrap();

    let outcome = k
        .ask("Тарифы на электроэнергию и газ", &AskOptions::default(), &RequestContext::new())
        .await
        .unwrap();
    assert!(matches!(outcome, AskOutcome::Generated { .. }), "got {outcome:?}");
    assert_eq!(outcome.sql(), Some("SELECT * FROM TARIFF_EL"));
    assert_eq!(engine.requests().len(), 1);
}

#[tokio::test]
async fn unprofitable_customers_are_repaired_and_executed() {
    let engine = Arc::new(ScriptedLlmEngine::reply(
        "```sql\nSELECT c.CLIENT_ID FROM CLIENTS c JOIN COST_ALLOCATION_RAW a ON a.CLIENT_ID = c.CLIENT_ID\n```",
    ));
    let backend = ScriptedBackend::new()
        .with_declared_cost(Some(850.0))
        .with_rows(&["CLIENT_ID", "PROFIT_RUB"], vec![vec![json!(17), json!(-42000)]]);
    let k = kernel(engine.clone(), Some(backend)).await;
    let ctx = RequestContext::with_timeout(Duration::from_secs(10));

    let outcome = k
        .ask("Найди убыточных клиентов за октябрь", &AskOptions::default(), &ctx)
        .await
        .unwrap();
    let AskOutcome::Generated { query, context } = &outcome else {
        panic!("expected generated query, got {outcome:?}");
    };
    assert!(matches!(query.validation_status, ValidationStatus::Repaired { .. }));
    assert!(!context.ranked_examples.is_empty());
    assert!(engine.requests()[0].user.contains("REVENUE"));

    let sql = outcome.sql().unwrap();
    assert_eq!(
        sql,
        "SELECT * FROM V_UNPROFITABLE_CUSTOMERS WHERE PERIOD = '2025-10' AND ALERT_TYPE = 'LOSS' ORDER BY PROFIT_RUB ASC"
    );
    match k.execute(sql, false, &ctx).await.unwrap() {
        ExecutionOutcome::Executed(exec) => match &exec.result().rows_or_count {
            RowsOrCount::Rows { rows, .. } => assert_eq!(rows.len(), 1),
            other => panic!("expected rows, got {other:?}"),
        },
        ExecutionOutcome::AwaitingConfirmation(p) => panic!("unexpected confirmation: {}", p.reason),
    }
}

#[tokio::test]
async fn model_failure_falls_back_to_examples() {
    let engine = Arc::new(ScriptedLlmEngine::new(vec![Err(LlmError::from_status(429, "rate limit reached"))]));
    let k = kernel(engine, None).await;
    let opts = AskOptions {
        fallback_examples: 1,
        ..AskOptions::default()
    };
    let outcome = k.ask("сколько стоит газ", &opts, &RequestContext::new()).await.unwrap();
    match outcome {
        AskOutcome::Fallback { error, examples, rejected } => {
            assert!(matches!(error, GenerationError::RateLimited(_)));
            assert_eq!(examples.len(), 1);
            assert!(rejected.is_none());
        }
        other => panic!("expected fallback, got {other:?}"),
    }
}

#[tokio::test]
async fn deadline_abandons_generation() {
    let k = kernel(Arc::new(SlowEngine), None).await;
    let ctx = RequestContext::with_timeout(Duration::from_millis(50));
    let err = k.ask("сколько стоит газ", &AskOptions::default(), &ctx).await.unwrap_err();
    assert!(matches!(err, PipelineError::DeadlineExceeded { stage: "generation" }));
}

#[tokio::test]
async fn execution_needs_a_database() {
    let k = kernel(Arc::new(ScriptedLlmEngine::new(Vec::new())), None).await;
    let err = k.execute("SELECT 1", false, &RequestContext::new()).await.unwrap_err();
    assert!(matches!(err, PipelineError::NoDatabase));
}
