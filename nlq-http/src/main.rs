use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use nlq_core::{AskOptions, AskOutcome, NlqConfig, NlqKernel, PipelineError};
use nlq_guard::{DbErrorCategory, ExecutionError, ExecutionOutcome, PendingConfirmation, Preview};
use nlq_store::SourceKind;
use nlq_types::{ExecutionResult, GeneratedQuery, RequestContext, RetrievalResult, RiskLevel, StatementKind};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

mod registry;

use registry::TxnRegistry;

#[derive(Clone)]
struct AppState {
    kernel: Arc<NlqKernel>,
    registry: Arc<TxnRegistry>,
    cfg: Arc<NlqConfig>,
}

struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(json!({ "error": self.1 }))).into_response()
    }
}

impl From<PipelineError> for ApiError {
    fn from(e: PipelineError) -> Self {
        let status = match &e {
            PipelineError::Retrieval(_) | PipelineError::NoDatabase => StatusCode::SERVICE_UNAVAILABLE,
            PipelineError::DeadlineExceeded { .. } => StatusCode::GATEWAY_TIMEOUT,
            PipelineError::Execution(e) => return ApiError::from_execution(e),
        };
        ApiError(status, e.to_string())
    }
}

impl ApiError {
    fn from_execution(e: &ExecutionError) -> Self {
        let status = match e {
            ExecutionError::ValidationFailed(_) | ExecutionError::NotApplicable(_) => StatusCode::BAD_REQUEST,
            ExecutionError::TransactionExpired(_) => StatusCode::GONE,
            ExecutionError::TransactionClosed => StatusCode::CONFLICT,
            ExecutionError::Database { category, .. } => match category {
                DbErrorCategory::Syntax => StatusCode::BAD_REQUEST,
                DbErrorCategory::Permission => StatusCode::FORBIDDEN,
                DbErrorCategory::Constraint => StatusCode::CONFLICT,
                DbErrorCategory::Timeout => StatusCode::GATEWAY_TIMEOUT,
                DbErrorCategory::Connection | DbErrorCategory::Other => StatusCode::BAD_GATEWAY,
            },
        };
        ApiError(status, e.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct AskRequest {
    question: String,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    k: Option<usize>,
    #[serde(default)]
    execute: bool,
    #[serde(default)]
    confirmed: bool,
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum AskResponse {
    Duplicate {
        query: GeneratedQuery,
        example: RetrievalResult,
        #[serde(skip_serializing_if = "Option::is_none")]
        execution: Option<ExecuteResponse>,
    },
    Generated {
        query: GeneratedQuery,
        examples: Vec<RetrievalResult>,
        #[serde(skip_serializing_if = "Option::is_none")]
        execution: Option<ExecuteResponse>,
    },
    Fallback {
        error: String,
        remediation: &'static str,
        rejected: Option<GeneratedQuery>,
        examples: Vec<RetrievalResult>,
    },
}

#[derive(Debug, Deserialize)]
struct ExecuteRequest {
    sql: String,
    #[serde(default)]
    confirmed: bool,
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum ExecuteResponse {
    AwaitingConfirmation {
        #[serde(flatten)]
        pending: PendingConfirmation,
    },
    Executed {
        /// Present while a modifying statement waits for commit/rollback.
        transaction_id: Option<Uuid>,
        kind: StatementKind,
        risk: RiskLevel,
        warnings: Vec<String>,
        preview: Option<Preview>,
        result: ExecutionResult,
    },
}

#[derive(Debug, Deserialize)]
struct IngestRequest {
    kind: SourceKind,
    records: serde_json::Value,
    #[serde(default)]
    recreate: bool,
    #[serde(default)]
    source: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let config_path = std::env::var("NLQ_CONFIG").ok().map(PathBuf::from);
    let cfg = Arc::new(NlqConfig::load(config_path.as_deref())?);
    let kernel = Arc::new(NlqKernel::from_config(&cfg).await?);
    let registry = Arc::new(TxnRegistry::new());

    let sweeper = Arc::clone(&registry);
    let period = Duration::from_secs((cfg.execution.idle_txn_timeout_secs / 4).max(1));
    tokio::spawn(async move {
        sweeper.sweep_every(period).await;
    });

    let app = router(AppState { kernel, registry, cfg });

    let addr: SocketAddr = std::env::var("NLQ_HTTP_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:7000".into())
        .parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "nlq HTTP server listening");
    axum::serve(listener, app).await?;

    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/ask", post(ask))
        .route("/v1/execute", post(execute))
        .route("/v1/transactions/:id/commit", post(commit))
        .route("/v1/transactions/:id/rollback", post(rollback))
        .route("/v1/ingest", post(ingest))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn healthz() -> &'static str {
    "ok"
}

async fn ask(State(state): State<AppState>, Json(req): Json<AskRequest>) -> Result<Json<AskResponse>, ApiError> {
    let ctx = RequestContext::with_timeout(state.cfg.request_timeout());
    let opts = AskOptions {
        k: req.k.unwrap_or(state.cfg.retrieval.k),
        category: req.category,
        fallback_examples: state.cfg.retrieval.fallback_examples,
    };
    let outcome = state.kernel.ask(&req.question, &opts, &ctx).await?;

    let execution = match (req.execute, outcome.sql()) {
        (true, Some(sql)) => Some(run(&state, sql, req.confirmed, &ctx).await?),
        _ => None,
    };
    let response = match outcome {
        AskOutcome::Duplicate { query, example } => AskResponse::Duplicate {
            query,
            example,
            execution,
        },
        AskOutcome::Generated { query, context } => AskResponse::Generated {
            query,
            examples: context.ranked_examples,
            execution,
        },
        AskOutcome::Fallback {
            error,
            rejected,
            examples,
        } => AskResponse::Fallback {
            remediation: error.remediation(),
            error: error.to_string(),
            rejected,
            examples,
        },
    };
    Ok(Json(response))
}

async fn execute(
    State(state): State<AppState>,
    Json(req): Json<ExecuteRequest>,
) -> Result<Json<ExecuteResponse>, ApiError> {
    let ctx = RequestContext::with_timeout(state.cfg.request_timeout());
    Ok(Json(run(&state, &req.sql, req.confirmed, &ctx).await?))
}

async fn run(state: &AppState, sql: &str, confirmed: bool, ctx: &RequestContext) -> Result<ExecuteResponse, ApiError> {
    match state.kernel.execute(sql, confirmed, ctx).await? {
        ExecutionOutcome::AwaitingConfirmation(pending) => Ok(ExecuteResponse::AwaitingConfirmation { pending }),
        ExecutionOutcome::Executed(exec) => {
            let kind = exec.kind;
            let risk = exec.risk;
            let warnings = exec.warnings.clone();
            let preview = exec.preview.clone();
            let result = exec.result().clone();
            let transaction_id = if exec.is_open() {
                Some(state.registry.hold(exec).await)
            } else {
                None
            };
            Ok(ExecuteResponse::Executed {
                transaction_id,
                kind,
                risk,
                warnings,
                preview,
                result,
            })
        }
    }
}

async fn commit(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<ExecutionResult>, ApiError> {
    match state.registry.commit(id).await {
        Some(result) => Ok(Json(result.map_err(|e| ApiError::from_execution(&e))?)),
        None => Err(ApiError(StatusCode::NOT_FOUND, format!("no open transaction {id}"))),
    }
}

async fn rollback(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<ExecutionResult>, ApiError> {
    match state.registry.rollback(id).await {
        Some(result) => Ok(Json(result.map_err(|e| ApiError::from_execution(&e))?)),
        None => Err(ApiError(StatusCode::NOT_FOUND, format!("no open transaction {id}"))),
    }
}

async fn ingest(State(state): State<AppState>, Json(req): Json<IngestRequest>) -> Response {
    let indexer = &state.kernel.indexer;
    if let Err(e) = indexer.rebuild(req.recreate).await {
        return ApiError(StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response();
    }
    let label = req.source.unwrap_or_else(|| "http".into());
    match indexer.ingest(req.kind, &req.records, &label).await {
        Ok(report) => Json(report).into_response(),
        Err(e) => ApiError(StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    }
}
