use std::future::Future;
use std::sync::Arc;

use nlq_context::{RetrievalError, Retriever};
use nlq_guard::{ExecutionError, ExecutionGuard, ExecutionOutcome, PgBackend};
use nlq_policy::{extract_statement, strip_terminator, RuleCatalog};
use nlq_receipts::ReceiptLog;
use nlq_store::Indexer;
use nlq_types::{GeneratedQuery, GenerationContext, RequestContext, RetrievalResult, ValidationStatus};
use thiserror::Error;

pub mod config;
pub mod generator;

pub use config::NlqConfig;
pub use generator::{GenerationError, GenerationSettings, Generator};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Retrieval(#[from] RetrievalError),
    #[error(transparent)]
    Execution(#[from] ExecutionError),
    #[error("deadline exceeded during {stage}")]
    DeadlineExceeded { stage: &'static str },
    #[error("no database configured")]
    NoDatabase,
}

/// Answer to one question.
#[derive(Debug)]
pub enum AskOutcome {
    /// A stored example answered the question; the model was not called.
    Duplicate {
        query: GeneratedQuery,
        example: RetrievalResult,
    },
    Generated {
        query: GeneratedQuery,
        context: GenerationContext,
    },
    /// Generation failed; these examples are offered for manual selection.
    Fallback {
        error: GenerationError,
        rejected: Option<GeneratedQuery>,
        examples: Vec<RetrievalResult>,
    },
}

impl AskOutcome {
    pub fn sql(&self) -> Option<&str> {
        match self {
            AskOutcome::Duplicate { query, .. } | AskOutcome::Generated { query, .. } => {
                query.sanitized_sql.as_deref()
            }
            AskOutcome::Fallback { .. } => None,
        }
    }
}

/// Per-request knobs for [`NlqKernel::ask`].
#[derive(Clone, Debug)]
pub struct AskOptions {
    pub k: usize,
    pub category: Option<String>,
    pub fallback_examples: usize,
}

impl Default for AskOptions {
    fn default() -> Self {
        Self {
            k: 5,
            category: None,
            fallback_examples: 3,
        }
    }
}

/// Wires retrieval, generation and execution together.
pub struct NlqKernel {
    pub indexer: Indexer,
    pub retriever: Retriever,
    pub generator: Generator,
    pub rules: Arc<RuleCatalog>,
    pub guard: Option<ExecutionGuard>,
}

impl NlqKernel {
    pub fn new(
        indexer: Indexer,
        retriever: Retriever,
        generator: Generator,
        rules: Arc<RuleCatalog>,
        guard: Option<ExecutionGuard>,
    ) -> Self {
        Self {
            indexer,
            retriever,
            generator,
            rules,
            guard,
        }
    }

    /// Build every collaborator from configuration. Connects to the
    /// database only when one is configured.
    pub async fn from_config(cfg: &NlqConfig) -> anyhow::Result<Self> {
        let index = cfg.vector_index();
        let embedder = cfg.embedder();
        let indexer = Indexer::new(index.clone(), embedder.clone(), cfg.collection())
            .with_concurrency(cfg.ingest_concurrency);
        let retriever = Retriever::new(index, embedder, cfg.index.collection.clone())
            .with_duplicate_threshold(cfg.retrieval.duplicate_threshold);
        let generator = Generator::new(cfg.llm(), cfg.generation());
        let rules = Arc::new(cfg.rule_catalog()?);
        tracing::info!(rules = rules.version(), collection = %cfg.index.collection, "kernel configured");

        let guard = match &cfg.execution.database_url {
            Some(url) => {
                let backend = PgBackend::connect(url, cfg.pg()).await?;
                let receipts = match &cfg.execution.receipts_file {
                    Some(path) => Some(Arc::new(ReceiptLog::open(path)?)),
                    None => None,
                };
                Some(ExecutionGuard::new(Arc::new(backend), cfg.guard()).with_receipts(receipts))
            }
            None => None,
        };
        Ok(Self::new(indexer, retriever, generator, rules, guard))
    }

    pub fn guard(&self) -> Result<&ExecutionGuard, PipelineError> {
        self.guard.as_ref().ok_or(PipelineError::NoDatabase)
    }

    /// Duplicate probe, then retrieval and guarded generation. Model failures
    /// come back as [`AskOutcome::Fallback`], not as errors.
    pub async fn ask(
        &self,
        question: &str,
        opts: &AskOptions,
        ctx: &RequestContext,
    ) -> Result<AskOutcome, PipelineError> {
        tracing::info!(request = %ctx.request_id, "question received");
        let dup = within(ctx, "duplicate_check", self.retriever.check_duplicate(question)).await??;
        if let (true, Some(example)) = (dup.is_duplicate, dup.top_match) {
            let stored = example.example().map(|ex| ex.sql.clone()).unwrap_or_default();
            match vetted_sql(&stored) {
                Some(sql) => {
                    let query = GeneratedQuery {
                        raw_model_output: stored,
                        sanitized_sql: Some(sql),
                        validation_status: ValidationStatus::Duplicate {
                            example_id: example.document_ref,
                        },
                        risk_hints: vec![format!(
                            "answered from stored example (similarity {:.3})",
                            example.similarity_score
                        )],
                    };
                    return Ok(AskOutcome::Duplicate { query, example });
                }
                None => tracing::warn!(
                    example = %example.document_ref,
                    "stored example is not a single clean statement; generating instead"
                ),
            }
        }

        let context = within(
            ctx,
            "retrieval",
            self.retriever.build_context(question, opts.k, opts.category.as_deref()),
        )
        .await??;
        tracing::info!(
            examples = context.ranked_examples.len(),
            schema_docs = context.referenced_schema_docs.len(),
            "context built"
        );

        match within(ctx, "generation", self.generator.generate(question, &context, &self.rules)).await? {
            Ok(query) => Ok(AskOutcome::Generated { query, context }),
            Err(error) => {
                tracing::warn!(%error, "generation failed; returning examples");
                let rejected = error.rejected_query();
                let mut examples = context.ranked_examples;
                examples.truncate(opts.fallback_examples);
                Ok(AskOutcome::Fallback {
                    error,
                    rejected,
                    examples,
                })
            }
        }
    }

    /// Run a statement through the execution guard within the request deadline.
    pub async fn execute(
        &self,
        sql: &str,
        confirmed: bool,
        ctx: &RequestContext,
    ) -> Result<ExecutionOutcome, PipelineError> {
        let guard = self.guard()?;
        Ok(within(ctx, "execution", guard.execute(sql, confirmed, ctx)).await??)
    }
}

/// Stored SQL usable verbatim: exactly one statement, nothing around it but
/// whitespace and a terminator.
fn vetted_sql(stored: &str) -> Option<String> {
    let stripped = strip_terminator(stored);
    match extract_statement(stored) {
        Some(sql) if sql.trim() == stripped => Some(stripped.to_string()),
        _ => None,
    }
}

/// Bound a stage by the request deadline. Dropping the future on expiry
/// cancels the stage.
pub async fn within<F: Future>(ctx: &RequestContext, stage: &'static str, fut: F) -> Result<F::Output, PipelineError> {
    match ctx.deadline {
        Some(deadline) => tokio::time::timeout_at(tokio::time::Instant::from_std(deadline), fut)
            .await
            .map_err(|_| {
                tracing::warn!(stage, "request deadline exceeded");
                PipelineError::DeadlineExceeded { stage }
            }),
        None => Ok(fut.await),
    }
}
