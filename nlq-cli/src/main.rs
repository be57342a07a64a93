use std::path::PathBuf;

use clap::{Parser, Subcommand};
use nlq_core::{AskOptions, AskOutcome, NlqConfig, NlqKernel};
use nlq_guard::{Execution, ExecutionOutcome};
use nlq_receipts::{verify_log, ReceiptLog};
use nlq_store::SourceKind;
use nlq_types::{RequestContext, StatementKind};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "nlq", about = "Grounded natural-language questions over SQL")]
struct Cli {
    /// YAML configuration; environment variables override it.
    #[arg(long, env = "NLQ_CONFIG", global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load examples, table/view docs or metadata into the knowledge base.
    Ingest {
        kind: SourceKind,
        path: PathBuf,
        /// Drop and recreate the collection first.
        #[arg(long)]
        recreate: bool,
    },
    /// Turn a question into one SQL statement, optionally running it.
    Ask {
        question: String,
        #[arg(long)]
        category: Option<String>,
        #[arg(short, long)]
        k: Option<usize>,
        #[arg(long)]
        execute: bool,
        /// Confirm high-risk and modifying statements.
        #[arg(long)]
        yes: bool,
        /// Commit a modifying statement instead of rolling it back.
        #[arg(long)]
        commit: bool,
    },
    /// Check whether a stored example already answers the question.
    Duplicate { question: String },
    /// Plan and risk for a read; dry-run preview for a modifying statement.
    Explain { sql: String },
    /// Run hand-written SQL through the execution guard.
    Execute {
        sql: String,
        #[arg(long)]
        yes: bool,
        #[arg(long)]
        commit: bool,
    },
    Receipts {
        #[command(subcommand)]
        action: ReceiptCommand,
        #[arg(long)]
        path: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum ReceiptCommand {
    Tail {
        #[arg(long, default_value_t = 10)]
        lines: usize,
    },
    Verify,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = NlqConfig::load(cli.config.as_deref())?;

    match cli.command {
        Command::Receipts { action, path } => {
            let path = path
                .or_else(|| cfg.execution.receipts_file.clone())
                .unwrap_or_else(|| PathBuf::from("./receipts.jsonl"));
            match action {
                ReceiptCommand::Tail { lines } => {
                    for receipt in ReceiptLog::open(&path)?.tail(lines)? {
                        println!("{}", serde_json::to_string(&receipt)?);
                    }
                }
                ReceiptCommand::Verify => {
                    let n = verify_log(&path)?;
                    println!("receipt log ok ({n} receipts)");
                }
            }
        }
        Command::Ingest { kind, path, recreate } => {
            let kernel = NlqKernel::from_config(&cfg).await?;
            kernel.indexer.rebuild(recreate).await?;
            let report = kernel.indexer.ingest_path(kind, &path).await?;
            tracing::info!(%kind, succeeded = report.succeeded, failed = report.failed, "ingest finished");
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Duplicate { question } => {
            let kernel = NlqKernel::from_config(&cfg).await?;
            let check = kernel.retriever.check_duplicate(&question).await?;
            match (check.stored_sql(), &check.top_match) {
                (Some(sql), Some(top)) => println!("duplicate (score {:.3}):\n{sql}", top.similarity_score),
                (None, Some(top)) => println!("not a duplicate (best score {:.3})", top.similarity_score),
                _ => println!("not a duplicate (knowledge base is empty)"),
            }
        }
        Command::Ask {
            question,
            category,
            k,
            execute,
            yes,
            commit,
        } => {
            let kernel = NlqKernel::from_config(&cfg).await?;
            let ctx = RequestContext::with_timeout(cfg.request_timeout());
            let opts = AskOptions {
                k: k.unwrap_or(cfg.retrieval.k),
                category,
                fallback_examples: cfg.retrieval.fallback_examples,
            };
            let outcome = kernel.ask(&question, &opts, &ctx).await?;
            let sql = match &outcome {
                AskOutcome::Duplicate { query, .. } | AskOutcome::Generated { query, .. } => {
                    println!("{}", serde_json::to_string_pretty(query)?);
                    query.sanitized_sql.clone()
                }
                AskOutcome::Fallback { error, examples, .. } => {
                    eprintln!("generation failed: {error}\nhint: {}", error.remediation());
                    for ex in examples.iter().filter_map(|r| r.example()) {
                        println!("-- {}\n{}\n", ex.question, ex.sql);
                    }
                    None
                }
            };
            if let (true, Some(sql)) = (execute, sql) {
                run(&kernel, &sql, yes, commit, &ctx).await?;
            }
        }
        Command::Explain { sql } => {
            let kernel = NlqKernel::from_config(&cfg).await?;
            let guard = kernel.guard()?;
            let validation = guard.validate(&sql);
            if let Some(error) = &validation.error {
                anyhow::bail!("invalid statement: {error}");
            }
            for w in &validation.warnings {
                eprintln!("warning: {w}");
            }
            match guard.classify(&sql) {
                StatementKind::Read => println!("{}", serde_json::to_string_pretty(&guard.plan_check(&sql).await?)?),
                StatementKind::Modifying => println!("{}", serde_json::to_string_pretty(&guard.preview(&sql).await?)?),
            }
        }
        Command::Execute { sql, yes, commit } => {
            let kernel = NlqKernel::from_config(&cfg).await?;
            let ctx = RequestContext::with_timeout(cfg.request_timeout());
            run(&kernel, &sql, yes, commit, &ctx).await?;
        }
    }

    Ok(())
}

async fn run(kernel: &NlqKernel, sql: &str, yes: bool, commit: bool, ctx: &RequestContext) -> anyhow::Result<()> {
    match kernel.execute(sql, yes, ctx).await? {
        ExecutionOutcome::AwaitingConfirmation(pending) => {
            println!("{}", serde_json::to_string_pretty(&pending)?);
            eprintln!("{}; re-run with --yes to proceed", pending.reason);
        }
        ExecutionOutcome::Executed(exec) => finish(exec, commit).await?,
    }
    Ok(())
}

async fn finish(mut exec: Execution, commit: bool) -> anyhow::Result<()> {
    for w in &exec.warnings {
        eprintln!("warning: {w}");
    }
    if exec.is_open() {
        if commit {
            exec.commit().await?;
        } else {
            exec.rollback().await?;
            eprintln!("rolled back; re-run with --commit to keep the changes");
        }
    }
    println!("{}", serde_json::to_string_pretty(exec.result())?);
    Ok(())
}
