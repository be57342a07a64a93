//! Guarded generation: one model call, then statement extraction and rule
//! review. Never emits more than one statement.

use std::fmt::Write as _;
use std::sync::Arc;

use nlq_infer::{CompletionRequest, LlmEngine, LlmError, LlmErrorKind};
use nlq_policy::{classify, extract_statement, referenced_tables, Review, RuleCatalog};
use nlq_types::{GeneratedQuery, GenerationContext, StatementKind, ValidationStatus};
use serde::Serialize;
use thiserror::Error;

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum GenerationError {
    #[error("model rejected credentials: {0}")]
    Auth(String),
    #[error("model quota exhausted: {0}")]
    Quota(String),
    #[error("model rate limited: {0}")]
    RateLimited(String),
    #[error("model temporarily unavailable: {0}")]
    Transient(String),
    #[error("model call failed: {0}")]
    Model(String),
    #[error("model returned no output")]
    EmptyOutput,
    #[error("model output contains no SQL statement")]
    NotSql { raw: String },
    #[error("statement rejected by rule '{rule}': {reason}")]
    ForbiddenPattern { rule: String, reason: String, raw: String },
}

impl GenerationError {
    /// What the caller can do about it.
    pub fn remediation(&self) -> &'static str {
        match self {
            GenerationError::Auth(_) => "check LLM_API_KEY and the model endpoint",
            GenerationError::Quota(_) => "top up the provider account or switch models",
            GenerationError::RateLimited(_) => "retry after a short pause",
            GenerationError::Transient(_) => "retry; the model service is recovering",
            GenerationError::Model(_) => "inspect the model service logs",
            GenerationError::EmptyOutput | GenerationError::NotSql { .. } => {
                "rephrase the question or pick one of the listed examples"
            }
            GenerationError::ForbiddenPattern { .. } => {
                "rephrase the question to name a known report, or pick one of the listed examples"
            }
        }
    }

    /// The rejected model output as an `Invalid` query, when there was one.
    pub fn rejected_query(&self) -> Option<GeneratedQuery> {
        let raw = match self {
            GenerationError::NotSql { raw } | GenerationError::ForbiddenPattern { raw, .. } => raw,
            _ => return None,
        };
        Some(GeneratedQuery {
            raw_model_output: raw.clone(),
            sanitized_sql: None,
            validation_status: ValidationStatus::Invalid {
                reason: self.to_string(),
            },
            risk_hints: Vec::new(),
        })
    }
}

impl From<LlmError> for GenerationError {
    fn from(e: LlmError) -> Self {
        match e.kind {
            LlmErrorKind::Auth => GenerationError::Auth(e.message),
            LlmErrorKind::Quota => GenerationError::Quota(e.message),
            LlmErrorKind::RateLimit => GenerationError::RateLimited(e.message),
            LlmErrorKind::Transient => GenerationError::Transient(e.message),
            LlmErrorKind::Other => GenerationError::Model(e.message),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct GenerationSettings {
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            max_tokens: 512,
        }
    }
}

pub struct Generator {
    llm: Arc<dyn LlmEngine>,
    settings: GenerationSettings,
}

#[derive(Serialize)]
struct ExampleLine<'a> {
    question: &'a str,
    sql: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    context: Option<&'a str>,
}

impl Generator {
    pub fn new(llm: Arc<dyn LlmEngine>, settings: GenerationSettings) -> Self {
        Self { llm, settings }
    }

    pub fn temperature(&self) -> f32 {
        if self.settings.temperature.is_nan() {
            return 0.0;
        }
        self.settings.temperature.clamp(0.0, 1.0)
    }

    /// Rule text, then serialized examples and schema docs, then the question.
    pub fn build_request(&self, question: &str, context: &GenerationContext, rules: &RuleCatalog) -> CompletionRequest {
        let mut user = String::new();
        if !context.ranked_examples.is_empty() {
            user.push_str("Examples (one JSON object per line):\n");
            for ex in context.ranked_examples.iter().filter_map(|r| r.example()) {
                let line = ExampleLine {
                    question: &ex.question,
                    sql: &ex.sql,
                    context: ex.context.as_deref(),
                };
                if let Ok(json) = serde_json::to_string(&line) {
                    let _ = writeln!(user, "{json}");
                }
            }
            user.push('\n');
        }
        if !context.referenced_schema_docs.is_empty() {
            user.push_str("Schema documentation:\n");
            for doc in context.referenced_schema_docs.values() {
                if let Ok(json) = serde_json::to_string(doc) {
                    let _ = writeln!(user, "{json}");
                }
            }
            user.push('\n');
        }
        let _ = write!(user, "Question: {question}\nSQL:");
        CompletionRequest {
            system: rules.render_instructions(),
            user,
            temperature: self.temperature(),
            max_tokens: self.settings.max_tokens,
        }
    }

    pub async fn generate(
        &self,
        question: &str,
        context: &GenerationContext,
        rules: &RuleCatalog,
    ) -> Result<GeneratedQuery, GenerationError> {
        let request = self.build_request(question, context, rules);
        tracing::debug!(prompt_chars = request.user.len(), temperature = request.temperature, "calling model");
        let raw = self.llm.complete(request).await?;
        if raw.trim().is_empty() {
            return Err(GenerationError::EmptyOutput);
        }
        let Some(statement) = extract_statement(&raw) else {
            tracing::warn!("model output contained no recognizable statement");
            return Err(GenerationError::NotSql { raw });
        };

        let mut risk_hints = Vec::new();
        let (sql, validation_status) = match rules.review(question, &statement) {
            Review::Clean => (statement, ValidationStatus::Valid),
            Review::Repaired { rule, intent, sql } => {
                risk_hints.push(format!("model output replaced with the '{intent}' template ({rule})"));
                (sql, ValidationStatus::Repaired { rule, intent })
            }
            Review::Rejected { rule, reason } => {
                tracing::warn!(%rule, "generated statement rejected");
                return Err(GenerationError::ForbiddenPattern { rule, reason, raw });
            }
        };

        if classify(&sql) == StatementKind::Modifying {
            risk_hints.push("modifying statement; preview and confirmation required before commit".into());
        }
        if !context.referenced_schema_docs.is_empty() {
            for table in referenced_tables(&sql) {
                let known = context.referenced_schema_docs.contains_key(&table)
                    || context
                        .ranked_examples
                        .iter()
                        .filter_map(|r| r.example())
                        .any(|ex| referenced_tables(&ex.sql).contains(&table));
                if !known {
                    risk_hints.push(format!("{table} is not documented in the knowledge base"));
                }
            }
        }

        tracing::info!(status = ?validation_status, hints = risk_hints.len(), "statement generated");
        Ok(GeneratedQuery {
            raw_model_output: raw,
            sanitized_sql: Some(sql),
            validation_status,
            risk_hints,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nlq_infer::ScriptedLlmEngine;

    const LOSS_SQL: &str = "SELECT * FROM V_UNPROFITABLE_CUSTOMERS WHERE PERIOD = '2025-10' AND ALERT_TYPE = 'LOSS' ORDER BY PROFIT_RUB ASC";

    fn generator(engine: &Arc<ScriptedLlmEngine>, temperature: f32) -> Generator {
        Generator::new(
            engine.clone(),
            GenerationSettings {
                temperature,
                max_tokens: 256,
            },
        )
    }

    #[tokio::test]
    async fn raw_cost_join_is_repaired_from_template() {
        let engine = Arc::new(ScriptedLlmEngine::reply(
            "Вот запрос:\n```sql\nSELECT c.CLIENT_NAME, SUM(r.AMOUNT_RUB) - SUM(a.COST_RUB) AS PROFIT\nFROM CLIENTS c\nJOIN COST_ALLOCATION_RAW a ON a.CLIENT_ID = c.CLIENT_ID\nJOIN REVENUE r ON r.CLIENT_ID = c.CLIENT_ID\nGROUP BY c.CLIENT_NAME\nHAVING SUM(r.AMOUNT_RUB) < SUM(a.COST_RUB);\n```\nЗапрос вернёт убыточных клиентов.",
        ));
        let rules = RuleCatalog::builtin().unwrap();
        let question = "Найди убыточных клиентов за октябрь";
        let q = generator(&engine, 0.0)
            .generate(question, &GenerationContext::schema_less(question), &rules)
            .await
            .unwrap();
        assert_eq!(q.sanitized_sql.as_deref(), Some(LOSS_SQL));
        assert_eq!(
            q.validation_status,
            ValidationStatus::Repaired {
                rule: "cost_allocation_raw_join".into(),
                intent: "unprofitable_customers".into()
            }
        );
        assert!(q.raw_model_output.contains("COST_ALLOCATION_RAW"));
    }

    #[tokio::test]
    async fn forbidden_join_without_intent_fails_closed() {
        let engine = Arc::new(ScriptedLlmEngine::reply(
            "SELECT * FROM CLIENTS c JOIN BILLING_DETAIL b ON b.CLIENT_ID = c.CLIENT_ID",
        ));
        let rules = RuleCatalog::builtin().unwrap();
        let question = "Покажи счета клиентов";
        let err = generator(&engine, 0.0)
            .generate(question, &GenerationContext::schema_less(question), &rules)
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::ForbiddenPattern { ref rule, .. } if rule == "billing_detail_join"));
        let rejected = err.rejected_query().unwrap();
        assert!(rejected.sanitized_sql.is_none());
        assert!(!rejected.is_usable());
    }

    #[tokio::test]
    async fn only_first_statement_survives() {
        let engine = Arc::new(ScriptedLlmEngine::reply(
            "SELECT * FROM TARIFF_EL;\nSELECT * FROM TARIFF_GAS;\nAlternatively you could filter by region.",
        ));
        let rules = RuleCatalog::builtin().unwrap();
        let q = generator(&engine, 0.0)
            .generate("tariffs", &GenerationContext::schema_less("tariffs"), &rules)
            .await
            .unwrap();
        assert_eq!(q.sanitized_sql.as_deref(), Some("SELECT * FROM TARIFF_EL"));
        assert_eq!(q.validation_status, ValidationStatus::Valid);
    }

    #[tokio::test]
    async fn empty_and_prose_outputs() {
        let rules = RuleCatalog::builtin().unwrap();
        let ctx = GenerationContext::schema_less("q");

        let engine = Arc::new(ScriptedLlmEngine::reply("  \n"));
        let err = generator(&engine, 0.0).generate("q", &ctx, &rules).await.unwrap_err();
        assert_eq!(err, GenerationError::EmptyOutput);

        let engine = Arc::new(ScriptedLlmEngine::reply("I cannot answer that without more detail."));
        let err = generator(&engine, 0.0).generate("q", &ctx, &rules).await.unwrap_err();
        assert!(matches!(err, GenerationError::NotSql { .. }));
    }

    #[tokio::test]
    async fn model_failures_keep_their_kind() {
        let rules = RuleCatalog::builtin().unwrap();
        let ctx = GenerationContext::schema_less("q");
        let engine = Arc::new(ScriptedLlmEngine::new(vec![
            Err(LlmError::from_status(401, "invalid api key")),
            Err(LlmError::new(LlmErrorKind::Quota, "insufficient_quota")),
        ]));
        let g = generator(&engine, 0.0);

        let err = g.generate("q", &ctx, &rules).await.unwrap_err();
        assert!(matches!(err, GenerationError::Auth(_)));
        assert!(err.remediation().contains("LLM_API_KEY"));
        assert!(matches!(g.generate("q", &ctx, &rules).await.unwrap_err(), GenerationError::Quota(_)));
    }

    #[tokio::test]
    async fn request_carries_rules_and_clamped_temperature() {
        let engine = Arc::new(ScriptedLlmEngine::reply("DELETE FROM TEMP_LOAD WHERE PERIOD = '2025-09'"));
        let rules = RuleCatalog::builtin().unwrap();
        let q = generator(&engine, 3.5)
            .generate("очисти временную загрузку", &GenerationContext::schema_less("x"), &rules)
            .await
            .unwrap();
        assert!(q.risk_hints.iter().any(|h| h.contains("confirmation")));

        let seen = engine.requests();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].temperature, 1.0);
        assert_eq!(seen[0].max_tokens, 256);
        assert!(seen[0].system.contains("2025.10-1"));
        assert!(seen[0].user.ends_with("Question: очисти временную загрузку\nSQL:"));
    }
}
