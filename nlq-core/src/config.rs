use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use nlq_embed::{Embedder, HashEmbedder, HttpEmbedder};
use nlq_guard::{GuardConfig, PgSettings};
use nlq_infer::{HttpChatEngine, LlmEngine};
use nlq_policy::{RiskThresholds, RuleCatalog, RuleSet};
use nlq_store::{QdrantIndex, VectorIndex};
use nlq_types::IndexCollection;
use serde::{Deserialize, Serialize};

use crate::generator::GenerationSettings;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexSettings {
    pub url: String,
    pub collection: String,
    pub api_key: Option<String>,
}

impl Default for IndexSettings {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:6333".into(),
            collection: "nlq_knowledge".into(),
            api_key: None,
        }
    }
}

/// Without `url` the offline lexical embedder is used.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbedSettings {
    pub url: Option<String>,
    pub model: String,
    pub dim: usize,
    pub api_key: Option<String>,
}

impl Default for EmbedSettings {
    fn default() -> Self {
        Self {
            url: None,
            model: "text-embedding-3-small".into(),
            dim: 1024,
            api_key: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSettings {
    pub url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub seed: Option<u64>,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8000".into(),
            model: "local-sql".into(),
            api_key: None,
            temperature: 0.0,
            max_tokens: 512,
            seed: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalSettings {
    pub k: usize,
    pub duplicate_threshold: f32,
    /// Examples returned for manual selection when generation fails.
    pub fallback_examples: usize,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            k: 5,
            duplicate_threshold: nlq_context::DEFAULT_DUPLICATE_THRESHOLD,
            fallback_examples: 3,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionSettings {
    pub database_url: Option<String>,
    pub idle_txn_timeout_secs: u64,
    pub statement_timeout_secs: u64,
    pub max_rows: usize,
    pub max_connections: u32,
    pub receipts_file: Option<PathBuf>,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            database_url: None,
            idle_txn_timeout_secs: 60,
            statement_timeout_secs: 30,
            max_rows: 1000,
            max_connections: 8,
            receipts_file: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NlqConfig {
    pub index: IndexSettings,
    pub embed: EmbedSettings,
    pub llm: LlmSettings,
    pub retrieval: RetrievalSettings,
    pub risk: RiskThresholds,
    pub execution: ExecutionSettings,
    pub request_timeout_secs: u64,
    pub ingest_concurrency: usize,
    pub rules_path: Option<PathBuf>,
}

impl Default for NlqConfig {
    fn default() -> Self {
        Self {
            index: IndexSettings::default(),
            embed: EmbedSettings::default(),
            llm: LlmSettings::default(),
            retrieval: RetrievalSettings::default(),
            risk: RiskThresholds::default(),
            execution: ExecutionSettings::default(),
            request_timeout_secs: 60,
            ingest_concurrency: 4,
            rules_path: None,
        }
    }
}

impl NlqConfig {
    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let text = fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&text)?)
    }

    /// File (if any), then environment overrides.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut cfg = match path {
            Some(path) => Self::from_path(path)?,
            None => Self::default(),
        };
        cfg.apply_env(|key| std::env::var(key).ok());
        Ok(cfg)
    }

    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("QDRANT_HTTP_URL") {
            self.index.url = v;
        }
        if let Some(v) = var("NLQ_COLLECTION") {
            self.index.collection = v;
        }
        if let Some(v) = var("QDRANT_API_KEY") {
            self.index.api_key = Some(v);
        }
        if let Some(dim) = var("EMBED_DIM").and_then(|v| v.parse().ok()) {
            self.embed.dim = dim;
        }
        if let Some(v) = var("EMBED_URL") {
            self.embed.url = Some(v);
        }
        if let Some(v) = var("EMBED_MODEL") {
            self.embed.model = v;
        }
        if let Some(v) = var("LLM_URL") {
            self.llm.url = v;
        }
        if let Some(v) = var("LLM_MODEL") {
            self.llm.model = v;
        }
        if let Some(v) = var("LLM_API_KEY") {
            self.embed.api_key.get_or_insert_with(|| v.clone());
            self.llm.api_key = Some(v);
        }
        if let Some(v) = var("DATABASE_URL") {
            self.execution.database_url = Some(v);
        }
        if let Some(v) = var("NLQ_RECEIPTS_FILE") {
            self.execution.receipts_file = Some(PathBuf::from(v));
        }
        if let Some(v) = var("NLQ_RULES") {
            self.rules_path = Some(PathBuf::from(v));
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn collection(&self) -> IndexCollection {
        IndexCollection::cosine(self.index.collection.clone(), self.embed.dim)
    }

    pub fn vector_index(&self) -> Arc<dyn VectorIndex> {
        Arc::new(QdrantIndex::new(self.index.url.clone()).with_api_key(self.index.api_key.clone()))
    }

    pub fn embedder(&self) -> Arc<dyn Embedder> {
        match &self.embed.url {
            Some(url) => Arc::new(
                HttpEmbedder::new(url.clone(), self.embed.model.clone(), self.embed.dim)
                    .with_api_key(self.embed.api_key.clone()),
            ),
            None => Arc::new(HashEmbedder::new(self.embed.dim)),
        }
    }

    pub fn llm(&self) -> Arc<dyn LlmEngine> {
        Arc::new(
            HttpChatEngine::new(self.llm.url.clone(), self.llm.model.clone())
                .with_api_key(self.llm.api_key.clone())
                .with_seed(self.llm.seed),
        )
    }

    pub fn generation(&self) -> GenerationSettings {
        GenerationSettings {
            temperature: self.llm.temperature,
            max_tokens: self.llm.max_tokens,
        }
    }

    pub fn rule_catalog(&self) -> anyhow::Result<RuleCatalog> {
        let rules = match &self.rules_path {
            Some(path) => RuleSet::from_path(path)?,
            None => RuleSet::builtin()?,
        };
        Ok(rules.compile()?)
    }

    pub fn guard(&self) -> GuardConfig {
        GuardConfig {
            thresholds: self.risk.clone(),
            idle_txn_timeout: Duration::from_secs(self.execution.idle_txn_timeout_secs),
            max_rows: self.execution.max_rows,
        }
    }

    pub fn pg(&self) -> PgSettings {
        PgSettings {
            max_connections: self.execution.max_connections,
            statement_timeout_secs: self.execution.statement_timeout_secs,
            idle_txn_timeout_secs: self.execution.idle_txn_timeout_secs,
            ..PgSettings::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn partial_yaml_keeps_defaults() {
        let cfg: NlqConfig = serde_yaml::from_str(
            "retrieval:\n  k: 8\nrisk:\n  critical: 5000000\nexecution:\n  idle_txn_timeout_secs: 30\n",
        )
        .unwrap();
        assert_eq!(cfg.retrieval.k, 8);
        assert_eq!(cfg.retrieval.duplicate_threshold, 0.85);
        assert_eq!(cfg.risk.critical, 5_000_000.0);
        assert_eq!(cfg.risk.high, 1_000_000.0);
        assert_eq!(cfg.guard().idle_txn_timeout, Duration::from_secs(30));
        assert_eq!(cfg.ingest_concurrency, 4);
    }

    #[test]
    fn environment_overrides_file() {
        let env: HashMap<&str, &str> = [
            ("QDRANT_HTTP_URL", "http://qdrant:6333"),
            ("EMBED_DIM", "384"),
            ("LLM_API_KEY", "sk-test"),
            ("DATABASE_URL", "postgres://nlq@db/warehouse"),
            ("NLQ_RULES", "/etc/nlq/rules.yaml"),
        ]
        .into_iter()
        .collect();
        let mut cfg = NlqConfig::default();
        cfg.apply_env(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.index.url, "http://qdrant:6333");
        assert_eq!(cfg.collection().vector_dimension, 384);
        assert_eq!(cfg.llm.api_key.as_deref(), Some("sk-test"));
        assert_eq!(cfg.execution.database_url.as_deref(), Some("postgres://nlq@db/warehouse"));
        assert_eq!(cfg.rules_path, Some(PathBuf::from("/etc/nlq/rules.yaml")));
    }

    #[test]
    fn loads_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nlq.yaml");
        fs::write(&path, "index:\n  collection: finance_kb\nllm:\n  temperature: 0.2\nrules_path: rules.yaml\n").unwrap();
        let cfg = NlqConfig::from_path(&path).unwrap();
        assert_eq!(cfg.index.collection, "finance_kb");
        assert_eq!(cfg.generation().temperature, 0.2);
        assert_eq!(cfg.rules_path, Some(PathBuf::from("rules.yaml")));
        assert!(cfg.rule_catalog().is_err());
    }

    #[test]
    fn builtin_rules_when_no_path() {
        let cfg = NlqConfig::default();
        assert_eq!(cfg.rule_catalog().unwrap().version(), "2025.10-1");
    }
}
