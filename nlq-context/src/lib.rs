use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use futures_util::future::try_join_all;
use nlq_embed::{EmbedError, Embedder};
use nlq_store::{Filter, IndexError, VectorIndex};
use nlq_types::{DocKind, GenerationContext, KnowledgeDocument, RetrievalResult, SchemaDoc};
use thiserror::Error;

/// Score at or above which a stored example answers the question as-is.
pub const DEFAULT_DUPLICATE_THRESHOLD: f32 = 0.85;

/// Upper bound on payload matches fetched per referenced object name.
const SCHEMA_LOOKUP_LIMIT: usize = 4;

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("embedding service unavailable: {0}")]
    Embedding(#[from] EmbedError),
    #[error("vector index unavailable: {0}")]
    IndexUnavailable(#[source] IndexError),
}

/// Result of a duplicate probe against the example collection.
#[derive(Clone, Debug)]
pub struct DuplicateCheck {
    pub top_match: Option<RetrievalResult>,
    pub is_duplicate: bool,
}

impl DuplicateCheck {
    /// Stored SQL of the matching example, when the question is a duplicate.
    pub fn stored_sql(&self) -> Option<&str> {
        if !self.is_duplicate {
            return None;
        }
        self.top_match
            .as_ref()
            .and_then(|m| m.example())
            .map(|ex| ex.sql.as_str())
    }
}

/// Ranks stored examples for a question and expands the schema docs they touch.
pub struct Retriever {
    index: Arc<dyn VectorIndex>,
    embedder: Arc<dyn Embedder>,
    collection: String,
    duplicate_threshold: f32,
}

impl Retriever {
    pub fn new(index: Arc<dyn VectorIndex>, embedder: Arc<dyn Embedder>, collection: impl Into<String>) -> Self {
        Self {
            index,
            embedder,
            collection: collection.into(),
            duplicate_threshold: DEFAULT_DUPLICATE_THRESHOLD,
        }
    }

    pub fn with_duplicate_threshold(mut self, threshold: f32) -> Self {
        self.duplicate_threshold = threshold;
        self
    }

    pub fn duplicate_threshold(&self) -> f32 {
        self.duplicate_threshold
    }

    /// Top-`k` examples by similarity, score descending then id ascending.
    /// A missing collection is an empty knowledge base, not an outage.
    pub async fn retrieve_examples(
        &self,
        question: &str,
        k: usize,
        category: Option<&str>,
    ) -> Result<Vec<RetrievalResult>, RetrievalError> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let vector = self.embedder.embed(question).await?;
        let mut filter = Filter::kind(DocKind::QaExample);
        if let Some(category) = category {
            filter = filter.field("category", category);
        }
        let mut hits = match self.index.search(&self.collection, &vector, &filter, k).await {
            Ok(hits) => hits,
            Err(IndexError::MissingCollection(name)) => {
                tracing::warn!(collection = %name, "knowledge collection missing; retrieving nothing");
                return Ok(Vec::new());
            }
            Err(e) => return Err(RetrievalError::IndexUnavailable(e)),
        };
        hits.sort_by(nlq_types::rank_order);
        hits.truncate(k);
        tracing::debug!(hits = hits.len(), top = ?hits.first().map(|h| h.similarity_score), "retrieved examples");
        Ok(hits)
    }

    pub async fn check_duplicate(&self, question: &str) -> Result<DuplicateCheck, RetrievalError> {
        self.check_duplicate_with(question, self.duplicate_threshold).await
    }

    /// Duplicate iff an example asks the same question (after whitespace and
    /// case folding) or the best example scores at least `threshold`.
    pub async fn check_duplicate_with(&self, question: &str, threshold: f32) -> Result<DuplicateCheck, RetrievalError> {
        if let Some(exact) = self.stored_example(question).await? {
            tracing::info!(id = %exact.document_ref, "question matches a stored example verbatim");
            return Ok(DuplicateCheck {
                top_match: Some(exact),
                is_duplicate: true,
            });
        }
        let top_match = self.retrieve_examples(question, 1, None).await?.into_iter().next();
        let is_duplicate = top_match
            .as_ref()
            .map(|m| m.similarity_score >= threshold)
            .unwrap_or(false);
        if is_duplicate {
            tracing::info!(score = ?top_match.as_ref().map(|m| m.similarity_score), "question matches a stored example");
        }
        Ok(DuplicateCheck { top_match, is_duplicate })
    }

    /// The example stored under this question's id, scored 1.0.
    async fn stored_example(&self, question: &str) -> Result<Option<RetrievalResult>, RetrievalError> {
        let id = KnowledgeDocument::example_id(question);
        let points = match self.index.fetch(&self.collection, &[id]).await {
            Ok(points) => points,
            Err(IndexError::MissingCollection(_)) => return Ok(None),
            Err(e) => return Err(RetrievalError::IndexUnavailable(e)),
        };
        Ok(points
            .into_iter()
            .find(|p| p.id == id && p.document.as_example().is_some())
            .map(|p| RetrievalResult {
                document_ref: p.id,
                similarity_score: 1.0,
                payload_snapshot: p.document,
                source: p.source,
            }))
    }

    /// Table and view docs for every object named after FROM/JOIN/INTO in the
    /// examples' SQL. Objects without a doc are omitted.
    pub async fn expand_schema_context(
        &self,
        examples: &[RetrievalResult],
    ) -> Result<BTreeMap<String, SchemaDoc>, RetrievalError> {
        let names: BTreeSet<String> = examples
            .iter()
            .filter_map(|r| r.example())
            .flat_map(|ex| nlq_policy::referenced_tables(&ex.sql))
            .collect();
        if names.is_empty() {
            return Ok(BTreeMap::new());
        }

        let lookups = names.iter().map(|name| self.lookup_schema_doc(name));
        let found = match try_join_all(lookups).await {
            Ok(found) => found,
            Err(IndexError::MissingCollection(name)) => {
                tracing::warn!(collection = %name, "knowledge collection missing; no schema docs");
                return Ok(BTreeMap::new());
            }
            Err(e) => return Err(RetrievalError::IndexUnavailable(e)),
        };

        let mut docs = BTreeMap::new();
        for (name, doc) in names.into_iter().zip(found) {
            match doc {
                Some(doc) => {
                    docs.insert(name, doc);
                }
                None => tracing::debug!(object = %name, "no schema doc for referenced object"),
            }
        }
        Ok(docs)
    }

    async fn lookup_schema_doc(&self, name: &str) -> Result<Option<SchemaDoc>, IndexError> {
        let mut spellings = vec![name.to_string()];
        let lower = name.to_lowercase();
        if lower != name {
            spellings.push(lower);
        }
        for spelling in spellings {
            let points = self
                .index
                .scroll(&self.collection, &Filter::new().field("name", spelling), SCHEMA_LOOKUP_LIMIT)
                .await?;
            if let Some(doc) = points.iter().find_map(|p| p.document.as_schema_doc()) {
                return Ok(Some(doc));
            }
        }
        Ok(None)
    }

    /// Ranked examples plus their schema docs. Zero examples yields a
    /// schema-less context.
    pub async fn build_context(
        &self,
        question: &str,
        k: usize,
        category: Option<&str>,
    ) -> Result<GenerationContext, RetrievalError> {
        let ranked_examples = self.retrieve_examples(question, k, category).await?;
        if ranked_examples.is_empty() {
            return Ok(GenerationContext::schema_less(question));
        }
        let referenced_schema_docs = self.expand_schema_context(&ranked_examples).await?;
        Ok(GenerationContext {
            question: question.to_string(),
            ranked_examples,
            referenced_schema_docs,
        })
    }
}
