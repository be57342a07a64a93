use async_trait::async_trait;
use nlq_types::{DocKind, IndexCollection, IndexedDocument, KnowledgeDocument, RetrievalResult, KIND_FIELD};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

pub mod qdrant;
pub use qdrant::QdrantIndex;

pub mod memory;
pub use memory::InMemoryIndex;

pub mod ingest;
pub use ingest::{IngestReport, IngestionError, Indexer, SourceKind};

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("vector index unavailable: {0}")]
    Unavailable(String),
    #[error("vector index returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("collection '{0}' does not exist")]
    MissingCollection(String),
    #[error("collection dimension mismatch; expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("malformed index response: {0}")]
    Malformed(String),
}

/// Exact-match condition on a top-level payload field.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FieldMatch {
    pub key: String,
    #[serde(rename = "match")]
    pub matches: MatchValue,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MatchValue {
    pub value: String,
}

/// Conjunction of field matches (Qdrant `must` semantics).
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Filter {
    pub must: Vec<FieldMatch>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kind(kind: DocKind) -> Self {
        Self::new().field(KIND_FIELD, kind.as_str())
    }

    pub fn field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.must.push(FieldMatch {
            key: key.into(),
            matches: MatchValue { value: value.into() },
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.must.is_empty()
    }

    /// Evaluate the filter against a payload object.
    pub fn matches(&self, payload: &serde_json::Value) -> bool {
        self.must.iter().all(|cond| match payload.get(&cond.key) {
            Some(serde_json::Value::String(s)) => *s == cond.matches.value,
            Some(serde_json::Value::Number(n)) => n.to_string() == cond.matches.value,
            Some(serde_json::Value::Bool(b)) => b.to_string() == cond.matches.value,
            _ => false,
        })
    }
}

/// A stored point returned by `scroll` (no score).
#[derive(Clone, Debug, PartialEq)]
pub struct StoredPoint {
    pub id: Uuid,
    pub document: KnowledgeDocument,
    pub source: String,
}

/// Vector index seam: a collection of embedded, typed documents.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Create the collection if missing; never drops data.
    async fn ensure_collection(&self, collection: &IndexCollection) -> Result<(), IndexError>;

    /// Destructive. Succeeds if the collection is already absent.
    async fn drop_collection(&self, name: &str) -> Result<(), IndexError>;

    /// Insert or replace points by id. Visible to `search` once this returns.
    async fn upsert(&self, collection: &str, docs: Vec<IndexedDocument>) -> Result<(), IndexError>;

    /// Top-k by cosine similarity, score descending then id ascending.
    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        filter: &Filter,
        k: usize,
    ) -> Result<Vec<RetrievalResult>, IndexError>;

    /// Up to `k` points matching the filter, in no particular rank.
    async fn scroll(&self, collection: &str, filter: &Filter, k: usize) -> Result<Vec<StoredPoint>, IndexError>;

    /// Points stored under the given ids. Unknown ids are skipped.
    async fn fetch(&self, collection: &str, ids: &[Uuid]) -> Result<Vec<StoredPoint>, IndexError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_serializes_like_qdrant() {
        let f = Filter::kind(DocKind::QaExample).field("category", "finance");
        let json = serde_json::to_value(&f).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"must": [
                {"key": "kind", "match": {"value": "qa_example"}},
                {"key": "category", "match": {"value": "finance"}}
            ]})
        );
    }

    #[test]
    fn filter_matches_payload_fields() {
        let payload = serde_json::json!({"kind": "table_doc", "name": "TARIFF_EL", "complexity": 3});
        assert!(Filter::kind(DocKind::TableDoc).field("name", "TARIFF_EL").matches(&payload));
        assert!(Filter::new().field("complexity", "3").matches(&payload));
        assert!(!Filter::kind(DocKind::ViewDoc).matches(&payload));
        assert!(Filter::new().matches(&payload));
    }
}
