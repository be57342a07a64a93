use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use nlq_types::{IndexCollection, IndexedDocument, RetrievalResult};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{Filter, IndexError, StoredPoint, VectorIndex};

/// In-memory vector index with exact (brute-force) cosine search.
///
/// Used for offline runs and tests. Not durable.
pub struct InMemoryIndex {
    collections: Mutex<HashMap<String, MemCollection>>,
}

struct MemCollection {
    dim: usize,
    points: BTreeMap<Uuid, IndexedDocument>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self {
            collections: Mutex::new(HashMap::new()),
        }
    }

    /// Number of points in a collection (test/debug hook).
    pub async fn len(&self, collection: &str) -> usize {
        let inner = self.collections.lock().await;
        inner.get(collection).map(|c| c.points.len()).unwrap_or(0)
    }
}

impl Default for InMemoryIndex {
    fn default() -> Self {
        Self::new()
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

#[async_trait]
impl VectorIndex for InMemoryIndex {
    async fn ensure_collection(&self, collection: &IndexCollection) -> Result<(), IndexError> {
        let mut inner = self.collections.lock().await;
        let entry = inner
            .entry(collection.name.clone())
            .or_insert_with(|| MemCollection {
                dim: collection.vector_dimension,
                points: BTreeMap::new(),
            });
        if entry.dim != collection.vector_dimension {
            return Err(IndexError::DimensionMismatch {
                expected: collection.vector_dimension,
                actual: entry.dim,
            });
        }
        Ok(())
    }

    async fn drop_collection(&self, name: &str) -> Result<(), IndexError> {
        self.collections.lock().await.remove(name);
        Ok(())
    }

    async fn upsert(&self, collection: &str, docs: Vec<IndexedDocument>) -> Result<(), IndexError> {
        let mut inner = self.collections.lock().await;
        let coll = inner
            .get_mut(collection)
            .ok_or_else(|| IndexError::MissingCollection(collection.to_string()))?;
        if let Some(bad) = docs.iter().find(|d| d.embedding.len() != coll.dim) {
            return Err(IndexError::DimensionMismatch {
                expected: coll.dim,
                actual: bad.embedding.len(),
            });
        }
        for doc in docs {
            coll.points.insert(doc.id, doc);
        }
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        filter: &Filter,
        k: usize,
    ) -> Result<Vec<RetrievalResult>, IndexError> {
        let inner = self.collections.lock().await;
        let coll = inner
            .get(collection)
            .ok_or_else(|| IndexError::MissingCollection(collection.to_string()))?;
        let mut hits: Vec<RetrievalResult> = coll
            .points
            .values()
            .filter(|doc| filter.matches(&doc.payload()))
            .map(|doc| RetrievalResult {
                document_ref: doc.id,
                similarity_score: cosine_similarity(vector, &doc.embedding),
                payload_snapshot: doc.document.clone(),
                source: doc.source.clone(),
            })
            .collect();
        hits.sort_by(nlq_types::rank_order);
        hits.truncate(k);
        Ok(hits)
    }

    async fn scroll(&self, collection: &str, filter: &Filter, k: usize) -> Result<Vec<StoredPoint>, IndexError> {
        let inner = self.collections.lock().await;
        let coll = inner
            .get(collection)
            .ok_or_else(|| IndexError::MissingCollection(collection.to_string()))?;
        Ok(coll
            .points
            .values()
            .filter(|doc| filter.matches(&doc.payload()))
            .take(k)
            .map(|doc| StoredPoint {
                id: doc.id,
                document: doc.document.clone(),
                source: doc.source.clone(),
            })
            .collect())
    }

    async fn fetch(&self, collection: &str, ids: &[Uuid]) -> Result<Vec<StoredPoint>, IndexError> {
        let inner = self.collections.lock().await;
        let coll = inner
            .get(collection)
            .ok_or_else(|| IndexError::MissingCollection(collection.to_string()))?;
        Ok(ids
            .iter()
            .filter_map(|id| coll.points.get(id))
            .map(|doc| StoredPoint {
                id: doc.id,
                document: doc.document.clone(),
                source: doc.source.clone(),
            })
            .collect())
    }
}
