use async_trait::async_trait;
use nlq_types::{document_from_payload, IndexCollection, IndexedDocument, RetrievalResult};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Filter, IndexError, StoredPoint, VectorIndex};

/// Qdrant REST-backed vector index.
pub struct QdrantIndex {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl QdrantIndex {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: None,
        }
    }

    pub fn with_api_key(mut self, key: Option<String>) -> Self {
        self.api_key = key;
        self
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let req = self.client.request(method, url);
        match &self.api_key {
            Some(key) => req.header("api-key", key),
            None => req,
        }
    }

    async fn send(&self, req: reqwest::RequestBuilder, collection: &str) -> Result<reqwest::Response, IndexError> {
        let resp = req
            .send()
            .await
            .map_err(|e| IndexError::Unavailable(format!("qdrant request error: {e}")))?;
        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(IndexError::MissingCollection(collection.to_string()));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(IndexError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(resp)
    }
}

#[derive(Serialize)]
struct CreateCollection {
    vectors: VectorParams,
}

#[derive(Serialize, Deserialize)]
struct VectorParams {
    size: usize,
    distance: String,
}

#[derive(Deserialize)]
struct CollectionInfoResponse {
    result: CollectionInfo,
}

#[derive(Deserialize)]
struct CollectionInfo {
    config: CollectionConfig,
}

#[derive(Deserialize)]
struct CollectionConfig {
    params: CollectionParams,
}

#[derive(Deserialize)]
struct CollectionParams {
    vectors: VectorParams,
}

#[derive(Serialize)]
struct UpsertPoint {
    id: String,
    vector: Vec<f32>,
    payload: serde_json::Value,
}

#[derive(Serialize)]
struct UpsertRequest {
    points: Vec<UpsertPoint>,
}

#[derive(Serialize)]
struct SearchRequest<'a> {
    vector: &'a [f32],
    limit: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    filter: Option<&'a Filter>,
    with_payload: bool,
    with_vector: bool,
}

#[derive(Deserialize, Debug)]
struct SearchResponse {
    result: Vec<ScoredPoint>,
}

#[derive(Deserialize, Debug)]
struct ScoredPoint {
    id: serde_json::Value,
    #[serde(default)]
    score: f32,
    #[serde(default)]
    payload: serde_json::Value,
}

#[derive(Serialize)]
struct ScrollRequest<'a> {
    limit: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    filter: Option<&'a Filter>,
    with_payload: bool,
    with_vector: bool,
}

#[derive(Deserialize, Debug)]
struct ScrollResponse {
    result: ScrollPage,
}

#[derive(Deserialize, Debug)]
struct ScrollPage {
    points: Vec<ScoredPoint>,
}

#[derive(Serialize)]
struct RetrieveRequest {
    ids: Vec<String>,
    with_payload: bool,
    with_vector: bool,
}

#[derive(Deserialize, Debug)]
struct RetrieveResponse {
    result: Vec<ScoredPoint>,
}

fn parse_id(id: &serde_json::Value) -> Result<Uuid, IndexError> {
    match id {
        serde_json::Value::String(s) => {
            Uuid::parse_str(s).map_err(|e| IndexError::Malformed(format!("point id '{s}': {e}")))
        }
        other => Err(IndexError::Malformed(format!("non-uuid point id {other}"))),
    }
}

fn non_empty(filter: &Filter) -> Option<&Filter> {
    if filter.is_empty() {
        None
    } else {
        Some(filter)
    }
}

#[async_trait]
impl VectorIndex for QdrantIndex {
    async fn ensure_collection(&self, collection: &IndexCollection) -> Result<(), IndexError> {
        let path = format!("/collections/{}", collection.name);
        match self
            .send(self.request(reqwest::Method::GET, &path), &collection.name)
            .await
        {
            Ok(resp) => {
                let info: CollectionInfoResponse = resp
                    .json()
                    .await
                    .map_err(|e| IndexError::Malformed(format!("qdrant parse error: {e}")))?;
                let actual = info.result.config.params.vectors.size;
                if actual != collection.vector_dimension {
                    return Err(IndexError::DimensionMismatch {
                        expected: collection.vector_dimension,
                        actual,
                    });
                }
                Ok(())
            }
            Err(IndexError::MissingCollection(_)) => {
                let body = CreateCollection {
                    vectors: VectorParams {
                        size: collection.vector_dimension,
                        distance: collection.distance.as_str().to_string(),
                    },
                };
                self.send(self.request(reqwest::Method::PUT, &path).json(&body), &collection.name)
                    .await?;
                tracing::info!(collection = %collection.name, dim = collection.vector_dimension, "created qdrant collection");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn drop_collection(&self, name: &str) -> Result<(), IndexError> {
        let path = format!("/collections/{name}");
        match self.send(self.request(reqwest::Method::DELETE, &path), name).await {
            Ok(_) | Err(IndexError::MissingCollection(_)) => {
                tracing::warn!(collection = %name, "dropped qdrant collection");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn upsert(&self, collection: &str, docs: Vec<IndexedDocument>) -> Result<(), IndexError> {
        if docs.is_empty() {
            return Ok(());
        }
        let points = docs
            .into_iter()
            .map(|doc| UpsertPoint {
                id: doc.id.to_string(),
                payload: doc.payload(),
                vector: doc.embedding,
            })
            .collect();
        let path = format!("/collections/{collection}/points?wait=true");
        self.send(
            self.request(reqwest::Method::PUT, &path)
                .json(&UpsertRequest { points }),
            collection,
        )
        .await?;
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        filter: &Filter,
        k: usize,
    ) -> Result<Vec<RetrievalResult>, IndexError> {
        let path = format!("/collections/{collection}/points/search");
        let body = SearchRequest {
            vector,
            limit: k,
            filter: non_empty(filter),
            with_payload: true,
            with_vector: false,
        };
        let resp = self
            .send(self.request(reqwest::Method::POST, &path).json(&body), collection)
            .await?;
        let parsed: SearchResponse = resp
            .json()
            .await
            .map_err(|e| IndexError::Malformed(format!("qdrant parse error: {e}")))?;

        let mut out = Vec::with_capacity(parsed.result.len());
        for point in parsed.result {
            let id = parse_id(&point.id)?;
            match document_from_payload(&point.payload) {
                Ok((document, source)) => out.push(RetrievalResult {
                    document_ref: id,
                    similarity_score: point.score,
                    payload_snapshot: document,
                    source,
                }),
                Err(e) => tracing::warn!(%id, error = %e, "skipping point with foreign payload"),
            }
        }
        out.sort_by(nlq_types::rank_order);
        Ok(out)
    }

    async fn scroll(&self, collection: &str, filter: &Filter, k: usize) -> Result<Vec<StoredPoint>, IndexError> {
        let path = format!("/collections/{collection}/points/scroll");
        let body = ScrollRequest {
            limit: k,
            filter: non_empty(filter),
            with_payload: true,
            with_vector: false,
        };
        let resp = self
            .send(self.request(reqwest::Method::POST, &path).json(&body), collection)
            .await?;
        let parsed: ScrollResponse = resp
            .json()
            .await
            .map_err(|e| IndexError::Malformed(format!("qdrant parse error: {e}")))?;

        let mut out = Vec::with_capacity(parsed.result.points.len());
        for point in parsed.result.points {
            let id = parse_id(&point.id)?;
            match document_from_payload(&point.payload) {
                Ok((document, source)) => out.push(StoredPoint { id, document, source }),
                Err(e) => tracing::warn!(%id, error = %e, "skipping point with foreign payload"),
            }
        }
        Ok(out)
    }

    async fn fetch(&self, collection: &str, ids: &[Uuid]) -> Result<Vec<StoredPoint>, IndexError> {
        let path = format!("/collections/{collection}/points");
        let body = RetrieveRequest {
            ids: ids.iter().map(Uuid::to_string).collect(),
            with_payload: true,
            with_vector: false,
        };
        let resp = self
            .send(self.request(reqwest::Method::POST, &path).json(&body), collection)
            .await?;
        let parsed: RetrieveResponse = resp
            .json()
            .await
            .map_err(|e| IndexError::Malformed(format!("qdrant parse error: {e}")))?;

        let mut out = Vec::with_capacity(parsed.result.len());
        for point in parsed.result {
            let id = parse_id(&point.id)?;
            match document_from_payload(&point.payload) {
                Ok((document, source)) => out.push(StoredPoint { id, document, source }),
                Err(e) => tracing::warn!(%id, error = %e, "skipping point with foreign payload"),
            }
        }
        Ok(out)
    }
}
