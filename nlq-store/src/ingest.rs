//! Knowledge indexer: curator JSON → embedded, upserted documents.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use futures_util::{stream, StreamExt};
use nlq_embed::Embedder;
use nlq_types::{IndexCollection, IndexedDocument, KnowledgeDocument, ObjectDoc, QaExample, SchemaMetadata};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{IndexError, VectorIndex};

const UPSERT_CHUNK: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Examples,
    Tables,
    Views,
    Metadata,
}

impl FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "examples" | "example" | "qa" => Ok(SourceKind::Examples),
            "tables" | "table" => Ok(SourceKind::Tables),
            "views" | "view" => Ok(SourceKind::Views),
            "metadata" | "meta" => Ok(SourceKind::Metadata),
            other => Err(format!("unknown source kind '{other}'")),
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SourceKind::Examples => "examples",
            SourceKind::Tables => "tables",
            SourceKind::Views => "views",
            SourceKind::Metadata => "metadata",
        };
        f.write_str(s)
    }
}

/// Per-record failure. Never aborts the batch.
#[derive(Clone, Debug, Error, Serialize)]
#[serde(tag = "error", rename_all = "snake_case")]
pub enum IngestionError {
    #[error("{source_label}#{record}: malformed record: {message}")]
    Malformed {
        source_label: String,
        record: usize,
        message: String,
    },
    #[error("{id}: embedding failed: {message}")]
    Embedding { id: Uuid, message: String },
    #[error("{id}: index write failed: {message}")]
    Index { id: Uuid, message: String },
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct IngestReport {
    pub succeeded: usize,
    pub failed: usize,
    pub errors: Vec<IngestionError>,
}

impl IngestReport {
    fn fail(&mut self, err: IngestionError) {
        tracing::warn!(error = %err, "skipping knowledge record");
        self.failed += 1;
        self.errors.push(err);
    }

    pub fn merge(&mut self, other: IngestReport) {
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.errors.extend(other.errors);
    }
}

/// Turns curator sources into documents in one collection.
pub struct Indexer {
    index: Arc<dyn VectorIndex>,
    embedder: Arc<dyn Embedder>,
    collection: IndexCollection,
    concurrency: usize,
    /// Serializes index writes so two ingests never race on one id.
    write_lock: Mutex<()>,
}

impl Indexer {
    pub fn new(index: Arc<dyn VectorIndex>, embedder: Arc<dyn Embedder>, collection: IndexCollection) -> Self {
        Self {
            index,
            embedder,
            collection,
            concurrency: 4,
            write_lock: Mutex::new(()),
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn collection(&self) -> &IndexCollection {
        &self.collection
    }

    /// `recreate = true` drops the collection first. Otherwise merges.
    pub async fn rebuild(&self, recreate: bool) -> Result<(), IndexError> {
        let _guard = self.write_lock.lock().await;
        if recreate {
            tracing::warn!(collection = %self.collection.name, "recreating collection");
            self.index.drop_collection(&self.collection.name).await?;
        }
        self.index.ensure_collection(&self.collection).await
    }

    /// Ingest one JSON source (array of records or a single record).
    pub async fn ingest(
        &self,
        kind: SourceKind,
        source_data: &serde_json::Value,
        source_label: &str,
    ) -> Result<IngestReport, IndexError> {
        let mut report = IngestReport::default();
        let docs = parse_records(kind, source_data, source_label, &mut report);
        let written = self.ingest_documents(docs).await?;
        report.merge(written);
        Ok(report)
    }

    /// Ingest a file, or every `*.json` file in a directory (sorted by name).
    pub async fn ingest_path(&self, kind: SourceKind, path: &Path) -> Result<IngestReport, IndexError> {
        let files = if path.is_dir() {
            let mut files: Vec<_> = std::fs::read_dir(path)
                .map_err(|e| IndexError::Unavailable(format!("{}: {e}", path.display())))?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| p.extension().map(|ext| ext == "json").unwrap_or(false))
                .collect();
            files.sort();
            files
        } else {
            vec![path.to_path_buf()]
        };

        let mut report = IngestReport::default();
        for file in files {
            let label = file.display().to_string();
            let parsed = std::fs::read_to_string(&file)
                .map_err(|e| e.to_string())
                .and_then(|text| serde_json::from_str::<serde_json::Value>(&text).map_err(|e| e.to_string()));
            match parsed {
                Ok(value) => report.merge(self.ingest(kind, &value, &label).await?),
                Err(message) => report.fail(IngestionError::Malformed {
                    source_label: label,
                    record: 0,
                    message,
                }),
            }
        }
        Ok(report)
    }

    /// Embed and upsert already-typed documents `(document, source)`.
    pub async fn ingest_documents(
        &self,
        docs: Vec<(KnowledgeDocument, String)>,
    ) -> Result<IngestReport, IndexError> {
        let mut report = IngestReport::default();
        if docs.is_empty() {
            return Ok(report);
        }
        self.index.ensure_collection(&self.collection).await?;

        // Same id twice in one batch: the later record wins.
        let mut unique: BTreeMap<Uuid, (KnowledgeDocument, String)> = BTreeMap::new();
        // Earlier records replaced per surviving id; they share its outcome.
        let mut superseded: BTreeMap<Uuid, usize> = BTreeMap::new();
        for (doc, source) in docs {
            let id = doc.id();
            if unique.insert(id, (doc, source)).is_some() {
                *superseded.entry(id).or_default() += 1;
            }
        }
        if !superseded.is_empty() {
            tracing::debug!(
                superseded = superseded.values().sum::<usize>(),
                "collapsed duplicate ids within batch"
            );
        }

        let embedder = Arc::clone(&self.embedder);
        let mut embedded: Vec<Result<IndexedDocument, IngestionError>> = stream::iter(unique)
            .map(|(id, (document, source))| {
                let embedder = Arc::clone(&embedder);
                async move {
                    let text = document.canonical_text();
                    match embedder.embed(&text).await {
                        Ok(embedding) => Ok(IndexedDocument {
                            id,
                            embedding,
                            document,
                            source,
                        }),
                        Err(e) => Err(IngestionError::Embedding {
                            id,
                            message: e.to_string(),
                        }),
                    }
                }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;
        embedded.sort_by_key(|r| match r {
            Ok(doc) => doc.id,
            Err(IngestionError::Embedding { id, .. }) => *id,
            Err(_) => Uuid::nil(),
        });

        let mut ready = Vec::with_capacity(embedded.len());
        for item in embedded {
            match item {
                Ok(doc) => ready.push(doc),
                Err(e) => report.fail(e),
            }
        }

        let _guard = self.write_lock.lock().await;
        for chunk in ready.chunks(UPSERT_CHUNK) {
            let ids: Vec<Uuid> = chunk.iter().map(|d| d.id).collect();
            match self.index.upsert(&self.collection.name, chunk.to_vec()).await {
                Ok(()) => {
                    report.succeeded += ids.len();
                    report.succeeded += ids.iter().filter_map(|id| superseded.get(id)).sum::<usize>();
                }
                Err(e) => {
                    for id in ids {
                        report.fail(IngestionError::Index {
                            id,
                            message: e.to_string(),
                        });
                    }
                }
            }
        }

        tracing::info!(
            collection = %self.collection.name,
            succeeded = report.succeeded,
            failed = report.failed,
            "ingested knowledge documents"
        );
        Ok(report)
    }
}

fn parse_records(
    kind: SourceKind,
    data: &serde_json::Value,
    source_label: &str,
    report: &mut IngestReport,
) -> Vec<(KnowledgeDocument, String)> {
    let records: Vec<&serde_json::Value> = match data {
        serde_json::Value::Array(items) => items.iter().collect(),
        other => vec![other],
    };

    let mut docs = Vec::with_capacity(records.len());
    for (idx, record) in records.into_iter().enumerate() {
        let parsed = match kind {
            SourceKind::Examples => serde_json::from_value::<QaExample>(record.clone())
                .map(KnowledgeDocument::QaExample),
            SourceKind::Tables => serde_json::from_value::<ObjectDoc>(record.clone())
                .map(KnowledgeDocument::TableDoc),
            SourceKind::Views => serde_json::from_value::<ObjectDoc>(record.clone())
                .map(KnowledgeDocument::ViewDoc),
            SourceKind::Metadata => serde_json::from_value::<SchemaMetadata>(record.clone())
                .map(KnowledgeDocument::SchemaMetadata),
        }
        .map_err(|e| e.to_string())
        .and_then(|doc| doc.validate().map(|_| doc));

        match parsed {
            Ok(doc) => docs.push((doc, source_label.to_string())),
            Err(message) => report.fail(IngestionError::Malformed {
                source_label: source_label.to_string(),
                record: idx,
                message,
            }),
        }
    }
    docs
}
