use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Namespace for deterministic document ids (UUIDv5 over `kind:natural_key`).
pub const DOCUMENT_ID_NAMESPACE: Uuid = Uuid::from_u128(0x6e6c_712d_6b62_5f64_6f63_0000_0000_0001);

/// Payload field every indexed document carries; used for variant filters.
pub const KIND_FIELD: &str = "kind";

/// Variant tag of a knowledge document.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocKind {
    QaExample,
    TableDoc,
    ViewDoc,
    SchemaMetadata,
}

impl DocKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocKind::QaExample => "qa_example",
            DocKind::TableDoc => "table_doc",
            DocKind::ViewDoc => "view_doc",
            DocKind::SchemaMetadata => "schema_metadata",
        }
    }
}

impl fmt::Display for DocKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_category() -> String {
    "general".into()
}

fn default_complexity() -> u8 {
    1
}

/// Curated question/SQL pair.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QaExample {
    pub question: String,
    pub sql: String,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default = "default_category")]
    pub category: String,
    /// 1 (trivial lookup) ..= 5 (multi-CTE analytics).
    #[serde(default = "default_complexity")]
    pub complexity: u8,
    #[serde(default)]
    pub business_entity: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub table: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub on: String,
}

/// Documentation for a table or a view.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ObjectDoc {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub ddl: Option<String>,
    #[serde(default)]
    pub key_columns: Vec<String>,
    #[serde(default)]
    pub business_rules: Vec<String>,
    #[serde(default)]
    pub relationships: Vec<Relationship>,
    #[serde(default)]
    pub usage_notes: Vec<String>,
}

/// Free-standing schema knowledge (glossary entries, period conventions, ...).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SchemaMetadata {
    pub key: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

fn document_id(kind: DocKind, natural_key: &str) -> Uuid {
    let key = format!("{kind}:{natural_key}");
    Uuid::new_v5(&DOCUMENT_ID_NAMESPACE, key.as_bytes())
}

/// A unit of the knowledge base. Serialized internally tagged on `kind`, which
/// is also the payload field the vector index filters on.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum KnowledgeDocument {
    QaExample(QaExample),
    TableDoc(ObjectDoc),
    ViewDoc(ObjectDoc),
    SchemaMetadata(SchemaMetadata),
}

impl KnowledgeDocument {
    pub fn kind(&self) -> DocKind {
        match self {
            KnowledgeDocument::QaExample(_) => DocKind::QaExample,
            KnowledgeDocument::TableDoc(_) => DocKind::TableDoc,
            KnowledgeDocument::ViewDoc(_) => DocKind::ViewDoc,
            KnowledgeDocument::SchemaMetadata(_) => DocKind::SchemaMetadata,
        }
    }

    /// Logical key the id is derived from. Two documents with the same kind
    /// and natural key are the same document.
    pub fn natural_key(&self) -> String {
        match self {
            KnowledgeDocument::QaExample(ex) => normalize_question(&ex.question),
            KnowledgeDocument::TableDoc(doc) | KnowledgeDocument::ViewDoc(doc) => {
                doc.name.trim().to_uppercase()
            }
            KnowledgeDocument::SchemaMetadata(meta) => meta.key.trim().to_string(),
        }
    }

    pub fn id(&self) -> Uuid {
        document_id(self.kind(), &self.natural_key())
    }

    /// Id an example asking `question` is stored under, whatever its SQL.
    pub fn example_id(question: &str) -> Uuid {
        document_id(DocKind::QaExample, &normalize_question(question))
    }

    /// Text that gets embedded for this document.
    pub fn canonical_text(&self) -> String {
        match self {
            KnowledgeDocument::QaExample(ex) => format!("{}\n{}", ex.question.trim(), ex.sql.trim()),
            KnowledgeDocument::TableDoc(doc) | KnowledgeDocument::ViewDoc(doc) => {
                let mut out = format!("{}\n{}", doc.name.trim(), doc.description.trim());
                for rule in &doc.business_rules {
                    out.push('\n');
                    out.push_str(rule.trim());
                }
                for rel in &doc.relationships {
                    out.push_str(&format!("\n{} {} ON {}", rel.kind, rel.table, rel.on));
                }
                for note in &doc.usage_notes {
                    out.push('\n');
                    out.push_str(note.trim());
                }
                out
            }
            KnowledgeDocument::SchemaMetadata(meta) => {
                format!("{}\n{}", meta.title.trim(), meta.body.trim())
            }
        }
    }

    /// Structural checks a record must pass before it is embedded.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            KnowledgeDocument::QaExample(ex) => {
                if ex.question.trim().is_empty() {
                    return Err("example has an empty question".into());
                }
                if ex.sql.trim().is_empty() {
                    return Err("example has empty sql".into());
                }
                if !(1..=5).contains(&ex.complexity) {
                    return Err(format!("complexity {} outside 1..=5", ex.complexity));
                }
            }
            KnowledgeDocument::TableDoc(doc) | KnowledgeDocument::ViewDoc(doc) => {
                if doc.name.trim().is_empty() {
                    return Err("object doc has an empty name".into());
                }
            }
            KnowledgeDocument::SchemaMetadata(meta) => {
                if meta.key.trim().is_empty() {
                    return Err("metadata entry has an empty key".into());
                }
            }
        }
        Ok(())
    }

    pub fn as_example(&self) -> Option<&QaExample> {
        match self {
            KnowledgeDocument::QaExample(ex) => Some(ex),
            _ => None,
        }
    }

    pub fn as_schema_doc(&self) -> Option<SchemaDoc> {
        match self {
            KnowledgeDocument::TableDoc(doc) => Some(SchemaDoc::Table(doc.clone())),
            KnowledgeDocument::ViewDoc(doc) => Some(SchemaDoc::View(doc.clone())),
            _ => None,
        }
    }
}

/// Lowercased, whitespace-collapsed question used as the example natural key.
pub fn normalize_question(question: &str) -> String {
    question
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// A table or view doc attached to a generation context.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "object", rename_all = "snake_case")]
pub enum SchemaDoc {
    Table(ObjectDoc),
    View(ObjectDoc),
}

impl SchemaDoc {
    pub fn doc(&self) -> &ObjectDoc {
        match self {
            SchemaDoc::Table(doc) | SchemaDoc::View(doc) => doc,
        }
    }

    pub fn name(&self) -> &str {
        &self.doc().name
    }
}

/// A document as stored in the vector index.
#[derive(Clone, Debug, PartialEq)]
pub struct IndexedDocument {
    pub id: Uuid,
    pub embedding: Vec<f32>,
    pub document: KnowledgeDocument,
    pub source: String,
}

impl IndexedDocument {
    /// Index payload: the tagged document plus its provenance.
    pub fn payload(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(&self.document).unwrap_or(serde_json::Value::Null);
        if let serde_json::Value::Object(map) = &mut value {
            map.insert("source".into(), serde_json::Value::String(self.source.clone()));
        }
        value
    }
}

/// Decode an index payload back into `(document, source)`.
pub fn document_from_payload(payload: &serde_json::Value) -> Result<(KnowledgeDocument, String), String> {
    let source = payload
        .get("source")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let document = serde_json::from_value::<KnowledgeDocument>(payload.clone())
        .map_err(|e| format!("undecodable payload: {e}"))?;
    Ok((document, source))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Distance {
    Cosine,
}

impl Distance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Distance::Cosine => "Cosine",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexCollection {
    pub name: String,
    pub vector_dimension: usize,
    pub distance: Distance,
}

impl IndexCollection {
    pub fn cosine(name: impl Into<String>, vector_dimension: usize) -> Self {
        Self {
            name: name.into(),
            vector_dimension,
            distance: Distance::Cosine,
        }
    }
}

/// One ranked hit from the knowledge base.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub document_ref: Uuid,
    pub similarity_score: f32,
    pub payload_snapshot: KnowledgeDocument,
    #[serde(default)]
    pub source: String,
}

impl RetrievalResult {
    pub fn example(&self) -> Option<&QaExample> {
        self.payload_snapshot.as_example()
    }
}

/// Score descending, then id ascending. NaN scores sort last.
pub fn rank_order(a: &RetrievalResult, b: &RetrievalResult) -> Ordering {
    b.similarity_score
        .partial_cmp(&a.similarity_score)
        .unwrap_or_else(|| a.similarity_score.is_nan().cmp(&b.similarity_score.is_nan()))
        .then_with(|| a.document_ref.cmp(&b.document_ref))
}
