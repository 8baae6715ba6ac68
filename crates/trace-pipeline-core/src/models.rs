//! Core data models that flow through the ingestion and vectorization stages.
//!
//! Field names serialize exactly as they are stored in the keyed tables
//! (`paper_id`, `abstract`, `embedding_metadata`, ...), so a record can be
//! turned into a store item with [`to_item`](crate::store::to_item) and
//! read back with `serde_json::from_value`.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::ValidationError;
use crate::store::{ItemKey, TableRecord, TableSpec};

/// Partition key attribute of both the papers and the vectors table.
pub const PAPER_KEY: &str = "paper_id";
/// Sort key attribute of the vectors table.
pub const VECTOR_KIND_KEY: &str = "vector_type";
/// Partition key attribute of the trace secondary index.
pub const TRACE_ID_ATTRIBUTE: &str = "trace_id";
/// Sort key attribute of the trace secondary index.
pub const BATCH_TIMESTAMP_ATTRIBUTE: &str = "batch_timestamp";

/// Vector kind produced from a title + abstract projection.
pub const DEFAULT_VECTOR_KIND: &str = "title_abstract";
pub const PREPROCESSING_TAG: &str = "title_abstract_combination";
pub const DEFAULT_LANGUAGE: &str = "en";
pub const PROCESSED_STATUS: &str = "processed";

const TEXT_SEPARATOR: &str = ". ";

/// Format a timestamp the way every record field stores it.
pub fn rfc3339(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Stored items may carry explicit `null` attributes; read them as empty.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// One ingested paper, keyed by `paper_id`.
///
/// Written once by the ingestion stage and never patched: a later write with
/// the same key is a full overwrite.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    #[serde(default, deserialize_with = "null_as_default")]
    pub paper_id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub source: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub title: String,
    #[serde(default, rename = "abstract", deserialize_with = "null_as_default")]
    pub abstract_text: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub authors: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub published_date: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub categories: Vec<String>,
    #[serde(
        default,
        skip_serializing_if = "String::is_empty",
        deserialize_with = "null_as_default"
    )]
    pub raw_xml: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub trace_id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub batch_timestamp: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub processing_status: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub created_at: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub updated_at: String,
}

impl SourceRecord {
    /// Key schema of the papers table.
    pub fn table_spec(table_name: impl Into<String>) -> TableSpec {
        TableSpec::new(table_name, PAPER_KEY)
    }

    /// Attach the run's trace id and timestamps.
    ///
    /// The trace id is always overwritten; audit timestamps are only filled
    /// when the payload did not carry them.
    pub fn stamp(&mut self, trace_id: &str, batch_timestamp: &str, now: &str) {
        self.trace_id = trace_id.to_string();
        self.batch_timestamp = batch_timestamp.to_string();
        if self.processing_status.is_empty() {
            self.processing_status = PROCESSED_STATUS.to_string();
        }
        if self.created_at.is_empty() {
            self.created_at = now.to_string();
        }
        if self.updated_at.is_empty() {
            self.updated_at = now.to_string();
        }
    }

    /// Checks a stored record must pass before it is vectorized.
    pub fn validate_for_embedding(&self) -> Result<(), ValidationError> {
        if self.paper_id.is_empty() {
            return Err(ValidationError::EmptyKey);
        }
        if self.trace_id.is_empty() {
            return Err(ValidationError::EmptyTraceId);
        }
        if self.title.trim().is_empty() && self.abstract_text.trim().is_empty() {
            return Err(ValidationError::EmptyText);
        }
        Ok(())
    }

    /// Project the record to its embedding input.
    ///
    /// Joins the trimmed, non-empty title and abstract with `". "`. Returns
    /// `None` when neither contributes any text.
    pub fn combined_text(&self) -> Option<CombinedText> {
        let mut parts = Vec::with_capacity(2);
        let mut source_fields = Vec::with_capacity(2);

        let title = self.title.trim();
        if !title.is_empty() {
            parts.push(title);
            source_fields.push("title".to_string());
        }
        let abstract_text = self.abstract_text.trim();
        if !abstract_text.is_empty() {
            parts.push(abstract_text);
            source_fields.push("abstract".to_string());
        }

        if parts.is_empty() {
            return None;
        }

        Some(CombinedText {
            paper_id: self.paper_id.clone(),
            text: parts.join(TEXT_SEPARATOR),
            source_fields,
        })
    }
}

impl TableRecord for SourceRecord {
    fn item_key(&self) -> ItemKey {
        ItemKey::partition(&self.paper_id)
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if self.paper_id.is_empty() {
            return Err(ValidationError::EmptyKey);
        }
        Ok(())
    }
}

/// Embedding input for one paper. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CombinedText {
    pub paper_id: String,
    pub text: String,
    /// Which record fields contributed to `text`, in join order.
    pub source_fields: Vec<String>,
}

impl CombinedText {
    pub fn new(paper_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            paper_id: paper_id.into(),
            text: text.into(),
            source_fields: vec!["title".to_string(), "abstract".to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingMetadata {
    pub model_name: String,
    pub model_version: String,
    pub dimension: usize,
    pub text_length: usize,
    pub preprocessing: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceText {
    pub content: String,
    pub source_fields: Vec<String>,
    pub language: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingInfo {
    pub created_at: String,
    pub trace_id: String,
    pub processing_time_ms: u64,
}

/// A derived embedding, keyed by `(paper_id, vector_type)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorRecord {
    pub paper_id: String,
    pub vector_type: String,
    pub embedding: Vec<f32>,
    pub embedding_metadata: EmbeddingMetadata,
    pub source_text: SourceText,
    pub processing_info: ProcessingInfo,
}

impl VectorRecord {
    /// Key schema of the vectors table.
    pub fn table_spec(table_name: impl Into<String>) -> TableSpec {
        TableSpec::new(table_name, PAPER_KEY).with_sort_key(VECTOR_KIND_KEY)
    }

    /// Build a record from a successful embedding call.
    ///
    /// The declared dimension is always taken from `embedding.len()`.
    pub fn from_embedding(
        text: &CombinedText,
        trace_id: &str,
        vector_kind: &str,
        embedding: Vec<f32>,
        model_version: &str,
        processing_time_ms: u64,
    ) -> Self {
        Self {
            paper_id: text.paper_id.clone(),
            vector_type: vector_kind.to_string(),
            embedding_metadata: EmbeddingMetadata {
                model_name: model_name_from_version(model_version),
                model_version: model_version.to_string(),
                dimension: embedding.len(),
                text_length: text.text.chars().count(),
                preprocessing: PREPROCESSING_TAG.to_string(),
            },
            embedding,
            source_text: SourceText {
                content: text.text.clone(),
                source_fields: text.source_fields.clone(),
                language: DEFAULT_LANGUAGE.to_string(),
            },
            processing_info: ProcessingInfo {
                created_at: rfc3339(Utc::now()),
                trace_id: trace_id.to_string(),
                processing_time_ms,
            },
        }
    }
}

/// Model versions are stored verbatim; the name is the version string.
fn model_name_from_version(model_version: &str) -> String {
    model_version.to_string()
}

impl TableRecord for VectorRecord {
    fn item_key(&self) -> ItemKey {
        ItemKey::with_sort(&self.paper_id, &self.vector_type)
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if self.paper_id.is_empty() {
            return Err(ValidationError::EmptyKey);
        }
        if self.vector_type.is_empty() {
            return Err(ValidationError::EmptyVectorKind);
        }
        if self.embedding.is_empty() {
            return Err(ValidationError::EmptyEmbedding);
        }
        if self.embedding_metadata.dimension != self.embedding.len() {
            return Err(ValidationError::DimensionMismatch {
                declared: self.embedding_metadata.dimension,
                actual: self.embedding.len(),
            });
        }
        if self.embedding_metadata.model_version.is_empty() {
            return Err(ValidationError::EmptyModelVersion);
        }
        if self.processing_info.trace_id.is_empty() {
            return Err(ValidationError::EmptyTraceId);
        }
        if let Some(index) = self.embedding.iter().position(|v| v.is_nan()) {
            return Err(ValidationError::NotANumber(index));
        }
        Ok(())
    }
}
