//! Configuration parsing and validation.
//!
//! `tpipe` reads one TOML file. Every section and field has a default, so
//! an empty file is a valid in-memory configuration (apart from the
//! embedding URL, which the `http` provider requires).
//!
//! ```toml
//! [store]
//! backend = "sqlite"            # memory | sqlite | dynamodb
//!
//! [store.sqlite]
//! path = "./data/pipeline.sqlite"
//!
//! [tables]
//! papers = "papers-table"
//! trace_index = "trace-id-index"
//! vectors = "vectors-table"
//!
//! [writer]
//! chunk_size = 25
//! max_attempts = 3
//!
//! [embedding]
//! provider = "http"             # http | hash
//! url = "http://localhost:8080/embed"
//!
//! [logging]
//! level = "info"
//! format = "pretty"             # pretty | json
//! ```
//!
//! After parsing, `PAPERS_TABLE_NAME`, `TRACE_ID_INDEX_NAME`,
//! `VECTORS_TABLE_NAME` and `EMBEDDING_API_URL` override the file when set
//! and non-empty.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use trace_pipeline_core::fanout::FanoutConfig;
use trace_pipeline_core::models::{
    BATCH_TIMESTAMP_ATTRIBUTE, DEFAULT_VECTOR_KIND, TRACE_ID_ATTRIBUTE,
};
use trace_pipeline_core::retriever::{RetrieverConfig, DEFAULT_MAX_PAGES};
use trace_pipeline_core::store::{SecondaryIndex, MAX_BATCH_WRITE_ITEMS};
use trace_pipeline_core::writer::WriterConfig;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub tables: TablesConfig,
    #[serde(default)]
    pub writer: WriterSettings,
    #[serde(default)]
    pub retriever: RetrieverSettings,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default)]
    pub sqlite: Option<SqliteConfig>,
    #[serde(default)]
    pub dynamodb: Option<DynamoDbConfig>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            sqlite: None,
            dynamodb: None,
        }
    }
}

fn default_backend() -> String {
    "memory".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct SqliteConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DynamoDbConfig {
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint (DynamoDB Local, LocalStack).
    #[serde(default)]
    pub endpoint_url: Option<String>,
}

impl Default for DynamoDbConfig {
    fn default() -> Self {
        Self {
            region: default_region(),
            endpoint_url: None,
        }
    }
}

fn default_region() -> String {
    "us-east-1".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct TablesConfig {
    #[serde(default = "default_papers_table")]
    pub papers: String,
    #[serde(default = "default_trace_index")]
    pub trace_index: String,
    #[serde(default = "default_vectors_table")]
    pub vectors: String,
}

impl Default for TablesConfig {
    fn default() -> Self {
        Self {
            papers: default_papers_table(),
            trace_index: default_trace_index(),
            vectors: default_vectors_table(),
        }
    }
}

fn default_papers_table() -> String {
    "papers-table".to_string()
}
fn default_trace_index() -> String {
    "trace-id-index".to_string()
}
fn default_vectors_table() -> String {
    "vectors-table".to_string()
}

impl TablesConfig {
    /// The papers table's trace id index.
    pub fn trace_index(&self) -> SecondaryIndex {
        SecondaryIndex {
            name: self.trace_index.clone(),
            partition_key: TRACE_ID_ATTRIBUTE.to_string(),
            sort_key: Some(BATCH_TIMESTAMP_ATTRIBUTE.to_string()),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct WriterSettings {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_max_concurrent_chunks")]
    pub max_concurrent_chunks: usize,
}

impl Default for WriterSettings {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            max_attempts: default_max_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            max_concurrent_chunks: default_max_concurrent_chunks(),
        }
    }
}

fn default_chunk_size() -> usize {
    MAX_BATCH_WRITE_ITEMS
}
fn default_max_attempts() -> u32 {
    3
}
fn default_retry_base_delay_ms() -> u64 {
    100
}
fn default_max_concurrent_chunks() -> usize {
    1
}

impl WriterSettings {
    pub fn to_writer_config(&self) -> WriterConfig {
        WriterConfig {
            chunk_size: self.chunk_size,
            max_attempts: self.max_attempts,
            retry_base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_concurrent_chunks: self.max_concurrent_chunks,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrieverSettings {
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
    #[serde(default)]
    pub page_size: Option<usize>,
}

impl Default for RetrieverSettings {
    fn default() -> Self {
        Self {
            max_pages: default_max_pages(),
            page_size: None,
        }
    }
}

fn default_max_pages() -> usize {
    DEFAULT_MAX_PAGES
}

impl RetrieverSettings {
    pub fn to_retriever_config(&self) -> RetrieverConfig {
        RetrieverConfig {
            max_pages: self.max_pages,
            page_size: self.page_size,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_max_text_length")]
    pub max_text_length: usize,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_vector_kind")]
    pub vector_kind: String,
    /// Vector length of the `hash` provider.
    #[serde(default)]
    pub dims: Option<usize>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            url: None,
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            max_text_length: default_max_text_length(),
            concurrency: default_concurrency(),
            vector_kind: default_vector_kind(),
            dims: None,
        }
    }
}

fn default_provider() -> String {
    "http".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    2
}
fn default_max_text_length() -> usize {
    trace_pipeline_core::embedding::MAX_EMBEDDING_TEXT_CHARS
}
fn default_concurrency() -> usize {
    1
}
fn default_vector_kind() -> String {
    DEFAULT_VECTOR_KIND.to_string()
}

impl EmbeddingConfig {
    pub fn to_fanout_config(&self) -> FanoutConfig {
        FanoutConfig {
            vector_kind: self.vector_kind.clone(),
            max_text_length: self.max_text_length,
            concurrency: self.concurrency,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default = "default_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: default_format(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_format() -> String {
    "pretty".to_string()
}

impl Config {
    /// Apply environment overrides. Empty values are ignored.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());
        if let Some(v) = get("PAPERS_TABLE_NAME") {
            self.tables.papers = v;
        }
        if let Some(v) = get("TRACE_ID_INDEX_NAME") {
            self.tables.trace_index = v;
        }
        if let Some(v) = get("VECTORS_TABLE_NAME") {
            self.tables.vectors = v;
        }
        if let Some(v) = get("EMBEDDING_API_URL") {
            self.embedding.url = Some(v);
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self.store.backend.as_str() {
            "memory" | "dynamodb" => {}
            "sqlite" => {
                if self.store.sqlite.is_none() {
                    bail!("store.sqlite.path must be set when store.backend is 'sqlite'");
                }
            }
            other => bail!(
                "Unknown store backend: '{}'. Must be memory, sqlite, or dynamodb.",
                other
            ),
        }

        for (name, value) in [
            ("tables.papers", &self.tables.papers),
            ("tables.trace_index", &self.tables.trace_index),
            ("tables.vectors", &self.tables.vectors),
        ] {
            if value.is_empty() {
                bail!("{} must not be empty", name);
            }
        }

        if !(1..=MAX_BATCH_WRITE_ITEMS).contains(&self.writer.chunk_size) {
            bail!("writer.chunk_size must be in [1, {}]", MAX_BATCH_WRITE_ITEMS);
        }
        if self.writer.max_attempts < 1 {
            bail!("writer.max_attempts must be >= 1");
        }
        if self.writer.max_concurrent_chunks < 1 {
            bail!("writer.max_concurrent_chunks must be >= 1");
        }
        if self.retriever.max_pages < 1 {
            bail!("retriever.max_pages must be >= 1");
        }
        if self.retriever.page_size == Some(0) {
            bail!("retriever.page_size must be > 0");
        }

        if self.embedding.concurrency < 1 {
            bail!("embedding.concurrency must be >= 1");
        }
        if self.embedding.max_text_length < 1 {
            bail!("embedding.max_text_length must be >= 1");
        }
        if self.embedding.vector_kind.is_empty() {
            bail!("embedding.vector_kind must not be empty");
        }
        match self.embedding.provider.as_str() {
            "http" => {
                if self.embedding.url.as_deref().unwrap_or("").is_empty() {
                    bail!("embedding.url (or EMBEDDING_API_URL) must be set when provider is 'http'");
                }
            }
            "hash" => {
                if self.embedding.dims.unwrap_or(0) == 0 {
                    bail!("embedding.dims must be > 0 when provider is 'hash'");
                }
            }
            other => bail!(
                "Unknown embedding provider: '{}'. Must be http or hash.",
                other
            ),
        }

        match self.logging.format.as_str() {
            "pretty" | "json" => {}
            other => bail!("Unknown logging format: '{}'. Must be pretty or json.", other),
        }

        Ok(())
    }
}

pub fn parse_config(content: &str) -> Result<Config> {
    toml::from_str(content).with_context(|| "Failed to parse config file")
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config = parse_config(&content)?;
    config.apply_env_overrides(|key| std::env::var(key).ok());
    config.validate()?;
    Ok(config)
}
