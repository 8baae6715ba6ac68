//! Paginated retrieval of a trace's records through a secondary index.
//!
//! [`TraceRetriever`] follows the store's pagination cursor (newest batch
//! first) until it runs out or a page ceiling is reached, validates each
//! item, and projects the survivors to [`CombinedText`].

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::PipelineError;
use crate::models::{CombinedText, SourceRecord};
use crate::store::{IndexQuery, Item, SecondaryIndex, SecondaryIndexQuery, SortOrder};

/// Hard ceiling on pages fetched for one trace.
pub const DEFAULT_MAX_PAGES: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrieverConfig {
    pub max_pages: usize,
    /// Items per page requested from the store; `None` uses the store default.
    pub page_size: Option<usize>,
}

impl Default for RetrieverConfig {
    fn default() -> Self {
        Self {
            max_pages: DEFAULT_MAX_PAGES,
            page_size: None,
        }
    }
}

/// Everything one retrieval pass observed.
#[derive(Debug, Clone, Default)]
pub struct RetrievalReport {
    pub texts: Vec<CombinedText>,
    pub pages: usize,
    pub items_seen: usize,
    pub invalid_count: usize,
    pub hit_page_limit: bool,
}

pub struct TraceRetriever {
    query: Arc<dyn SecondaryIndexQuery>,
    table: String,
    index: SecondaryIndex,
    config: RetrieverConfig,
}

impl TraceRetriever {
    pub fn new(
        query: Arc<dyn SecondaryIndexQuery>,
        table: impl Into<String>,
        index: SecondaryIndex,
        config: RetrieverConfig,
    ) -> Self {
        Self {
            query,
            table: table.into(),
            index,
            config,
        }
    }

    /// Combined texts of every valid record carrying `trace_id`.
    pub async fn fetch_by_trace(
        &self,
        trace_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<CombinedText>, PipelineError> {
        Ok(self.retrieve(trace_id, cancel).await?.texts)
    }

    /// Like [`fetch_by_trace`](Self::fetch_by_trace), with page and
    /// validation counts.
    ///
    /// Fails on an empty trace id (before any query), on a store error, or
    /// on cancellation. A trace with no valid records is an empty report.
    pub async fn retrieve(
        &self,
        trace_id: &str,
        cancel: &CancellationToken,
    ) -> Result<RetrievalReport, PipelineError> {
        if trace_id.is_empty() {
            return Err(PipelineError::InvalidArgument(
                "trace_id cannot be empty".into(),
            ));
        }

        let max_pages = self.config.max_pages.max(1);
        let mut report = RetrievalReport::default();
        let mut cursor = None;

        loop {
            if report.pages >= max_pages {
                warn!(
                    trace_id,
                    max_pages,
                    items = report.items_seen,
                    "reached page limit, continuing with records retrieved so far"
                );
                report.hit_page_limit = true;
                break;
            }

            let request = IndexQuery {
                table: self.table.clone(),
                index: self.index.clone(),
                partition_value: trace_id.to_string(),
                order: SortOrder::Descending,
                cursor: cursor.take(),
                limit: self.config.page_size,
            };

            let page_number = report.pages + 1;
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(PipelineError::Cancelled {
                        trace_id: trace_id.to_string(),
                    });
                }
                r = self.query.query(request) => r,
            };
            let page = result.map_err(|source| PipelineError::Query {
                trace_id: trace_id.to_string(),
                page: page_number,
                source,
            })?;

            report.pages = page_number;
            report.items_seen += page.items.len();
            debug!(
                trace_id,
                page = page_number,
                items = page.items.len(),
                has_more = page.next_cursor.is_some(),
                "retrieved page"
            );

            for item in page.items {
                match project(item) {
                    Ok(text) => report.texts.push(text),
                    Err(reason) => {
                        report.invalid_count += 1;
                        warn!(trace_id, reason = %reason, "skipping invalid record");
                    }
                }
            }

            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        info!(
            trace_id,
            pages = report.pages,
            items = report.items_seen,
            valid = report.texts.len(),
            invalid = report.invalid_count,
            "retrieved records by trace_id"
        );
        Ok(report)
    }
}

fn project(item: Item) -> Result<CombinedText, String> {
    let record: SourceRecord = serde_json::from_value(serde_json::Value::Object(item))
        .map_err(|e| format!("malformed record: {e}"))?;
    record
        .validate_for_embedding()
        .map_err(|e| format!("record {:?}: {e}", record.paper_id))?;
    record
        .combined_text()
        .ok_or_else(|| format!("record {:?}: no text to embed", record.paper_id))
}
