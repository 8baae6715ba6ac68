//! Batch payload parsing.
//!
//! A payload is either one JSON array of paper objects or newline-delimited
//! JSON (one object per line, any of `\n`, `\r\n`, `\r`). Entries that do
//! not parse or carry no usable key are rejected individually; the rest of
//! the payload is kept.

use serde_json::{Map, Value};
use tracing::warn;

use crate::models::SourceRecord;

const UNKNOWN_SOURCE: &str = "unknown";

/// One fetched batch file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestPayload {
    /// Where the payload came from (object key or file path).
    pub object_key: String,
    pub data: Vec<u8>,
}

impl IngestPayload {
    pub fn new(object_key: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            object_key: object_key.into(),
            data: data.into(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ParsedPayload {
    pub records: Vec<SourceRecord>,
    /// Entries dropped because they did not parse or had no key.
    pub rejected: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PayloadError {
    #[error("payload is not valid UTF-8")]
    NotUtf8,
    #[error("no valid papers found in payload ({rejected} entries rejected)")]
    NoRecords { rejected: usize },
}

/// Parse a payload into unstamped source records.
pub fn parse_payload(data: &[u8]) -> Result<ParsedPayload, PayloadError> {
    let mut parsed = ParsedPayload::default();

    if let Ok(entries) = serde_json::from_slice::<Vec<Value>>(data) {
        for (index, entry) in entries.into_iter().enumerate() {
            match entry_to_record(entry) {
                Ok(record) => parsed.records.push(record),
                Err(reason) => {
                    warn!(entry = index + 1, reason, "failed to convert paper data");
                    parsed.rejected += 1;
                }
            }
        }
    } else {
        let text = std::str::from_utf8(data).map_err(|_| PayloadError::NotUtf8)?;
        let normalized = text.replace("\r\n", "\n").replace('\r', "\n");
        for (index, line) in normalized.split('\n').enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let entry = match serde_json::from_str::<Value>(line) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(line_number = index + 1, error = %e, "failed to parse line as JSON");
                    parsed.rejected += 1;
                    continue;
                }
            };
            match entry_to_record(entry) {
                Ok(record) => parsed.records.push(record),
                Err(reason) => {
                    warn!(line_number = index + 1, reason, "failed to convert paper data");
                    parsed.rejected += 1;
                }
            }
        }
    }

    if parsed.records.is_empty() {
        return Err(PayloadError::NoRecords {
            rejected: parsed.rejected,
        });
    }
    Ok(parsed)
}

fn entry_to_record(entry: Value) -> Result<SourceRecord, &'static str> {
    let Value::Object(map) = entry else {
        return Err("entry is not a JSON object");
    };

    let paper_id = non_empty_string(&map, "paper_id")
        .or_else(|| non_empty_string(&map, "id"))
        .ok_or("missing or invalid paper_id")?;

    Ok(SourceRecord {
        paper_id,
        source: string_field(&map, "source").unwrap_or_else(|| UNKNOWN_SOURCE.to_string()),
        title: string_field(&map, "title").unwrap_or_default(),
        abstract_text: string_field(&map, "abstract").unwrap_or_default(),
        authors: string_list(&map, "authors"),
        published_date: string_field(&map, "published_date").unwrap_or_default(),
        categories: string_list(&map, "categories"),
        raw_xml: string_field(&map, "raw_xml").unwrap_or_default(),
        ..Default::default()
    })
}

fn string_field(map: &Map<String, Value>, key: &str) -> Option<String> {
    map.get(key).and_then(Value::as_str).map(str::to_string)
}

fn non_empty_string(map: &Map<String, Value>, key: &str) -> Option<String> {
    string_field(map, key).filter(|s| !s.is_empty())
}

fn string_list(map: &Map<String, Value>, key: &str) -> Vec<String> {
    map.get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
