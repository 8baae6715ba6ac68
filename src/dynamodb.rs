//! Amazon DynamoDB table store.
//!
//! Implements [`KeyedTableStore`] and [`SecondaryIndexQuery`] over the
//! DynamoDB JSON 1.0 HTTP protocol (`BatchWriteItem`, `Query`) with AWS
//! Signature V4 authentication. Works against DynamoDB Local or LocalStack
//! through `endpoint_url`.
//!
//! Uses only pure-Rust dependencies (`hmac`, `sha2`) for AWS signing.
//!
//! # Configuration
//!
//! ```toml
//! [store]
//! backend = "dynamodb"
//!
//! [store.dynamodb]
//! region = "us-east-1"
//! # endpoint_url = "http://localhost:8000"   # DynamoDB Local
//! ```
//!
//! # Environment Variables
//!
//! - `AWS_ACCESS_KEY_ID` (required)
//! - `AWS_SECRET_ACCESS_KEY` (required)
//! - `AWS_SESSION_TOKEN` (optional, for temporary credentials)
//!
//! # Items
//!
//! Items cross the trait boundary as plain JSON objects and are converted
//! to DynamoDB attribute values on the way out (`S`, `N`, `BOOL`, `NULL`,
//! `L`, `M`) and back on the way in. Query pagination hands the raw
//! `LastEvaluatedKey` to the caller as an opaque [`PageCursor`].

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde_json::{json, Map, Number, Value};
use sha2::{Digest, Sha256};
use tracing::debug;

use trace_pipeline_core::error::StoreError;
use trace_pipeline_core::store::{
    BatchWriteResponse, IndexQuery, Item, KeyedTableStore, PageCursor, QueryPage,
    SecondaryIndexQuery, SortOrder, TableSpec,
};

use crate::config::DynamoDbConfig;

type HmacSha256 = Hmac<Sha256>;

const SERVICE: &str = "dynamodb";
const TARGET_PREFIX: &str = "DynamoDB_20120810";
const CONTENT_TYPE: &str = "application/x-amz-json-1.0";

// ============ AWS Credentials ============

/// AWS credentials loaded from environment variables.
#[derive(Clone)]
pub struct AwsCredentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
}

impl AwsCredentials {
    pub fn new(
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
        session_token: Option<String>,
    ) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token,
        }
    }

    /// Load credentials from `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY`,
    /// and optionally `AWS_SESSION_TOKEN`.
    pub fn from_env() -> Result<Self> {
        let access_key_id = std::env::var("AWS_ACCESS_KEY_ID")
            .context("AWS_ACCESS_KEY_ID environment variable not set")?;
        let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY")
            .context("AWS_SECRET_ACCESS_KEY environment variable not set")?;
        let session_token = std::env::var("AWS_SESSION_TOKEN").ok();

        Ok(Self {
            access_key_id,
            secret_access_key,
            session_token,
        })
    }
}

// ============ Store ============

pub struct DynamoDbTableStore {
    client: reqwest::Client,
    endpoint: String,
    host: String,
    region: String,
    creds: AwsCredentials,
}

impl DynamoDbTableStore {
    pub fn new(config: &DynamoDbConfig, creds: AwsCredentials) -> Result<Self> {
        let endpoint = match &config.endpoint_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("https://dynamodb.{}.amazonaws.com", config.region),
        };
        let host = endpoint
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .to_string();
        let client = reqwest::Client::builder()
            .build()
            .context("Failed to build HTTP client for DynamoDB")?;

        Ok(Self {
            client,
            endpoint,
            host,
            region: config.region.clone(),
            creds,
        })
    }

    pub fn from_config(config: &DynamoDbConfig) -> Result<Self> {
        Self::new(config, AwsCredentials::from_env()?)
    }

    /// Send one signed JSON 1.0 request and return the parsed body.
    async fn call(&self, operation: &str, body: &Value) -> Result<Value, StoreError> {
        let payload =
            serde_json::to_vec(body).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let target = format!("{}.{}", TARGET_PREFIX, operation);
        let now = Utc::now();
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();

        let authorization = sign_request(&SigningInput {
            creds: &self.creds,
            region: &self.region,
            host: &self.host,
            target: &target,
            amz_date: &amz_date,
            date_stamp: &date_stamp,
            payload: &payload,
        })?;

        let mut req_builder = self
            .client
            .post(format!("{}/", self.endpoint))
            .header("Authorization", &authorization)
            .header("Content-Type", CONTENT_TYPE)
            .header("X-Amz-Date", &amz_date)
            .header("X-Amz-Target", &target);
        if let Some(ref token) = self.creds.session_token {
            req_builder = req_builder.header("X-Amz-Security-Token", token);
        }

        let resp = req_builder
            .body(payload)
            .send()
            .await
            .map_err(|e| StoreError::Transport(format!("DynamoDB {} failed: {}", operation, e)))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;

        if !status.is_success() {
            return Err(service_error(status.as_u16(), &text));
        }

        serde_json::from_str(&text).map_err(|e| {
            StoreError::Serialization(format!("invalid DynamoDB {} response: {}", operation, e))
        })
    }
}

#[async_trait]
impl KeyedTableStore for DynamoDbTableStore {
    async fn batch_write(
        &self,
        table: &TableSpec,
        items: Vec<Item>,
    ) -> Result<BatchWriteResponse, StoreError> {
        let requests: Vec<Value> = items
            .iter()
            .map(|item| json!({ "PutRequest": { "Item": item_to_attributes(item) } }))
            .collect();
        let mut request_items = Map::new();
        request_items.insert(table.name.clone(), Value::Array(requests));
        let body = json!({ "RequestItems": request_items });

        debug!(table = %table.name, items = items.len(), "BatchWriteItem");
        let response = self.call("BatchWriteItem", &body).await?;

        let unprocessed = response
            .get("UnprocessedItems")
            .and_then(|u| u.get(&table.name))
            .and_then(Value::as_array)
            .map(|requests| {
                requests
                    .iter()
                    .filter_map(|r| r.pointer("/PutRequest/Item"))
                    .filter_map(Value::as_object)
                    .map(attributes_to_item)
                    .collect::<Result<Vec<_>, _>>()
            })
            .transpose()?
            .unwrap_or_default();

        Ok(BatchWriteResponse { unprocessed })
    }
}

#[async_trait]
impl SecondaryIndexQuery for DynamoDbTableStore {
    async fn query(&self, request: IndexQuery) -> Result<QueryPage, StoreError> {
        let mut body = json!({
            "TableName": request.table,
            "IndexName": request.index.name,
            "KeyConditionExpression": "#pk = :pk",
            "ExpressionAttributeNames": { "#pk": request.index.partition_key },
            "ExpressionAttributeValues": { ":pk": { "S": request.partition_value } },
            "ScanIndexForward": request.order == SortOrder::Ascending,
        });
        if let Some(limit) = request.limit {
            body["Limit"] = json!(limit);
        }
        if let Some(PageCursor(start_key)) = request.cursor {
            body["ExclusiveStartKey"] = start_key;
        }

        let response = self.call("Query", &body).await?;

        let items = response
            .get("Items")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_object)
                    .map(attributes_to_item)
                    .collect::<Result<Vec<_>, _>>()
            })
            .transpose()?
            .unwrap_or_default();

        let next_cursor = response
            .get("LastEvaluatedKey")
            .filter(|k| k.as_object().is_some_and(|m| !m.is_empty()))
            .cloned()
            .map(PageCursor);

        Ok(QueryPage { items, next_cursor })
    }
}

/// Map a DynamoDB error body (`{"__type": "...#Code", "message": "..."}`).
fn service_error(status: u16, body: &str) -> StoreError {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    let code = parsed
        .as_ref()
        .and_then(|v| v.get("__type"))
        .and_then(Value::as_str)
        .map(|t| t.rsplit('#').next().unwrap_or(t).to_string())
        .unwrap_or_else(|| "UnknownError".to_string());
    let message = parsed
        .as_ref()
        .and_then(|v| v.get("message").or_else(|| v.get("Message")))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| body.chars().take(500).collect());
    StoreError::Service {
        status,
        code,
        message,
    }
}

// ============ Attribute Values ============

/// Convert a plain JSON item into a DynamoDB attribute map.
pub fn item_to_attributes(item: &Item) -> Value {
    Value::Object(
        item.iter()
            .map(|(k, v)| (k.clone(), to_attribute(v)))
            .collect(),
    )
}

fn to_attribute(value: &Value) -> Value {
    match value {
        Value::Null => json!({ "NULL": true }),
        Value::Bool(b) => json!({ "BOOL": b }),
        Value::Number(n) => json!({ "N": n.to_string() }),
        Value::String(s) => json!({ "S": s }),
        Value::Array(items) => json!({ "L": items.iter().map(to_attribute).collect::<Vec<_>>() }),
        Value::Object(map) => json!({ "M": item_to_attributes(map) }),
    }
}

/// Convert a DynamoDB attribute map back into a plain JSON item.
pub fn attributes_to_item(attributes: &Map<String, Value>) -> Result<Item, StoreError> {
    attributes
        .iter()
        .map(|(k, v)| Ok((k.clone(), from_attribute(v)?)))
        .collect()
}

fn from_attribute(attribute: &Value) -> Result<Value, StoreError> {
    let invalid = || StoreError::Serialization(format!("unsupported attribute value: {attribute}"));
    let map = attribute.as_object().ok_or_else(invalid)?;
    let (kind, inner) = map.iter().next().ok_or_else(invalid)?;

    match kind.as_str() {
        "S" => Ok(inner.clone()),
        "N" => inner.as_str().map(parse_number).ok_or_else(invalid)?,
        "BOOL" => Ok(inner.clone()),
        "NULL" => Ok(Value::Null),
        "L" => inner
            .as_array()
            .ok_or_else(invalid)?
            .iter()
            .map(from_attribute)
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        "M" => attributes_to_item(inner.as_object().ok_or_else(invalid)?).map(Value::Object),
        "SS" => Ok(inner.clone()),
        "NS" => inner
            .as_array()
            .ok_or_else(invalid)?
            .iter()
            .map(|n| n.as_str().map(parse_number).ok_or_else(invalid)?)
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        _ => Err(invalid()),
    }
}

fn parse_number(text: &str) -> Result<Value, StoreError> {
    if let Ok(i) = text.parse::<i64>() {
        return Ok(Value::Number(i.into()));
    }
    text.parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map(Value::Number)
        .ok_or_else(|| StoreError::Serialization(format!("invalid number attribute: {text}")))
}

// ============ Signing ============

struct SigningInput<'a> {
    creds: &'a AwsCredentials,
    region: &'a str,
    host: &'a str,
    target: &'a str,
    amz_date: &'a str,
    date_stamp: &'a str,
    payload: &'a [u8],
}

/// Build the SigV4 `Authorization` header for a DynamoDB POST.
fn sign_request(input: &SigningInput<'_>) -> Result<String, StoreError> {
    let payload_hash = hex_sha256(input.payload);

    let mut headers = vec![
        ("content-type", CONTENT_TYPE.to_string()),
        ("host", input.host.to_string()),
        ("x-amz-date", input.amz_date.to_string()),
        ("x-amz-target", input.target.to_string()),
    ];
    if let Some(ref token) = input.creds.session_token {
        headers.push(("x-amz-security-token", token.clone()));
    }
    headers.sort_by(|a, b| a.0.cmp(b.0));

    let signed_headers = headers
        .iter()
        .map(|(k, _)| *k)
        .collect::<Vec<_>>()
        .join(";");
    let canonical_headers: String = headers
        .iter()
        .map(|(k, v)| format!("{}:{}\n", k, v.trim()))
        .collect();

    let canonical_request = format!(
        "POST\n/\n\n{}\n{}\n{}",
        canonical_headers, signed_headers, payload_hash
    );

    let credential_scope = format!(
        "{}/{}/{}/aws4_request",
        input.date_stamp, input.region, SERVICE
    );
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{}\n{}\n{}",
        input.amz_date,
        credential_scope,
        hex_sha256(canonical_request.as_bytes())
    );

    let signing_key = derive_signing_key(
        &input.creds.secret_access_key,
        input.date_stamp,
        input.region,
        SERVICE,
    )?;
    let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes())?);

    Ok(format!(
        "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
        input.creds.access_key_id, credential_scope, signed_headers, signature
    ))
}

/// Compute the hex-encoded SHA-256 hash of data.
fn hex_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Compute HMAC-SHA256 of data with the given key.
fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>, StoreError> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| StoreError::Transport(format!("request signing failed: {}", e)))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Derive the AWS SigV4 signing key for a given date, region, and service.
///
/// ```text
/// kDate    = HMAC("AWS4" + secret, dateStamp)
/// kRegion  = HMAC(kDate, region)
/// kService = HMAC(kRegion, service)
/// kSigning = HMAC(kService, "aws4_request")
/// ```
fn derive_signing_key(
    secret_key: &str,
    date_stamp: &str,
    region: &str,
    service: &str,
) -> Result<Vec<u8>, StoreError> {
    let k_date = hmac_sha256(
        format!("AWS4{}", secret_key).as_bytes(),
        date_stamp.as_bytes(),
    )?;
    let k_region = hmac_sha256(&k_date, region.as_bytes())?;
    let k_service = hmac_sha256(&k_region, service.as_bytes())?;
    hmac_sha256(&k_service, b"aws4_request")
}
