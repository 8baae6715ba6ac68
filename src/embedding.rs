//! Embedding service implementations.
//!
//! - **[`HttpEmbeddingClient`]**: calls an external embedding endpoint
//!   (`POST {url}` with `{"text": ...}`) with retry and backoff.
//! - **[`HashEmbedder`]**: deterministic, offline feature-hash embeddings
//!   for local runs and tests.
//!
//! Use [`create_service`] to build the one selected by `[embedding]`.
//!
//! # Retry Strategy
//!
//! The HTTP client uses exponential backoff for transient errors:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//!
//! Backoff is 1s, 2s, 4s, ... capped at 32s.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use trace_pipeline_core::embedding::{EmbeddingResponse, EmbeddingService};
use trace_pipeline_core::error::EmbeddingError;

use crate::config::EmbeddingConfig;

/// Build the embedding service selected by `config.provider`.
pub fn create_service(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingService>> {
    match config.provider.as_str() {
        "http" => {
            let url = config
                .url
                .as_deref()
                .filter(|u| !u.is_empty())
                .ok_or_else(|| anyhow::anyhow!("embedding.url required for the http provider"))?;
            Ok(Arc::new(HttpEmbeddingClient::new(
                url,
                Duration::from_secs(config.timeout_secs),
                config.max_retries,
            )?))
        }
        "hash" => {
            let dims = config
                .dims
                .filter(|d| *d > 0)
                .ok_or_else(|| anyhow::anyhow!("embedding.dims required for the hash provider"))?;
            Ok(Arc::new(HashEmbedder::new(dims)))
        }
        other => bail!("Unknown embedding provider: {}", other),
    }
}

// ============ HTTP Client ============

/// Client for a synchronous text-to-vector HTTP endpoint.
pub struct HttpEmbeddingClient {
    client: reqwest::Client,
    url: String,
    max_retries: u32,
    retry_base_delay: Duration,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

impl HttpEmbeddingClient {
    pub fn new(url: &str, timeout: Duration, max_retries: u32) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client for embedding service")?;
        Ok(Self {
            client,
            url: url.to_string(),
            max_retries,
            retry_base_delay: Duration::from_secs(1),
        })
    }

    /// Override the first backoff delay (doubles per retry).
    pub fn with_retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.retry_base_delay * (1u32 << (attempt - 1).min(5))
    }
}

/// Turn a non-success response into an [`EmbeddingError::Api`].
///
/// Understands `{"error": {"code", "message", "timestamp"}}` and falls back
/// to the raw body.
fn api_error(status: u16, body: &str) -> EmbeddingError {
    match serde_json::from_str::<ApiErrorBody>(body) {
        Ok(parsed) => EmbeddingError::Api {
            status,
            code: parsed.error.code,
            message: parsed.error.message,
        },
        Err(_) => EmbeddingError::Api {
            status,
            code: String::new(),
            message: body.chars().take(500).collect(),
        },
    }
}

#[async_trait]
impl EmbeddingService for HttpEmbeddingClient {
    fn model_name(&self) -> &str {
        &self.url
    }

    async fn embed(&self, text: &str) -> Result<EmbeddingResponse, EmbeddingError> {
        if text.is_empty() {
            return Err(EmbeddingError::EmptyText);
        }
        let body = serde_json::json!({ "text": text });
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = self.backoff(attempt);
                debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying embedding call");
                tokio::time::sleep(delay).await;
            }

            let resp = self.client.post(&self.url).json(&body).send().await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let text = response
                            .text()
                            .await
                            .map_err(|e| EmbeddingError::Transport(e.to_string()))?;
                        return serde_json::from_str(&text)
                            .map_err(|e| EmbeddingError::InvalidResponse(e.to_string()));
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    let err = api_error(status.as_u16(), &body_text);

                    // Rate limited or server error: retry
                    if status.as_u16() == 429 || status.is_server_error() {
                        warn!(status = status.as_u16(), attempt, "embedding service unavailable");
                        last_err = Some(err);
                        continue;
                    }

                    // Client error (not 429): fail now
                    return Err(err);
                }
                Err(e) => {
                    last_err = Some(EmbeddingError::Transport(e.to_string()));
                    continue;
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| EmbeddingError::Transport("embedding failed after retries".into())))
    }
}

// ============ Hash Embedder ============

/// Deterministic embedder: SHA-256 feature hashing of lowercase word
/// tokens into `dims` buckets, L2-normalized.
pub struct HashEmbedder {
    dims: usize,
    model: String,
}

impl HashEmbedder {
    pub fn new(dims: usize) -> Self {
        let dims = dims.max(1);
        Self {
            dims,
            model: format!("sha256-feature-hash-{}", dims),
        }
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn vector(&self, text: &str) -> Vec<f32> {
        let lowered = text.to_lowercase();
        let mut tokens: Vec<&str> = lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .collect();
        if tokens.is_empty() {
            tokens.push(lowered.as_str());
        }

        let mut vector = vec![0f32; self.dims];
        for token in tokens {
            let digest = Sha256::digest(token.as_bytes());
            let mut bucket = [0u8; 8];
            bucket.copy_from_slice(&digest[..8]);
            let index = (u64::from_le_bytes(bucket) % self.dims as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[index] += sign;
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

#[async_trait]
impl EmbeddingService for HashEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn embed(&self, text: &str) -> Result<EmbeddingResponse, EmbeddingError> {
        if text.is_empty() {
            return Err(EmbeddingError::EmptyText);
        }
        let embedding = self.vector(text);
        Ok(EmbeddingResponse {
            dimension: embedding.len(),
            embedding,
            model_version: self.model.clone(),
            processing_time_ms: Some(0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use trace_pipeline_core::embedding::validate_response;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer, retries: u32) -> HttpEmbeddingClient {
        HttpEmbeddingClient::new(
            &format!("{}/embed", server.uri()),
            Duration::from_secs(5),
            retries,
        )
        .unwrap()
        .with_retry_base_delay(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_http_client_parses_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embed"))
            .and(body_json(json!({"text": "Attention. Transformers"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "embedding": [0.1, 0.2, 0.3],
                "model_version": "mini-v2",
                "dimension": 3,
                "processing_time_ms": 12
            })))
            .expect(1)
            .mount(&server)
            .await;

        let response = client(&server, 2)
            .embed("Attention. Transformers")
            .await
            .unwrap();
        assert_eq!(response.embedding, vec![0.1, 0.2, 0.3]);
        assert_eq!(response.model_version, "mini-v2");
        assert_eq!(response.dimension, 3);
        assert_eq!(response.processing_time_ms, Some(12));
    }

    #[tokio::test]
    async fn test_http_client_retries_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .up_to_n_times(2)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "embedding": [1.0],
                "model_version": "v1",
                "dimension": 1
            })))
            .expect(1)
            .mount(&server)
            .await;

        let response = client(&server, 2).embed("text").await.unwrap();
        assert_eq!(response.processing_time_ms, None);
    }

    #[tokio::test]
    async fn test_http_client_gives_up_after_max_retries() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_json(json!({
                "error": {"code": "RATE_LIMITED", "message": "slow down", "timestamp": "2024-01-01T00:00:00Z"}
            })))
            .expect(3)
            .mount(&server)
            .await;

        let err = client(&server, 2).embed("text").await.unwrap_err();
        assert_eq!(
            err,
            EmbeddingError::Api {
                status: 429,
                code: "RATE_LIMITED".into(),
                message: "slow down".into(),
            }
        );
    }

    #[tokio::test]
    async fn test_http_client_does_not_retry_client_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad input"))
            .expect(1)
            .mount(&server)
            .await;

        let err = client(&server, 3).embed("text").await.unwrap_err();
        assert!(matches!(
            err,
            EmbeddingError::Api { status: 400, ref message, .. } if message == "bad input"
        ));
    }

    #[tokio::test]
    async fn test_http_client_rejects_malformed_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{\"vector\": []}"))
            .mount(&server)
            .await;

        let err = client(&server, 0).embed("text").await.unwrap_err();
        assert!(matches!(err, EmbeddingError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn test_hash_embedder_is_deterministic_and_normalized() {
        let embedder = HashEmbedder::new(64);
        let a = embedder.embed("Graph neural networks").await.unwrap();
        let b = embedder.embed("graph NEURAL networks!").await.unwrap();
        assert_eq!(a.embedding, b.embedding);
        assert_eq!(a.dimension, 64);
        validate_response(&a).unwrap();

        let norm: f32 = a.embedding.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);

        let c = embedder.embed("protein folding").await.unwrap();
        assert_ne!(a.embedding, c.embedding);
        assert!(embedder.embed("").await.is_err());
    }

    #[test]
    fn test_create_service_checks_provider_settings() {
        let mut config = EmbeddingConfig {
            provider: "hash".into(),
            dims: Some(8),
            ..Default::default()
        };
        assert!(create_service(&config).unwrap().model_name().contains("8"));

        config.dims = None;
        assert!(create_service(&config).is_err());

        config.provider = "http".into();
        assert!(create_service(&config).is_err());
        config.url = Some("http://localhost:9/embed".into());
        assert!(create_service(&config).is_ok());

        config.provider = "openai".into();
        assert!(create_service(&config).is_err());
    }
}
