//! HTTP embedding providers.
//!
//! Implements the core [`Embedder`] trait for:
//! - **[`OpenAiEmbedder`]**: `POST {url}/embeddings` on the OpenAI API or any
//!   compatible endpoint.
//! - **[`OllamaEmbedder`]**: `POST {url}/api/embed` on a local Ollama instance.
//!
//! Each `embed` call makes exactly one HTTP request. Retries, backoff and
//! timeouts are applied by the caller through [`crate::retry`], so the
//! providers only classify failures:
//! - HTTP 429 → [`SyncError::RateLimited`] with the `Retry-After` delay
//! - HTTP 5xx and network errors → [`SyncError::EmbeddingService`] (retryable)
//! - other HTTP 4xx and malformed responses → [`SyncError::Rejected`]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use reqwest::StatusCode;

use corpus_sync_core::embedding::Embedder;
use corpus_sync_core::error::SyncError;

use crate::config::EmbeddingConfig;

const OPENAI_DEFAULT_URL: &str = "https://api.openai.com/v1";
const OLLAMA_DEFAULT_URL: &str = "http://localhost:11434";

/// Build the configured embedder, or `None` when embedding is disabled.
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Option<Arc<dyn Embedder>>> {
    if !config.enabled {
        return Ok(None);
    }
    let model = config
        .model
        .clone()
        .ok_or_else(|| anyhow::anyhow!("embedding.model required when embedding is enabled"))?;
    let dims = config
        .dims
        .ok_or_else(|| anyhow::anyhow!("embedding.dims required when embedding is enabled"))?;
    let client = reqwest::Client::builder().build()?;

    match config.provider.as_str() {
        "openai" => {
            let api_key = std::env::var(&config.api_key_env).map_err(|_| {
                anyhow::anyhow!("{} environment variable not set", config.api_key_env)
            })?;
            Ok(Some(Arc::new(OpenAiEmbedder {
                client,
                url: config.url.clone().unwrap_or_else(|| OPENAI_DEFAULT_URL.to_string()),
                api_key,
                model,
                dims,
            })))
        }
        "ollama" => Ok(Some(Arc::new(OllamaEmbedder {
            client,
            url: config.url.clone().unwrap_or_else(|| OLLAMA_DEFAULT_URL.to_string()),
            model,
            dims,
        }))),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

/// Embedding provider using the OpenAI API (or a compatible server).
pub struct OpenAiEmbedder {
    client: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
    dims: usize,
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, SyncError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let response = self
            .client
            .post(format!("{}/embeddings", self.url.trim_end_matches('/')))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| SyncError::EmbeddingService(format!("OpenAI request failed: {}", e)))?;

        let json = read_json(response, "OpenAI").await?;
        let vectors = parse_openai_response(&json)?;
        check_shape(&vectors, texts.len(), self.dims)?;
        Ok(vectors)
    }
}

/// Embedding provider using a local Ollama instance.
pub struct OllamaEmbedder {
    client: reqwest::Client,
    url: String,
    model: String,
    dims: usize,
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, SyncError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let response = self
            .client
            .post(format!("{}/api/embed", self.url.trim_end_matches('/')))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                SyncError::EmbeddingService(format!(
                    "Ollama connection error (is Ollama running at {}?): {}",
                    self.url, e
                ))
            })?;

        let json = read_json(response, "Ollama").await?;
        let vectors = parse_ollama_response(&json)?;
        check_shape(&vectors, texts.len(), self.dims)?;
        Ok(vectors)
    }
}

async fn read_json(response: reqwest::Response, provider: &str) -> Result<serde_json::Value, SyncError> {
    let status = response.status();
    if status.is_success() {
        return response
            .json()
            .await
            .map_err(|e| SyncError::EmbeddingService(format!("{} response unreadable: {}", provider, e)));
    }
    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_retry_after);
    let body_text = response.text().await.unwrap_or_default();
    Err(classify_status(status, retry_after, &format!("{} API error {}: {}", provider, status, body_text)))
}

/// Map a non-success HTTP status to a [`SyncError`].
pub fn classify_status(status: StatusCode, retry_after: Option<Duration>, message: &str) -> SyncError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        SyncError::RateLimited { retry_after }
    } else if status.is_server_error() {
        SyncError::EmbeddingService(message.to_string())
    } else {
        SyncError::Rejected(message.to_string())
    }
}

/// `Retry-After` in delta-seconds form. HTTP-date values are ignored.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

fn check_shape(vectors: &[Vec<f32>], expected: usize, dims: usize) -> Result<(), SyncError> {
    if vectors.len() != expected {
        return Err(SyncError::Rejected(format!(
            "expected {} embeddings, got {}",
            expected,
            vectors.len()
        )));
    }
    if let Some(v) = vectors.iter().find(|v| v.len() != dims) {
        return Err(SyncError::Rejected(format!(
            "embedding has {} dims, configured {}",
            v.len(),
            dims
        )));
    }
    Ok(())
}

fn parse_float_array(value: &serde_json::Value) -> Option<Vec<f32>> {
    value
        .as_array()
        .map(|a| a.iter().map(|v| v.as_f64().unwrap_or(0.0) as f32).collect())
}

/// Extract `data[].embedding`, ordered by `data[].index` when present.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, SyncError> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| SyncError::Rejected("Invalid OpenAI response: missing data array".into()))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (pos, item) in data.iter().enumerate() {
        let vector = item
            .get("embedding")
            .and_then(parse_float_array)
            .ok_or_else(|| SyncError::Rejected("Invalid OpenAI response: missing embedding".into()))?;
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(pos);
        indexed.push((index, vector));
    }
    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, SyncError> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| SyncError::Rejected("Invalid Ollama response: missing embeddings array".into()))?;
    embeddings
        .iter()
        .map(|e| {
            parse_float_array(e)
                .ok_or_else(|| SyncError::Rejected("Invalid Ollama response: embedding is not an array".into()))
        })
        .collect()
}
