//! Embedding providers.
//!
//! - **[`DisabledProvider`]**: rejects every call; used when `embedding.provider = "disabled"`.
//! - **[`OpenAIProvider`]**: `POST {url}/embeddings` (default `https://api.openai.com/v1`),
//!   key from `OPENAI_API_KEY`.
//! - **[`OllamaProvider`]**: `POST {url}/api/embed` on a local Ollama instance.
//!
//! Vectors are stored as little-endian `f32` BLOBs ([`vec_to_blob`] / [`blob_to_vec`]).
//!
//! # Retry Strategy
//!
//! - HTTP 429 and 5xx → retry with exponential backoff
//! - other 4xx → [`EmbeddingError::Permanent`] immediately
//! - network errors → retry
//! - backoff: 1s, 2s, 4s, … capped at 32s; exhausting retries yields
//!   [`EmbeddingError::Transient`]

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use crate::config::EmbeddingConfig;
use crate::error::EmbeddingError;

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Provider identifier stored on queue items (`"openai"`, `"ollama"`).
    fn name(&self) -> &str;
    fn model_name(&self) -> &str;
    fn dims(&self) -> usize;

    /// Embed `texts`, returning one vector of [`dims`](Self::dims) per input, in order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;
}

/// Build the provider named by `embedding.provider`.
pub fn create_provider(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledProvider)),
        "openai" => Ok(Arc::new(OpenAIProvider::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaProvider::new(config)?)),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

// ============ Disabled ============

pub struct DisabledProvider;

#[async_trait]
impl EmbeddingProvider for DisabledProvider {
    fn name(&self) -> &str {
        "disabled"
    }
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Err(EmbeddingError::Permanent(
            "embedding provider is disabled".to_string(),
        ))
    }
}

// ============ Shared HTTP plumbing ============

/// HTTP settings shared by the remote providers.
#[derive(Clone)]
struct HttpEndpoint {
    client: reqwest::Client,
    url: String,
    bearer: Option<String>,
    max_retries: u32,
    backoff: Duration,
}

impl HttpEndpoint {
    fn new(config: &EmbeddingConfig, url: String, bearer: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            url,
            bearer,
            max_retries: config.max_retries,
            backoff: Duration::from_secs(1),
        })
    }

    async fn post_json(&self, label: &str, body: &Value) -> Result<Value, EmbeddingError> {
        let mut last_err = String::new();

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = self.backoff * (1u32 << (attempt - 1).min(5));
                tracing::debug!(provider = label, attempt, ?delay, "retrying embedding request");
                tokio::time::sleep(delay).await;
            }

            let mut request = self.client.post(&self.url).json(body);
            if let Some(key) = &self.bearer {
                request = request.bearer_auth(key);
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return response.json::<Value>().await.map_err(|e| {
                            EmbeddingError::Transient(format!("{} response unreadable: {}", label, e))
                        });
                    }
                    let text = response.text().await.unwrap_or_default();
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = format!("{} API error {}: {}", label, status, text);
                        continue;
                    }
                    return Err(EmbeddingError::Permanent(format!(
                        "{} API error {}: {}",
                        label, status, text
                    )));
                }
                Err(e) => {
                    last_err = format!("{} connection error ({}): {}", label, self.url, e);
                }
            }
        }

        Err(EmbeddingError::Transient(last_err))
    }
}

fn check_dims(vectors: &[Vec<f32>], dims: usize, expected: usize) -> Result<(), EmbeddingError> {
    if vectors.len() != expected {
        return Err(EmbeddingError::Permanent(format!(
            "expected {} embeddings, got {}",
            expected,
            vectors.len()
        )));
    }
    if let Some(bad) = vectors.iter().find(|v| v.len() != dims) {
        return Err(EmbeddingError::Permanent(format!(
            "expected {} dimensions, got {}",
            dims,
            bad.len()
        )));
    }
    Ok(())
}

fn to_f32(values: &[Value]) -> Vec<f32> {
    values
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect()
}

fn required(config: &EmbeddingConfig, provider: &str) -> Result<(String, usize)> {
    let model = config
        .model
        .clone()
        .ok_or_else(|| anyhow::anyhow!("embedding.model required for {} provider", provider))?;
    let dims = config
        .dims
        .ok_or_else(|| anyhow::anyhow!("embedding.dims required for {} provider", provider))?;
    Ok((model, dims))
}

// ============ OpenAI ============

pub struct OpenAIProvider {
    model: String,
    dims: usize,
    endpoint: HttpEndpoint,
}

impl OpenAIProvider {
    /// Fails if `model`/`dims` are unset or `OPENAI_API_KEY` is missing.
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let (model, dims) = required(config, "OpenAI")?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let base = config
            .url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string());
        let url = format!("{}/embeddings", base.trim_end_matches('/'));
        Ok(Self {
            model,
            dims,
            endpoint: HttpEndpoint::new(config, url, Some(api_key))?,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIProvider {
    fn name(&self) -> &str {
        "openai"
    }
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let body = json!({ "model": self.model, "input": texts });
        let response = self.endpoint.post_json("OpenAI", &body).await?;
        let vectors = parse_openai_response(&response)?;
        check_dims(&vectors, self.dims, texts.len())?;
        Ok(vectors)
    }
}

/// `data[].embedding`, reordered by `data[].index`.
fn parse_openai_response(json: &Value) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    let data = json
        .get("data")
        .and_then(Value::as_array)
        .ok_or_else(|| EmbeddingError::Permanent("OpenAI response: missing data array".into()))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .and_then(Value::as_array)
            .ok_or_else(|| EmbeddingError::Permanent("OpenAI response: missing embedding".into()))?;
        let index = item
            .get("index")
            .and_then(Value::as_u64)
            .map(|i| i as usize)
            .unwrap_or(position);
        indexed.push((index, to_f32(embedding)));
    }
    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

// ============ Ollama ============

pub struct OllamaProvider {
    model: String,
    dims: usize,
    endpoint: HttpEndpoint,
}

impl OllamaProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let (model, dims) = required(config, "Ollama")?;
        let base = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());
        let url = format!("{}/api/embed", base.trim_end_matches('/'));
        Ok(Self {
            model,
            dims,
            endpoint: HttpEndpoint::new(config, url, None)?,
        })
    }

    /// Override the first retry delay.
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.endpoint.backoff = backoff;
        self
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaProvider {
    fn name(&self) -> &str {
        "ollama"
    }
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let body = json!({ "model": self.model, "input": texts });
        let response = self.endpoint.post_json("Ollama", &body).await?;
        let vectors = parse_ollama_response(&response)?;
        check_dims(&vectors, self.dims, texts.len())?;
        Ok(vectors)
    }
}

fn parse_ollama_response(json: &Value) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    let embeddings = json
        .get("embeddings")
        .and_then(Value::as_array)
        .ok_or_else(|| {
            EmbeddingError::Permanent("Ollama response: missing embeddings array".into())
        })?;
    embeddings
        .iter()
        .map(|e| {
            e.as_array().map(|a| to_f32(a)).ok_or_else(|| {
                EmbeddingError::Permanent("Ollama response: embedding is not an array".into())
            })
        })
        .collect()
}

// ============ Vector encoding ============

pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    vec.iter().flat_map(|f| f.to_le_bytes()).collect()
}

pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode, routing::post, Json, Router};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn blob_encoding_is_little_endian() {
        let blob = vec_to_blob(&[1.0, -0.5]);
        assert_eq!(blob.len(), 8);
        assert_eq!(&blob[..4], &1.0f32.to_le_bytes());
        assert_eq!(blob_to_vec(&blob), vec![1.0, -0.5]);
    }

    #[test]
    fn openai_response_is_reordered_by_index() {
        let json = json!({
            "data": [
                { "index": 1, "embedding": [2.0, 2.0] },
                { "index": 0, "embedding": [1.0, 1.0] }
            ]
        });
        let vectors = parse_openai_response(&json).unwrap();
        assert_eq!(vectors, vec![vec![1.0, 1.0], vec![2.0, 2.0]]);
        assert!(parse_openai_response(&json!({})).is_err());
    }

    #[test]
    fn dimension_mismatch_is_permanent() {
        let err = check_dims(&[vec![1.0]], 2, 1).unwrap_err();
        assert!(!err.is_transient());
        assert!(check_dims(&[vec![1.0, 2.0]], 2, 2).is_err());
    }

    #[tokio::test]
    async fn disabled_provider_refuses() {
        let provider = create_provider(&EmbeddingConfig::default()).unwrap();
        assert_eq!(provider.model_name(), "disabled");
        let err = provider.embed(&["x".to_string()]).await.unwrap_err();
        assert!(!err.is_transient());
    }

    async fn mock_ollama(failures: usize, status: StatusCode) -> (String, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let app = Router::new().route(
            "/api/embed",
            post(move |Json(body): Json<Value>| {
                let counter = counter.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    if n < failures {
                        return (status, Json(json!({ "error": "busy" })));
                    }
                    let inputs = body["input"].as_array().map(|a| a.len()).unwrap_or(0);
                    let embeddings: Vec<Vec<f32>> = (0..inputs).map(|i| vec![i as f32, 0.5]).collect();
                    (StatusCode::OK, Json(json!({ "embeddings": embeddings })))
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}", addr), calls)
    }

    fn ollama_config(url: String) -> EmbeddingConfig {
        EmbeddingConfig {
            provider: "ollama".into(),
            model: Some("nomic-embed-text".into()),
            dims: Some(2),
            max_retries: 2,
            url: Some(url),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn server_errors_are_retried() {
        let (url, calls) = mock_ollama(1, StatusCode::SERVICE_UNAVAILABLE).await;
        let provider = OllamaProvider::new(&ollama_config(url))
            .unwrap()
            .with_backoff(Duration::from_millis(10));

        let vectors = provider
            .embed(&["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert_eq!(vectors, vec![vec![0.0, 0.5], vec![1.0, 0.5]]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let (url, calls) = mock_ollama(10, StatusCode::BAD_REQUEST).await;
        let provider = OllamaProvider::new(&ollama_config(url))
            .unwrap()
            .with_backoff(Duration::from_millis(10));

        let err = provider.embed(&["a".to_string()]).await.unwrap_err();
        assert!(!err.is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_are_transient() {
        let (url, calls) = mock_ollama(10, StatusCode::TOO_MANY_REQUESTS).await;
        let provider = OllamaProvider::new(&ollama_config(url))
            .unwrap()
            .with_backoff(Duration::from_millis(10));

        let err = provider.embed(&["a".to_string()]).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
