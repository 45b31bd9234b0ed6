use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::config::settings::{EmbeddingModelConfig, EmbeddingProviderKind};

#[derive(Debug, Clone, thiserror::Error)]
pub enum EmbeddingError {
    /// The provider is configured but not answering or the model is missing.
    /// Needs user remediation, never retried automatically.
    #[error("{0}")]
    Unavailable(String),

    #[error("embedding request failed: {0}")]
    Failed(String),

    #[error("embedding count mismatch: sent {sent}, got {got}")]
    CountMismatch { sent: usize, got: usize },

    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
}

/// Turns text chunks into fixed-length vectors.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn model_id(&self) -> &str;

    fn dimensions(&self) -> usize;

    /// Embeds `texts`, returning one vector per input in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;
}

pub type EmbedderFactory =
    Arc<dyn Fn(&EmbeddingModelConfig) -> Result<Arc<dyn EmbeddingProvider>, EmbeddingError> + Send + Sync>;

pub fn default_embedder_factory() -> EmbedderFactory {
    Arc::new(build_embedder)
}

pub fn build_embedder(config: &EmbeddingModelConfig) -> Result<Arc<dyn EmbeddingProvider>, EmbeddingError> {
    let provider: Arc<dyn EmbeddingProvider> = match config.provider {
        EmbeddingProviderKind::OpenAi => Arc::new(OpenAiEmbedder::new(config)?),
        EmbeddingProviderKind::Ollama => Arc::new(OllamaEmbedder::new(config)?),
    };
    Ok(provider)
}

fn http_client(timeout_secs: u64) -> Result<reqwest::Client, EmbeddingError> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs.max(1)))
        .build()
        .map_err(|e| EmbeddingError::Failed(format!("failed to build http client: {}", e)))
}

fn classify_transport(err: reqwest::Error, endpoint: &str) -> EmbeddingError {
    if err.is_connect() || err.is_timeout() {
        EmbeddingError::Unavailable(format!("embedding server at {} is not reachable: {}", endpoint, err))
    } else {
        EmbeddingError::Failed(err.to_string())
    }
}

fn classify_status(status: StatusCode, body: String, model: &str) -> EmbeddingError {
    if status == StatusCode::NOT_FOUND || status.is_server_error() || body.contains("not found") {
        EmbeddingError::Unavailable(format!(
            "embedding model '{}' is not available (server returned {}: {})",
            model, status, body
        ))
    } else {
        EmbeddingError::Failed(format!("server returned {}: {}", status, body))
    }
}

fn check_vectors(
    vectors: Vec<Vec<f32>>,
    sent: usize,
    expected: usize,
) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    if vectors.len() != sent {
        return Err(EmbeddingError::CountMismatch {
            sent,
            got: vectors.len(),
        });
    }
    if let Some(bad) = vectors.iter().find(|v| v.len() != expected) {
        return Err(EmbeddingError::DimensionMismatch {
            expected,
            got: bad.len(),
        });
    }
    Ok(vectors)
}

/// OpenAI-compatible `/embeddings` endpoint (OpenAI, LM Studio, llama-server).
pub struct OpenAiEmbedder {
    http: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    dimensions: usize,
}

#[derive(Debug, Serialize)]
struct OpenAiEmbeddingsRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct OpenAiEmbeddingsResponse {
    data: Vec<OpenAiEmbeddingDatum>,
}

#[derive(Debug, Deserialize)]
struct OpenAiEmbeddingDatum {
    #[serde(default)]
    index: Option<usize>,
    #[serde(default)]
    embedding: Vec<f32>,
}

impl OpenAiEmbedder {
    pub fn new(config: &EmbeddingModelConfig) -> Result<Self, EmbeddingError> {
        Ok(Self {
            http: http_client(config.timeout_secs)?,
            base_url: config.endpoint.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key: config.api_key.clone(),
            dimensions: config.dimensions,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbedder {
    fn model_id(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let url = format!("{}/embeddings", self.base_url);
        let mut request = self.http.post(&url).json(&OpenAiEmbeddingsRequest {
            model: &self.model,
            input: texts,
        });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| classify_transport(e, &self.base_url))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, body, &self.model));
        }

        let parsed: OpenAiEmbeddingsResponse = response
            .json()
            .await
            .map_err(|e| EmbeddingError::Failed(format!("malformed embeddings response: {}", e)))?;

        // Some servers do not return data in input order.
        let mut pairs: Vec<(usize, Vec<f32>)> = parsed
            .data
            .into_iter()
            .enumerate()
            .map(|(pos, d)| (d.index.unwrap_or(pos), d.embedding))
            .collect();
        pairs.sort_by_key(|(i, _)| *i);

        check_vectors(
            pairs.into_iter().map(|(_, v)| v).collect(),
            texts.len(),
            self.dimensions,
        )
    }
}

/// Local Ollama daemon, `/api/embed`.
pub struct OllamaEmbedder {
    http: reqwest::Client,
    base_url: String,
    model: String,
    dimensions: usize,
}

#[derive(Debug, Serialize)]
struct OllamaEmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct OllamaEmbedResponse {
    #[serde(default)]
    embeddings: Vec<Vec<f32>>,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingModelConfig) -> Result<Self, EmbeddingError> {
        Ok(Self {
            http: http_client(config.timeout_secs)?,
            base_url: config.endpoint.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            dimensions: config.dimensions,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaEmbedder {
    fn model_id(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let url = format!("{}/api/embed", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&OllamaEmbedRequest {
                model: &self.model,
                input: texts,
            })
            .send()
            .await
            .map_err(|e| classify_transport(e, &self.base_url))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, body, &self.model));
        }

        let parsed: OllamaEmbedResponse = response
            .json()
            .await
            .map_err(|e| EmbeddingError::Failed(format!("malformed embed response: {}", e)))?;
        check_vectors(parsed.embeddings, texts.len(), self.dimensions)
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let mut dot_product = 0.0;
    let mut norm_a = 0.0;
    let mut norm_b = 0.0;
    for (x, y) in a.iter().zip(b.iter()) {
        dot_product += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a > 0.0 && norm_b > 0.0 {
        dot_product / (norm_a.sqrt() * norm_b.sqrt())
    } else {
        0.0
    }
}
