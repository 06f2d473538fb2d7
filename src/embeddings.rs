//! Embedding capability: text -> fixed-dimension vector
//!
//! Two implementations:
//! - `HttpEmbedder`: OpenAI-compatible embeddings endpoint
//! - `HashEmbedder`: deterministic local fallback (free, offline, lower quality)
//!
//! Recently computed embeddings are cached in an LRU so repeated queries and
//! reinforced insights do not re-hit the API.

use async_trait::async_trait;
use lru::LruCache;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::error::{PlaybookError, Result};

/// Text-to-vector capability consumed by the engine and refiner
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Dimension of produced vectors
    fn dimension(&self) -> usize;
}

/// Embedding provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Endpoint base URL (OpenAI-compatible `/embeddings` route)
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Model name
    #[serde(default = "default_model_name")]
    pub model_name: String,
    /// API key; if None, read from `ACE_EMBEDDING_API_KEY`
    #[serde(skip)]
    pub api_key: Option<String>,
    /// Embedding dimension
    #[serde(default = "default_embedding_dim")]
    pub embedding_dim: usize,
    /// Rough input cap, in characters
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
    /// LRU cache capacity
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,
    /// Request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_endpoint() -> String {
    "https://api.openai.com/v1/embeddings".to_string()
}

fn default_model_name() -> String {
    "text-embedding-3-small".to_string()
}

fn default_embedding_dim() -> usize {
    1536
}

fn default_max_chars() -> usize {
    8000
}

fn default_cache_size() -> usize {
    1000
}

fn default_timeout_secs() -> u64 {
    30
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            model_name: default_model_name(),
            api_key: None,
            embedding_dim: default_embedding_dim(),
            max_chars: default_max_chars(),
            cache_size: default_cache_size(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// OpenAI-compatible HTTP embedder with an LRU cache
pub struct HttpEmbedder {
    config: EmbeddingConfig,
    client: Client,
    cache: Arc<RwLock<LruCache<String, Vec<f32>>>>,
}

impl HttpEmbedder {
    pub fn new(mut config: EmbeddingConfig) -> Result<Self> {
        if config.api_key.is_none() {
            if let Ok(key) = std::env::var("ACE_EMBEDDING_API_KEY") {
                if !key.is_empty() {
                    config.api_key = Some(key);
                }
            }
        }
        if config.api_key.is_none() {
            return Err(PlaybookError::Embedding(
                "no API key configured for embeddings".to_string(),
            ));
        }

        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| PlaybookError::Embedding(e.to_string()))?;

        let capacity = NonZeroUsize::new(config.cache_size.max(1)).unwrap_or(NonZeroUsize::MIN);
        let cache = Arc::new(RwLock::new(LruCache::new(capacity)));

        info!("Initialized embedding client: {}", config.model_name);
        Ok(Self {
            config,
            client,
            cache,
        })
    }

    async fn embed_via_api(&self, text: &str) -> Result<Vec<f32>> {
        let api_key = self
            .config
            .api_key
            .as_ref()
            .ok_or_else(|| PlaybookError::Embedding("API key missing".to_string()))?;

        let text = truncate_chars(text, self.config.max_chars);
        let request = EmbeddingRequest {
            model: self.config.model_name.clone(),
            input: vec![text.to_string()],
        };

        let response = self
            .client
            .post(&self.config.endpoint)
            .bearer_auth(api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| PlaybookError::Embedding(format!("request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!("Embedding API error ({}): {}", status, body);
            return Err(PlaybookError::Embedding(format!(
                "API returned {status}: {body}"
            )));
        }

        let result: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| PlaybookError::Embedding(format!("bad response body: {e}")))?;

        result
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| PlaybookError::Embedding("empty embedding response".to_string()))
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        {
            let mut cache = self.cache.write().await;
            if let Some(cached) = cache.get(text) {
                return Ok(cached.clone());
            }
        }

        let embedding = self.embed_via_api(text).await?;

        {
            let mut cache = self.cache.write().await;
            cache.put(text.to_string(), embedding.clone());
        }

        Ok(embedding)
    }

    fn dimension(&self) -> usize {
        self.config.embedding_dim
    }
}

/// Deterministic hash-based embedder. No model, no network; quality is low
/// but identical text always maps to the same unit vector, which is what the
/// offline path and the tests need.
pub struct HashEmbedder {
    dim: usize,
}

impl HashEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim: dim.max(8) }
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut embedding = vec![0.0f32; self.dim];
        for (i, token) in text.split_whitespace().enumerate() {
            let mut hasher = DefaultHasher::new();
            token.to_lowercase().hash(&mut hasher);
            (i as u64).hash(&mut hasher);
            let hash = hasher.finish();

            for (j, slot) in embedding.iter_mut().enumerate() {
                let mut hasher = DefaultHasher::new();
                hash.hash(&mut hasher);
                (j as u64).hash(&mut hasher);
                let val = hasher.finish();
                let normalized = (val as f64 / u64::MAX as f64) * 2.0 - 1.0;
                *slot += normalized as f32;
            }
        }

        let mag: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
        if mag > 0.0 {
            for val in embedding.iter_mut() {
                *val /= mag;
            }
        }

        Ok(embedding)
    }

    fn dimension(&self) -> usize {
        self.dim
    }
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest {
    model: String,
    input: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

/// Truncate on a char boundary
fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Cosine similarity between two vectors; 0.0 on dimension mismatch or a
/// zero-magnitude input
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }

    dot / (mag_a * mag_b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hash_embedder_is_deterministic_and_normalized() {
        let embedder = HashEmbedder::new(64);

        let emb1 = embedder.embed("hello world").await.unwrap();
        let emb2 = embedder.embed("hello world").await.unwrap();
        let emb3 = embedder.embed("goodbye moon").await.unwrap();

        assert_eq!(emb1, emb2);
        assert_ne!(emb1, emb3);

        let mag: f32 = emb1.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((mag - 1.0).abs() < 0.001);
    }

    #[test]
    fn cosine_similarity_basics() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![1.0, 0.0, 0.0];
        let c = vec![0.0, 1.0, 0.0];

        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 0.001);
        assert!(cosine_similarity(&a, &c).abs() < 0.001);
        assert_eq!(cosine_similarity(&a, &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("hi", 10), "hi");
    }
}
