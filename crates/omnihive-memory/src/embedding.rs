use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use omnihive_schema::EmbeddingError;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Pluggable embedding backend. Implementations never return vectors of
/// the wrong dimension; backends that cannot guarantee that must check
/// and fail with `DimensionMismatch`.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;
    fn dimension(&self) -> usize;
    fn backend_name(&self) -> &str;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut batch = self.embed_batch(&[text.to_owned()]).await?;
        batch
            .pop()
            .ok_or_else(|| EmbeddingError::Unavailable("backend returned no vectors".into()))
    }
}

// ---------------------------------------------------------------------------
// OpenAI-compatible embedding endpoint
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct OpenAiEmbedding {
    client: reqwest::Client,
    api_key: String,
    model: String,
    dimensions: usize,
    base_url: String,
    timeout: Duration,
}

impl OpenAiEmbedding {
    pub fn new(api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            model: "text-embedding-3-small".to_string(),
            dimensions: 1536,
            base_url: "https://api.openai.com/v1".to_string(),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_model(mut self, model: String, dimensions: usize) -> Self {
        self.model = model;
        self.dimensions = dimensions;
        self
    }

    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Serialize)]
struct OpenAiEmbeddingRequest {
    model: String,
    input: Vec<String>,
    encoding_format: String,
}

#[derive(Deserialize)]
struct OpenAiEmbeddingResponse {
    data: Vec<OpenAiEmbeddingData>,
}

#[derive(Deserialize)]
struct OpenAiEmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbedding {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let endpoint = format!("{}/embeddings", self.base_url.trim_end_matches('/'));
        let request = OpenAiEmbeddingRequest {
            model: self.model.clone(),
            input: texts.to_vec(),
            encoding_format: "float".to_string(),
        };

        let response = self
            .client
            .post(endpoint)
            .header(AUTHORIZATION, format!("Bearer {}", self.api_key))
            .header(CONTENT_TYPE, "application/json")
            .timeout(self.timeout)
            .json(&request)
            .send()
            .await
            .map_err(|e| EmbeddingError::Unavailable(e.to_string()))?
            .error_for_status()
            .map_err(|e| EmbeddingError::Unavailable(e.to_string()))?;

        let parsed: OpenAiEmbeddingResponse = response
            .json()
            .await
            .map_err(|e| EmbeddingError::Unavailable(e.to_string()))?;

        let mut data = parsed.data;
        data.sort_by_key(|item| item.index);
        let embeddings: Vec<Vec<f32>> = data.into_iter().map(|item| item.embedding).collect();

        if embeddings.len() != texts.len() {
            return Err(EmbeddingError::Unavailable(format!(
                "embedding count mismatch: expected {}, got {}",
                texts.len(),
                embeddings.len()
            )));
        }
        if let Some(bad) = embeddings.iter().find(|v| v.len() != self.dimensions) {
            return Err(EmbeddingError::DimensionMismatch {
                expected: self.dimensions,
                got: bad.len(),
            });
        }
        Ok(embeddings)
    }

    fn dimension(&self) -> usize {
        self.dimensions
    }

    fn backend_name(&self) -> &str {
        &self.model
    }
}

// ---------------------------------------------------------------------------
// Ollama
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct OllamaEmbedding {
    client: reqwest::Client,
    model: String,
    dimensions: usize,
    base_url: String,
    timeout: Duration,
}

impl OllamaEmbedding {
    pub fn new(model: String, dimensions: usize) -> Self {
        Self {
            client: reqwest::Client::new(),
            model,
            dimensions,
            base_url: "http://localhost:11434".to_string(),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url;
        self
    }
}

#[derive(Serialize)]
struct OllamaEmbeddingRequest {
    model: String,
    input: Vec<String>,
}

#[derive(Deserialize)]
struct OllamaEmbeddingResponse {
    embeddings: Vec<Vec<f32>>,
}

#[async_trait]
impl EmbeddingProvider for OllamaEmbedding {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let endpoint = format!("{}/api/embed", self.base_url.trim_end_matches('/'));
        let request = OllamaEmbeddingRequest {
            model: self.model.clone(),
            input: texts.to_vec(),
        };

        let response = self
            .client
            .post(&endpoint)
            .header(CONTENT_TYPE, "application/json")
            .timeout(self.timeout)
            .json(&request)
            .send()
            .await
            .map_err(|e| EmbeddingError::Unavailable(e.to_string()))?
            .error_for_status()
            .map_err(|e| EmbeddingError::Unavailable(e.to_string()))?;

        let parsed: OllamaEmbeddingResponse = response
            .json()
            .await
            .map_err(|e| EmbeddingError::Unavailable(e.to_string()))?;

        if parsed.embeddings.len() != texts.len() {
            return Err(EmbeddingError::Unavailable(format!(
                "embedding count mismatch: expected {}, got {}",
                texts.len(),
                parsed.embeddings.len()
            )));
        }
        if let Some(bad) = parsed.embeddings.iter().find(|v| v.len() != self.dimensions) {
            return Err(EmbeddingError::DimensionMismatch {
                expected: self.dimensions,
                got: bad.len(),
            });
        }
        Ok(parsed.embeddings)
    }

    fn dimension(&self) -> usize {
        self.dimensions
    }

    fn backend_name(&self) -> &str {
        &self.model
    }
}

// ---------------------------------------------------------------------------
// Deterministic hash embedding (tests, offline mode)
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct HashEmbedding {
    dims: usize,
}

impl HashEmbedding {
    pub fn new(dims: usize) -> Self {
        Self { dims }
    }

    fn hash_to_unit_range(text: &str, index: usize) -> f32 {
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        hasher.update(index.to_le_bytes());
        let hash = hasher.finalize();
        let value = u32::from_le_bytes([hash[0], hash[1], hash[2], hash[3]]);
        (value as f32 / u32::MAX as f32) * 2.0 - 1.0
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbedding {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Ok(texts
            .iter()
            .map(|text| {
                (0..self.dims)
                    .map(|index| Self::hash_to_unit_range(text, index))
                    .collect()
            })
            .collect())
    }

    fn dimension(&self) -> usize {
        self.dims
    }

    fn backend_name(&self) -> &str {
        "hash"
    }
}

// ---------------------------------------------------------------------------
// SQLite-backed cache wrapper
// ---------------------------------------------------------------------------

fn text_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let digest = hasher.finalize();
    digest[..16].iter().map(|b| format!("{b:02x}")).collect()
}

/// Caches embeddings in the `embedding_cache` table so repeated indexing
/// of unchanged routing text costs nothing.
pub struct CachedEmbedding<P: EmbeddingProvider> {
    inner: P,
    db: Arc<Mutex<Connection>>,
}

impl<P: EmbeddingProvider> CachedEmbedding<P> {
    pub fn new(inner: P, db: Arc<Mutex<Connection>>) -> Self {
        Self { inner, db }
    }

    fn cache_get(&self, hash: &str) -> Option<Vec<f32>> {
        let conn = self.db.lock().ok()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT embedding FROM embedding_cache
                 WHERE provider = ?1 AND model = ?2 AND hash = ?3",
                params!["embedding", self.inner.backend_name(), hash],
                |r| r.get(0),
            )
            .optional()
            .ok()?;
        raw.and_then(|json| serde_json::from_str(&json).ok())
    }

    fn cache_put(&self, hash: &str, embedding: &[f32]) {
        let Ok(conn) = self.db.lock() else { return };
        let json = match serde_json::to_string(embedding) {
            Ok(json) => json,
            Err(_) => return,
        };
        let _ = conn.execute(
            "INSERT OR REPLACE INTO embedding_cache
             (provider, model, hash, embedding, dims, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                "embedding",
                self.inner.backend_name(),
                hash,
                json,
                embedding.len() as i64,
                chrono::Utc::now().timestamp()
            ],
        );
    }
}

#[async_trait]
impl<P: EmbeddingProvider + 'static> EmbeddingProvider for CachedEmbedding<P> {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut results: Vec<Option<Vec<f32>>> = Vec::with_capacity(texts.len());
        let mut pending_indices = Vec::new();
        let mut pending_texts = Vec::new();

        for (i, text) in texts.iter().enumerate() {
            match self.cache_get(&text_hash(text)) {
                Some(embedding) => results.push(Some(embedding)),
                None => {
                    results.push(None);
                    pending_indices.push(i);
                    pending_texts.push(text.clone());
                }
            }
        }

        if !pending_texts.is_empty() {
            let fresh = self.inner.embed_batch(&pending_texts).await?;
            for ((idx, text), embedding) in pending_indices
                .iter()
                .zip(pending_texts.iter())
                .zip(fresh.into_iter())
            {
                self.cache_put(&text_hash(text), &embedding);
                results[*idx] = Some(embedding);
            }
        }

        results
            .into_iter()
            .map(|r| {
                r.ok_or_else(|| {
                    EmbeddingError::Unavailable("backend returned fewer vectors than texts".into())
                })
            })
            .collect()
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    fn backend_name(&self) -> &str {
        self.inner.backend_name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::VectorStore;

    #[tokio::test]
    async fn hash_embedding_is_deterministic() {
        let provider = HashEmbedding::new(8);
        let texts = vec!["same input".to_string()];
        let first = provider.embed_batch(&texts).await.unwrap();
        let second = provider.embed_batch(&texts).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first[0].len(), 8);
    }

    #[tokio::test]
    async fn hash_embedding_varies_by_text() {
        let provider = HashEmbedding::new(8);
        let batch = provider
            .embed_batch(&["alpha".to_string(), "beta".to_string()])
            .await
            .unwrap();
        assert_ne!(batch[0], batch[1]);
    }

    #[tokio::test]
    async fn embed_returns_first_of_batch() {
        let provider = HashEmbedding::new(4);
        let single = provider.embed("hello").await.unwrap();
        let batch = provider
            .embed_batch(&["hello".to_string()])
            .await
            .unwrap();
        assert_eq!(single, batch[0]);
    }

    #[test]
    fn openai_defaults() {
        let provider = OpenAiEmbedding::new("k".into());
        assert_eq!(provider.backend_name(), "text-embedding-3-small");
        assert_eq!(provider.dimension(), 1536);
    }

    #[tokio::test]
    async fn openai_unreachable_maps_to_unavailable() {
        let provider = OpenAiEmbedding::new("k".into())
            .with_base_url("http://127.0.0.1:1".into())
            .with_timeout(Duration::from_millis(200));
        let err = provider
            .embed_batch(&["x".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, EmbeddingError::Unavailable(_)));
    }

    #[tokio::test]
    async fn cached_embedding_hits_after_first_batch() {
        let store = VectorStore::open_in_memory().unwrap();
        let cached = CachedEmbedding::new(HashEmbedding::new(6), store.db());

        let texts = vec!["cache me".to_string()];
        let first = cached.embed_batch(&texts).await.unwrap();
        let second = cached.embed_batch(&texts).await.unwrap();
        assert_eq!(first, second);

        let conn = store.db();
        let conn = conn.lock().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM embedding_cache", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }
}
