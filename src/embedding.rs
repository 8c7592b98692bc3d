//! Embedding provider abstraction and implementations.
//!
//! Defines the [`Embedder`] trait and concrete implementations:
//! - **[`DisabledEmbedder`]** — reports unavailable; used when embeddings
//!   are not configured. Hybrid search degrades to keyword-only.
//! - **[`OllamaEmbedder`]** — calls a local Ollama instance's `/api/embed`
//!   endpoint with batching, retry, and exponential backoff.
//! - **[`HashEmbedder`]** — deterministic local projection from a SHA-256
//!   stream; no network, stable across processes. Useful for tests and
//!   fully offline installs.
//!
//! Every provider returns unit-normalized vectors of a fixed dimension;
//! normalization is enforced here rather than trusted from the backend.
//!
//! Also provides vector utilities:
//! - [`cosine_similarity`] — similarity between two embedding vectors
//! - [`vec_to_blob`] — encode a `Vec<f32>` as little-endian bytes for BLOB storage
//! - [`blob_to_vec`] — decode a BLOB back into a `Vec<f32>`

use async_trait::async_trait;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::time::Duration;

use crate::config::EmbeddingConfig;
use crate::error::{Error, Result};

/// A backend that turns text into fixed-dimension unit vectors.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Model identifier recorded with every stored embedding.
    fn model_id(&self) -> &str;

    /// Vector dimensionality; constant per model id.
    fn dims(&self) -> usize;

    /// Embed a batch of texts, one vector per input, in order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Embed a single query text.
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed(&[text.to_string()]).await?;
        if vectors.is_empty() {
            return Err(Error::DependencyUnavailable(
                "embedder returned empty response".into(),
            ));
        }
        Ok(vectors.remove(0))
    }
}

/// Instantiate the provider selected by configuration.
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Box<dyn Embedder>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledEmbedder)),
        "ollama" => Ok(Box::new(OllamaEmbedder::new(config)?)),
        "hash" => Ok(Box::new(HashEmbedder::new(config)?)),
        other => Err(Error::ValidationFailed {
            field: "embedding.provider".into(),
            reason: format!("unknown provider '{other}'"),
        }),
    }
}

// ============ Disabled ============

/// Provider used when embeddings are not configured. Any embed attempt
/// reports the dependency as unavailable so callers can degrade.
pub struct DisabledEmbedder;

#[async_trait]
impl Embedder for DisabledEmbedder {
    fn model_id(&self) -> &str {
        "disabled"
    }

    fn dims(&self) -> usize {
        0
    }

    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Err(Error::DependencyUnavailable("embedding provider is disabled".into()))
    }
}

// ============ Ollama ============

/// Embedding provider backed by a local Ollama instance.
///
/// Calls `POST {endpoint}/api/embed`. Transient failures (network errors,
/// HTTP 429/5xx) retry with exponential backoff: 1s, 2s, 4s, ... capped at
/// 2^5; other HTTP errors fail immediately.
pub struct OllamaEmbedder {
    model: String,
    dims: usize,
    endpoint: String,
    max_retries: u32,
    timeout: Duration,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config.model.clone().ok_or_else(|| Error::ValidationFailed {
            field: "embedding.model".into(),
            reason: "required for the ollama provider".into(),
        })?;
        let dims = config.dims.ok_or_else(|| Error::ValidationFailed {
            field: "embedding.dims".into(),
            reason: "required for the ollama provider".into(),
        })?;
        Ok(Self {
            model,
            dims,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            max_retries: config.max_retries,
            timeout: Duration::from_secs(config.timeout_secs),
        })
    }
}

#[derive(Deserialize)]
struct OllamaEmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn model_id(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let client = reqwest::Client::builder().timeout(self.timeout).build()?;
        let url = format!("{}/api/embed", self.endpoint);
        let body = serde_json::json!({ "model": self.model, "input": texts });

        let mut attempt = 0u32;
        loop {
            let response = client.post(&url).json(&body).send().await;
            let retry_after = match response {
                Ok(resp) if resp.status().is_success() => {
                    let parsed: OllamaEmbedResponse = resp.json().await?;
                    if parsed.embeddings.len() != texts.len() {
                        return Err(Error::DependencyUnavailable(format!(
                            "embedder returned {} vectors for {} inputs",
                            parsed.embeddings.len(),
                            texts.len()
                        )));
                    }
                    let mut vectors = parsed.embeddings;
                    for vector in &mut vectors {
                        if vector.len() != self.dims {
                            return Err(Error::DependencyUnavailable(format!(
                                "embedder returned dim {} (expected {})",
                                vector.len(),
                                self.dims
                            )));
                        }
                        normalize(vector);
                    }
                    return Ok(vectors);
                }
                Ok(resp) => {
                    let status = resp.status();
                    if status.as_u16() == 429 || status.is_server_error() {
                        true
                    } else {
                        return Err(Error::DependencyUnavailable(format!(
                            "embedder returned HTTP {status}"
                        )));
                    }
                }
                Err(_) => true,
            };

            if !retry_after || attempt >= self.max_retries {
                return Err(Error::DependencyUnavailable(format!(
                    "embedder unreachable after {attempt} retries"
                )));
            }
            let backoff = Duration::from_secs(1 << attempt.min(5));
            tokio::time::sleep(backoff).await;
            attempt += 1;
        }
    }
}

// ============ Hash projection ============

/// Deterministic local embedder.
///
/// Expands `sha256(model_id ∥ text)` into a pseudo-random unit vector by
/// repeated hashing. Identical text always yields the identical vector, and
/// distinct texts land near-orthogonal, which is what the retrieval tests
/// and fully offline installs need.
pub struct HashEmbedder {
    model: String,
    dims: usize,
}

impl HashEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let dims = config.dims.ok_or_else(|| Error::ValidationFailed {
            field: "embedding.dims".into(),
            reason: "required for the hash provider".into(),
        })?;
        Ok(Self {
            model: config
                .model
                .clone()
                .unwrap_or_else(|| "hash-projection-v1".to_string()),
            dims,
        })
    }

    fn project(&self, text: &str) -> Vec<f32> {
        let mut vector = Vec::with_capacity(self.dims);
        let mut seed = Sha256::new()
            .chain_update(self.model.as_bytes())
            .chain_update([0])
            .chain_update(text.as_bytes())
            .finalize();

        'outer: loop {
            for window in seed.chunks_exact(4) {
                let bits = u32::from_le_bytes([window[0], window[1], window[2], window[3]]);
                // Map to [-1, 1).
                let value = (bits as f64 / u32::MAX as f64) * 2.0 - 1.0;
                vector.push(value as f32);
                if vector.len() == self.dims {
                    break 'outer;
                }
            }
            seed = Sha256::digest(seed);
        }

        normalize(&mut vector);
        vector
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn model_id(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.project(t)).collect())
    }
}

// ============ Vector utilities ============

/// Scale a vector to unit length in place. Zero vectors are left as-is.
pub fn normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|v| (*v as f64) * (*v as f64)).sum::<f64>().sqrt();
    if norm > f64::EPSILON {
        for value in vector.iter_mut() {
            *value = (*value as f64 / norm) as f32;
        }
    }
}

/// Cosine similarity between two vectors. Mismatched lengths score zero.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += *x as f64 * *y as f64;
        norm_a += *x as f64 * *x as f64;
        norm_b += *y as f64 * *y as f64;
    }
    if norm_a <= f64::EPSILON || norm_b <= f64::EPSILON {
        return 0.0;
    }
    (dot / (norm_a.sqrt() * norm_b.sqrt())) as f32
}

/// Encode a vector as little-endian bytes for SQLite BLOB storage.
pub fn vec_to_blob(vector: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(vector.len() * 4);
    for value in vector {
        blob.extend_from_slice(&value.to_le_bytes());
    }
    blob
}

/// Decode a SQLite BLOB back into a vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}
