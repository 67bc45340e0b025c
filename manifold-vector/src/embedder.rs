//! Embedding providers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Embedding failures. The hub never falls back to lexical search; callers
/// surface these to the client.
#[derive(Error, Debug, Clone)]
#[error("Embedder error: {0}")]
pub struct EmbedderError(pub String);

/// Turns text into dense vectors.
#[async_trait::async_trait]
pub trait Embedder: Send + Sync {
    /// Model identifier, recorded alongside stored vectors.
    fn model(&self) -> &str;

    /// Embed a batch of texts; the output order matches the input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedderError>;
}

/// OpenAI-compatible `/v1/embeddings` client.
pub struct HttpEmbedder {
    http: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    index: usize,
    embedding: Vec<f32>,
}

impl HttpEmbedder {
    pub fn new(endpoint: impl Into<String>, model: impl Into<String>, api_key: Option<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("default reqwest client");
        Self {
            http,
            endpoint: endpoint.into(),
            model: model.into(),
            api_key,
        }
    }
}

#[async_trait::async_trait]
impl Embedder for HttpEmbedder {
    fn model(&self) -> &str {
        &self.model
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedderError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut request = self.http.post(&self.endpoint).json(&serde_json::json!({
            "model": self.model,
            "input": texts,
        }));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| EmbedderError(format!("request failed: {}", e)))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EmbedderError(format!("endpoint returned {}: {}", status, body)));
        }

        let parsed: EmbeddingsResponse = response
            .json()
            .await
            .map_err(|e| EmbedderError(format!("malformed response: {}", e)))?;
        if parsed.data.len() != texts.len() {
            return Err(EmbedderError(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                parsed.data.len()
            )));
        }

        let mut ordered = parsed.data;
        ordered.sort_by_key(|d| d.index);
        Ok(ordered.into_iter().map(|d| d.embedding).collect())
    }
}

/// Deterministic embedder for tests and offline runs: every distinct text
/// maps to a stable unit-norm vector, with optional per-text overrides.
pub struct MockEmbedder {
    dim: usize,
    overrides: Mutex<HashMap<String, Vec<f32>>>,
    calls: AtomicUsize,
}

impl MockEmbedder {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            overrides: Mutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Pin the vector returned for one exact text.
    pub fn set_vector(&self, text: impl Into<String>, vector: Vec<f32>) {
        self.overrides
            .lock()
            .expect("overrides lock poisoned")
            .insert(text.into(), vector);
    }

    /// Number of `embed` invocations so far.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn derive(&self, text: &str) -> Vec<f32> {
        // FNV-style rolling hash seeds each component; stable across runs.
        let mut state: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in text.bytes() {
            state ^= u64::from(byte);
            state = state.wrapping_mul(0x0000_0100_0000_01b3);
        }
        let mut vector = Vec::with_capacity(self.dim);
        for i in 0..self.dim {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407 ^ i as u64);
            vector.push(((state >> 33) as f32 / (1u64 << 31) as f32) - 1.0);
        }
        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

#[async_trait::async_trait]
impl Embedder for MockEmbedder {
    fn model(&self) -> &str {
        "mock-embedder"
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let overrides = self.overrides.lock().expect("overrides lock poisoned");
        Ok(texts
            .iter()
            .map(|text| overrides.get(text).cloned().unwrap_or_else(|| self.derive(text)))
            .collect())
    }
}
