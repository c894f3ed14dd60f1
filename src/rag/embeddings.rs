use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Serialize;

use crate::config::Settings;
use crate::models::{EmbeddingRequest, EmbeddingResponse};

pub const DEFAULT_DIMENSION: usize = 768;

/// Result of one call to a remote embedding API.
#[derive(Debug, Clone, PartialEq)]
pub enum EmbeddingOutcome {
    Success(Vec<Vec<f32>>),
    AuthError,
    AccessDenied,
    RateLimited,
    ServerError(u16),
    NetworkError(String),
    Malformed(String),
}

impl EmbeddingOutcome {
    fn describe(&self) -> String {
        match self {
            EmbeddingOutcome::Success(_) => "ok".to_string(),
            EmbeddingOutcome::AuthError => "invalid or missing API key".to_string(),
            EmbeddingOutcome::AccessDenied => "access denied".to_string(),
            EmbeddingOutcome::RateLimited => "rate limited".to_string(),
            EmbeddingOutcome::ServerError(status) => format!("provider returned {}", status),
            EmbeddingOutcome::NetworkError(e) => format!("network error: {}", e),
            EmbeddingOutcome::Malformed(e) => format!("malformed response: {}", e),
        }
    }
}

#[async_trait]
pub trait EmbeddingApi: Send + Sync {
    async fn request(&self, texts: &[String]) -> EmbeddingOutcome;
}

/// Jina-compatible `/v1/embeddings` client.
pub struct JinaEmbeddings {
    client: Client,
    url: String,
    api_key: String,
    model: String,
}

impl JinaEmbeddings {
    pub fn new(url: String, api_key: String, model: String, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            url,
            api_key,
            model,
        })
    }
}

#[async_trait]
impl EmbeddingApi for JinaEmbeddings {
    async fn request(&self, texts: &[String]) -> EmbeddingOutcome {
        let body = EmbeddingRequest {
            input: texts.to_vec(),
            model: self.model.clone(),
        };

        let response = match self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => return EmbeddingOutcome::NetworkError(e.to_string()),
        };

        match response.status() {
            StatusCode::UNAUTHORIZED => return EmbeddingOutcome::AuthError,
            StatusCode::FORBIDDEN => return EmbeddingOutcome::AccessDenied,
            StatusCode::TOO_MANY_REQUESTS => return EmbeddingOutcome::RateLimited,
            status if !status.is_success() => return EmbeddingOutcome::ServerError(status.as_u16()),
            _ => {}
        }

        let parsed: EmbeddingResponse = match response.json().await {
            Ok(parsed) => parsed,
            Err(e) => return EmbeddingOutcome::Malformed(e.to_string()),
        };

        let vectors: Vec<Vec<f32>> = parsed.data.into_iter().map(|d| d.embedding).collect();
        if vectors.len() != texts.len() {
            return EmbeddingOutcome::Malformed(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                vectors.len()
            ));
        }
        if let Some(first) = vectors.first() {
            if first.is_empty() || vectors.iter().any(|v| v.len() != first.len()) {
                return EmbeddingOutcome::Malformed("inconsistent embedding dimensions".to_string());
            }
        }
        EmbeddingOutcome::Success(vectors)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingMode {
    Remote,
    Fallback,
}

/// Text to vector conversion that never fails.
///
/// With a remote API configured, every call goes to it first; any failure
/// (credential, network, rate limit, bad payload) degrades to the local
/// hashed bag-of-words vector and bumps the fallback counter.
pub struct Embedder {
    remote: Option<Arc<dyn EmbeddingApi>>,
    dimension: usize,
    fallbacks: AtomicU64,
}

impl Embedder {
    pub fn new(remote: Option<Arc<dyn EmbeddingApi>>, dimension: usize) -> Self {
        Self {
            remote,
            dimension,
            fallbacks: AtomicU64::new(0),
        }
    }

    pub fn local(dimension: usize) -> Self {
        Self::new(None, dimension)
    }

    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let remote: Option<Arc<dyn EmbeddingApi>> = match settings.jina_api_key.clone() {
            Some(api_key) => Some(Arc::new(JinaEmbeddings::new(
                settings.jina_api_url.clone(),
                api_key,
                settings.embedding_model.clone(),
                settings.http_timeout(),
            )?)),
            None => {
                tracing::warn!("JINA_API_KEY not set, using fallback embeddings");
                None
            }
        };
        Ok(Self::new(remote, settings.embedding_dimension))
    }

    pub fn mode(&self) -> EmbeddingMode {
        if self.remote.is_some() {
            EmbeddingMode::Remote
        } else {
            EmbeddingMode::Fallback
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Number of calls answered by the fallback since startup.
    pub fn fallback_count(&self) -> u64 {
        self.fallbacks.load(Ordering::Relaxed)
    }

    pub async fn embed(&self, text: &str) -> Vec<f32> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await;
        vectors.pop().unwrap_or_else(|| fallback_embedding(text, self.dimension))
    }

    /// One vector per input, in input order.
    pub async fn embed_batch(&self, texts: &[String]) -> Vec<Vec<f32>> {
        if texts.is_empty() {
            return Vec::new();
        }

        let Some(remote) = self.remote.as_ref() else {
            self.fallbacks.fetch_add(1, Ordering::Relaxed);
            return self.fallback_batch(texts);
        };

        match remote.request(texts).await {
            EmbeddingOutcome::Success(vectors) => vectors,
            outcome @ (EmbeddingOutcome::AuthError | EmbeddingOutcome::AccessDenied) => {
                tracing::warn!("Embedding API rejected credentials ({}), using fallback embeddings", outcome.describe());
                self.degrade(texts)
            }
            outcome => {
                tracing::warn!("Embedding API failed ({}), using fallback embeddings", outcome.describe());
                self.degrade(texts)
            }
        }
    }

    fn degrade(&self, texts: &[String]) -> Vec<Vec<f32>> {
        self.fallbacks.fetch_add(1, Ordering::Relaxed);
        self.fallback_batch(texts)
    }

    fn fallback_batch(&self, texts: &[String]) -> Vec<Vec<f32>> {
        texts
            .iter()
            .map(|text| fallback_embedding(text, self.dimension))
            .collect()
    }
}

/// Deterministic, network-free embedding.
///
/// Each lower-cased whitespace token hashes to the sum of its UTF-16 code
/// units; bucket `hash % dimension` accumulates `1 / (position + 1)`. The
/// result is L2-normalized unless it is all zeros.
///
/// Tokens come from `split_whitespace`, so leading, trailing and repeated
/// whitespace never yields empty tokens. Vectors therefore differ from a
/// regex `split(/\s+/)` tokenizer on such input.
pub fn fallback_embedding(text: &str, dimension: usize) -> Vec<f32> {
    let mut embedding = vec![0f32; dimension];
    if dimension == 0 {
        return embedding;
    }

    let lowered = text.to_lowercase();
    for (position, token) in lowered.split_whitespace().enumerate() {
        let hash: u64 = token.encode_utf16().map(u64::from).sum();
        embedding[(hash % dimension as u64) as usize] += 1.0 / (position as f32 + 1.0);
    }

    let magnitude = embedding.iter().map(|v| v * v).sum::<f32>().sqrt();
    if magnitude > 0.0 {
        for value in embedding.iter_mut() {
            *value /= magnitude;
        }
    }
    embedding
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct ScriptedApi {
        outcome: EmbeddingOutcome,
        calls: Mutex<Vec<Vec<String>>>,
    }

    impl ScriptedApi {
        fn new(outcome: EmbeddingOutcome) -> Arc<Self> {
            Arc::new(Self {
                outcome,
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl EmbeddingApi for ScriptedApi {
        async fn request(&self, texts: &[String]) -> EmbeddingOutcome {
            self.calls.lock().unwrap().push(texts.to_vec());
            self.outcome.clone()
        }
    }

    fn norm(v: &[f32]) -> f32 {
        v.iter().map(|x| x * x).sum::<f32>().sqrt()
    }

    #[test]
    fn test_fallback_is_deterministic_unit_vector() {
        for text in ["Stocks rallied on Tuesday", "a", "   padded   text  ", "Ünïcode 東京 news"] {
            let a = fallback_embedding(text, DEFAULT_DIMENSION);
            let b = fallback_embedding(text, DEFAULT_DIMENSION);
            assert_eq!(a.len(), DEFAULT_DIMENSION);
            assert_eq!(a, b);
            assert!((norm(&a) - 1.0).abs() < 1e-5, "{} not normalized", text);
        }
    }

    #[test]
    fn test_fallback_empty_text_is_zero_vector() {
        let v = fallback_embedding("", 16);
        assert_eq!(v.len(), 16);
        assert!(v.iter().all(|x| *x == 0.0));
        assert!(fallback_embedding(" \t\n", 16).iter().all(|x| *x == 0.0));
    }

    #[test]
    fn test_fallback_buckets_and_weights() {
        // "ab" = 97 + 98 = 195, "c" = 99. With 10 buckets: 5 and 9.
        let v = fallback_embedding("AB c", 10);
        let magnitude = (1.0f32 + 0.25).sqrt();
        assert!((v[5] - 1.0 / magnitude).abs() < 1e-6);
        assert!((v[9] - 0.5 / magnitude).abs() < 1e-6);
        assert_eq!(v.iter().filter(|x| **x != 0.0).count(), 2);
    }

    #[test]
    fn test_fallback_ignores_surrounding_whitespace() {
        let padded = fallback_embedding("  Rates rise\t\n again  ", 32);
        assert_eq!(padded, fallback_embedding("rates rise again", 32));
    }

    #[test]
    fn test_fallback_is_case_insensitive() {
        assert_eq!(
            fallback_embedding("Breaking News", 64),
            fallback_embedding("breaking news", 64)
        );
    }

    #[tokio::test]
    async fn test_no_credential_uses_fallback() {
        let embedder = Embedder::local(DEFAULT_DIMENSION);
        assert_eq!(embedder.mode(), EmbeddingMode::Fallback);

        let v = embedder.embed("markets today").await;
        assert_eq!(v, fallback_embedding("markets today", DEFAULT_DIMENSION));
        assert_eq!(embedder.fallback_count(), 1);
    }

    #[tokio::test]
    async fn test_remote_success_is_passed_through() {
        let api = ScriptedApi::new(EmbeddingOutcome::Success(vec![vec![0.1, 0.2], vec![0.3, 0.4]]));
        let embedder = Embedder::new(Some(api.clone()), DEFAULT_DIMENSION);

        let texts = vec!["one".to_string(), "two".to_string()];
        let vectors = embedder.embed_batch(&texts).await;

        assert_eq!(vectors, vec![vec![0.1, 0.2], vec![0.3, 0.4]]);
        assert_eq!(api.calls.lock().unwrap().as_slice(), &[texts]);
        assert_eq!(embedder.fallback_count(), 0);
    }

    #[tokio::test]
    async fn test_every_remote_failure_degrades_to_fallback() {
        let failures = [
            EmbeddingOutcome::AuthError,
            EmbeddingOutcome::AccessDenied,
            EmbeddingOutcome::RateLimited,
            EmbeddingOutcome::ServerError(502),
            EmbeddingOutcome::NetworkError("connection reset".into()),
            EmbeddingOutcome::Malformed("missing data".into()),
        ];
        for outcome in failures {
            let embedder = Embedder::new(Some(ScriptedApi::new(outcome.clone())), 32);
            let texts = vec!["alpha beta".to_string(), "gamma".to_string(), "".to_string()];
            let vectors = embedder.embed_batch(&texts).await;

            assert_eq!(vectors.len(), texts.len(), "{:?}", outcome);
            for (text, vector) in texts.iter().zip(&vectors) {
                assert_eq!(vector, &fallback_embedding(text, 32));
            }
            assert_eq!(embedder.fallback_count(), 1);
        }
    }

    #[tokio::test]
    async fn test_empty_batch_skips_remote() {
        let api = ScriptedApi::new(EmbeddingOutcome::AuthError);
        let embedder = Embedder::new(Some(api.clone()), 32);
        assert!(embedder.embed_batch(&[]).await.is_empty());
        assert!(api.calls.lock().unwrap().is_empty());
    }
}
