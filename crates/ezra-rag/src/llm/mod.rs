//! External LLM service clients: chat completion and embeddings.

pub mod openai;
pub mod seeker;

use std::num::NonZeroUsize;

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::types::Usage;

/// Errors from the external completion/embedding services.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("missing API key for {0}")]
    MissingCredentials(&'static str),
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("service returned status {status}: {message}")]
    Api { status: u16, message: String },
    #[error("malformed service response: {0}")]
    Malformed(String),
}

/// A completed (non-streaming) chat response.
#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub usage: Usage,
}

/// Per-request generation settings.
#[derive(Debug, Clone)]
pub struct CompletionOptions {
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            max_tokens: 800,
            temperature: 0.2,
        }
    }
}

/// One event on a streaming completion channel.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Token(String),
    Done(Usage),
}

/// Chat-completion backend.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(
        &self,
        prompt: &str,
        options: &CompletionOptions,
    ) -> Result<Completion, ServiceError>;

    /// Stream raw model tokens. The channel ends with a `Done` event
    /// carrying the turn's usage when the service reports it.
    async fn complete_stream(
        &self,
        prompt: &str,
        options: &CompletionOptions,
    ) -> Result<mpsc::Receiver<StreamEvent>, ServiceError>;
}

/// Text-embedding backend.
#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ServiceError>;
}

/// LRU-caching wrapper around an embedding backend. Repeated queries hit
/// the cache; only misses go out to the service.
pub struct CachedEmbeddings {
    inner: Arc<dyn EmbeddingClient>,
    cache: Mutex<LruCache<String, Vec<f32>>>,
}

impl CachedEmbeddings {
    pub fn new(inner: Arc<dyn EmbeddingClient>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }
}

#[async_trait]
impl EmbeddingClient for CachedEmbeddings {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ServiceError> {
        let mut results: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
        let mut missing: Vec<(usize, String)> = Vec::new();
        {
            let mut cache = self.cache.lock();
            for (idx, text) in texts.iter().enumerate() {
                match cache.get(text) {
                    Some(vector) => results[idx] = Some(vector.clone()),
                    None => missing.push((idx, text.clone())),
                }
            }
        }

        if !missing.is_empty() {
            let queries: Vec<String> = missing.iter().map(|(_, t)| t.clone()).collect();
            let fetched = self.inner.embed(&queries).await?;
            if fetched.len() != queries.len() {
                return Err(ServiceError::Malformed(format!(
                    "embedding count mismatch: sent {} texts, got {} vectors",
                    queries.len(),
                    fetched.len()
                )));
            }
            let mut cache = self.cache.lock();
            for ((idx, text), vector) in missing.into_iter().zip(fetched) {
                cache.put(text, vector.clone());
                results[idx] = Some(vector);
            }
        }

        Ok(results.into_iter().flatten().collect())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct CountingEmbedder {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingClient for CountingEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ServiceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(texts.iter().map(|t| vec![t.len() as f32, 1.0]).collect())
        }
    }

    #[tokio::test]
    async fn cache_serves_repeats_without_service_calls() {
        let inner = Arc::new(CountingEmbedder {
            calls: AtomicUsize::new(0),
        });
        let cached = CachedEmbeddings::new(inner.clone(), 10);

        let texts = vec!["alpha".to_string(), "beta".to_string()];
        let first = cached.embed(&texts).await.unwrap();
        let second = cached.embed(&texts).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cache_fetches_only_misses() {
        let inner = Arc::new(CountingEmbedder {
            calls: AtomicUsize::new(0),
        });
        let cached = CachedEmbeddings::new(inner.clone(), 10);

        cached.embed(&["alpha".to_string()]).await.unwrap();
        let mixed = cached
            .embed(&["alpha".to_string(), "gamma".to_string()])
            .await
            .unwrap();
        assert_eq!(mixed.len(), 2);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }
}
