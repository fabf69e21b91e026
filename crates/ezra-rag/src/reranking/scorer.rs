//! Scorers that assign absolute query-passage relevance to the fused
//! shortlist. Fusion scores are rank artifacts; the confidence gate needs
//! scores on a stable scale, which these provide.

use async_trait::async_trait;
use std::sync::Arc;

use crate::index::dense::{dot, l2_normalize};
use crate::llm::{EmbeddingClient, ServiceError};
use crate::text;
use crate::types::Candidate;

/// Assigns a relevance score in roughly [0, 1] to each shortlisted
/// passage. Scores come back in input order; the caller sorts.
#[async_trait]
pub trait RelevanceScorer: Send + Sync {
    async fn score(
        &self,
        query: &str,
        candidates: &[(usize, String)],
    ) -> Result<Vec<Candidate>, ServiceError>;
}

/// Cosine similarity between query and passage embeddings, both
/// L2-normalized. One batched service call per query.
pub struct EmbeddingScorer {
    client: Arc<dyn EmbeddingClient>,
}

impl EmbeddingScorer {
    pub fn new(client: Arc<dyn EmbeddingClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RelevanceScorer for EmbeddingScorer {
    async fn score(
        &self,
        query: &str,
        candidates: &[(usize, String)],
    ) -> Result<Vec<Candidate>, ServiceError> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        let mut inputs: Vec<String> = Vec::with_capacity(candidates.len() + 1);
        inputs.push(text::normalize(query));
        inputs.extend(candidates.iter().map(|(_, passage)| text::normalize(passage)));

        let mut vectors = self.client.embed(&inputs).await?;
        if vectors.len() != inputs.len() {
            return Err(ServiceError::Malformed(format!(
                "scorer expected {} vectors, got {}",
                inputs.len(),
                vectors.len()
            )));
        }
        for vector in &mut vectors {
            l2_normalize(vector);
        }
        let query_vec = vectors.remove(0);

        Ok(candidates
            .iter()
            .zip(&vectors)
            .map(|((passage_idx, _), vector)| Candidate {
                passage_idx: *passage_idx,
                score: dot(&query_vec, vector),
            })
            .collect())
    }
}

/// Token-overlap fallback scorer: Dice coefficient over deduplicated word
/// tokens. Infallible, used when no embedding service is configured or the
/// embedding call degrades.
#[derive(Debug, Default, Clone)]
pub struct LexicalScorer;

impl LexicalScorer {
    pub fn new() -> Self {
        Self
    }

    fn token_set(value: &str) -> Vec<String> {
        let mut tokens = text::tokenize(value);
        tokens.sort();
        tokens.dedup();
        tokens
    }
}

#[async_trait]
impl RelevanceScorer for LexicalScorer {
    async fn score(
        &self,
        query: &str,
        candidates: &[(usize, String)],
    ) -> Result<Vec<Candidate>, ServiceError> {
        let query_tokens = Self::token_set(query);
        Ok(candidates
            .iter()
            .map(|(passage_idx, passage)| {
                let passage_tokens = Self::token_set(passage);
                let overlap = query_tokens
                    .iter()
                    .filter(|t| passage_tokens.binary_search(t).is_ok())
                    .count();
                let denominator = query_tokens.len() + passage_tokens.len();
                let score = if denominator == 0 {
                    0.0
                } else {
                    2.0 * overlap as f32 / denominator as f32
                };
                Candidate {
                    passage_idx: *passage_idx,
                    score,
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lexical_scorer_prefers_overlapping_passage() {
        let scorer = LexicalScorer::new();
        let candidates = vec![
            (0, "reset your password in settings".to_string()),
            (1, "export monthly invoices".to_string()),
        ];
        let scores = scorer.score("how to reset password", &candidates).await.unwrap();
        assert!(scores[0].score > scores[1].score);
        assert!(scores[0].score > 0.15);
    }

    #[tokio::test]
    async fn lexical_scorer_empty_query_scores_zero() {
        let scorer = LexicalScorer::new();
        let scores = scorer
            .score("", &[(0, "anything".to_string())])
            .await
            .unwrap();
        assert_eq!(scores[0].score, 0.0);
    }

    struct FixedEmbedder;

    #[async_trait]
    impl EmbeddingClient for FixedEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ServiceError> {
            Ok(texts
                .iter()
                .map(|t| {
                    if t.contains("password") {
                        vec![1.0, 0.0]
                    } else {
                        vec![0.0, 1.0]
                    }
                })
                .collect())
        }
    }

    #[tokio::test]
    async fn embedding_scorer_uses_cosine_similarity() {
        let scorer = EmbeddingScorer::new(Arc::new(FixedEmbedder));
        let candidates = vec![
            (3, "password help".to_string()),
            (9, "invoices".to_string()),
        ];
        let scores = scorer.score("reset password", &candidates).await.unwrap();
        assert_eq!(scores[0].passage_idx, 3);
        assert!((scores[0].score - 1.0).abs() < 1e-5);
        assert!(scores[1].score.abs() < 1e-5);
    }
}
