//! Hybrid retrieval pipeline: sparse + dense signals fused by reciprocal
//! rank, reranked to an absolute scale, then checked by the confidence
//! gate.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::{ConfidenceConfig, RetrievalConfig};
use crate::index::{DenseIndex, SparseIndex};
use crate::llm::EmbeddingClient;
use crate::reranking::{LexicalScorer, RelevanceScorer};
use crate::search::confidence::ConfidenceGate;
use crate::search::fusion::reciprocal_rank_fusion;
use crate::text;
use crate::types::{Candidate, Passage, RetrievalResult, ScoredPassage};

/// Separator between passages in the formatted context block.
const CONTEXT_SEPARATOR: &str = "\n\n---\n\n";

/// Immutable retrieval snapshot over one corpus version. Rebuilds produce
/// a fresh `Retriever` that the engine swaps in atomically.
pub struct Retriever {
    passages: Vec<Arc<Passage>>,
    sparse: SparseIndex,
    dense: Option<DenseIndex>,
    embedder: Option<Arc<dyn EmbeddingClient>>,
    scorer: Arc<dyn RelevanceScorer>,
    fallback_scorer: LexicalScorer,
    gate: ConfidenceGate,
    config: RetrievalConfig,
}

impl Retriever {
    pub fn new(
        passages: Vec<Arc<Passage>>,
        sparse: SparseIndex,
        dense: Option<DenseIndex>,
        embedder: Option<Arc<dyn EmbeddingClient>>,
        scorer: Arc<dyn RelevanceScorer>,
        retrieval: RetrievalConfig,
        confidence: ConfidenceConfig,
    ) -> Self {
        Self {
            passages,
            sparse,
            dense,
            embedder,
            scorer,
            fallback_scorer: LexicalScorer::new(),
            gate: ConfidenceGate::new(confidence),
            config: retrieval,
        }
    }

    pub fn passage_count(&self) -> usize {
        self.passages.len()
    }

    /// Run the full pipeline for one query.
    pub async fn retrieve(&self, query: &str) -> RetrievalResult {
        self.retrieve_with_variants(query, &[]).await
    }

    /// Run the pipeline with additional query variants (for example a
    /// clarified restatement). Each variant contributes its own sparse
    /// ranking to the fusion.
    pub async fn retrieve_with_variants(
        &self,
        query: &str,
        variants: &[String],
    ) -> RetrievalResult {
        let query = text::normalize(query);
        let index_tokens = text::tokenize_for_index(&query);
        let word_tokens = text::tokenize(&query);

        if index_tokens.is_empty() {
            return RetrievalResult {
                hits: Vec::new(),
                is_confident: false,
                clarifications: self.gate.clarifications(&word_tokens),
            };
        }

        let mut lists: Vec<Vec<Candidate>> = Vec::new();
        lists.push(self.sparse.search(&index_tokens, self.config.signal_top_n));
        for variant in variants {
            let variant_tokens = text::tokenize_for_index(variant);
            if !variant_tokens.is_empty() {
                lists.push(self.sparse.search(&variant_tokens, self.config.signal_top_n));
            }
        }
        if let Some(dense_list) = self.dense_signal(&query).await {
            lists.push(dense_list);
        }

        let fused =
            reciprocal_rank_fusion(&lists, self.config.fusion_k, self.config.fusion_limit);
        let mut ranked = self.rerank(&query, &fused).await;

        ranked.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.passage.id.cmp(&b.passage.id))
        });
        ranked.truncate(self.config.top_k);

        let decision = self.gate.decide(&ranked, &word_tokens);
        debug!(
            hits = ranked.len(),
            is_confident = decision.is_confident,
            "retrieval complete"
        );
        RetrievalResult {
            hits: ranked,
            is_confident: decision.is_confident,
            clarifications: decision.clarifications,
        }
    }

    /// Dense cosine ranking over the query embedding. Any service failure
    /// degrades to sparse-only retrieval.
    async fn dense_signal(&self, query: &str) -> Option<Vec<Candidate>> {
        let dense = self.dense.as_ref()?;
        let embedder = self.embedder.as_ref()?;
        match embedder.embed(&[query.to_string()]).await {
            Ok(mut vectors) if !vectors.is_empty() => Some(dense.search(
                &vectors.remove(0),
                self.config.signal_top_n,
                self.passages.len(),
            )),
            Ok(_) => None,
            Err(err) => {
                warn!(%err, "query embedding failed, continuing sparse-only");
                None
            }
        }
    }

    /// Score the fused shortlist on an absolute relevance scale. A failing
    /// primary scorer degrades to the lexical fallback rather than erroring
    /// the turn.
    async fn rerank(&self, query: &str, fused: &[Candidate]) -> Vec<ScoredPassage> {
        let shortlist: Vec<(usize, String)> = fused
            .iter()
            .filter_map(|c| {
                self.passages
                    .get(c.passage_idx)
                    .map(|p| (c.passage_idx, p.representation()))
            })
            .collect();
        if shortlist.is_empty() {
            return Vec::new();
        }

        let scored = match self.scorer.score(query, &shortlist).await {
            Ok(scored) => scored,
            Err(err) => {
                warn!(%err, "reranker failed, falling back to lexical scoring");
                match self.fallback_scorer.score(query, &shortlist).await {
                    Ok(scored) => scored,
                    Err(_) => return Vec::new(),
                }
            }
        };

        scored
            .into_iter()
            .filter(|c| c.score.is_finite())
            .filter_map(|c| {
                self.passages.get(c.passage_idx).map(|p| ScoredPassage {
                    passage: Arc::clone(p),
                    score: c.score,
                })
            })
            .collect()
    }

    /// Render a retrieval result as the context block handed to the
    /// answering model. Each passage keeps its id, source URL, question
    /// title and verbatim answer text.
    pub fn format_context(result: &RetrievalResult) -> String {
        result
            .hits
            .iter()
            .map(|hit| {
                let p = &hit.passage;
                let mut block = format!("ID: {}\nSource URL: {}", p.id, p.source_url);
                if let Some(question) = &p.question_title {
                    block.push_str(&format!("\nQuestion: {question}"));
                }
                block.push_str(&format!("\nAnswer: {}", p.body));
                block
            })
            .collect::<Vec<_>>()
            .join(CONTEXT_SEPARATOR)
    }

    /// Map passage id to source URL for answer link resolution.
    pub fn source_links(result: &RetrievalResult) -> std::collections::HashMap<u32, String> {
        result
            .hits
            .iter()
            .map(|hit| (hit.passage.id, hit.passage.source_url.clone()))
            .collect()
    }
}
