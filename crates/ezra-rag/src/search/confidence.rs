//! Confidence gate over a reranked passage list.
//!
//! A ranking is trusted only when the top score clears an absolute floor,
//! the top result separates clearly enough from the runner-up, and the top
//! passage actually shares salient terms with the query. Any failed check
//! routes the turn to clarification instead of answering.

use tracing::debug;

use crate::config::ConfidenceConfig;
use crate::text;
use crate::types::ScoredPassage;

const SCORE_DENOMINATOR_FLOOR: f32 = 1e-6;
const MAX_CLARIFICATIONS: usize = 3;

/// Outcome of the gate for one query.
#[derive(Debug, Clone, Default)]
pub struct GateDecision {
    pub is_confident: bool,
    /// Clarification prompts, populated only when not confident.
    pub clarifications: Vec<String>,
}

/// Threshold-based acceptance check for a reranked result list.
#[derive(Debug, Clone)]
pub struct ConfidenceGate {
    config: ConfidenceConfig,
}

impl ConfidenceGate {
    pub fn new(config: ConfidenceConfig) -> Self {
        Self { config }
    }

    /// Evaluate a descending-sorted ranking against the query's word
    /// tokens.
    pub fn decide(&self, ranked: &[ScoredPassage], query_tokens: &[String]) -> GateDecision {
        if self.is_confident(ranked, query_tokens) {
            return GateDecision {
                is_confident: true,
                clarifications: Vec::new(),
            };
        }
        GateDecision {
            is_confident: false,
            clarifications: self.clarifications(query_tokens),
        }
    }

    fn is_confident(&self, ranked: &[ScoredPassage], query_tokens: &[String]) -> bool {
        let Some(top) = ranked.first() else {
            debug!("gate: no candidates");
            return false;
        };

        if top.score < self.config.low_score {
            debug!(top_score = top.score, "gate: top score below floor");
            return false;
        }

        if let Some(second) = ranked.get(1) {
            let gap = (top.score - second.score) / top.score.abs().max(SCORE_DENOMINATOR_FLOOR);
            if gap < self.config.gap_ratio {
                debug!(top_score = top.score, second_score = second.score, "gate: scores too close");
                return false;
            }
        }

        let query_terms = text::key_terms(query_tokens, 8);
        let passage_terms = text::key_terms(&top.passage.tokens, 24);
        let overlap = query_terms
            .iter()
            .filter(|term| passage_terms.contains(term))
            .count();
        if overlap < self.config.min_overlap {
            debug!(overlap, "gate: no salient-term overlap with top passage");
            return false;
        }

        true
    }

    /// Up to three clarification prompts: one anchored on each of the
    /// first two salient query terms, plus a generic fallback.
    pub fn clarifications(&self, query_tokens: &[String]) -> Vec<String> {
        let mut prompts: Vec<String> = Vec::new();
        for term in text::key_terms(query_tokens, 2) {
            let prompt = format!("האם השאלה שלך קשורה ל\"{term}\"?");
            if !prompts.contains(&prompt) {
                prompts.push(prompt);
            }
        }
        prompts.push("אפשר לפרט מה ניסית לעשות במערכת?".to_string());
        prompts.truncate(MAX_CLARIFICATIONS);
        prompts
    }
}
