//! Core data model shared across indexing, retrieval and the agent loop.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::text;

/// One indexed knowledge passage: a support Q&A entry with its cached
/// index token list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Passage {
    pub id: u32,
    pub source_url: String,
    pub question_title: Option<String>,
    /// Normalized answer text.
    pub body: String,
    /// Index tokens (word tokens plus Hebrew trigram shadows) over
    /// question title and body.
    pub tokens: Vec<String>,
}

impl Passage {
    /// Build a passage from raw storage fields, normalizing text and
    /// computing index tokens when the stored token cache is absent.
    /// Returns `None` for rows with an empty answer.
    pub fn from_parts(
        id: u32,
        url: &str,
        question: Option<&str>,
        answer: &str,
        cached_tokens: Option<Vec<String>>,
    ) -> Option<Self> {
        let body = text::normalize(answer);
        if body.is_empty() {
            return None;
        }
        let question_title = question.map(text::normalize).filter(|q| !q.is_empty());
        let tokens = cached_tokens.filter(|t| !t.is_empty()).unwrap_or_else(|| {
            let combined = match &question_title {
                Some(q) => format!("{q} {body}"),
                None => body.clone(),
            };
            text::tokenize_for_index(&combined)
        });
        Some(Self {
            id,
            source_url: text::normalize(url),
            question_title,
            body,
            tokens,
        })
    }

    /// Textual representation fed to embedding and reranking.
    pub fn representation(&self) -> String {
        text::passage_representation(
            &self.source_url,
            self.question_title.as_deref(),
            &self.body,
        )
    }
}

/// A passage position with a retrieval score, used inside the ranking
/// pipeline before passages are attached.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    /// Positional index into the passage list, not the passage id.
    pub passage_idx: usize,
    pub score: f32,
}

/// A ranked passage with its final relevance score.
#[derive(Debug, Clone)]
pub struct ScoredPassage {
    pub passage: Arc<Passage>,
    pub score: f32,
}

/// Outcome of one retrieval pass, after fusion, reranking and the
/// confidence gate.
#[derive(Debug, Clone, Default)]
pub struct RetrievalResult {
    /// Top passages in descending score order.
    pub hits: Vec<ScoredPassage>,
    /// Whether the confidence gate accepted the ranking.
    pub is_confident: bool,
    /// Clarification prompts to surface when the gate rejected (empty
    /// otherwise). At most three entries.
    pub clarifications: Vec<String>,
}

impl RetrievalResult {
    pub fn top_hit(&self) -> Option<&ScoredPassage> {
        self.hits.first()
    }

    /// Deduplicated question titles of the hits, in rank order.
    pub fn question_titles(&self) -> Vec<String> {
        let mut titles: Vec<String> = Vec::new();
        for hit in &self.hits {
            if let Some(title) = &hit.passage.question_title {
                if !titles.iter().any(|t| t == title) {
                    titles.push(title.clone());
                }
            }
        }
        titles
    }
}

/// A synthesized support ticket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticket {
    pub category: String,
    pub title: String,
    pub description: String,
}

/// LLM token accounting for one turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl Usage {
    pub fn add(&mut self, other: Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// Persistent record of one completed conversation turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRecord {
    pub id: uuid::Uuid,
    pub session_id: String,
    pub question: String,
    pub answer: String,
    /// Retrieval context shown to the model, if any.
    pub context: Option<String>,
    /// Serialized conversation history at the end of the turn.
    pub history: Vec<crate::agent::Message>,
    pub usage: Usage,
    pub created_at: DateTime<Utc>,
}
