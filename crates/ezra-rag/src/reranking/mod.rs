//! Relevance scoring of the fused candidate shortlist.

pub mod scorer;

pub use scorer::{EmbeddingScorer, LexicalScorer, RelevanceScorer};
