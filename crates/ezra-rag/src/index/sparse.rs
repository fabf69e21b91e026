//! BM25-Okapi sparse index over passage token lists.
//!
//! Scoring follows the classic Okapi formulation with k1 = 1.5, b = 0.75.
//! Terms whose raw IDF comes out non-positive (present in half the corpus
//! or more) are clamped to a small positive floor derived from the average
//! IDF, so very common terms keep a small positive contribution. On tiny
//! corpora the average itself can be non-positive, so the floor is taken
//! from its magnitude; matches must always outscore non-matches.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::types::Candidate;

const K1: f32 = 1.5;
const B: f32 = 0.75;
const EPSILON: f32 = 0.25;

/// Immutable BM25 statistics over a passage corpus. Built once per corpus
/// snapshot and swapped atomically on rebuild.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SparseIndex {
    doc_count: usize,
    avg_doc_len: f32,
    doc_lens: Vec<u32>,
    /// Per-document term frequencies.
    term_freqs: Vec<HashMap<String, u32>>,
    /// Per-term inverse document frequency, non-positive values already
    /// clamped to the positive floor.
    idf: HashMap<String, f32>,
}

impl SparseIndex {
    /// Build the index from per-passage token lists. Positions in
    /// `token_lists` become the candidate indices returned by `search`.
    pub fn build(token_lists: &[Vec<String>]) -> Self {
        let doc_count = token_lists.len();
        let mut doc_lens = Vec::with_capacity(doc_count);
        let mut term_freqs = Vec::with_capacity(doc_count);
        let mut doc_freq: HashMap<String, u32> = HashMap::new();

        for tokens in token_lists {
            doc_lens.push(tokens.len() as u32);
            let mut freqs: HashMap<String, u32> = HashMap::new();
            for token in tokens {
                *freqs.entry(token.clone()).or_insert(0) += 1;
            }
            for term in freqs.keys() {
                *doc_freq.entry(term.clone()).or_insert(0) += 1;
            }
            term_freqs.push(freqs);
        }

        let avg_doc_len = if doc_count == 0 {
            0.0
        } else {
            doc_lens.iter().map(|&l| l as f32).sum::<f32>() / doc_count as f32
        };

        let mut idf: HashMap<String, f32> = HashMap::with_capacity(doc_freq.len());
        let mut idf_sum = 0.0f32;
        let mut negatives: Vec<String> = Vec::new();
        for (term, df) in &doc_freq {
            let value =
                ((doc_count as f32 - *df as f32 + 0.5) / (*df as f32 + 0.5)).ln();
            idf_sum += value;
            if value <= 0.0 {
                negatives.push(term.clone());
            }
            idf.insert(term.clone(), value);
        }
        if !idf.is_empty() {
            let average_idf = idf_sum / idf.len() as f32;
            // On one- or two-document corpora every IDF can be zero or
            // negative, which would push the floor itself to zero or
            // below and drop genuine matches. The magnitude keeps the
            // floor positive in every case.
            let floor = EPSILON * average_idf.abs().max(f32::EPSILON);
            for term in negatives {
                idf.insert(term, floor);
            }
        }

        Self {
            doc_count,
            avg_doc_len,
            doc_lens,
            term_freqs,
            idf,
        }
    }

    pub fn len(&self) -> usize {
        self.doc_count
    }

    pub fn is_empty(&self) -> bool {
        self.doc_count == 0
    }

    /// Score every passage against the query tokens and return the top
    /// `top_n` positive-scoring candidates in descending score order.
    /// An empty query yields no candidates.
    pub fn search(&self, query_tokens: &[String], top_n: usize) -> Vec<Candidate> {
        if query_tokens.is_empty() || self.doc_count == 0 || top_n == 0 {
            return Vec::new();
        }

        let mut candidates: Vec<Candidate> = Vec::new();
        for (idx, freqs) in self.term_freqs.iter().enumerate() {
            let doc_len = self.doc_lens[idx] as f32;
            let len_norm = 1.0 - B + B * doc_len / self.avg_doc_len.max(f32::EPSILON);
            let mut score = 0.0f32;
            for term in query_tokens {
                let Some(&idf) = self.idf.get(term) else { continue };
                let Some(&freq) = freqs.get(term) else { continue };
                let freq = freq as f32;
                score += idf * freq * (K1 + 1.0) / (freq + K1 * len_norm);
            }
            if score > 0.0 {
                candidates.push(Candidate {
                    passage_idx: idx,
                    score,
                });
            }
        }

        candidates.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.passage_idx.cmp(&b.passage_idx))
        });
        candidates.truncate(top_n);
        candidates
    }

    /// Persist the index next to the corpus snapshot.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating index directory {}", parent.display()))?;
        }
        let raw = serde_json::to_vec(self).context("serializing sparse index")?;
        fs::write(path, raw)
            .with_context(|| format!("writing sparse index {}", path.display()))?;
        Ok(())
    }

    /// Load a persisted index, validating it against the current corpus
    /// size. A missing, corrupt or stale artifact returns `None` so the
    /// caller rebuilds from scratch.
    pub fn load(path: &Path, expected_len: usize) -> Option<Self> {
        let raw = match fs::read(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
            Err(err) => {
                warn!(path = %path.display(), %err, "failed to read sparse index, rebuilding");
                return None;
            }
        };
        let index: Self = match serde_json::from_slice(&raw) {
            Ok(index) => index,
            Err(err) => {
                warn!(path = %path.display(), %err, "corrupt sparse index, rebuilding");
                return None;
            }
        };
        if index.doc_count != expected_len {
            warn!(
                path = %path.display(),
                stored = index.doc_count,
                expected = expected_len,
                "sparse index size mismatch, rebuilding"
            );
            return None;
        }
        Some(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(words: &[&str]) -> Vec<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    fn corpus() -> Vec<Vec<String>> {
        vec![
            toks(&["reset", "password", "settings", "security"]),
            toks(&["create", "invoice", "billing"]),
            toks(&["password", "policy", "length"]),
            toks(&["export", "report", "csv"]),
        ]
    }

    #[test]
    fn empty_query_returns_empty() {
        let index = SparseIndex::build(&corpus());
        assert!(index.search(&[], 10).is_empty());
    }

    #[test]
    fn empty_corpus_returns_empty() {
        let index = SparseIndex::build(&[]);
        assert!(index.is_empty());
        assert!(index.search(&toks(&["password"]), 10).is_empty());
    }

    #[test]
    fn ranks_matching_passages_first() {
        let index = SparseIndex::build(&corpus());
        let hits = index.search(&toks(&["reset", "password"]), 10);
        assert_eq!(hits[0].passage_idx, 0);
        assert!(hits[0].score > hits[1].score);
        // Passage 1 shares no terms and must not appear.
        assert!(hits.iter().all(|c| c.passage_idx != 1));
    }

    #[test]
    fn top_n_truncates() {
        let index = SparseIndex::build(&corpus());
        let hits = index.search(&toks(&["password"]), 1);
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn ubiquitous_terms_keep_positive_idf() {
        // "common" appears in 3 of 4 docs, raw IDF is negative.
        let docs = vec![
            toks(&["common", "alpha"]),
            toks(&["common", "beta"]),
            toks(&["common", "gamma"]),
            toks(&["delta"]),
        ];
        let index = SparseIndex::build(&docs);
        let hits = index.search(&toks(&["common"]), 10);
        assert_eq!(hits.len(), 3);
        assert!(hits.iter().all(|c| c.score > 0.0));
    }

    #[test]
    fn term_in_exactly_half_the_corpus_still_matches() {
        // "password" has df = 2 of 4, so its raw IDF is ln(1) = 0; the
        // clamp must lift it above zero or both matches vanish.
        let index = SparseIndex::build(&corpus());
        let hits = index.search(&toks(&["password"]), 10);
        let matched: Vec<usize> = hits.iter().map(|c| c.passage_idx).collect();
        assert_eq!(matched, vec![2, 0]);
        assert!(hits.iter().all(|c| c.score > 0.0));
    }

    #[test]
    fn single_document_corpus_matches_its_own_terms() {
        // With one document every raw IDF is negative, so the floor must
        // not be derived from the (negative) average as-is.
        let index = SparseIndex::build(&[toks(&["reset", "password", "settings"])]);
        let hits = index.search(&toks(&["reset", "password"]), 10);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].passage_idx, 0);
        assert!(hits[0].score > 0.0);
    }

    #[test]
    fn two_document_corpus_ranks_the_matching_document() {
        // df = 1 of 2 also yields a raw IDF of exactly zero.
        let docs = vec![
            toks(&["reset", "password", "settings"]),
            toks(&["export", "invoice", "billing"]),
        ];
        let index = SparseIndex::build(&docs);
        let hits = index.search(&toks(&["reset", "password"]), 10);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].passage_idx, 0);
        assert!(hits[0].score > 0.0);
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sparse_index.json");
        let index = SparseIndex::build(&corpus());
        index.save(&path).unwrap();

        let loaded = SparseIndex::load(&path, corpus().len()).unwrap();
        let expected = index.search(&toks(&["password"]), 5);
        let got = loaded.search(&toks(&["password"]), 5);
        assert_eq!(expected.len(), got.len());
        for (a, b) in expected.iter().zip(&got) {
            assert_eq!(a.passage_idx, b.passage_idx);
            assert!((a.score - b.score).abs() < 1e-6);
        }
    }

    #[test]
    fn load_rejects_size_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sparse_index.json");
        SparseIndex::build(&corpus()).save(&path).unwrap();
        assert!(SparseIndex::load(&path, corpus().len() + 1).is_none());
    }

    #[test]
    fn load_rejects_corrupt_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sparse_index.json");
        std::fs::write(&path, b"not json at all").unwrap();
        assert!(SparseIndex::load(&path, 4).is_none());
    }

    #[test]
    fn load_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(SparseIndex::load(&dir.path().join("absent.json"), 4).is_none());
    }
}
