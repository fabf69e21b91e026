//! Dense cosine-similarity index over passage embeddings.
//!
//! Vectors are L2-normalized at insertion, so cosine similarity reduces to
//! a dot product at query time.

use anyhow::{bail, Result};

use crate::types::Candidate;

/// Flat in-memory nearest-neighbor index. Positions mirror the passage
/// list the embeddings were computed from.
#[derive(Debug, Clone)]
pub struct DenseIndex {
    dim: usize,
    vectors: Vec<Vec<f32>>,
}

impl DenseIndex {
    /// Build from raw embeddings, normalizing each row. All rows must
    /// share one dimension.
    pub fn build(embeddings: Vec<Vec<f32>>) -> Result<Self> {
        let dim = embeddings.first().map(|v| v.len()).unwrap_or(0);
        let mut vectors = Vec::with_capacity(embeddings.len());
        for (idx, mut vector) in embeddings.into_iter().enumerate() {
            if vector.len() != dim {
                bail!(
                    "embedding {idx} has dimension {} but expected {dim}",
                    vector.len()
                );
            }
            l2_normalize(&mut vector);
            vectors.push(vector);
        }
        Ok(Self { dim, vectors })
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    /// Top `top_n` passages by cosine similarity, descending. Candidates
    /// with non-finite scores are dropped, and any position at or beyond
    /// `passage_count` is discarded as stale.
    pub fn search(&self, query: &[f32], top_n: usize, passage_count: usize) -> Vec<Candidate> {
        if query.len() != self.dim || self.vectors.is_empty() || top_n == 0 {
            return Vec::new();
        }

        let mut query = query.to_vec();
        l2_normalize(&mut query);

        let mut candidates: Vec<Candidate> = self
            .vectors
            .iter()
            .enumerate()
            .filter(|(idx, _)| *idx < passage_count)
            .map(|(idx, vector)| Candidate {
                passage_idx: idx,
                score: dot(&query, vector),
            })
            .filter(|c| c.score.is_finite())
            .collect();

        candidates.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.passage_idx.cmp(&b.passage_idx))
        });
        candidates.truncate(top_n);
        candidates
    }
}

/// Scale a vector to unit length in place. Zero vectors are left as-is.
pub fn l2_normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
}

/// Cosine similarity of two already-normalized vectors.
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranks_by_cosine_similarity() {
        let index = DenseIndex::build(vec![
            vec![1.0, 0.0],
            vec![0.0, 1.0],
            vec![2.0, 2.0],
        ])
        .unwrap();
        let hits = index.search(&[1.0, 0.1], 3, 3);
        assert_eq!(hits[0].passage_idx, 0);
        assert_eq!(hits[1].passage_idx, 2);
        assert_eq!(hits[2].passage_idx, 1);
    }

    #[test]
    fn normalization_makes_magnitude_irrelevant() {
        let a = DenseIndex::build(vec![vec![1.0, 1.0]]).unwrap();
        let b = DenseIndex::build(vec![vec![10.0, 10.0]]).unwrap();
        let sa = a.search(&[1.0, 1.0], 1, 1)[0].score;
        let sb = b.search(&[1.0, 1.0], 1, 1)[0].score;
        assert!((sa - sb).abs() < 1e-6);
        assert!((sa - 1.0).abs() < 1e-5);
    }

    #[test]
    fn discards_positions_beyond_passage_count() {
        let index = DenseIndex::build(vec![vec![1.0, 0.0], vec![0.9, 0.1]]).unwrap();
        let hits = index.search(&[1.0, 0.0], 5, 1);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].passage_idx, 0);
    }

    #[test]
    fn rejects_mixed_dimensions() {
        assert!(DenseIndex::build(vec![vec![1.0, 0.0], vec![1.0]]).is_err());
    }

    #[test]
    fn dimension_mismatch_query_returns_empty() {
        let index = DenseIndex::build(vec![vec![1.0, 0.0]]).unwrap();
        assert!(index.search(&[1.0, 0.0, 0.0], 5, 1).is_empty());
    }
}
