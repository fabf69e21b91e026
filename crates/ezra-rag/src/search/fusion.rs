//! Reciprocal rank fusion of multiple candidate rankings.

use std::collections::{HashMap, HashSet};

use crate::types::Candidate;

/// Merge ranked candidate lists with reciprocal rank fusion.
///
/// Each list contributes `1 / (k + rank)` for a passage's best (first)
/// position in that list; duplicates within one list are ignored. The
/// merged ranking is sorted by fused score descending, ties broken by
/// passage position ascending, and truncated to `limit`.
pub fn reciprocal_rank_fusion(lists: &[Vec<Candidate>], k: usize, limit: usize) -> Vec<Candidate> {
    let mut fused: HashMap<usize, f32> = HashMap::new();
    for list in lists {
        let mut seen: HashSet<usize> = HashSet::new();
        let mut rank = 0usize;
        for candidate in list {
            if !seen.insert(candidate.passage_idx) {
                continue;
            }
            rank += 1;
            *fused.entry(candidate.passage_idx).or_insert(0.0) += 1.0 / (k + rank) as f32;
        }
    }

    let mut merged: Vec<Candidate> = fused
        .into_iter()
        .map(|(passage_idx, score)| Candidate { passage_idx, score })
        .collect();
    merged.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.passage_idx.cmp(&b.passage_idx))
    });
    merged.truncate(limit);
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(ids: &[usize]) -> Vec<Candidate> {
        ids.iter()
            .enumerate()
            .map(|(rank, &passage_idx)| Candidate {
                passage_idx,
                // Per-signal scores are irrelevant to fusion, only rank is.
                score: 1.0 / (rank + 1) as f32,
            })
            .collect()
    }

    #[test]
    fn worked_example_with_k_60() {
        // List A ranks [p1, p2, p3], list B ranks [p2, p1].
        let a = list(&[1, 2, 3]);
        let b = list(&[2, 1]);
        let fused = reciprocal_rank_fusion(&[a, b], 60, 30);

        assert_eq!(fused.len(), 3);
        // p1 and p2 both score 1/61 + 1/62 and tie above p3 at 1/63.
        let expected_top = 1.0 / 61.0 + 1.0 / 62.0;
        assert!((fused[0].score - expected_top).abs() < 1e-6);
        assert!((fused[1].score - expected_top).abs() < 1e-6);
        assert_eq!(fused[2].passage_idx, 3);
        assert!((fused[2].score - 1.0 / 63.0).abs() < 1e-6);
    }

    #[test]
    fn fusion_is_commutative_over_lists() {
        let a = list(&[1, 2, 3, 4]);
        let b = list(&[4, 2, 9]);
        let ab = reciprocal_rank_fusion(&[a.clone(), b.clone()], 60, 30);
        let ba = reciprocal_rank_fusion(&[b, a], 60, 30);
        assert_eq!(ab.len(), ba.len());
        for (x, y) in ab.iter().zip(&ba) {
            assert_eq!(x.passage_idx, y.passage_idx);
            assert!((x.score - y.score).abs() < 1e-7);
        }
    }

    #[test]
    fn duplicates_within_one_list_count_once() {
        let duplicated = list(&[7, 7, 7]);
        let fused = reciprocal_rank_fusion(&[duplicated], 60, 30);
        assert_eq!(fused.len(), 1);
        assert!((fused[0].score - 1.0 / 61.0).abs() < 1e-7);
    }

    #[test]
    fn limit_truncates_output() {
        let a = list(&[1, 2, 3, 4, 5]);
        let fused = reciprocal_rank_fusion(&[a], 60, 2);
        assert_eq!(fused.len(), 2);
        assert_eq!(fused[0].passage_idx, 1);
        assert_eq!(fused[1].passage_idx, 2);
    }

    #[test]
    fn empty_input_yields_empty() {
        assert!(reciprocal_rank_fusion(&[], 60, 30).is_empty());
        assert!(reciprocal_rank_fusion(&[Vec::new()], 60, 30).is_empty());
    }
}
