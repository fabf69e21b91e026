//! Retrieval indexes: sparse BM25 and dense cosine similarity.

pub mod dense;
pub mod sparse;

pub use dense::DenseIndex;
pub use sparse::SparseIndex;
