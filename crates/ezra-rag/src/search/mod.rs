//! Query-time search: fusion, confidence gating and the retrieval
//! pipeline.

pub mod confidence;
pub mod fusion;
pub mod retriever;

pub use confidence::{ConfidenceGate, GateDecision};
pub use retriever::Retriever;
