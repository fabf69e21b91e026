//! Hybrid retrieval and agent engine for a Hebrew customer-support
//! chatbot.
//!
//! The crate combines a BM25 sparse index and an optional dense cosine
//! index over a support-article corpus, fuses them by reciprocal rank,
//! reranks the shortlist on an absolute relevance scale and gates the
//! result on confidence thresholds. On top of retrieval sits a bounded,
//! checkpointed agent loop that searches, clarifies, answers, explains
//! its capabilities or opens a support ticket.

pub mod agent;
pub mod config;
pub mod engine;
pub mod index;
pub mod llm;
pub mod prompt;
pub mod reranking;
pub mod search;
pub mod storage;
pub mod text;
pub mod types;

pub use agent::{AgentState, ControlSignal, Message, OutputKind, TurnEvent};
pub use config::EngineConfig;
pub use engine::{SupportEngine, TurnReply};
pub use search::Retriever;
pub use storage::{CheckpointStore, PassageRow, PassageSource, TurnStore};
pub use types::{Passage, RetrievalResult, ScoredPassage, Ticket, TurnRecord, Usage};
