//! Collaborator traits for persistence: passage corpus, checkpoints and
//! turn records. The engine stays storage-agnostic; hosts plug in their
//! own database-backed implementations, and in-memory versions back the
//! tests.

use std::collections::HashMap;

use anyhow::Result;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::agent::{AgentState, Message};
use crate::types::TurnRecord;

/// One raw passage row as stored by the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PassageRow {
    pub id: u32,
    pub url: String,
    pub question: Option<String>,
    pub answer: String,
    /// Cached index tokens; recomputed when absent.
    pub tokens: Option<Vec<String>>,
}

/// Source of the passage corpus.
pub trait PassageSource: Send + Sync {
    fn list_passages(&self) -> Result<Vec<PassageRow>>;
}

/// Suspended-turn checkpoint storage, keyed by session. Finished states
/// stay stored: the next turn reads them to carry session-scoped flags
/// forward. Eviction is the host's concern.
pub trait CheckpointStore: Send + Sync {
    fn get(&self, session_id: &str) -> Option<AgentState>;
    fn put(&self, session_id: &str, state: &AgentState);
}

/// The most recent completed turn of a session, used to seed history.
#[derive(Debug, Clone, Default)]
pub struct RecentTurn {
    pub history: Vec<Message>,
}

/// Persistence of completed turns.
pub trait TurnStore: Send + Sync {
    fn load_recent_turn(&self, session_id: &str) -> Result<Option<RecentTurn>>;
    fn save_turn(&self, record: &TurnRecord) -> Result<()>;
}

/// In-memory checkpoint store.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    states: RwLock<HashMap<String, AgentState>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn get(&self, session_id: &str) -> Option<AgentState> {
        self.states.read().get(session_id).cloned()
    }

    fn put(&self, session_id: &str, state: &AgentState) {
        self.states.write().insert(session_id.to_string(), state.clone());
    }
}

/// In-memory turn store.
#[derive(Default)]
pub struct MemoryTurnStore {
    turns: RwLock<Vec<TurnRecord>>,
}

impl MemoryTurnStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<TurnRecord> {
        self.turns.read().clone()
    }
}

impl TurnStore for MemoryTurnStore {
    fn load_recent_turn(&self, session_id: &str) -> Result<Option<RecentTurn>> {
        let turns = self.turns.read();
        Ok(turns
            .iter()
            .rev()
            .find(|t| t.session_id == session_id)
            .map(|t| RecentTurn {
                history: t.history.clone(),
            }))
    }

    fn save_turn(&self, record: &TurnRecord) -> Result<()> {
        self.turns.write().push(record.clone());
        Ok(())
    }
}

/// Static in-memory passage source.
pub struct MemoryPassageSource {
    rows: Vec<PassageRow>,
}

impl MemoryPassageSource {
    pub fn new(rows: Vec<PassageRow>) -> Self {
        Self { rows }
    }
}

impl PassageSource for MemoryPassageSource {
    fn list_passages(&self) -> Result<Vec<PassageRow>> {
        Ok(self.rows.clone())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::types::Usage;

    #[test]
    fn checkpoint_store_round_trips() {
        let store = MemoryCheckpointStore::new();
        let state = AgentState::new_turn(Vec::new(), "שאלה");
        store.put("s1", &state);
        assert!(store.get("s1").is_some());
        assert!(store.get("s2").is_none());
    }

    #[test]
    fn turn_store_returns_latest_turn_per_session() {
        let store = MemoryTurnStore::new();
        for (session, answer) in [("s1", "a1"), ("s2", "b1"), ("s1", "a2")] {
            store
                .save_turn(&TurnRecord {
                    id: uuid::Uuid::new_v4(),
                    session_id: session.to_string(),
                    question: "q".to_string(),
                    answer: answer.to_string(),
                    context: None,
                    history: vec![Message::assistant(answer)],
                    usage: Usage::default(),
                    created_at: Utc::now(),
                })
                .unwrap();
        }
        let recent = store.load_recent_turn("s1").unwrap().unwrap();
        assert_eq!(recent.history[0].content, "a2");
        assert!(store.load_recent_turn("s3").unwrap().is_none());
    }
}
