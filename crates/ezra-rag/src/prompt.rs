//! Prompt assembly for the answering model.
//!
//! The full prompt is a single JSON document: fixed instructions, recent
//! conversation history, the retrieved context block and the user
//! question. The model is instructed to answer with a structured object
//! `{"response": ..., "responseSourceId": ...}` so the stream seeker can
//! surface answer text incrementally and the engine can resolve the
//! source link afterwards.

use std::sync::LazyLock;

use serde::Deserialize;
use serde_json::{json, Value};

use crate::agent::{Message, Role};

/// Rough token estimate used for budget decisions: one token per four
/// characters.
pub const CHARS_PER_TOKEN: usize = 4;

/// Sentinel the model must answer with when the context does not cover
/// the question.
pub const NO_ANSWER_SENTINEL: &str = "IDK";

static SYSTEM_INSTRUCTION: LazyLock<Value> = LazyLock::new(|| {
    json!({
        "role": "עוזר תמיכה טכנית למערכת לניהול עסק, העונה בעברית בלבד",
        "grounding": "ענה אך ורק על סמך המידע שבשדה retrieved_context_from_manual. אל תמציא מידע.",
        "no_answer_rule": format!(
            "אם המידע שבהקשר אינו עונה על השאלה, החזר בשדה response את הערך \"{NO_ANSWER_SENTINEL}\" בלבד.",
        ),
        "output_format": {
            "type": "json",
            "fields": {
                "response": "התשובה למשתמש בעברית",
                "responseSourceId": "מספר ה-ID של הפסקה שעליה מבוססת התשובה, או null",
            },
        },
        "style": "תשובות קצרות, מעשיות, צעד אחר צעד כשנדרש",
    })
});

/// Structured answer payload returned by the answering model.
#[derive(Debug, Clone, Deserialize)]
pub struct AnswerPayload {
    pub response: String,
    #[serde(rename = "responseSourceId")]
    pub source_id: Option<u32>,
}

impl AnswerPayload {
    /// Parse a completed model answer. Accepts surrounding noise around
    /// the JSON object; returns `None` when no valid payload is present.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if let Ok(payload) = serde_json::from_str::<Self>(trimmed) {
            return Some(payload);
        }
        let start = trimmed.find('{')?;
        let end = trimmed.rfind('}')?;
        if end <= start {
            return None;
        }
        serde_json::from_str(&trimmed[start..=end]).ok()
    }

    pub fn is_no_answer(&self) -> bool {
        self.response.trim() == NO_ANSWER_SENTINEL
    }
}

/// Builds the JSON prompt for one answering call.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    max_history_messages: usize,
}

impl PromptBuilder {
    pub fn new(max_history_messages: usize) -> Self {
        Self {
            max_history_messages,
        }
    }

    /// Assemble the full prompt document.
    pub fn build(&self, history: &[Message], question: &str, context: &str) -> String {
        let recent = trim_history(history, self.max_history_messages);
        let history_lines: Vec<String> = recent
            .iter()
            .map(|message| {
                let speaker = match message.role {
                    Role::User => "User",
                    Role::Assistant => "Assistant",
                    Role::Tool => "Tool",
                };
                format!("{speaker}: {}", message.content)
            })
            .collect();

        let document = json!({
            "instructions": &*SYSTEM_INSTRUCTION,
            "conversation_history": history_lines,
            "retrieved_context_from_manual": context,
            "user_question": question,
        });
        serde_json::to_string_pretty(&document)
            .unwrap_or_else(|_| document.to_string())
    }
}

/// Approximate token count of a text.
pub fn approx_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

/// Keep only the most recent `max_messages` history entries.
pub fn trim_history(history: &[Message], max_messages: usize) -> &[Message] {
    let start = history.len().saturating_sub(max_messages);
    &history[start..]
}
