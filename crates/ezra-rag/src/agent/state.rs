//! Serializable per-turn agent state and checkpoint plumbing.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

static CHOICE_NUMBER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+").expect("choice regex is valid"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

/// One conversation message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn tool(content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
        }
    }
}

/// Per-turn tool usage counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolCounts {
    pub search: u32,
    pub clarify: u32,
    pub final_answer: u32,
    pub capability: u32,
}

/// What kind of content `pending_output` holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    ToolMarker,
    Clarification,
    FinalText,
    Ticket,
}

/// Where the turn stands: still planning, suspended waiting for the user,
/// or finished.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlSignal {
    #[default]
    Planning,
    /// Suspended after asking a multiple-choice clarification.
    AwaitingClarification,
    /// Suspended after explaining capabilities; the next user message is
    /// routed to either ticket creation or a fresh question.
    AwaitingTicketRouting,
    Finished,
}

/// The complete checkpointable state of one agent turn.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentState {
    pub history: Vec<Message>,
    pub tool_counts: ToolCounts,
    /// Formatted context blocks gathered by search calls this turn.
    pub search_contexts: Vec<String>,
    pub pending_output: String,
    pub pending_kind: Option<OutputKind>,
    pub control_signal: ControlSignal,
    pub clarify_question: String,
    pub clarify_options: Vec<String>,
    pub clarify_selected: Option<usize>,
    /// A ticket has already been synthesized this conversation.
    pub ticket_built: bool,
}

impl AgentState {
    /// Fresh turn state over prior conversation history plus the new user
    /// message.
    pub fn new_turn(mut history: Vec<Message>, user_message: &str) -> Self {
        history.push(Message::user(user_message));
        Self {
            history,
            ..Self::default()
        }
    }

    /// The most recent user message, if any.
    pub fn last_user_message(&self) -> Option<&str> {
        self.history
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
    }

    /// Reset per-turn budgets and gathered context for a follow-up
    /// question in the same session. Ticket state survives the reset.
    pub fn reset_for_new_question(&mut self) {
        self.tool_counts = ToolCounts::default();
        self.search_contexts.clear();
        self.pending_output.clear();
        self.pending_kind = None;
        self.control_signal = ControlSignal::Planning;
        self.clarify_question.clear();
        self.clarify_options.clear();
        self.clarify_selected = None;
    }
}

/// Resolve a user's reply to a multiple-choice clarification into an
/// option index. Tries an explicit number first, then a case-insensitive
/// substring match, and defaults to the first option.
pub fn parse_choice(reply: &str, options: &[String]) -> usize {
    if options.is_empty() {
        return 0;
    }

    if let Some(found) = CHOICE_NUMBER_RE.find(reply) {
        if let Ok(number) = found.as_str().parse::<usize>() {
            if (1..=options.len()).contains(&number) {
                return number - 1;
            }
        }
    }

    let reply_lower = reply.trim().to_lowercase();
    if !reply_lower.is_empty() {
        for (idx, option) in options.iter().enumerate() {
            let option_lower = option.to_lowercase();
            if option_lower.contains(&reply_lower) || reply_lower.contains(&option_lower) {
                return idx;
            }
        }
    }

    0
}
