//! Planner abstraction: choose the next tool call for the current state.

use std::sync::Arc;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use tracing::debug;

use crate::llm::{CompletionClient, CompletionOptions, ServiceError};
use crate::types::Usage;

use super::state::{AgentState, Role};
use super::tools::ToolIntent;

static JSON_OBJECT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)\{.*\}").expect("json object regex is valid")
});

/// What the planner chose to do next.
#[derive(Debug, Clone, PartialEq)]
pub enum PlannerDecision {
    Tool(ToolIntent),
    /// Plain text without a tool call, treated as the final answer.
    Direct(String),
}

/// One planner step with its token cost.
#[derive(Debug, Clone)]
pub struct PlannedStep {
    pub decision: PlannerDecision,
    pub usage: Usage,
}

#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(
        &self,
        state: &AgentState,
        system_prompt: &str,
    ) -> Result<PlannedStep, ServiceError>;
}

/// LLM-backed planner: renders the conversation under the system prompt
/// and decodes a single JSON tool call from the reply.
pub struct LlmPlanner {
    completion: Arc<dyn CompletionClient>,
    options: CompletionOptions,
}

impl LlmPlanner {
    pub fn new(completion: Arc<dyn CompletionClient>, options: CompletionOptions) -> Self {
        Self {
            completion,
            options,
        }
    }

    fn render_prompt(state: &AgentState, system_prompt: &str) -> String {
        let mut prompt = String::from(system_prompt);
        prompt.push_str("\n\nConversation:\n");
        for message in &state.history {
            let speaker = match message.role {
                Role::User => "User",
                Role::Assistant => "Assistant",
                Role::Tool => "Tool",
            };
            prompt.push_str(&format!("{speaker}: {}\n", message.content));
        }
        prompt.push_str("\nNext action (one JSON object):");
        prompt
    }

    /// Decode `{"tool": ..., "args": {...}}` from the model reply.
    /// Non-conforming replies become a direct answer.
    fn decode(reply: &str) -> PlannerDecision {
        #[derive(Deserialize)]
        struct WireCall {
            tool: String,
            #[serde(default)]
            args: serde_json::Value,
        }

        if let Some(found) = JSON_OBJECT_RE.find(reply) {
            if let Ok(call) = serde_json::from_str::<WireCall>(found.as_str()) {
                if let Some(intent) = ToolIntent::decode(&call.tool, &call.args) {
                    return PlannerDecision::Tool(intent);
                }
                debug!(tool = %call.tool, "planner chose an undecodable tool, treating as text");
            }
        }
        PlannerDecision::Direct(reply.trim().to_string())
    }
}

#[async_trait]
impl Planner for LlmPlanner {
    async fn plan(
        &self,
        state: &AgentState,
        system_prompt: &str,
    ) -> Result<PlannedStep, ServiceError> {
        let prompt = Self::render_prompt(state, system_prompt);
        let completion = self.completion.complete(&prompt, &self.options).await?;
        Ok(PlannedStep {
            decision: Self::decode(&completion.text),
            usage: completion.usage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_tool_call_with_surrounding_text() {
        let reply = "Thinking... {\"tool\": \"search\", \"args\": {\"query\": \"איפוס סיסמה\"}}";
        assert_eq!(
            LlmPlanner::decode(reply),
            PlannerDecision::Tool(ToolIntent::Search {
                query: "איפוס סיסמה".to_string()
            })
        );
    }

    #[test]
    fn plain_text_becomes_direct_answer() {
        assert_eq!(
            LlmPlanner::decode("  התשובה היא כך וכך  "),
            PlannerDecision::Direct("התשובה היא כך וכך".to_string())
        );
    }

    #[test]
    fn unknown_tool_becomes_direct_answer() {
        let reply = "{\"tool\": \"launch_rocket\", \"args\": {}}";
        match LlmPlanner::decode(reply) {
            PlannerDecision::Direct(text) => assert!(text.contains("launch_rocket")),
            other => panic!("expected direct answer, got {other:?}"),
        }
    }

    #[test]
    fn args_default_to_null_object() {
        let reply = "{\"tool\": \"build_ticket\"}";
        assert_eq!(
            LlmPlanner::decode(reply),
            PlannerDecision::Tool(ToolIntent::BuildTicket)
        );
    }
}
