//! Tool vocabulary of the planner and strict decoding of its tool calls.

use serde_json::{json, Value};

/// One planner-requested action.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolIntent {
    /// Query the knowledge base.
    Search { query: String },
    /// Ask the user a multiple-choice clarification before searching.
    Clarify {
        question: String,
        /// Query used to populate the options from related titles.
        search_query: String,
    },
    /// Deliver the final answer for this turn.
    FinalAnswer { answer: String },
    /// Explain what the assistant can help with.
    ExplainCapabilities,
    /// Synthesize a support ticket from the conversation.
    BuildTicket,
}

impl ToolIntent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Search { .. } => "search",
            Self::Clarify { .. } => "clarify",
            Self::FinalAnswer { .. } => "final_answer",
            Self::ExplainCapabilities => "explain_capabilities",
            Self::BuildTicket => "build_ticket",
        }
    }

    /// Decode a named tool call with JSON arguments. Unknown names and
    /// missing required arguments yield `None`.
    pub fn decode(name: &str, args: &Value) -> Option<Self> {
        let text_arg = |key: &str| -> Option<String> {
            args.get(key)
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };

        match name {
            "search" => Some(Self::Search {
                query: text_arg("query")?,
            }),
            "clarify" => {
                let question = text_arg("question")?;
                let search_query = text_arg("search_query").unwrap_or_else(|| question.clone());
                Some(Self::Clarify {
                    question,
                    search_query,
                })
            }
            "final_answer" => Some(Self::FinalAnswer {
                answer: text_arg("answer")?,
            }),
            "explain_capabilities" => Some(Self::ExplainCapabilities),
            "build_ticket" => Some(Self::BuildTicket),
            _ => None,
        }
    }
}

/// Tool descriptions advertised to the planner.
pub fn tool_schemas() -> Value {
    json!([
        {
            "name": "search",
            "description": "חיפוש במאגר הידע של מדריכי המערכת",
            "parameters": {"query": "שאילתת חיפוש בעברית או באנגלית"},
        },
        {
            "name": "clarify",
            "description": "שאלת הבהרה עם אפשרויות בחירה כשהשאלה עמומה",
            "parameters": {
                "question": "שאלת ההבהרה למשתמש",
                "search_query": "שאילתה לאיתור נושאים קרובים לאפשרויות",
            },
        },
        {
            "name": "final_answer",
            "description": "מסירת התשובה הסופית למשתמש, מבוססת על תוצאות חיפוש",
            "parameters": {"answer": "התשובה בעברית"},
        },
        {
            "name": "explain_capabilities",
            "description": "הסבר למשתמש על תחומי העזרה של העוזר כשהשאלה מחוץ לתחום",
            "parameters": {},
        },
        {
            "name": "build_ticket",
            "description": "פתיחת פניית תמיכה כשהמשתמש מבקש זאת",
            "parameters": {},
        },
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_search_with_query() {
        let intent = ToolIntent::decode("search", &json!({"query": "איפוס סיסמה"})).unwrap();
        assert_eq!(
            intent,
            ToolIntent::Search {
                query: "איפוס סיסמה".to_string()
            }
        );
    }

    #[test]
    fn search_without_query_is_rejected() {
        assert!(ToolIntent::decode("search", &json!({})).is_none());
        assert!(ToolIntent::decode("search", &json!({"query": "  "})).is_none());
    }

    #[test]
    fn clarify_falls_back_to_question_as_search_query() {
        let intent = ToolIntent::decode("clarify", &json!({"question": "לאיזו משימה?"})).unwrap();
        assert_eq!(
            intent,
            ToolIntent::Clarify {
                question: "לאיזו משימה?".to_string(),
                search_query: "לאיזו משימה?".to_string(),
            }
        );
    }

    #[test]
    fn unknown_tool_is_rejected() {
        assert!(ToolIntent::decode("delete_everything", &json!({})).is_none());
    }

    #[test]
    fn parameterless_tools_decode() {
        assert_eq!(
            ToolIntent::decode("explain_capabilities", &json!({})),
            Some(ToolIntent::ExplainCapabilities)
        );
        assert_eq!(
            ToolIntent::decode("build_ticket", &Value::Null),
            Some(ToolIntent::BuildTicket)
        );
    }

    #[test]
    fn schema_names_match_decoder() {
        let schemas = tool_schemas();
        for schema in schemas.as_array().unwrap() {
            let name = schema["name"].as_str().unwrap();
            let args = json!({
                "query": "x", "question": "x", "search_query": "x", "answer": "x",
            });
            assert!(ToolIntent::decode(name, &args).is_some(), "schema {name} undecodable");
        }
    }
}
