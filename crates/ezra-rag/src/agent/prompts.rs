//! Fixed Hebrew messages and prompt templates used by the agent loop.

use crate::config::AgentConfig;
use crate::types::Ticket;

use super::state::ToolCounts;

/// Marker recorded as a search tool result when retrieval found nothing.
pub const NO_RESULTS_MARKER: &str = "No results found";

/// Capability explanation shown when a question falls outside the
/// support domain.
pub const CAPABILITY_MESSAGE: &str = "אני עוזר תמיכה למערכת ניהול העסק, ויכול לסייע בשאלות על השימוש במערכת: ניהול לקוחות ומשימות, הפקת מסמכים ודוחות, הגדרות והרשאות ופתרון תקלות.\nלא מצאתי במדריכים מידע שמתאים לשאלה ששאלת.\nאם ברצונך לפתוח פניית תמיכה בנושא, כתוב לי ואפתח עבורך פנייה; אחרת, אפשר לשאול אותי שאלה אחרת על המערכת.";

/// Final answer when the search budget runs out without a grounded answer.
pub const BUDGET_EXHAUSTED_ANSWER: &str = "מצטער, לא הצלחתי למצוא במדריכים תשובה מבוססת לשאלה. אפשר לנסח את השאלה מחדש או לפתוח פניית תמיכה.";

/// Final answer when a question is clearly out of the support domain and
/// the capability explanation was already given.
pub const OFF_TOPIC_ANSWER: &str = "אני יכול לעזור רק בשאלות על מערכת ניהול העסק. אשמח לעזור בשאלה על השימוש במערכת.";

/// Final answer when the clarification budget is exhausted.
pub const CLARIFY_BUDGET_ANSWER: &str = "מצטער, לא הצלחתי להבין את השאלה גם לאחר הבהרה. אפשר לנסח אותה מחדש או לפתוח פניית תמיכה.";

/// Final answer when capability explanation was already used this turn.
pub const CAPABILITY_REPEAT_ANSWER: &str = "כפי שציינתי, אני עוזר בשאלות על מערכת ניהול העסק. אפשר לשאול שאלה על המערכת או לפתוח פניית תמיכה.";

/// Final answer when a ticket already exists for this conversation.
pub const TICKET_REPEAT_ANSWER: &str = "כבר נפתחה פניית תמיכה בשיחה זו. צוות התמיכה יחזור אליך בהקדם.";

/// Final answer when the planner loop hits its iteration cap without a
/// deliverable.
pub const LOOP_OVERFLOW_ANSWER: &str = "מצטער, לא הצלחתי להשלים את הטיפול בשאלה. אפשר לנסות שוב או לפתוח פניית תמיכה.";

/// Generic user-facing failure message for transient service errors.
pub const GENERIC_FAILURE_ANSWER: &str = "מצטער, אירעה תקלה זמנית. אפשר לנסות שוב בעוד מספר רגעים.";

/// Clarify option shown when no related titles were found.
pub const NO_OPTIONS_FALLBACK: &str = "לא נמצאו נושאים קרובים";

const FALLBACK_TICKET_CATEGORY: &str = "בקשת תמיכה";
const FALLBACK_TICKET_TITLE: &str = "בקשת תמיכת לקוחות";
const FALLBACK_TICKET_DESCRIPTION: &str = "המשתמש ביקש סיוע מתמיכת לקוחות.";

/// Fixed ticket used when ticket synthesis fails for any reason.
pub fn fallback_ticket() -> Ticket {
    Ticket {
        category: FALLBACK_TICKET_CATEGORY.to_string(),
        title: FALLBACK_TICKET_TITLE.to_string(),
        description: FALLBACK_TICKET_DESCRIPTION.to_string(),
    }
}

/// System prompt for one planner call: role, scope, tool vocabulary,
/// remaining budgets, gathered search context and known question titles.
pub fn planner_system_prompt(
    config: &AgentConfig,
    counts: &ToolCounts,
    search_contexts: &[String],
    question_titles: &[String],
) -> String {
    let mut prompt = String::new();
    prompt.push_str(
        "You are the planner of a Hebrew customer-support assistant for a business \
         management system. You help only with questions about using the system. \
         Decide the single next action and respond with one JSON object: \
         {\"tool\": <name>, \"args\": {...}}. Available tools:\n",
    );
    prompt.push_str(&super::tools::tool_schemas().to_string());

    prompt.push_str(&format!(
        "\n\nRemaining budgets this turn: search {}, clarify {}, final_answer {}, \
         explain_capabilities {}.",
        config.max_searches.saturating_sub(counts.search),
        config.max_clarifications.saturating_sub(counts.clarify),
        config.max_final_answers.saturating_sub(counts.final_answer),
        config.max_capability_explanations.saturating_sub(counts.capability),
    ));
    prompt.push_str(
        "\nGround every final_answer in the search results below. If they do not \
         cover the question, search again with different terms or clarify. \
         Answer the user in Hebrew only.",
    );

    if !search_contexts.is_empty() {
        prompt.push_str("\n\nSearch results gathered this turn:\n");
        for (idx, context) in search_contexts.iter().enumerate() {
            prompt.push_str(&format!("<data_{}>\n{}\n</data_{}>\n", idx + 1, context, idx + 1));
        }
    }

    if !question_titles.is_empty() {
        prompt.push_str("\nKnown manual topics:\n");
        for title in question_titles.iter().take(50) {
            prompt.push_str(&format!("- {title}\n"));
        }
    }

    prompt
}

/// Prompt for synthesizing a support ticket from the conversation.
pub fn ticket_prompt(conversation: &str) -> String {
    format!(
        "Summarize the following support conversation into a ticket. Respond with \
         exactly one JSON object with the keys \"category\", \"title\" and \
         \"description\", all values in Hebrew. \"category\" is at most three words. \
         Do not add any other text.\n\nConversation:\n{conversation}"
    )
}

/// Prompt for routing the message after a capability explanation: does
/// the user want a ticket, or is this a new question?
pub fn routing_prompt(user_message: &str) -> String {
    format!(
        "A support assistant just offered to open a support ticket. The user \
         replied:\n\"{user_message}\"\nDoes the user want a support ticket opened? \
         Answer with exactly one word: TICKET or MESSAGE."
    )
}

/// Cheap lexical check for whether a message is plausibly about the
/// support domain. Retrieval remains the canonical relevance signal; this
/// only guards obvious off-topic questions.
pub fn mentions_topic(message: &str, config: &AgentConfig) -> bool {
    let lowered = message.to_lowercase();
    config
        .topic_keywords
        .iter()
        .any(|keyword| lowered.contains(keyword.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_ticket_has_short_category() {
        let ticket = fallback_ticket();
        assert!(!ticket.category.is_empty());
        assert!(!ticket.title.is_empty());
        assert!(!ticket.description.is_empty());
        assert!(ticket.category.split_whitespace().count() <= 3);
    }

    #[test]
    fn planner_prompt_reflects_budgets_and_context() {
        let config = AgentConfig::default();
        let counts = ToolCounts {
            search: 3,
            ..ToolCounts::default()
        };
        let prompt = planner_system_prompt(
            &config,
            &counts,
            &["ID: 1\nAnswer: something".to_string()],
            &["How do I reset my password?".to_string()],
        );
        assert!(prompt.contains("search 2"));
        assert!(prompt.contains("<data_1>"));
        assert!(prompt.contains("How do I reset my password?"));
    }

    #[test]
    fn topic_check_matches_keywords_case_insensitively() {
        let config = AgentConfig::default();
        assert!(mentions_topic("איך מאפסים סיסמה במערכת?", &config));
        assert!(mentions_topic("Where are the SYSTEM settings?", &config));
        assert!(!mentions_topic("מה מזג האוויר היום?", &config));
    }
}
