//! The agent turn runner: a bounded planner loop with per-tool budgets,
//! suspend/resume checkpoints and streamed progress events.
//!
//! One call to [`TurnRunner::run`] drives one user message to either a
//! final deliverable (answer or ticket) or a suspension point
//! (clarification question, capability explanation). Suspended turns are
//! checkpointed and resumed by the next message in the same session.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::AgentConfig;
use crate::llm::{CompletionClient, CompletionOptions};
use crate::search::Retriever;
use crate::storage::CheckpointStore;
use crate::types::{Ticket, Usage};

use super::planner::{Planner, PlannerDecision};
use super::prompts;
use super::state::{parse_choice, AgentState, ControlSignal, Message, OutputKind, ToolCounts};
use super::tools::ToolIntent;

/// Progress events streamed while a turn runs.
#[derive(Debug, Clone)]
pub enum TurnEvent {
    /// The loop entered a named stage.
    Node(&'static str),
    /// A tool is about to execute.
    Tool(&'static str),
    /// User-visible answer text.
    Token(String),
    /// The turn suspended on a multiple-choice clarification.
    Clarification {
        question: String,
        options: Vec<String>,
    },
    /// A support ticket was synthesized.
    Ticket(Ticket),
    /// The turn is complete and persisted.
    Done,
}

/// Result of one runner invocation.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub state: AgentState,
    /// User-visible answer text for this turn.
    pub answer: String,
    pub kind: OutputKind,
    pub ticket: Option<Ticket>,
    pub usage: Usage,
    /// The turn suspended and awaits the next user message.
    pub suspended: bool,
}

/// What to do after budget enforcement: run a tool, or deliver a canned
/// final answer directly.
enum Step {
    Run(ToolIntent),
    Deliver(&'static str),
}

/// Drives agent turns against a fixed retrieval snapshot.
pub struct TurnRunner {
    retriever: Arc<Retriever>,
    planner: Arc<dyn Planner>,
    completion: Arc<dyn CompletionClient>,
    checkpoints: Arc<dyn CheckpointStore>,
    config: AgentConfig,
    completion_options: CompletionOptions,
    question_titles: Arc<Vec<String>>,
}

impl TurnRunner {
    pub fn new(
        retriever: Arc<Retriever>,
        planner: Arc<dyn Planner>,
        completion: Arc<dyn CompletionClient>,
        checkpoints: Arc<dyn CheckpointStore>,
        config: AgentConfig,
        completion_options: CompletionOptions,
        question_titles: Arc<Vec<String>>,
    ) -> Self {
        Self {
            retriever,
            planner,
            completion,
            checkpoints,
            config,
            completion_options,
            question_titles,
        }
    }

    /// Run one turn for `message`. Never errors: service failures become
    /// an apologetic final answer so the turn always produces a
    /// recordable outcome.
    pub async fn run(
        &self,
        session_id: &str,
        message: &str,
        prior_history: Vec<Message>,
        events: &mpsc::Sender<TurnEvent>,
    ) -> TurnOutcome {
        let mut usage = Usage::default();
        let mut state = match self.checkpoints.get(session_id) {
            Some(mut checkpoint)
                if checkpoint.control_signal == ControlSignal::AwaitingClarification =>
            {
                let _ = events.send(TurnEvent::Node("clarify_resume")).await;
                self.resume_clarification(&mut checkpoint, message);
                checkpoint
            }
            Some(mut checkpoint)
                if checkpoint.control_signal == ControlSignal::AwaitingTicketRouting =>
            {
                let _ = events.send(TurnEvent::Node("ticket_routing")).await;
                checkpoint.history.push(Message::user(message));
                if self.wants_ticket(message, &mut usage).await {
                    // Routing must honor the one-ticket-per-session rule
                    // just like a planner-issued build_ticket.
                    if checkpoint.ticket_built {
                        return self.finalize(
                            checkpoint,
                            prompts::TICKET_REPEAT_ANSWER.to_string(),
                            usage,
                            events,
                            session_id,
                        )
                        .await;
                    }
                    return self.build_ticket(checkpoint, usage, events, session_id).await;
                }
                checkpoint.reset_for_new_question();
                checkpoint
            }
            previous => {
                let mut state = AgentState::new_turn(prior_history, message);
                // One ticket per session, across turns.
                state.ticket_built = previous.map(|p| p.ticket_built).unwrap_or(false);
                state
            }
        };

        for iteration in 1..=self.config.max_iterations {
            let _ = events.send(TurnEvent::Node("plan")).await;
            let system_prompt = prompts::planner_system_prompt(
                &self.config,
                &state.tool_counts,
                &state.search_contexts,
                &self.question_titles,
            );
            let step = match self.planner.plan(&state, &system_prompt).await {
                Ok(step) => step,
                Err(err) => {
                    warn!(%err, iteration, "planner call failed");
                    return self.finalize(
                        state,
                        prompts::GENERIC_FAILURE_ANSWER.to_string(),
                        usage,
                        events,
                        session_id,
                    )
                    .await;
                }
            };
            usage.add(step.usage);

            let intent = match step.decision {
                PlannerDecision::Tool(intent) => intent,
                // Tool-less planner output is its answer.
                PlannerDecision::Direct(text) if !text.is_empty() => {
                    ToolIntent::FinalAnswer { answer: text }
                }
                PlannerDecision::Direct(_) => {
                    continue;
                }
            };
            debug!(iteration, tool = intent.name(), "planner chose a tool");

            match self.enforce_budgets(&state, intent) {
                Step::Deliver(canned) => {
                    return self.finalize(state, canned.to_string(), usage, events, session_id).await;
                }
                Step::Run(ToolIntent::Search { query }) => {
                    let redirect = self.run_search(&mut state, &query, events).await;
                    if redirect {
                        if state.tool_counts.capability
                            < self.config.max_capability_explanations
                        {
                            return self
                                .suspend_capability(state, usage, events, session_id)
                                .await;
                        }
                        return self.finalize(
                            state,
                            prompts::OFF_TOPIC_ANSWER.to_string(),
                            usage,
                            events,
                            session_id,
                        )
                        .await;
                    }
                }
                Step::Run(ToolIntent::Clarify {
                    question,
                    search_query,
                }) => {
                    return self
                        .suspend_clarification(
                            state,
                            question,
                            &search_query,
                            usage,
                            events,
                            session_id,
                        )
                        .await;
                }
                Step::Run(ToolIntent::FinalAnswer { answer }) => {
                    if state.tool_counts.final_answer >= self.config.max_final_answers {
                        // Second final answer in one turn ends it as-is.
                        let delivered = if state.pending_output.is_empty() {
                            answer
                        } else {
                            state.pending_output.clone()
                        };
                        return self.finalize(state, delivered, usage, events, session_id).await;
                    }
                    if !self.question_in_scope(&state) {
                        if state.tool_counts.capability
                            < self.config.max_capability_explanations
                        {
                            return self
                                .suspend_capability(state, usage, events, session_id)
                                .await;
                        }
                        return self.finalize(
                            state,
                            prompts::OFF_TOPIC_ANSWER.to_string(),
                            usage,
                            events,
                            session_id,
                        )
                        .await;
                    }
                    state.tool_counts.final_answer += 1;
                    let _ = events.send(TurnEvent::Tool("final_answer")).await;
                    return self.finalize(state, answer, usage, events, session_id).await;
                }
                Step::Run(ToolIntent::ExplainCapabilities) => {
                    return self.suspend_capability(state, usage, events, session_id).await;
                }
                Step::Run(ToolIntent::BuildTicket) => {
                    return self.build_ticket(state, usage, events, session_id).await;
                }
            }
        }

        info!(session_id, "planner loop hit iteration cap");
        let answer = if state.pending_kind == Some(OutputKind::FinalText)
            && !state.pending_output.is_empty()
        {
            state.pending_output.clone()
        } else {
            prompts::LOOP_OVERFLOW_ANSWER.to_string()
        };
        self.finalize(state, answer, usage, events, session_id).await
    }

    /// Substitute over-budget tool calls per the budget policy.
    fn enforce_budgets(&self, state: &AgentState, intent: ToolIntent) -> Step {
        let counts: &ToolCounts = &state.tool_counts;
        match intent {
            ToolIntent::Search { .. } if counts.search >= self.config.max_searches => {
                if !self.question_in_scope(state) {
                    if counts.capability < self.config.max_capability_explanations {
                        Step::Run(ToolIntent::ExplainCapabilities)
                    } else {
                        Step::Deliver(prompts::OFF_TOPIC_ANSWER)
                    }
                } else {
                    Step::Deliver(prompts::BUDGET_EXHAUSTED_ANSWER)
                }
            }
            ToolIntent::Clarify { .. } if counts.clarify >= self.config.max_clarifications => {
                Step::Deliver(prompts::CLARIFY_BUDGET_ANSWER)
            }
            ToolIntent::ExplainCapabilities
                if counts.capability >= self.config.max_capability_explanations =>
            {
                Step::Deliver(prompts::CAPABILITY_REPEAT_ANSWER)
            }
            ToolIntent::BuildTicket if state.ticket_built => {
                Step::Deliver(prompts::TICKET_REPEAT_ANSWER)
            }
            other => Step::Run(other),
        }
    }

    /// Topical pre-filter: some user message mentions domain keywords,
    /// the user engaged with a clarification, or a search this turn
    /// actually returned passages. Retrieval remains the canonical
    /// relevance signal.
    fn question_in_scope(&self, state: &AgentState) -> bool {
        if state.clarify_selected.is_some() {
            return true;
        }
        if state
            .history
            .iter()
            .filter(|m| m.role == super::state::Role::User)
            .any(|m| prompts::mentions_topic(&m.content, &self.config))
        {
            return true;
        }
        state
            .search_contexts
            .iter()
            .any(|context| !context.is_empty() && context != prompts::NO_RESULTS_MARKER)
    }

    /// Execute one search. Returns true when the turn should redirect to
    /// a capability explanation: the very first search found nothing and
    /// the question shows no topical anchor.
    async fn run_search(
        &self,
        state: &mut AgentState,
        query: &str,
        events: &mpsc::Sender<TurnEvent>,
    ) -> bool {
        state.tool_counts.search += 1;
        let _ = events.send(TurnEvent::Tool("search")).await;

        let mut variants: Vec<String> = Vec::new();
        if let Some(selected) = state.clarify_selected {
            if let Some(option) = state.clarify_options.get(selected) {
                variants.push(option.clone());
            }
        }
        let result = self.retriever.retrieve_with_variants(query, &variants).await;

        let context = if result.hits.is_empty() {
            prompts::NO_RESULTS_MARKER.to_string()
        } else {
            Retriever::format_context(&result)
        };
        state.history.push(Message::tool(format!(
            "search(\"{query}\"): {} passages",
            result.hits.len()
        )));
        state.search_contexts.push(context);

        let first_search_empty = state.tool_counts.search == 1 && result.hits.is_empty();
        let topical = state
            .last_user_message()
            .map(|m| prompts::mentions_topic(m, &self.config))
            .unwrap_or(false);
        first_search_empty && !topical
    }

    /// Suspend the turn on a multiple-choice clarification.
    async fn suspend_clarification(
        &self,
        mut state: AgentState,
        question: String,
        search_query: &str,
        usage: Usage,
        events: &mpsc::Sender<TurnEvent>,
        session_id: &str,
    ) -> TurnOutcome {
        state.tool_counts.clarify += 1;
        let _ = events.send(TurnEvent::Tool("clarify")).await;

        let related = self.retriever.retrieve(search_query).await;
        let mut options = related.question_titles();
        options.truncate(3);
        if options.is_empty() {
            options.extend(self.question_titles.iter().take(3).cloned());
        }
        if options.is_empty() {
            options.push(prompts::NO_OPTIONS_FALLBACK.to_string());
        }

        let rendered = render_choices(&question, &options);
        state.history.push(Message::assistant(rendered.clone()));
        state.clarify_question = question.clone();
        state.clarify_options = options.clone();
        state.clarify_selected = None;
        state.pending_output = rendered.clone();
        state.pending_kind = Some(OutputKind::Clarification);
        state.control_signal = ControlSignal::AwaitingClarification;
        self.checkpoints.put(session_id, &state);

        let _ = events
            .send(TurnEvent::Clarification {
                question,
                options,
            })
            .await;
        TurnOutcome {
            answer: rendered,
            kind: OutputKind::Clarification,
            ticket: None,
            usage,
            suspended: true,
            state,
        }
    }

    /// Apply the user's reply to a pending clarification.
    fn resume_clarification(&self, state: &mut AgentState, message: &str) {
        state.history.push(Message::user(message));
        let selected = parse_choice(message, &state.clarify_options);
        let option = state
            .clarify_options
            .get(selected)
            .cloned()
            .unwrap_or_default();
        state.history.push(Message::tool(format!(
            "clarification choice {}: {option}",
            selected + 1
        )));
        state.clarify_selected = Some(selected);
        state.control_signal = ControlSignal::Planning;
    }

    /// Suspend after explaining capabilities; the next message routes to
    /// ticket creation or a fresh question.
    async fn suspend_capability(
        &self,
        mut state: AgentState,
        usage: Usage,
        events: &mpsc::Sender<TurnEvent>,
        session_id: &str,
    ) -> TurnOutcome {
        state.tool_counts.capability += 1;
        let _ = events.send(TurnEvent::Tool("explain_capabilities")).await;

        state
            .history
            .push(Message::assistant(prompts::CAPABILITY_MESSAGE));
        state.pending_output = prompts::CAPABILITY_MESSAGE.to_string();
        state.pending_kind = Some(OutputKind::FinalText);
        state.control_signal = ControlSignal::AwaitingTicketRouting;
        self.checkpoints.put(session_id, &state);

        let _ = events
            .send(TurnEvent::Token(prompts::CAPABILITY_MESSAGE.to_string()))
            .await;
        TurnOutcome {
            answer: prompts::CAPABILITY_MESSAGE.to_string(),
            kind: OutputKind::FinalText,
            ticket: None,
            usage,
            suspended: true,
            state,
        }
    }

    /// Decide whether a post-capability reply asks for a ticket. A cheap
    /// lexical check first, then the routing model; routing failures fall
    /// back to treating the reply as a new question.
    async fn wants_ticket(&self, message: &str, usage: &mut Usage) -> bool {
        let lowered = message.to_lowercase();
        if lowered.contains("פנייה") || lowered.contains("פניה") || lowered.contains("ticket")
        {
            return true;
        }
        if lowered.split_whitespace().any(|token| token == "כן" || token == "yes") {
            return true;
        }

        match self
            .completion
            .complete(&prompts::routing_prompt(message), &self.completion_options)
            .await
        {
            Ok(completion) => {
                usage.add(completion.usage);
                completion.text.to_uppercase().contains("TICKET")
            }
            Err(err) => {
                warn!(%err, "ticket routing call failed, treating reply as a new question");
                false
            }
        }
    }

    /// Synthesize a support ticket and finish the turn.
    async fn build_ticket(
        &self,
        mut state: AgentState,
        mut usage: Usage,
        events: &mpsc::Sender<TurnEvent>,
        session_id: &str,
    ) -> TurnOutcome {
        let _ = events.send(TurnEvent::Tool("build_ticket")).await;
        let ticket = self.synthesize_ticket(&state, &mut usage).await;
        state.ticket_built = true;

        let answer = format!("פתחתי עבורך פניית תמיכה: {}", ticket.title);
        state.history.push(Message::assistant(answer.clone()));
        state.pending_output =
            serde_json::to_string(&ticket).unwrap_or_else(|_| answer.clone());
        state.pending_kind = Some(OutputKind::Ticket);
        state.control_signal = ControlSignal::Finished;
        self.checkpoints.put(session_id, &state);

        let _ = events.send(TurnEvent::Ticket(ticket.clone())).await;
        let _ = events.send(TurnEvent::Token(answer.clone())).await;
        TurnOutcome {
            answer,
            kind: OutputKind::Ticket,
            ticket: Some(ticket),
            usage,
            suspended: false,
            state,
        }
    }

    /// Ask the model for `{category, title, description}`. Any failure,
    /// from transport to malformed fields, yields the fixed fallback
    /// ticket.
    async fn synthesize_ticket(&self, state: &AgentState, usage: &mut Usage) -> Ticket {
        let conversation: String = state
            .history
            .iter()
            .filter(|m| m.role != super::state::Role::Tool)
            .map(|m| {
                let speaker = match m.role {
                    super::state::Role::User => "User",
                    _ => "Assistant",
                };
                format!("{speaker}: {}\n", m.content)
            })
            .collect();

        let completion = match self
            .completion
            .complete(&prompts::ticket_prompt(&conversation), &self.completion_options)
            .await
        {
            Ok(completion) => completion,
            Err(err) => {
                warn!(%err, "ticket synthesis call failed, using fallback ticket");
                return prompts::fallback_ticket();
            }
        };
        usage.add(completion.usage);

        let Some(mut ticket) = decode_ticket(&completion.text) else {
            warn!("ticket synthesis returned malformed JSON, using fallback ticket");
            return prompts::fallback_ticket();
        };
        let words: Vec<&str> = ticket.category.split_whitespace().collect();
        if words.len() > 3 {
            ticket.category = words[..3].join(" ");
        }
        ticket
    }

    /// Record the final answer, close the checkpoint and emit it.
    async fn finalize(
        &self,
        mut state: AgentState,
        answer: String,
        usage: Usage,
        events: &mpsc::Sender<TurnEvent>,
        session_id: &str,
    ) -> TurnOutcome {
        state.history.push(Message::assistant(answer.clone()));
        state.pending_output = answer.clone();
        state.pending_kind = Some(OutputKind::FinalText);
        state.control_signal = ControlSignal::Finished;
        self.checkpoints.put(session_id, &state);

        let _ = events.send(TurnEvent::Token(answer.clone())).await;
        TurnOutcome {
            answer,
            kind: OutputKind::FinalText,
            ticket: None,
            usage,
            suspended: false,
            state,
        }
    }
}

fn render_choices(question: &str, options: &[String]) -> String {
    let mut rendered = question.to_string();
    for (idx, option) in options.iter().enumerate() {
        rendered.push_str(&format!("\n{}. {option}", idx + 1));
    }
    rendered
}

/// Decode a `{category, title, description}` object from model output,
/// tolerating surrounding prose.
fn decode_ticket(raw: &str) -> Option<Ticket> {
    let trimmed = raw.trim();
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    let ticket: Ticket = serde_json::from_str(&trimmed[start..=end]).ok()?;
    if ticket.category.trim().is_empty()
        || ticket.title.trim().is_empty()
        || ticket.description.trim().is_empty()
    {
        return None;
    }
    Some(ticket)
}
