//! Checkpointed agent control loop over the retrieval pipeline.

pub mod control;
pub mod planner;
pub mod prompts;
pub mod state;
pub mod tools;

pub use control::{TurnEvent, TurnOutcome, TurnRunner};
pub use planner::{LlmPlanner, PlannedStep, Planner, PlannerDecision};
pub use state::{parse_choice, AgentState, ControlSignal, Message, OutputKind, Role, ToolCounts};
pub use tools::ToolIntent;
