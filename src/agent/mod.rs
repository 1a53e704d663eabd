//! Agent module - the core autonomous agent logic.
//!
//! The agent follows a "tools in a loop" pattern:
//! 1. Build context with a recovery-aware system prompt and the user task
//! 2. Call LLM with available tools
//! 3. If LLM requests tool calls, execute them and feed results back
//! 4. On a plain answer, decide completion (user or heuristics)
//! 5. Save state after every iteration so the task can be resumed
//!
//! `run_plan` is the alternative workflow that plans and decomposes the task
//! before executing subtasks one by one.

mod agent_loop;
pub mod completion;
mod planner;
mod prompt;
mod session;
pub mod summary;

pub use agent_loop::{Agent, TaskOutcome};
pub use completion::Verdict;
pub use planner::{parse_subtasks, Subtask, SubtaskResult, TaskReport};
pub use prompt::build_system_prompt;
pub use session::{MAX_DELEGATION_DEPTH, SESSION_TOOLS};
