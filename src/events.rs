//! Execution events emitted while a task runs.
//!
//! The agent never prints. The CLI renders these events to the console and
//! the HTTP API appends them to the task log.

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::todos::TodoStatus;

/// Capacity of the event channel. Slow subscribers drop the oldest events.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// A fresh task was created.
    TaskStarted { task_id: String, task: String },
    /// A saved task was picked up again.
    TaskResumed {
        task_id: String,
        completed_steps: usize,
        current_step: String,
    },
    /// Start of one loop iteration (1-based).
    Iteration { number: usize },
    /// Assistant text returned alongside or instead of tool calls.
    Thinking { content: String },
    ToolCall { id: String, name: String, args: Value },
    ToolResult {
        id: String,
        name: String,
        success: bool,
        summary: String,
    },
    TodoUpdated {
        id: String,
        status: TodoStatus,
        description: String,
    },
    SummaryCreated {
        summary_id: String,
        accomplishments: usize,
    },
    /// A request was delayed to respect the minimum request interval.
    Throttled { wait_ms: u64 },
    /// An LLM request failed and will be retried.
    Retrying {
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    /// The client moved to another model after repeated failures.
    ModelSwitched { from: String, to: String },
    SubtaskStarted { id: String, description: String },
    SubtaskFinished {
        id: String,
        description: String,
        success: bool,
    },
    Paused,
    Resumed,
    Error { message: String },
    Finished { success: bool, iterations: usize },
}

/// Sending half of the event channel. Sending never fails: events emitted
/// with no subscriber are dropped.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: broadcast::Sender<AgentEvent>,
}

impl EventSink {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn emit(&self, event: AgentEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new()
    }
}
