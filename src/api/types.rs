//! API request and response types.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::events::AgentEvent;

/// Request to submit a new task.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateTaskRequest {
    /// The task description / user prompt
    #[serde(default)]
    pub task: String,

    /// Optional model override (uses default if not specified)
    pub model: Option<String>,

    /// Optional workspace path override
    pub workspace_path: Option<String>,

    /// Run the plan workflow instead of the persistent loop
    #[serde(default)]
    pub plan: bool,

    /// Resume a saved task by its id
    pub resume_id: Option<String>,
}

/// Response after creating a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTaskResponse {
    /// Unique task identifier
    pub id: Uuid,

    /// Current task status
    pub status: TaskStatus,
}

/// Task status enumeration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Task is queued, waiting to start
    Pending,
    /// Task is currently running
    Running,
    /// Task completed successfully
    Completed,
    /// Task failed with an error
    Failed,
    /// Task was stopped through the API
    Cancelled,
}

impl TaskStatus {
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// Full task state including results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskState {
    /// Unique task identifier
    pub id: Uuid,

    /// Current status
    pub status: TaskStatus,

    /// Original task description
    pub task: String,

    /// Model used for this task
    pub model: String,

    /// Id of the persisted agent state, usable as `resume_id`
    pub agent_task_id: Option<String>,

    /// Number of iterations completed
    pub iterations: usize,

    /// Final result or error message
    pub result: Option<String>,

    /// Whether a failed run left resumable state behind
    pub resume_possible: bool,

    /// Detailed execution log
    pub log: Vec<TaskLogEntry>,
}

/// A single entry in the task execution log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskLogEntry {
    /// Timestamp (ISO 8601)
    pub timestamp: String,

    /// Entry type
    pub entry_type: LogEntryType,

    /// Content of the entry
    pub content: String,
}

/// Types of log entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogEntryType {
    /// Agent is thinking / planning
    Thinking,
    /// Tool is being called
    ToolCall,
    /// Tool returned a result
    ToolResult,
    /// Todo, summary, subtask and retry notices
    Progress,
    /// Agent produced final response
    Response,
    /// An error occurred
    Error,
}

impl TaskLogEntry {
    pub fn new(entry_type: LogEntryType, content: impl Into<String>) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            entry_type,
            content: content.into(),
        }
    }

    /// Log entry for an agent event, if the event is worth logging.
    pub fn from_event(event: &AgentEvent) -> Option<Self> {
        let (entry_type, content) = match event {
            AgentEvent::TaskStarted { task_id, .. } => {
                (LogEntryType::Progress, format!("Started task {}", task_id))
            }
            AgentEvent::TaskResumed {
                task_id,
                completed_steps,
                current_step,
            } => (
                LogEntryType::Progress,
                format!(
                    "Resumed task {} ({} completed steps, at: {})",
                    task_id, completed_steps, current_step
                ),
            ),
            AgentEvent::Thinking { content } => (LogEntryType::Thinking, content.clone()),
            AgentEvent::ToolCall { name, args, .. } => (
                LogEntryType::ToolCall,
                format!("Calling tool: {} with args: {}", name, args),
            ),
            AgentEvent::ToolResult { name, summary, .. } => {
                (LogEntryType::ToolResult, format!("{}: {}", name, summary))
            }
            AgentEvent::TodoUpdated {
                id,
                status,
                description,
            } => (
                LogEntryType::Progress,
                format!("Todo {} [{}]: {}", id, status.as_str(), description),
            ),
            AgentEvent::SummaryCreated {
                summary_id,
                accomplishments,
            } => (
                LogEntryType::Progress,
                format!("Summary {} ({} accomplishments)", summary_id, accomplishments),
            ),
            AgentEvent::Retrying {
                attempt,
                delay_ms,
                error,
            } => (
                LogEntryType::Progress,
                format!("Retry {} in {}ms after: {}", attempt, delay_ms, error),
            ),
            AgentEvent::ModelSwitched { from, to } => (
                LogEntryType::Progress,
                format!("Switched model from {} to {}", from, to),
            ),
            AgentEvent::SubtaskStarted { id, description } => (
                LogEntryType::Progress,
                format!("Subtask {} started: {}", id, description),
            ),
            AgentEvent::SubtaskFinished { id, success, .. } => (
                LogEntryType::Progress,
                format!(
                    "Subtask {} {}",
                    id,
                    if *success { "completed" } else { "failed" }
                ),
            ),
            AgentEvent::Error { message } => (LogEntryType::Error, message.clone()),
            AgentEvent::Iteration { .. }
            | AgentEvent::Throttled { .. }
            | AgentEvent::Paused
            | AgentEvent::Resumed
            | AgentEvent::Finished { .. } => return None,
        };
        Some(Self::new(entry_type, content))
    }
}

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Service status
    pub status: String,

    /// Service version
    pub version: String,
}
