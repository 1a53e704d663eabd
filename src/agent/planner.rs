//! Plan workflow: plan, decompose into subtasks, execute each, report.

use serde::{Deserialize, Serialize};

use crate::error::AgentError;
use crate::events::AgentEvent;
use crate::llm::{ChatMessage, TokenUsage, ToolSchema};
use crate::state::{task_id_for, PersistentState};
use crate::todos::{TodoStatus, MAIN_TASK_ID};

use super::agent_loop::Agent;
use super::completion::subtask_succeeded;
use super::prompt::{
    aggregation_prompt, decomposition_prompt, execution_prompt, plan_system_prompt,
    planning_prompt,
};

/// Subtasks executed per plan run.
pub const MAX_PLAN_ITERATIONS: usize = 10;

/// Tool round trips allowed within one subtask.
const MAX_TOOL_ROUNDS: usize = 3;

/// Tool results considered when judging a subtask.
const RECENT_RESULTS: usize = 5;

fn default_priority() -> u32 {
    3
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subtask {
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub tools_needed: Vec<String>,
    #[serde(default)]
    pub expected_output: String,
    #[serde(default)]
    pub verification_criteria: String,
    /// Lower runs first.
    #[serde(default = "default_priority")]
    pub priority: u32,
}

impl Subtask {
    /// Single subtask used when the decomposition cannot be parsed.
    pub fn fallback(task: &str) -> Self {
        Self {
            id: "fallback_task".to_string(),
            description: task.to_string(),
            tools_needed: vec!["file_search".to_string()],
            expected_output: "Task completion".to_string(),
            verification_criteria: "Task executed without errors".to_string(),
            priority: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SubtaskResult {
    pub id: String,
    pub description: String,
    pub success: bool,
    pub output: String,
    pub tools_used: Vec<String>,
}

/// Final report of a plan run.
#[derive(Debug, Clone, Serialize)]
pub struct TaskReport {
    pub task: String,
    pub subtasks_total: usize,
    pub subtasks_completed: usize,
    pub subtasks_failed: usize,
    pub success_rate: f64,
    pub results: Vec<SubtaskResult>,
    pub final_report: String,
    pub usage: TokenUsage,
}

impl TaskReport {
    pub fn success(&self) -> bool {
        self.subtasks_completed > 0 && self.subtasks_failed == 0
    }
}

/// Parse `{"subtasks": [...]}` out of a model reply, sorted by priority.
/// Code fences and surrounding prose are ignored.
pub fn parse_subtasks(text: &str) -> Option<Vec<Subtask>> {
    #[derive(Deserialize)]
    struct Plan {
        subtasks: Vec<Subtask>,
    }

    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end < start {
        return None;
    }
    let mut subtasks = serde_json::from_str::<Plan>(&text[start..=end]).ok()?.subtasks;
    if subtasks.is_empty() {
        return None;
    }
    subtasks.sort_by_key(|s| s.priority);
    Some(subtasks)
}

impl Agent {
    /// Run the plan workflow for `task`.
    pub async fn run_plan(&self, task: &str) -> Result<TaskReport, AgentError> {
        self.todos
            .update(MAIN_TASK_ID, TodoStatus::InProgress, Some(task));
        self.events.emit(AgentEvent::TaskStarted {
            task_id: task_id_for(task),
            task: task.to_string(),
        });

        let result = self.plan_and_execute(task).await;
        let success = result.as_ref().is_ok_and(TaskReport::success);
        self.todos.update(
            MAIN_TASK_ID,
            if success {
                TodoStatus::Completed
            } else {
                TodoStatus::Failed
            },
            None,
        );
        if let Err(e) = &result {
            tracing::error!("Plan run failed: {}", e);
            self.events.emit(AgentEvent::Error {
                message: e.to_string(),
            });
        }
        self.events.emit(AgentEvent::Finished {
            success,
            iterations: result.as_ref().map_or(0, |r| r.results.len()),
        });
        result
    }

    async fn plan_and_execute(&self, task: &str) -> Result<TaskReport, AgentError> {
        // Tool progress is tracked in memory only; plan runs are not resumable.
        let mut state = PersistentState::new(task);
        let infos = self.tools.list_tools();
        let tool_names: Vec<String> = infos.iter().map(|t| t.name.clone()).collect();
        let schemas = self.tools.get_tool_schemas();
        let mut usage = TokenUsage::default();

        let mut messages = vec![ChatMessage::system(plan_system_prompt(
            &self.workspace_display(),
            &infos,
        ))];

        self.control.checkpoint().await?;
        messages.push(ChatMessage::user(planning_prompt(task)));
        let plan = self.ask_model(&mut messages, None, &mut usage).await?;
        tracing::info!("Plan created");
        self.events.emit(AgentEvent::Thinking { content: plan });

        self.control.checkpoint().await?;
        messages.push(ChatMessage::user(decomposition_prompt(task, &tool_names)));
        let raw = self.ask_model(&mut messages, None, &mut usage).await?;
        let subtasks = parse_subtasks(&raw).unwrap_or_else(|| {
            tracing::warn!("Could not parse subtasks, falling back to a single subtask");
            vec![Subtask::fallback(task)]
        });
        tracing::info!("Decomposed into {} subtasks", subtasks.len());
        for subtask in &subtasks {
            self.todos
                .update(&subtask.id, TodoStatus::Pending, Some(&subtask.description));
        }

        let mut results = Vec::new();
        for (i, subtask) in subtasks.iter().take(MAX_PLAN_ITERATIONS).enumerate() {
            self.control.checkpoint().await?;
            self.events.emit(AgentEvent::Iteration { number: i + 1 });
            self.todos.update(&subtask.id, TodoStatus::InProgress, None);
            self.events.emit(AgentEvent::SubtaskStarted {
                id: subtask.id.clone(),
                description: subtask.description.clone(),
            });

            messages.push(ChatMessage::user(execution_prompt(subtask)));
            let (output, tool_outputs, tools_used) = self
                .execute_subtask(&mut state, &mut messages, &schemas, &mut usage)
                .await;
            let recent = &tool_outputs[tool_outputs.len().saturating_sub(RECENT_RESULTS)..];
            let success = subtask_succeeded(&output, recent);

            tracing::info!(subtask = %subtask.id, success, "Subtask finished");
            self.todos.update(
                &subtask.id,
                if success {
                    TodoStatus::Completed
                } else {
                    TodoStatus::Failed
                },
                None,
            );
            self.events.emit(AgentEvent::SubtaskFinished {
                id: subtask.id.clone(),
                description: subtask.description.clone(),
                success,
            });
            results.push(SubtaskResult {
                id: subtask.id.clone(),
                description: subtask.description.clone(),
                success,
                output,
                tools_used,
            });
        }

        let completed = results.iter().filter(|r| r.success).count();
        let failed = results.len() - completed;
        let success_rate = completed as f64 / results.len().max(1) as f64;

        let results_json = serde_json::to_string_pretty(&results).unwrap_or_default();
        messages.push(ChatMessage::user(aggregation_prompt(
            task,
            completed,
            failed,
            &results_json,
        )));
        let final_report = match self
            .ask_model(&mut messages, Some(&schemas), &mut usage)
            .await
        {
            Ok(report) => report,
            Err(e) => {
                tracing::warn!("Report generation failed: {}", e);
                format!("Report generation failed: {}", e)
            }
        };

        Ok(TaskReport {
            task: task.to_string(),
            subtasks_total: subtasks.len(),
            subtasks_completed: completed,
            subtasks_failed: failed,
            success_rate,
            results,
            final_report,
            usage,
        })
    }

    /// One request whose text reply is appended to the conversation.
    async fn ask_model(
        &self,
        messages: &mut Vec<ChatMessage>,
        tools: Option<&[ToolSchema]>,
        usage: &mut TokenUsage,
    ) -> Result<String, AgentError> {
        let response = self
            .llm
            .chat_completion(&self.config.default_model, messages, tools)
            .await?;
        if let Some(u) = &response.usage {
            *usage = usage.add(u);
        }
        let text = response.content.unwrap_or_default();
        messages.push(ChatMessage::assistant(Some(text.clone()), None));
        Ok(text)
    }

    /// Let the model work on the current subtask: tool rounds until it
    /// answers in text. Returns the final text, tool outputs and tool names.
    async fn execute_subtask(
        &self,
        state: &mut PersistentState,
        messages: &mut Vec<ChatMessage>,
        schemas: &[ToolSchema],
        usage: &mut TokenUsage,
    ) -> (String, Vec<String>, Vec<String>) {
        let mut outputs = Vec::new();
        let mut used = Vec::new();
        let mut rounds = 0;

        loop {
            let response = match self
                .llm
                .chat_completion(&self.config.default_model, messages, Some(schemas))
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    tracing::warn!("Subtask request failed: {}", e);
                    let text = format!("Task execution encountered an error: {}", e);
                    messages.push(ChatMessage::assistant(Some(text.clone()), None));
                    return (text, outputs, used);
                }
            };
            if let Some(u) = &response.usage {
                *usage = usage.add(u);
            }

            let calls = response.requested_tools().to_vec();
            if calls.is_empty() {
                let text = response.content.unwrap_or_default();
                messages.push(ChatMessage::assistant(Some(text.clone()), None));
                return (text, outputs, used);
            }

            messages.push(ChatMessage::assistant(
                response.content.clone(),
                Some(calls.clone()),
            ));
            for call in &calls {
                let (_, output) = self.execute_tool_call(state, call, None).await;
                used.push(call.function.name.clone());
                outputs.push(output.clone());
                messages.push(ChatMessage::tool(&call.id, output));
            }

            rounds += 1;
            if rounds >= MAX_TOOL_ROUNDS {
                return (response.content.unwrap_or_default(), outputs, used);
            }
        }
    }
}
