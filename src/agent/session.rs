//! Session tools: the tools that act on the agent itself rather than the
//! workspace (asking the user, saving progress, summaries, delegation).

use std::sync::atomic::Ordering;

use anyhow::bail;
use async_recursion::async_recursion;
use serde_json::{json, Value};

use crate::events::AgentEvent;
use crate::llm::{ChatMessage, ToolSchema};
use crate::state::{EntryStatus, PersistentState};
use crate::todos::TodoStatus;
use crate::tools::{required_str, resolve_path};

use super::agent_loop::Agent;
use super::completion::{judge_final_answer, Verdict};
use super::prompt::delegate_system_prompt;
use super::summary::build_summary;

/// Nested `delegate_task` loops allowed below the main loop.
pub const MAX_DELEGATION_DEPTH: u32 = 2;

/// Iteration budget of one delegated subtask.
pub const DELEGATE_MAX_ITERATIONS: usize = 10;

pub const SESSION_TOOLS: &[&str] = &[
    "ask_user_step",
    "save_progress",
    "load_progress",
    "create_summary",
    "update_progress_md",
    "delegate_task",
];

pub fn is_session_tool(name: &str) -> bool {
    SESSION_TOOLS.contains(&name)
}

/// Schemas of the session tools, `delegate_task` only while nesting is allowed.
pub fn session_tool_schemas(allow_delegate: bool) -> Vec<ToolSchema> {
    let mut schemas = vec![
        ToolSchema::function(
            "ask_user_step",
            "Report a step to the user and ask how to proceed. Use when a step failed or you need guidance.",
            json!({
                "type": "object",
                "properties": {
                    "step_description": {"type": "string", "description": "The step in question"},
                    "status": {
                        "type": "string",
                        "enum": ["completed", "failed", "needs_guidance"]
                    },
                    "error_details": {"type": "string", "description": "What went wrong, if anything"},
                    "suggested_next_action": {"type": "string"}
                },
                "required": ["step_description", "status"]
            }),
        ),
        ToolSchema::function(
            "save_progress",
            "Record completed steps and the current context so the task can be resumed later.",
            json!({
                "type": "object",
                "properties": {
                    "completed_steps": {"type": "array", "items": {"type": "string"}},
                    "current_context": {"type": "string", "description": "Notes on where the work stands"}
                },
                "required": ["completed_steps"]
            }),
        ),
        ToolSchema::function(
            "load_progress",
            "Load the saved progress of a task (defaults to the current task).",
            json!({
                "type": "object",
                "properties": {
                    "task_id": {"type": "string"}
                }
            }),
        ),
        ToolSchema::function(
            "create_summary",
            "Create a summary checkpoint of the work so far.",
            json!({
                "type": "object",
                "properties": {
                    "reason": {"type": "string", "description": "Why the summary is being created"},
                    "key_accomplishments": {"type": "array", "items": {"type": "string"}},
                    "current_focus": {"type": "string"},
                    "next_steps": {"type": "array", "items": {"type": "string"}}
                },
                "required": ["reason", "key_accomplishments", "current_focus"]
            }),
        ),
        ToolSchema::function(
            "update_progress_md",
            "Add an entry to progress.md and track the files it touched.",
            json!({
                "type": "object",
                "properties": {
                    "action": {"type": "string", "description": "What was accomplished"},
                    "details": {"type": "string"},
                    "files_modified": {"type": "array", "items": {"type": "string"}}
                },
                "required": ["action"]
            }),
        ),
    ];
    if allow_delegate {
        schemas.push(ToolSchema::function(
            "delegate_task",
            "Run a self-contained subtask in a fresh conversation and return its report.",
            json!({
                "type": "object",
                "properties": {
                    "description": {"type": "string", "description": "What the subtask must achieve"},
                    "context": {"type": "string", "description": "Facts the subtask needs to know"}
                },
                "required": ["description"]
            }),
        ));
    }
    schemas
}

fn string_list(value: &Value) -> Vec<String> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

impl Agent {
    pub(super) async fn handle_session_tool(
        &self,
        state: &mut PersistentState,
        name: &str,
        args: &Value,
        depth: u32,
    ) -> anyhow::Result<String> {
        match name {
            "ask_user_step" => self.ask_user_step(state, args).await,
            "save_progress" => self.save_progress(state, args).await,
            "load_progress" => self.load_progress(state, args).await,
            "create_summary" => self.create_summary(state, args),
            "update_progress_md" => self.update_progress_md(state, args).await,
            "delegate_task" => self.delegate_task(state, args, depth).await,
            other => bail!("Unknown tool: {}", other),
        }
    }

    async fn ask_user_step(
        &self,
        state: &mut PersistentState,
        args: &Value,
    ) -> anyhow::Result<String> {
        let step = required_str(args, "step_description")?;
        let status = args["status"].as_str().unwrap_or("needs_guidance");

        let Some(prompter) = &self.prompter else {
            if status == "completed" {
                state.record_step(step);
                return Ok(format!("Step recorded as completed: {}", step));
            }
            return Ok("No user is available in non-interactive mode. Choose the best approach yourself and continue.".to_string());
        };

        let mut question = format!("\n📋 Step: {}\nStatus: {}", step, status);
        if let Some(details) = args["error_details"].as_str() {
            question.push_str(&format!("\nError: {}", details));
        }
        if let Some(suggestion) = args["suggested_next_action"].as_str() {
            question.push_str(&format!("\nSuggested next action: {}", suggestion));
        }
        let (options, default) = if status == "failed" {
            ("retry / alternative / skip / manual", "retry")
        } else {
            ("continue / modify / pause", "continue")
        };
        question.push_str(&format!("\nOptions: {}\nYour choice:", options));

        let mut choice = prompter.ask(&question).await.to_lowercase();
        if choice.is_empty() {
            choice = default.to_string();
        }

        let info = match choice.as_str() {
            "alternative" | "modify" => prompter.ask("What approach should we try?").await,
            "manual" => prompter.ask("What did you do manually?").await,
            "pause" => {
                prompter.ask("⏸️ Paused. Press Enter to continue:").await;
                String::new()
            }
            _ => String::new(),
        };

        match choice.as_str() {
            "skip" => {
                state.record_step(format!("SKIPPED: {}", step));
                state.add_progress("ask_user_step", format!("Skipped: {}", step), Vec::new(), EntryStatus::Skipped);
            }
            "manual" => {
                state.record_step(format!("MANUAL: {}", step));
                state.add_progress("ask_user_step", format!("Done manually: {}", info), Vec::new(), EntryStatus::Completed);
            }
            "continue" if status == "completed" => {
                state.record_step(step);
            }
            _ => {}
        }

        Ok(format!("User chose '{}'. Additional info: {}", choice, info))
    }

    async fn save_progress(
        &self,
        state: &mut PersistentState,
        args: &Value,
    ) -> anyhow::Result<String> {
        for step in string_list(&args["completed_steps"]) {
            state.record_step(step);
        }
        if let Some(context) = args["current_context"].as_str() {
            state
                .working_context
                .insert("manual_save".to_string(), context.to_string());
        }
        self.store.save(state).await?;
        Ok(format!(
            "Progress saved: {} steps completed",
            state.completed_steps.len()
        ))
    }

    async fn load_progress(
        &self,
        state: &mut PersistentState,
        args: &Value,
    ) -> anyhow::Result<String> {
        let task_id = args["task_id"]
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| state.task_id.clone());

        let Some(saved) = self.store.load(&task_id).await? else {
            bail!("Could not load task {}", task_id);
        };

        let mut out = format!(
            "Loaded task {}: {} completed steps\nCurrent step: {}",
            saved.task_id,
            saved.completed_steps.len(),
            saved.current_step
        );
        for step in &saved.completed_steps {
            out.push_str(&format!("\n- {}", step));
        }
        if let Some(context) = saved.working_context.get("manual_save") {
            out.push_str(&format!("\nSaved context: {}", context));
        }
        Ok(out)
    }

    fn create_summary(&self, state: &mut PersistentState, args: &Value) -> anyhow::Result<String> {
        let reason = required_str(args, "reason")?;
        let since = state
            .latest_summary()
            .map_or(0, |s| s.iterations_covered.1);

        let mut summary = build_summary(state, "", "manual", since);
        summary.key_accomplishments = string_list(&args["key_accomplishments"]);
        if let Some(focus) = args["current_focus"].as_str() {
            summary.current_focus = focus.to_string();
        }
        summary.next_steps = string_list(&args["next_steps"]);

        let count = summary.key_accomplishments.len();
        tracing::info!(summary_id = %summary.summary_id, "Manual summary created: {}", reason);
        self.events.emit(AgentEvent::SummaryCreated {
            summary_id: summary.summary_id.clone(),
            accomplishments: count,
        });
        state.summaries.push(summary);

        Ok(format!(
            "Summary created - Reason: {}, Accomplishments: {}",
            reason, count
        ))
    }

    async fn update_progress_md(
        &self,
        state: &mut PersistentState,
        args: &Value,
    ) -> anyhow::Result<String> {
        let action = required_str(args, "action")?;
        let details = args["details"].as_str().unwrap_or(action).to_string();
        let files = string_list(&args["files_modified"]);

        for file in &files {
            let path = resolve_path(&self.config.workspace_path, file);
            if let Ok(meta) = tokio::fs::metadata(&path).await {
                state.record_file(file, "modified", meta.len());
            }
        }
        state.add_progress(action, details, files, EntryStatus::Completed);
        self.progress.update(state).await?;

        Ok(format!(
            "Progress updated: {} - {} files tracked",
            action,
            state.files_tracking.len()
        ))
    }

    async fn delegate_task(
        &self,
        state: &mut PersistentState,
        args: &Value,
        depth: u32,
    ) -> anyhow::Result<String> {
        let description = required_str(args, "description")?;
        if depth >= MAX_DELEGATION_DEPTH {
            bail!(
                "Delegation depth limit ({}) reached; work on this subtask directly",
                MAX_DELEGATION_DEPTH
            );
        }

        let id = format!(
            "delegate_{}",
            self.delegations.fetch_add(1, Ordering::Relaxed) + 1
        );
        self.todos
            .update(&id, TodoStatus::InProgress, Some(description));
        self.events.emit(AgentEvent::SubtaskStarted {
            id: id.clone(),
            description: description.to_string(),
        });

        let result = self
            .run_delegate(state, description, args["context"].as_str(), depth + 1)
            .await;

        let success = result.is_ok();
        self.todos.update(
            &id,
            if success {
                TodoStatus::Completed
            } else {
                TodoStatus::Failed
            },
            None,
        );
        self.events.emit(AgentEvent::SubtaskFinished {
            id,
            description: description.to_string(),
            success,
        });

        result.map(|report| format!("Subtask completed: {}", report))
    }

    /// Nested loop for a delegated subtask: fresh conversation, own budget,
    /// shared state for progress and file tracking.
    #[async_recursion]
    async fn run_delegate(
        &self,
        state: &mut PersistentState,
        description: &str,
        context: Option<&str>,
        depth: u32,
    ) -> anyhow::Result<String> {
        let schemas = self.tool_schemas(depth);
        let mut task = description.to_string();
        if let Some(context) = context {
            task.push_str("\n\nContext:\n");
            task.push_str(context);
        }
        let mut messages = vec![
            ChatMessage::system(delegate_system_prompt(
                &self.workspace_display(),
                &self.tool_infos(depth),
            )),
            ChatMessage::user(task),
        ];

        let budget = DELEGATE_MAX_ITERATIONS.min(self.config.max_iterations);
        for iteration in 0..budget {
            self.control.checkpoint().await?;
            tracing::debug!(depth, "Delegate iteration {}", iteration + 1);

            let response = self
                .llm
                .chat_completion(&self.config.default_model, &messages, Some(&schemas))
                .await?;

            let calls = response.requested_tools().to_vec();
            if calls.is_empty() {
                let text = response.content.unwrap_or_default();
                if judge_final_answer(&text) == Verdict::Failed {
                    bail!("Subtask failed: {}", text);
                }
                return Ok(text);
            }

            messages.push(ChatMessage::assistant(response.content, Some(calls.clone())));
            for call in &calls {
                let (_, output) = self.execute_tool_call(state, call, Some(depth)).await;
                messages.push(ChatMessage::tool(&call.id, output));
            }
        }

        bail!("Subtask did not finish within {} iterations", budget)
    }
}
