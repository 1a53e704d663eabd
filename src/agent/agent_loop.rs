//! Core agent loop implementation.

use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};

use crate::config::Config;
use crate::control::{ExecutionControl, Prompter};
use crate::error::AgentError;
use crate::events::{AgentEvent, EventSink};
use crate::llm::{ChatMessage, LlmClient, LlmError, Role, TokenUsage, ToolCall, ToolSchema};
use crate::permissions::PermissionManager;
use crate::progress::ProgressReport;
use crate::state::{EntryStatus, PersistentState, StateStore};
use crate::todos::{TodoManager, TodoStatus, MAIN_TASK_ID};
use crate::tools::{resolve_path, ToolInfo, ToolRegistry};

use super::completion::{judge_final_answer, Verdict};
use super::prompt::{build_system_prompt, CONTINUE_NUDGE, RESUME_NOTE, SUMMARY_PROMPT};
use super::session::{is_session_tool, session_tool_schemas, MAX_DELEGATION_DEPTH};
use super::summary::{build_summary, compress_conversation, render_recent, SUMMARY_WINDOW};

/// Result of a `run_task` call.
#[derive(Debug, Clone, Serialize)]
pub struct TaskOutcome {
    pub task_id: String,
    pub success: bool,
    pub iterations: u32,
    pub final_response: Option<String>,
    pub error: Option<String>,
    /// The state was saved and `run_task` can pick the task up again.
    pub resume_possible: bool,
    pub usage: TokenUsage,
}

enum Decision {
    Complete,
    Failed,
    Continue(String),
}

enum Recovery {
    /// Retry with an optional note for the model and a bound on the request.
    Retry {
        note: Option<String>,
        timeout: Option<Duration>,
    },
    Skip(String),
    Abort,
}

/// The autonomous agent.
pub struct Agent {
    pub(super) config: Config,
    pub(super) llm: Arc<dyn LlmClient>,
    pub(super) tools: ToolRegistry,
    pub(super) todos: TodoManager,
    pub(super) events: EventSink,
    pub(super) control: ExecutionControl,
    /// Present in interactive mode.
    pub(super) prompter: Option<Arc<dyn Prompter>>,
    pub(super) store: StateStore,
    pub(super) progress: ProgressReport,
    pub(super) delegations: AtomicUsize,
}

fn preview(s: &str, max: usize) -> String {
    let line = s.lines().next().unwrap_or_default();
    let short: String = line.chars().take(max).collect();
    if short.len() < s.len() {
        format!("{}...", short)
    } else {
        short
    }
}

impl Agent {
    pub fn new(config: Config, llm: Arc<dyn LlmClient>, events: EventSink) -> Self {
        let todos = TodoManager::new(config.show_todo_updates).with_events(events.clone());
        let permissions = PermissionManager::new(config.permission_level)
            .with_allowed_file_patterns(&config.allowed_file_patterns);
        let tools = ToolRegistry::new(permissions, todos.clone());
        let control = ExecutionControl::new()
            .with_events(events.clone())
            .with_todos(todos.clone());

        Self {
            store: StateStore::new(config.state_path()),
            progress: ProgressReport::new(config.progress_path(), config.progress_tracking),
            config,
            llm,
            tools,
            todos,
            events,
            control,
            prompter: None,
            delegations: AtomicUsize::new(0),
        }
    }

    /// Ask the user for completion and recovery decisions.
    pub fn with_prompter(mut self, prompter: Arc<dyn Prompter>) -> Self {
        self.prompter = Some(prompter);
        self
    }

    pub fn with_control(mut self, control: ExecutionControl) -> Self {
        self.control = control
            .with_events(self.events.clone())
            .with_todos(self.todos.clone());
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn control(&self) -> &ExecutionControl {
        &self.control
    }

    pub fn todos(&self) -> &TodoManager {
        &self.todos
    }

    pub fn events(&self) -> &EventSink {
        &self.events
    }

    pub(super) fn workspace_display(&self) -> String {
        self.config.workspace_path.to_string_lossy().to_string()
    }

    /// Tools offered at the given delegation depth.
    pub(super) fn tool_schemas(&self, depth: u32) -> Vec<ToolSchema> {
        let mut schemas = self.tools.get_tool_schemas();
        schemas.extend(session_tool_schemas(depth < MAX_DELEGATION_DEPTH));
        schemas
    }

    pub(super) fn tool_infos(&self, depth: u32) -> Vec<ToolInfo> {
        let mut infos = self.tools.list_tools();
        infos.extend(
            session_tool_schemas(depth < MAX_DELEGATION_DEPTH)
                .into_iter()
                .map(|s| ToolInfo {
                    name: s.function.name,
                    description: s.function.description,
                }),
        );
        infos
    }

    fn system_prompt(&self, state: &PersistentState) -> String {
        build_system_prompt(&self.workspace_display(), &self.tool_infos(0), state)
    }

    fn refresh_system_prompt(&self, messages: &mut Vec<ChatMessage>, state: &PersistentState) {
        let prompt = self.system_prompt(state);
        match messages.first_mut() {
            Some(first) if first.role == Role::System => first.content = Some(prompt),
            _ => messages.insert(0, ChatMessage::system(prompt)),
        }
    }

    /// Run a task to completion, resuming saved state when `resume_id`
    /// matches the stored task.
    pub async fn run_task(
        &self,
        task: &str,
        resume_id: Option<&str>,
    ) -> Result<TaskOutcome, AgentError> {
        let mut state = self.prepare_state(task, resume_id).await?;
        self.todos.update(
            MAIN_TASK_ID,
            TodoStatus::InProgress,
            Some(&state.original_task),
        );

        let mut messages = if state.conversation.is_empty() {
            vec![
                ChatMessage::system(self.system_prompt(&state)),
                ChatMessage::user(state.original_task.clone()),
            ]
        } else {
            let mut restored = std::mem::take(&mut state.conversation);
            self.refresh_system_prompt(&mut restored, &state);
            restored.push(ChatMessage::user(RESUME_NOTE));
            restored
        };

        let schemas = self.tool_schemas(0);
        let mut usage = TokenUsage::default();
        let mut undetermined = 0u32;
        let mut consecutive_errors = 0u32;
        let mut retry_timeout: Option<Duration> = None;
        self.persist(&mut state, &messages).await;

        while (state.iteration_count as usize) < self.config.max_iterations {
            if self.control.checkpoint().await.is_err() {
                let reason = AgentError::Stopped.to_string();
                return Ok(self
                    .stop_unfinished(&mut state, &messages, usage, reason, None, TodoStatus::Paused)
                    .await);
            }

            let iteration = state.iteration_count + 1;
            tracing::debug!("Agent iteration {}", iteration);
            self.events.emit(AgentEvent::Iteration {
                number: iteration as usize,
            });

            if self.summary_due(&state) {
                messages = self.summarize(&mut state, messages).await;
            }

            let request =
                self.llm
                    .chat_completion(&self.config.default_model, &messages, Some(&schemas));
            let limit = retry_timeout.take();
            let cancel = self.control.cancel_token();
            let result = tokio::select! {
                result = async {
                    match limit {
                        Some(limit) => tokio::time::timeout(limit, request)
                            .await
                            .unwrap_or_else(|_| Err(LlmError::Timeout(limit))),
                        None => request.await,
                    }
                } => Some(result),
                _ = cancel.cancelled() => None,
            };
            let Some(result) = result else {
                tracing::info!("Stop requested during LLM call");
                let reason = AgentError::Stopped.to_string();
                return Ok(self
                    .stop_unfinished(&mut state, &messages, usage, reason, None, TodoStatus::Paused)
                    .await);
            };

            match result {
                Ok(response) => {
                    consecutive_errors = 0;
                    if let Some(u) = &response.usage {
                        usage = usage.add(u);
                    }

                    let calls = response.requested_tools().to_vec();
                    if !calls.is_empty() {
                        undetermined = 0;
                        if let Some(text) = response.content.as_deref().filter(|t| !t.trim().is_empty()) {
                            self.events.emit(AgentEvent::Thinking {
                                content: text.to_string(),
                            });
                        }
                        messages.push(ChatMessage::assistant(response.content, Some(calls.clone())));
                        for call in &calls {
                            let (_, output) = self.execute_tool_call(&mut state, call, Some(0)).await;
                            messages.push(ChatMessage::tool(&call.id, output));
                        }
                    } else {
                        let text = response.content.unwrap_or_default();
                        messages.push(ChatMessage::assistant(Some(text.clone()), None));
                        self.events.emit(AgentEvent::Thinking {
                            content: text.clone(),
                        });

                        match self.decide_completion(&text, &mut undetermined).await {
                            Decision::Complete => {
                                state.iteration_count += 1;
                                return Ok(self.complete(&mut state, &messages, text, usage).await);
                            }
                            Decision::Failed => {
                                state.iteration_count += 1;
                                tracing::error!("Task reported as failed by the model");
                                return Ok(self
                                    .stop_unfinished(
                                        &mut state,
                                        &messages,
                                        usage,
                                        "The model reported that the task failed".to_string(),
                                        Some(text),
                                        TodoStatus::Failed,
                                    )
                                    .await);
                            }
                            Decision::Continue(nudge) => messages.push(ChatMessage::user(nudge)),
                        }
                    }
                }
                Err(e) => {
                    let err = AgentError::from(e);
                    let category = err.category();
                    tracing::warn!(%category, "Iteration {} failed: {}", iteration, err);
                    state.record_error(&format!("Iteration {}", iteration), &err.to_string(), category);
                    self.events.emit(AgentEvent::Error {
                        message: err.to_string(),
                    });

                    consecutive_errors += 1;
                    match self.recover(&state, &err, consecutive_errors).await {
                        Recovery::Retry { note, timeout } => {
                            if let Some(note) = note {
                                messages.push(ChatMessage::user(note));
                            }
                            retry_timeout = timeout;
                        }
                        Recovery::Skip(note) => {
                            let skipped = format!("SKIPPED: {}", state.current_step);
                            state.add_progress("skip", skipped.clone(), Vec::new(), EntryStatus::Skipped);
                            state.record_step(skipped);
                            messages.push(ChatMessage::user(note));
                        }
                        Recovery::Abort => {
                            state.iteration_count += 1;
                            tracing::error!("Aborting task after error: {}", err);
                            return Ok(self
                                .stop_unfinished(&mut state, &messages, usage, err.to_string(), None, TodoStatus::Failed)
                                .await);
                        }
                    }
                }
            }

            state.iteration_count += 1;
            self.persist(&mut state, &messages).await;
        }

        tracing::warn!("Max iterations ({}) reached", self.config.max_iterations);
        Ok(self
            .stop_unfinished(
                &mut state,
                &messages,
                usage,
                "Max iterations reached".to_string(),
                None,
                TodoStatus::Paused,
            )
            .await)
    }

    async fn prepare_state(
        &self,
        task: &str,
        resume_id: Option<&str>,
    ) -> Result<PersistentState, AgentError> {
        if let Some(id) = resume_id {
            match self.store.resolve(id).await {
                Ok(Some(state)) => {
                    tracing::info!(
                        task_id = %state.task_id,
                        "Resuming task: {} completed steps, current step: {}",
                        state.completed_steps.len(),
                        state.current_step
                    );
                    self.events.emit(AgentEvent::TaskResumed {
                        task_id: state.task_id.clone(),
                        completed_steps: state.completed_steps.len(),
                        current_step: state.current_step.clone(),
                    });
                    return Ok(state);
                }
                Ok(None) => tracing::warn!("No saved state for task {}", id),
                Err(e) => tracing::warn!("Could not load saved state: {}", e),
            }
        }

        if task.trim().is_empty() {
            return Err(AgentError::Aborted(match resume_id {
                Some(id) => format!("Could not resume task {} and no task was given", id),
                None => "No task given".to_string(),
            }));
        }

        let state = PersistentState::new(task);
        tracing::info!(task_id = %state.task_id, "Starting new task");
        self.events.emit(AgentEvent::TaskStarted {
            task_id: state.task_id.clone(),
            task: task.to_string(),
        });
        Ok(state)
    }

    /// Save state and the progress report. Returns whether the state was saved.
    async fn persist(&self, state: &mut PersistentState, messages: &[ChatMessage]) -> bool {
        state.conversation = messages.to_vec();
        let saved = match self.store.save(state).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Could not save state: {}", e);
                false
            }
        };
        if let Err(e) = self.progress.update(state).await {
            tracing::warn!("Could not update progress report: {}", e);
        }
        saved
    }

    async fn complete(
        &self,
        state: &mut PersistentState,
        messages: &[ChatMessage],
        final_response: String,
        usage: TokenUsage,
    ) -> TaskOutcome {
        state.conversation = messages.to_vec();
        state.current_step = "Task completed".to_string();
        self.todos
            .update(MAIN_TASK_ID, TodoStatus::Completed, Some(&state.original_task));
        if let Err(e) = self.progress.finalize(state).await {
            tracing::warn!("Could not finalize progress report: {}", e);
        }
        if let Err(e) = self.store.cleanup(&state.task_id).await {
            tracing::warn!("Could not remove state file: {}", e);
        }

        tracing::info!(
            task_id = %state.task_id,
            "Task completed after {} iterations",
            state.iteration_count
        );
        self.events.emit(AgentEvent::Finished {
            success: true,
            iterations: state.iteration_count as usize,
        });

        TaskOutcome {
            task_id: state.task_id.clone(),
            success: true,
            iterations: state.iteration_count,
            final_response: Some(final_response),
            error: None,
            resume_possible: false,
            usage,
        }
    }

    async fn stop_unfinished(
        &self,
        state: &mut PersistentState,
        messages: &[ChatMessage],
        usage: TokenUsage,
        error: String,
        final_response: Option<String>,
        todo_status: TodoStatus,
    ) -> TaskOutcome {
        let saved = self.persist(state, messages).await;
        self.todos.update(MAIN_TASK_ID, todo_status, None);
        self.events.emit(AgentEvent::Error {
            message: error.clone(),
        });
        self.events.emit(AgentEvent::Finished {
            success: false,
            iterations: state.iteration_count as usize,
        });
        if saved {
            tracing::info!(task_id = %state.task_id, "State saved; resume with --resume {}", state.task_id);
        }

        TaskOutcome {
            task_id: state.task_id.clone(),
            success: false,
            iterations: state.iteration_count,
            final_response,
            error: Some(error),
            resume_possible: saved,
            usage,
        }
    }

    async fn decide_completion(&self, text: &str, undetermined: &mut u32) -> Decision {
        if let Some(prompter) = &self.prompter {
            let answer = prompter
                .ask("\n❓ Is the overall task complete? (y/n/continue)")
                .await
                .to_lowercase();
            return match answer.as_str() {
                "y" | "yes" => Decision::Complete,
                "n" | "no" => {
                    let feedback = prompter.ask("What still needs to be done?").await;
                    Decision::Continue(format!("Task not complete. User feedback: {}", feedback))
                }
                _ => Decision::Continue(CONTINUE_NUDGE.to_string()),
            };
        }

        match judge_final_answer(text) {
            Verdict::Complete => Decision::Complete,
            Verdict::Failed => Decision::Failed,
            Verdict::Undetermined => {
                *undetermined += 1;
                if *undetermined >= 2 {
                    tracing::debug!("Accepting second undetermined final answer");
                    Decision::Complete
                } else {
                    Decision::Continue(CONTINUE_NUDGE.to_string())
                }
            }
        }
    }

    async fn recover(&self, state: &PersistentState, err: &AgentError, consecutive: u32) -> Recovery {
        if let Some(prompter) = &self.prompter {
            let question = format!(
                "\n❌ Error: {}\nContext: {}\nRecovery options: retry / skip / abort\nYour choice:",
                err,
                state.context_line()
            );
            return match prompter.ask(&question).await.to_lowercase().as_str() {
                "abort" | "a" => Recovery::Abort,
                "skip" | "s" => Recovery::Skip(format!(
                    "Error occurred: {}. User chose to skip this step. Please continue with the next step.",
                    err
                )),
                _ => Recovery::Retry {
                    note: Some(format!(
                        "Error occurred: {}. Please retry the current step with a different approach.",
                        err
                    )),
                    timeout: None,
                },
            };
        }

        let strategy = err.category().strategy();
        if consecutive >= strategy.max_attempts {
            return Recovery::Abort;
        }
        let delay = strategy.delay_for(consecutive);
        tracing::info!(
            "Retrying in {:?} (attempt {}/{})",
            delay,
            consecutive,
            strategy.max_attempts
        );
        let cancel = self.control.cancel_token();
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => {}
        }
        Recovery::Retry {
            note: strategy.retry_note(&err.to_string()),
            timeout: Some(strategy.timeout),
        }
    }

    fn summary_due(&self, state: &PersistentState) -> bool {
        let threshold = self.config.summarization_threshold as u32;
        threshold > 0
            && state.iteration_count > 0
            && state.iteration_count % threshold == 0
            && state
                .latest_summary()
                .map_or(true, |s| s.iterations_covered.1 < state.iteration_count)
    }

    /// Summarize recent work with a separate request and compress the
    /// conversation around the summary.
    async fn summarize(
        &self,
        state: &mut PersistentState,
        mut messages: Vec<ChatMessage>,
    ) -> Vec<ChatMessage> {
        let request = vec![ChatMessage::user(format!(
            "{}\n\nRecent conversation:\n{}",
            SUMMARY_PROMPT,
            render_recent(&messages, SUMMARY_WINDOW)
        ))];

        let text = match self
            .llm
            .chat_completion(&self.config.default_model, &request, None)
            .await
        {
            Ok(response) => response.content.unwrap_or_default(),
            Err(e) => {
                tracing::warn!("Summary generation failed: {}", e);
                return messages;
            }
        };

        let since = state
            .latest_summary()
            .map_or(0, |s| s.iterations_covered.1);
        let summary = build_summary(state, &text, "summary", since);
        tracing::info!(
            summary_id = %summary.summary_id,
            "Created summary of iterations {}-{}",
            since,
            state.iteration_count
        );
        self.events.emit(AgentEvent::SummaryCreated {
            summary_id: summary.summary_id.clone(),
            accomplishments: summary.key_accomplishments.len(),
        });

        messages = compress_conversation(&messages, &summary, self.config.context_retention);
        state.summaries.push(summary);
        self.refresh_system_prompt(&mut messages, state);
        messages
    }

    /// Execute one tool call and return `(success, output)`.
    ///
    /// `session_depth` is the delegation depth when session tools are
    /// available, `None` when only workspace tools may run.
    pub(super) async fn execute_tool_call(
        &self,
        state: &mut PersistentState,
        call: &ToolCall,
        session_depth: Option<u32>,
    ) -> (bool, String) {
        let name = call.function.name.as_str();
        let args = if call.function.arguments.trim().is_empty() {
            json!({})
        } else {
            call.arguments()
        };

        tracing::info!("Calling tool: {} with args: {}", name, call.function.arguments);
        self.events.emit(AgentEvent::ToolCall {
            id: call.id.clone(),
            name: name.to_string(),
            args: args.clone(),
        });
        state.current_step = describe_call(name, &args);

        let result = if args.is_null() {
            Err(anyhow::anyhow!(
                "Invalid JSON arguments: {}",
                call.function.arguments
            ))
        } else {
            match session_depth {
                Some(depth) if is_session_tool(name) => {
                    self.handle_session_tool(state, name, &args, depth).await
                }
                _ => {
                    self.tools
                        .execute(name, args.clone(), &self.config.workspace_path)
                        .await
                }
            }
        };

        let (success, output) = match result {
            Ok(output) => {
                if !is_session_tool(name) {
                    self.record_success(state, name, &args).await;
                }
                (true, output)
            }
            Err(e) => {
                tracing::warn!("Tool {} failed: {}", name, e);
                state.add_progress(
                    name,
                    format!("Failed: {}", preview(&e.to_string(), 100)),
                    Vec::new(),
                    EntryStatus::Failed,
                );
                (false, format!("Error: {}", e))
            }
        };

        self.events.emit(AgentEvent::ToolResult {
            id: call.id.clone(),
            name: name.to_string(),
            success,
            summary: preview(&output, 200),
        });
        (success, output)
    }

    /// Record the completed step and any files a successful tool touched.
    async fn record_success(&self, state: &mut PersistentState, name: &str, args: &Value) {
        let path = args["path"].as_str();
        let step = match (name, path) {
            ("bash", _) => format!(
                "Executed: {}",
                preview(args["command"].as_str().unwrap_or_default(), 50)
            ),
            ("read_file", Some(p)) => format!("File read: {}", p),
            ("write_file", Some(p)) => format!("File written: {}", p),
            ("edit_file" | "multi_edit", Some(p)) => format!("File edited: {}", p),
            _ => format!("Used tool: {}", name),
        };

        let mut files = Vec::new();
        if let (Some(p), "write_file" | "edit_file" | "multi_edit") = (path, name) {
            let action = if name == "write_file" && !state.files_tracking.contains_key(p) {
                "created"
            } else {
                "modified"
            };
            let size = tokio::fs::metadata(resolve_path(&self.config.workspace_path, p))
                .await
                .map(|m| m.len())
                .unwrap_or(0);
            state.record_file(p, action, size);
            files.push(p.to_string());
        }

        state.add_progress(name, step.clone(), files, EntryStatus::Completed);
        state.last_successful_operation = step.clone();
        state.record_step(step);
    }
}

fn describe_call(name: &str, args: &Value) -> String {
    if let Some(command) = args["command"].as_str() {
        format!("{}: {}", name, preview(command, 80))
    } else if let Some(path) = args["path"].as_str() {
        format!("{}: {}", name, path)
    } else {
        name.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::testing::ScriptedPrompter;
    use crate::llm::scripted::ScriptedClient;
    use crate::llm::{ChatResponse, LlmError};
    use std::path::Path;
    use std::sync::atomic::Ordering;

    fn config(dir: &Path) -> Config {
        Config::new("test-key".into(), "test-model".into(), dir.to_path_buf())
    }

    fn agent_with(
        config: Config,
        responses: Vec<Result<ChatResponse, LlmError>>,
    ) -> (Agent, Arc<ScriptedClient>) {
        let llm = Arc::new(ScriptedClient::new(responses));
        (Agent::new(config, llm.clone(), EventSink::new()), llm)
    }

    fn replies(responses: Vec<ChatResponse>) -> Vec<Result<ChatResponse, LlmError>> {
        responses.into_iter().map(Ok).collect()
    }

    fn last_content(messages: &[ChatMessage]) -> String {
        messages
            .last()
            .and_then(|m| m.content.clone())
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn completes_task_and_cleans_up_state() {
        let dir = tempfile::tempdir().unwrap();
        let (agent, llm) = agent_with(
            config(dir.path()),
            replies(vec![
                ScriptedClient::tool_calls(vec![(
                    "write_file",
                    json!({"path": "a.txt", "content": "hello"}),
                )]),
                ScriptedClient::text("Task completed: file created at a.txt"),
            ]),
        );
        let mut events = agent.events().subscribe();

        let outcome = agent.run_task("Create a.txt", None).await.unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.iterations, 2);
        assert_eq!(outcome.task_id, crate::state::task_id_for("Create a.txt"));
        assert!(!outcome.resume_possible);
        assert_eq!(std::fs::read_to_string(dir.path().join("a.txt")).unwrap(), "hello");
        assert!(!dir
            .path()
            .join(".swe_agent_state")
            .join(format!("{}.json", outcome.task_id))
            .exists());

        let report = std::fs::read_to_string(dir.path().join("progress.md")).unwrap();
        assert!(report.contains("- File written: a.txt"));
        assert!(report.contains("## Task Completed"));

        let second = llm.request(1);
        assert_eq!(second[3].role, Role::Tool);
        assert!(last_content(&second).starts_with("Wrote 5 bytes"));

        let mut saw_tool_result = false;
        let mut finished = None;
        while let Ok(event) = events.try_recv() {
            match event {
                AgentEvent::ToolResult { name, success, .. } => {
                    assert_eq!(name, "write_file");
                    saw_tool_result = success;
                }
                AgentEvent::Finished { success, .. } => finished = Some(success),
                _ => {}
            }
        }
        assert!(saw_tool_result);
        assert_eq!(finished, Some(true));
        assert_eq!(agent.todos().list()[0].status, TodoStatus::Completed);
    }

    #[tokio::test]
    async fn undetermined_answer_is_nudged_once() {
        let dir = tempfile::tempdir().unwrap();
        let (agent, llm) = agent_with(
            config(dir.path()),
            replies(vec![
                ScriptedClient::text("Here is what I did."),
                ScriptedClient::text("All set."),
            ]),
        );

        let outcome = agent.run_task("Explain things", None).await.unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.final_response.as_deref(), Some("All set."));
        assert_eq!(last_content(&llm.request(1)), CONTINUE_NUDGE);
    }

    #[tokio::test]
    async fn tool_errors_are_returned_to_the_model() {
        let dir = tempfile::tempdir().unwrap();
        let (agent, llm) = agent_with(
            config(dir.path()),
            replies(vec![
                ScriptedClient::tool_calls(vec![("read_file", json!({"path": "missing.txt"}))]),
                ScriptedClient::tool_calls(vec![("no_such_tool", json!({}))]),
                ScriptedClient::text("Task completed."),
            ]),
        );

        let outcome = agent.run_task("Read missing.txt", None).await.unwrap();

        assert!(outcome.success);
        assert!(last_content(&llm.request(1)).starts_with("Error: File not found"));
        assert_eq!(last_content(&llm.request(2)), "Error: Unknown tool: no_such_tool");
    }

    #[tokio::test]
    async fn failed_answer_is_resumable() {
        let dir = tempfile::tempdir().unwrap();
        let (agent, _) = agent_with(
            config(dir.path()),
            replies(vec![
                ScriptedClient::tool_calls(vec![("list_directory", json!({}))]),
                ScriptedClient::text("The build failed with a linker error."),
            ]),
        );

        let outcome = agent.run_task("Build the project", None).await.unwrap();
        assert!(!outcome.success);
        assert!(outcome.resume_possible);
        assert_eq!(
            outcome.final_response.as_deref(),
            Some("The build failed with a linker error.")
        );

        let task_id = outcome.task_id.clone();
        let store = StateStore::new(dir.path().join(".swe_agent_state"));
        let saved = store.load(&task_id).await.unwrap().unwrap();
        assert_eq!(saved.iteration_count, 2);
        assert!(saved.completed_steps.contains(&"Used tool: list_directory".to_string()));

        let (resumed, llm) = agent_with(
            config(dir.path()),
            replies(vec![ScriptedClient::text("Task completed successfully.")]),
        );
        let mut events = resumed.events().subscribe();
        let outcome = resumed.run_task("", Some(&outcome.task_id)).await.unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.iterations, 3);
        let request = llm.request(0);
        assert!(request[0]
            .content
            .as_deref()
            .unwrap()
            .contains("- Used tool: list_directory"));
        assert_eq!(last_content(&request), RESUME_NOTE);
        assert!(matches!(
            events.try_recv().unwrap(),
            AgentEvent::TaskResumed { completed_steps: 1, .. }
        ));
        assert!(!store.path_for(&task_id).exists());
    }

    #[tokio::test]
    async fn another_task_in_the_workspace_keeps_resume_state() {
        let dir = tempfile::tempdir().unwrap();
        let (first, _) = agent_with(
            config(dir.path()),
            replies(vec![ScriptedClient::text("The build failed with a linker error.")]),
        );
        let failed = first.run_task("Build the project", None).await.unwrap();
        assert!(failed.resume_possible);

        let (second, _) = agent_with(
            config(dir.path()),
            replies(vec![ScriptedClient::text("Task completed successfully.")]),
        );
        assert!(second.run_task("Write the docs", None).await.unwrap().success);

        let (resumed, _) = agent_with(
            config(dir.path()),
            replies(vec![ScriptedClient::text("Task completed successfully.")]),
        );
        let outcome = resumed.run_task("", Some(&failed.task_id)).await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.task_id, failed.task_id);
    }

    #[tokio::test]
    async fn resume_latest_picks_the_last_saved_task() {
        let dir = tempfile::tempdir().unwrap();
        let (first, _) = agent_with(
            config(dir.path()),
            replies(vec![ScriptedClient::text("The build failed with a linker error.")]),
        );
        let failed = first.run_task("Build the project", None).await.unwrap();

        let (resumed, _) = agent_with(
            config(dir.path()),
            replies(vec![ScriptedClient::text("Task completed successfully.")]),
        );
        let outcome = resumed
            .run_task("", Some(crate::state::LATEST))
            .await
            .unwrap();
        assert_eq!(outcome.task_id, failed.task_id);
    }

    #[tokio::test]
    async fn resume_without_state_or_task_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let (agent, _) = agent_with(config(dir.path()), Vec::new());
        let err = agent.run_task("  ", Some("deadbeef")).await.unwrap_err();
        assert!(err.to_string().contains("Could not resume task deadbeef"));
    }

    #[tokio::test]
    async fn stops_at_max_iterations() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.max_iterations = 2;
        let (agent, llm) = agent_with(
            config,
            replies(vec![
                ScriptedClient::tool_calls(vec![("list_directory", json!({}))]),
                ScriptedClient::tool_calls(vec![("list_directory", json!({}))]),
            ]),
        );

        let outcome = agent.run_task("Loop forever", None).await.unwrap();

        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some("Max iterations reached"));
        assert_eq!(outcome.iterations, 2);
        assert!(outcome.resume_possible);
        assert_eq!(llm.request_count(), 2);
        assert_eq!(agent.todos().list()[0].status, TodoStatus::Paused);
    }

    #[tokio::test]
    async fn stop_request_ends_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let (agent, llm) = agent_with(config(dir.path()), Vec::new());
        agent.control().stop();

        let outcome = agent.run_task("Anything", None).await.unwrap();

        assert!(!outcome.success);
        assert_eq!(
            outcome.error.as_deref(),
            Some("Execution stopped by user request")
        );
        assert!(outcome.resume_possible);
        assert_eq!(llm.request_count(), 0);
    }

    #[tokio::test]
    async fn unrecoverable_llm_error_aborts_with_history() {
        let dir = tempfile::tempdir().unwrap();
        let (agent, _) = agent_with(
            config(dir.path()),
            vec![Err(LlmError::Http {
                status: 401,
                body: "invalid x-api-key".into(),
            })],
        );

        let outcome = agent.run_task("Anything", None).await.unwrap();

        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("HTTP 401"));
        let saved = StateStore::new(dir.path().join(".swe_agent_state"))
            .load(&outcome.task_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(saved.error_history.len(), 1);
        assert_eq!(saved.error_history[0].step, "Iteration 1");
        assert_eq!(saved.error_history[0].category, crate::error::ErrorCategory::Input);
    }

    async fn saved_state(dir: &Path, task_id: &str) -> PersistentState {
        StateStore::new(dir.join(".swe_agent_state"))
            .load(task_id)
            .await
            .unwrap()
            .unwrap()
    }

    fn unavailable() -> LlmError {
        LlmError::Http {
            status: 503,
            body: "service unavailable".into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn network_errors_abort_after_max_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let (agent, llm) = agent_with(
            config(dir.path()),
            (0..6).map(|_| Err(unavailable())).collect(),
        );

        let outcome = agent.run_task("Anything", None).await.unwrap();

        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("HTTP 503"));
        assert!(outcome.resume_possible);
        assert_eq!(llm.request_count(), 5);
        let saved = saved_state(dir.path(), &outcome.task_id).await;
        assert_eq!(saved.error_history.len(), 5);
        assert!(saved
            .error_history
            .iter()
            .all(|e| e.category == crate::error::ErrorCategory::Network));
    }

    #[tokio::test(start_paused = true)]
    async fn model_errors_retry_with_a_simpler_approach() {
        let dir = tempfile::tempdir().unwrap();
        let (agent, llm) = agent_with(
            config(dir.path()),
            vec![
                Err(LlmError::InvalidResponse("garbled tool arguments".into())),
                Ok(ScriptedClient::text("Task completed successfully.")),
            ],
        );

        let outcome = agent.run_task("Anything", None).await.unwrap();

        assert!(outcome.success);
        assert_eq!(llm.request_count(), 2);
        let note = last_content(&llm.request(1));
        assert!(note.contains("simpler approach"));
        assert!(note.contains("garbled tool arguments"));
    }

    #[tokio::test(start_paused = true)]
    async fn network_retries_carry_no_extra_note() {
        let dir = tempfile::tempdir().unwrap();
        let (agent, llm) = agent_with(
            config(dir.path()),
            vec![
                Err(unavailable()),
                Ok(ScriptedClient::text("Task completed successfully.")),
            ],
        );

        let outcome = agent.run_task("Anything", None).await.unwrap();

        assert!(outcome.success);
        assert_eq!(llm.request(0).len(), llm.request(1).len());
    }

    /// Fails once with a 503, then never answers.
    struct StallingClient {
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl LlmClient for StallingClient {
        async fn chat_completion(
            &self,
            _model: &str,
            _messages: &[ChatMessage],
            _tools: Option<&[ToolSchema]>,
        ) -> Result<ChatResponse, LlmError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(unavailable());
            }
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retried_requests_are_bounded_by_the_strategy_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let llm = Arc::new(StallingClient {
            calls: AtomicUsize::new(0),
        });
        let agent = Agent::new(config(dir.path()), llm.clone(), EventSink::new());

        let outcome = agent.run_task("Anything", None).await.unwrap();

        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("timed out after 60s"));
        assert_eq!(llm.calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_retry_backoff_sends_no_further_request() {
        let dir = tempfile::tempdir().unwrap();
        let (agent, llm) = agent_with(
            config(dir.path()),
            vec![Err(unavailable()), Err(unavailable())],
        );
        let control = agent.control().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            control.stop();
        });

        let outcome = agent.run_task("Anything", None).await.unwrap();

        assert!(!outcome.success);
        assert_eq!(
            outcome.error.as_deref(),
            Some("Execution stopped by user request")
        );
        assert_eq!(llm.request_count(), 1);
    }

    /// Never answers.
    struct SilentClient;

    #[async_trait::async_trait]
    impl LlmClient for SilentClient {
        async fn chat_completion(
            &self,
            _model: &str,
            _messages: &[ChatMessage],
            _tools: Option<&[ToolSchema]>,
        ) -> Result<ChatResponse, LlmError> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stop_interrupts_an_unanswered_request() {
        let dir = tempfile::tempdir().unwrap();
        let agent = Agent::new(config(dir.path()), Arc::new(SilentClient), EventSink::new());
        let control = agent.control().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            control.stop();
        });

        let outcome = agent.run_task("Anything", None).await.unwrap();

        assert!(!outcome.success);
        assert_eq!(
            outcome.error.as_deref(),
            Some("Execution stopped by user request")
        );
        assert!(outcome.resume_possible);
    }

    #[tokio::test]
    async fn interactive_completion_collects_feedback() {
        let dir = tempfile::tempdir().unwrap();
        let prompter = Arc::new(ScriptedPrompter::new(&["n", "add tests", "y"]));
        let (agent, llm) = agent_with(
            config(dir.path()),
            replies(vec![ScriptedClient::text("Done"), ScriptedClient::text("Done now")]),
        );
        let agent = agent.with_prompter(prompter.clone());

        let outcome = agent.run_task("Write code", None).await.unwrap();

        assert!(outcome.success);
        assert_eq!(
            last_content(&llm.request(1)),
            "Task not complete. User feedback: add tests"
        );
        let asked = prompter.asked();
        assert_eq!(asked.len(), 3);
        assert!(asked[0].contains("Is the overall task complete? (y/n/continue)"));
        assert_eq!(asked[1], "What still needs to be done?");
    }

    #[tokio::test]
    async fn interactive_skip_after_error() {
        let dir = tempfile::tempdir().unwrap();
        let prompter = Arc::new(ScriptedPrompter::new(&["skip", "y"]));
        let (agent, llm) = agent_with(
            config(dir.path()),
            vec![
                Err(LlmError::Http {
                    status: 400,
                    body: "bad request".into(),
                }),
                Ok(ScriptedClient::text("ok")),
            ],
        );
        let agent = agent.with_prompter(prompter);

        let outcome = agent.run_task("Anything", None).await.unwrap();

        assert!(outcome.success);
        assert!(last_content(&llm.request(1))
            .contains("User chose to skip this step. Please continue with the next step."));
        let report = std::fs::read_to_string(dir.path().join("progress.md")).unwrap();
        assert!(report.contains("SKIPPED: Starting task"));
    }

    #[tokio::test]
    async fn summarizes_and_compresses_at_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.summarization_threshold = 2;
        config.context_retention = 2;
        let (agent, llm) = agent_with(
            config,
            replies(vec![
                ScriptedClient::tool_calls(vec![("list_directory", json!({}))]),
                ScriptedClient::tool_calls(vec![("list_directory", json!({"path": "."}))]),
                ScriptedClient::text("- Listed the workspace\nCurrently checking files\nNext steps:\n- Finish"),
                ScriptedClient::text("Task completed."),
            ]),
        );
        let mut events = agent.events().subscribe();

        let outcome = agent.run_task("Inspect", None).await.unwrap();
        assert!(outcome.success);

        let summary_request = llm.request(2);
        assert_eq!(summary_request.len(), 1);
        assert!(summary_request[0]
            .content
            .as_deref()
            .unwrap()
            .starts_with(SUMMARY_PROMPT));

        let after = llm.request(3);
        assert_eq!(after.len(), 5);
        assert!(after[0].content.as_deref().unwrap().contains("## LATEST SUMMARY"));
        assert!(after[2]
            .content
            .as_deref()
            .unwrap()
            .starts_with("CONTEXT SUMMARY: Previous Progress Summary:\nKey accomplishments: Listed the workspace"));
        assert!(after[3].has_tool_calls());
        assert_eq!(after[4].role, Role::Tool);

        let mut summaries = 0;
        while let Ok(event) = events.try_recv() {
            if let AgentEvent::SummaryCreated { summary_id, accomplishments } = event {
                assert_eq!(summary_id, "summary_1");
                assert_eq!(accomplishments, 1);
                summaries += 1;
            }
        }
        assert_eq!(summaries, 1);
    }

    #[tokio::test]
    async fn delegated_subtask_runs_in_fresh_conversation() {
        let dir = tempfile::tempdir().unwrap();
        let (agent, llm) = agent_with(
            config(dir.path()),
            replies(vec![
                ScriptedClient::tool_calls(vec![(
                    "delegate_task",
                    json!({"description": "Create b.txt", "context": "Contents: bee"}),
                )]),
                ScriptedClient::tool_calls(vec![(
                    "write_file",
                    json!({"path": "b.txt", "content": "bee"}),
                )]),
                ScriptedClient::text("b.txt file created"),
                ScriptedClient::text("Task completed."),
            ]),
        );

        let outcome = agent.run_task("Make b.txt via a helper", None).await.unwrap();

        assert!(outcome.success);
        assert_eq!(std::fs::read_to_string(dir.path().join("b.txt")).unwrap(), "bee");

        let nested = llm.request(1);
        assert_eq!(nested.len(), 2);
        assert!(nested[0].content.as_deref().unwrap().contains("focused sub-agent"));
        assert_eq!(
            nested[1].content.as_deref(),
            Some("Create b.txt\n\nContext:\nContents: bee")
        );
        assert_eq!(
            last_content(&llm.request(3)),
            "Subtask completed: b.txt file created"
        );

        let todos = agent.todos().list();
        let delegate = todos.iter().find(|t| t.id == "delegate_1").unwrap();
        assert_eq!(delegate.status, TodoStatus::Completed);
    }

    #[test]
    fn describes_calls_for_progress() {
        assert_eq!(
            describe_call("bash", &json!({"command": "cargo test"})),
            "bash: cargo test"
        );
        assert_eq!(
            describe_call("write_file", &json!({"path": "a.rs"})),
            "write_file: a.rs"
        );
        assert_eq!(describe_call("web_search", &json!({"query": "x"})), "web_search");
    }
}
