//! Run control (pause, resume, stop) and user prompting.

use std::io::Write as _;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::AgentError;
use crate::events::{AgentEvent, EventSink};
use crate::todos::{TodoManager, TodoStatus, MAIN_TASK_ID};

/// Shared handle to pause, resume or stop a running task.
#[derive(Clone)]
pub struct ExecutionControl {
    paused: Arc<watch::Sender<bool>>,
    cancel: CancellationToken,
    events: Option<EventSink>,
    todos: Option<TodoManager>,
}

impl ExecutionControl {
    pub fn new() -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            paused: Arc::new(paused),
            cancel: CancellationToken::new(),
            events: None,
            todos: None,
        }
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = Some(events);
        self
    }

    /// Mirror pause/resume on the `main_task` todo.
    pub fn with_todos(mut self, todos: TodoManager) -> Self {
        self.todos = Some(todos);
        self
    }

    fn emit(&self, event: AgentEvent) {
        if let Some(events) = &self.events {
            events.emit(event);
        }
    }

    pub fn pause(&self) {
        if self.paused.send_replace(true) {
            return;
        }
        tracing::info!("Execution paused");
        if let Some(todos) = &self.todos {
            todos.update(MAIN_TASK_ID, TodoStatus::Paused, None);
        }
        self.emit(AgentEvent::Paused);
    }

    pub fn resume(&self) {
        if !self.paused.send_replace(false) {
            return;
        }
        tracing::info!("Execution resumed");
        if let Some(todos) = &self.todos {
            todos.update(MAIN_TASK_ID, TodoStatus::InProgress, None);
        }
        self.emit(AgentEvent::Resumed);
    }

    pub fn stop(&self) {
        tracing::info!("Stop requested");
        self.cancel.cancel();
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait while paused. Fails with `AgentError::Stopped` once a stop was
    /// requested, including while paused.
    pub async fn checkpoint(&self) -> Result<(), AgentError> {
        let mut rx = self.paused.subscribe();
        loop {
            if self.cancel.is_cancelled() {
                return Err(AgentError::Stopped);
            }
            if !*rx.borrow_and_update() {
                return Ok(());
            }
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
                _ = self.cancel.cancelled() => return Err(AgentError::Stopped),
            }
        }
    }
}

impl Default for ExecutionControl {
    fn default() -> Self {
        Self::new()
    }
}

/// Source of answers to questions the agent asks the user.
#[async_trait]
pub trait Prompter: Send + Sync {
    /// Ask `question` and return the trimmed answer. Empty on end of input.
    async fn ask(&self, question: &str) -> String;
}

/// Reads answers from the terminal.
pub struct StdinPrompter;

#[async_trait]
impl Prompter for StdinPrompter {
    async fn ask(&self, question: &str) -> String {
        let question = question.to_string();
        tokio::task::spawn_blocking(move || {
            print!("{} ", question);
            let _ = std::io::stdout().flush();
            let mut line = String::new();
            match std::io::stdin().read_line(&mut line) {
                Ok(_) => line.trim().to_string(),
                Err(_) => String::new(),
            }
        })
        .await
        .unwrap_or_default()
    }
}

/// Install the Ctrl+C handler.
///
/// Non-interactive runs stop on the first interrupt. Interactive runs offer
/// pause, stop or continue; while paused the next answer resumes or stops.
pub fn spawn_interrupt_handler(
    control: ExecutionControl,
    prompter: Option<Arc<dyn Prompter>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interruption received");
            let Some(prompter) = &prompter else {
                control.stop();
                return;
            };

            let choice = prompter
                .ask("\nOptions:\n1. Pause execution\n2. Stop execution\n3. Continue execution\nEnter choice (1-3):")
                .await;
            match choice.as_str() {
                "1" => {
                    control.pause();
                    let answer = prompter
                        .ask("⏸️ Execution paused. Press Enter to resume or type 'stop':")
                        .await;
                    if answer.eq_ignore_ascii_case("stop") {
                        control.stop();
                        return;
                    }
                    control.resume();
                }
                "2" => {
                    control.stop();
                    return;
                }
                _ => control.resume(),
            }
        }
    })
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::*;

    /// Answers questions from a queue and records what was asked.
    pub struct ScriptedPrompter {
        answers: Mutex<VecDeque<String>>,
        asked: Mutex<Vec<String>>,
    }

    impl ScriptedPrompter {
        pub fn new(answers: &[&str]) -> Self {
            Self {
                answers: Mutex::new(answers.iter().map(|a| a.to_string()).collect()),
                asked: Mutex::new(Vec::new()),
            }
        }

        pub fn asked(&self) -> Vec<String> {
            self.asked.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Prompter for ScriptedPrompter {
        async fn ask(&self, question: &str) -> String {
            self.asked.lock().unwrap().push(question.to_string());
            self.answers.lock().unwrap().pop_front().unwrap_or_default()
        }
    }
}
