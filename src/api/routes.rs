//! HTTP routes and the task table.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::future::BoxFuture;
use tokio::sync::RwLock;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use super::types::{
    CreateTaskRequest, CreateTaskResponse, HealthResponse, LogEntryType, TaskLogEntry,
    TaskState, TaskStatus,
};
use crate::agent::Agent;
use crate::config::Config;
use crate::control::ExecutionControl;
use crate::error::AgentError;
use crate::events::{AgentEvent, EventSink};
use crate::llm::{client_from_config, LlmClient};

struct TaskEntry {
    state: TaskState,
    control: ExecutionControl,
}

/// Shared state of the HTTP server.
pub struct AppState {
    pub config: Config,
    tasks: RwLock<HashMap<Uuid, TaskEntry>>,
    /// Client shared by every task instead of one built from `config`.
    llm: Option<Arc<dyn LlmClient>>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            tasks: RwLock::new(HashMap::new()),
            llm: None,
        }
    }

    pub fn with_llm_client(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/task", post(create_task))
        .route("/api/tasks", get(list_tasks))
        .route("/api/task/:id", get(get_task))
        .route("/api/task/:id/stop", post(stop_task))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the HTTP server until it fails.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let app = router(Arc::new(AppState::new(config)));

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on http://{}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn create_task(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateTaskRequest>,
) -> Result<Json<CreateTaskResponse>, (StatusCode, String)> {
    if req.task.trim().is_empty() && req.resume_id.is_none() {
        return Err((
            StatusCode::BAD_REQUEST,
            "Either 'task' or 'resume_id' is required".to_string(),
        ));
    }

    let id = Uuid::new_v4();
    let control = ExecutionControl::new();
    let task_state = TaskState {
        id,
        status: TaskStatus::Pending,
        task: req.task.clone(),
        model: req
            .model
            .clone()
            .unwrap_or_else(|| state.config.default_model.clone()),
        agent_task_id: req.resume_id.clone(),
        iterations: 0,
        result: None,
        resume_possible: false,
        log: Vec::new(),
    };
    state.tasks.write().await.insert(
        id,
        TaskEntry {
            state: task_state,
            control: control.clone(),
        },
    );

    tracing::info!(%id, "Task submitted");
    tokio::spawn(run_task(state.clone(), id, req, control));

    Ok(Json(CreateTaskResponse {
        id,
        status: TaskStatus::Pending,
    }))
}

async fn list_tasks(State(state): State<Arc<AppState>>) -> Json<Vec<TaskState>> {
    let tasks = state.tasks.read().await;
    let mut list: Vec<TaskState> = tasks.values().map(|e| e.state.clone()).collect();
    list.sort_by(|a, b| {
        let first = |t: &TaskState| t.log.first().map(|e| e.timestamp.clone());
        first(a).cmp(&first(b))
    });
    Json(list)
}

async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<TaskState>, (StatusCode, String)> {
    state
        .tasks
        .read()
        .await
        .get(&id)
        .map(|e| Json(e.state.clone()))
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("Task {} not found", id)))
}

async fn stop_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<TaskState>, (StatusCode, String)> {
    let tasks = state.tasks.read().await;
    let entry = tasks
        .get(&id)
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("Task {} not found", id)))?;
    if !entry.state.status.is_finished() {
        tracing::info!(%id, "Stop requested");
        entry.control.stop();
    }
    Ok(Json(entry.state.clone()))
}

/// What a finished run reports back to the task table.
struct RunResult {
    status: TaskStatus,
    result: Option<String>,
    iterations: usize,
    agent_task_id: Option<String>,
    resume_possible: bool,
}

async fn run_task(
    state: Arc<AppState>,
    id: Uuid,
    req: CreateTaskRequest,
    control: ExecutionControl,
) {
    let mut config = state.config.clone();
    config.interactive = false;
    if let Some(model) = &req.model {
        config.default_model = model.clone();
    }
    if let Some(workspace) = &req.workspace_path {
        config.workspace_path = workspace.into();
    }

    let events = EventSink::new();
    let llm = state
        .llm
        .clone()
        .unwrap_or_else(|| client_from_config(&config, events.clone()));
    let agent = Agent::new(config, llm, events.clone()).with_control(control.clone());
    let mut rx = events.subscribe();

    set_status(&state, id, TaskStatus::Running).await;

    let mut run: BoxFuture<'_, RunResult> = if req.plan {
        Box::pin(async {
            match agent.run_plan(&req.task).await {
                Ok(report) => RunResult {
                    status: if report.success() {
                        TaskStatus::Completed
                    } else {
                        TaskStatus::Failed
                    },
                    result: Some(report.final_report),
                    iterations: report.results.len(),
                    agent_task_id: None,
                    resume_possible: false,
                },
                Err(e) => failed_run(e, &control),
            }
        })
    } else {
        Box::pin(async {
            match agent.run_task(&req.task, req.resume_id.as_deref()).await {
                Ok(outcome) => RunResult {
                    status: if outcome.success {
                        TaskStatus::Completed
                    } else if control.is_stopped() {
                        TaskStatus::Cancelled
                    } else {
                        TaskStatus::Failed
                    },
                    result: outcome.final_response.or(outcome.error),
                    iterations: outcome.iterations as usize,
                    agent_task_id: Some(outcome.task_id),
                    resume_possible: outcome.resume_possible,
                },
                Err(e) => failed_run(e, &control),
            }
        })
    };

    let result = loop {
        tokio::select! {
            result = &mut run => break result,
            Ok(event) = rx.recv() => record_event(&state, id, &event).await,
        }
    };
    while let Ok(event) = rx.try_recv() {
        record_event(&state, id, &event).await;
    }

    tracing::info!(%id, status = ?result.status, "Task finished");
    if let Some(entry) = state.tasks.write().await.get_mut(&id) {
        let task = &mut entry.state;
        task.status = result.status;
        task.iterations = task.iterations.max(result.iterations);
        task.resume_possible = result.resume_possible;
        if result.agent_task_id.is_some() {
            task.agent_task_id = result.agent_task_id;
        }
        if let Some(text) = &result.result {
            let entry_type = if result.status == TaskStatus::Completed {
                LogEntryType::Response
            } else {
                LogEntryType::Error
            };
            task.log.push(TaskLogEntry::new(entry_type, text.clone()));
        }
        task.result = result.result;
    }
}

fn failed_run(e: AgentError, control: &ExecutionControl) -> RunResult {
    tracing::error!("Task failed: {}", e);
    RunResult {
        status: if control.is_stopped() {
            TaskStatus::Cancelled
        } else {
            TaskStatus::Failed
        },
        result: Some(e.to_string()),
        iterations: 0,
        agent_task_id: None,
        resume_possible: false,
    }
}

async fn set_status(state: &AppState, id: Uuid, status: TaskStatus) {
    if let Some(entry) = state.tasks.write().await.get_mut(&id) {
        entry.state.status = status;
    }
}

async fn record_event(state: &AppState, id: Uuid, event: &AgentEvent) {
    let mut tasks = state.tasks.write().await;
    let Some(entry) = tasks.get_mut(&id) else {
        return;
    };
    match event {
        AgentEvent::Iteration { number } => entry.state.iterations = *number,
        AgentEvent::TaskStarted { task_id, .. } | AgentEvent::TaskResumed { task_id, .. } => {
            entry.state.agent_task_id = Some(task_id.clone());
        }
        _ => {}
    }
    if let Some(log) = TaskLogEntry::from_event(event) {
        entry.state.log.push(log);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::scripted::ScriptedClient;
    use serde_json::json;
    use std::time::Duration;

    async fn spawn_server(dir: &std::path::Path, llm: impl LlmClient + 'static) -> String {
        let config = Config::new("k".into(), "test-model".into(), dir.to_path_buf());
        let state = Arc::new(AppState::new(config).with_llm_client(Arc::new(llm)));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(state)).await.unwrap();
        });
        format!("http://{}", addr)
    }

    async fn wait_until_finished(base: &str, id: Uuid) -> TaskState {
        let client = reqwest::Client::new();
        for _ in 0..100 {
            let task: TaskState = client
                .get(format!("{}/api/task/{}", base, id))
                .send()
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
            if task.status.is_finished() {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("task {} did not finish", id);
    }

    /// Accepts requests and never answers them.
    struct SilentClient;

    #[async_trait::async_trait]
    impl LlmClient for SilentClient {
        async fn chat_completion(
            &self,
            _model: &str,
            _messages: &[crate::llm::ChatMessage],
            _tools: Option<&[crate::llm::ToolSchema]>,
        ) -> Result<crate::llm::ChatResponse, crate::llm::LlmError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn stopped_task_is_reported_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let base = spawn_server(dir.path(), SilentClient).await;
        let client = reqwest::Client::new();

        let created: CreateTaskResponse = client
            .post(format!("{}/api/task", base))
            .json(&json!({"task": "Wait forever"}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let stopped = client
            .post(format!("{}/api/task/{}/stop", base, created.id))
            .send()
            .await
            .unwrap();
        assert_eq!(stopped.status(), reqwest::StatusCode::OK);

        let task = wait_until_finished(&base, created.id).await;
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert_eq!(task.result.as_deref(), Some("Execution stopped by user request"));
        assert!(task.resume_possible);
    }

    #[tokio::test]
    async fn health_reports_version() {
        let dir = tempfile::tempdir().unwrap();
        let base = spawn_server(dir.path(), ScriptedClient::new(Vec::new())).await;
        let health: HealthResponse = reqwest::get(format!("{}/api/health", base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health.status, "ok");
        assert_eq!(health.version, env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn submitted_task_runs_to_completion() {
        let dir = tempfile::tempdir().unwrap();
        let llm = ScriptedClient::replies(vec![
            ScriptedClient::tool_calls(vec![(
                "write_file",
                json!({"path": "notes.md", "content": "# Notes"}),
            )]),
            ScriptedClient::text("Task completed: notes.md file created."),
        ]);
        let base = spawn_server(dir.path(), llm).await;
        let client = reqwest::Client::new();

        let created: CreateTaskResponse = client
            .post(format!("{}/api/task", base))
            .json(&json!({"task": "Write notes"}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(created.status, TaskStatus::Pending);

        let task = wait_until_finished(&base, created.id).await;
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.iterations, 2);
        assert_eq!(task.model, "test-model");
        assert_eq!(
            task.agent_task_id.as_deref(),
            Some(crate::state::task_id_for("Write notes").as_str())
        );
        assert!(task
            .log
            .iter()
            .any(|e| e.entry_type == LogEntryType::ToolCall && e.content.contains("write_file")));
        assert_eq!(task.log.last().unwrap().entry_type, LogEntryType::Response);
        assert!(dir.path().join("notes.md").exists());

        let all: Vec<TaskState> = client
            .get(format!("{}/api/tasks", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn rejects_empty_tasks_and_unknown_ids() {
        let dir = tempfile::tempdir().unwrap();
        let base = spawn_server(dir.path(), ScriptedClient::new(Vec::new())).await;
        let client = reqwest::Client::new();

        let empty = client
            .post(format!("{}/api/task", base))
            .json(&json!({"task": "  "}))
            .send()
            .await
            .unwrap();
        assert_eq!(empty.status(), reqwest::StatusCode::BAD_REQUEST);

        let missing = client
            .get(format!("{}/api/task/{}", base, Uuid::new_v4()))
            .send()
            .await
            .unwrap();
        assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);

        let stop = client
            .post(format!("{}/api/task/{}/stop", base, Uuid::new_v4()))
            .send()
            .await
            .unwrap();
        assert_eq!(stop.status(), reqwest::StatusCode::NOT_FOUND);
    }
}
