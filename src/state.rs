//! Persistent task state.
//!
//! One JSON snapshot per task, `<state dir>/<task_id>.json`, holds everything
//! needed to resume an interrupted task: completed steps, error history,
//! progress entries, summaries, tracked files and the conversation itself.
//! The snapshot is rewritten after every iteration and removed once the task
//! succeeds. Tasks sharing a workspace never touch each other's snapshot.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ErrorCategory;
use crate::llm::ChatMessage;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("I/O error on {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("Corrupt state file {0}: {1}")]
    Corrupt(PathBuf, #[source] serde_json::Error),

    #[error("Failed to serialize state: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Stable short id for a task: first 8 hex chars of its md5 digest.
pub fn task_id_for(task: &str) -> String {
    let digest = format!("{:x}", md5::compute(task.as_bytes()));
    digest[..8].to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Completed,
    Failed,
    Skipped,
}

impl EntryStatus {
    pub fn icon(self) -> &'static str {
        match self {
            EntryStatus::Completed => "✅",
            EntryStatus::Failed => "❌",
            EntryStatus::Skipped => "⏭️",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEntry {
    pub timestamp: DateTime<Utc>,
    pub action: String,
    pub details: String,
    #[serde(default)]
    pub files_affected: Vec<String>,
    pub status: EntryStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    /// What happened to the file, e.g. `created` or `modified`.
    pub action: String,
    pub size: u64,
    pub first_seen: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub timestamp: DateTime<Utc>,
    pub iteration: u32,
    pub step: String,
    pub error: String,
    pub category: ErrorCategory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub summary_id: String,
    /// Inclusive iteration range the summary covers.
    pub iterations_covered: (u32, u32),
    pub key_accomplishments: Vec<String>,
    pub current_focus: String,
    pub next_steps: Vec<String>,
    pub files_created_modified: Vec<String>,
    pub errors_resolved: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistentState {
    pub task_id: String,
    pub original_task: String,
    #[serde(default)]
    pub completed_steps: Vec<String>,
    #[serde(default)]
    pub current_step: String,
    #[serde(default)]
    pub error_history: Vec<ErrorRecord>,
    #[serde(default)]
    pub iteration_count: u32,
    #[serde(default)]
    pub last_successful_operation: String,
    /// Free-form notes saved through `save_progress`.
    #[serde(default)]
    pub working_context: BTreeMap<String, String>,
    #[serde(default)]
    pub progress_entries: Vec<ProgressEntry>,
    #[serde(default)]
    pub summaries: Vec<ConversationSummary>,
    #[serde(default)]
    pub files_tracking: BTreeMap<String, FileRecord>,
    #[serde(default)]
    pub conversation: Vec<ChatMessage>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PersistentState {
    pub fn new(task: &str) -> Self {
        let now = Utc::now();
        Self {
            task_id: task_id_for(task),
            original_task: task.to_string(),
            completed_steps: Vec::new(),
            current_step: "Starting task".to_string(),
            error_history: Vec::new(),
            iteration_count: 0,
            last_successful_operation: String::new(),
            working_context: BTreeMap::new(),
            progress_entries: Vec::new(),
            summaries: Vec::new(),
            files_tracking: BTreeMap::new(),
            conversation: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Add a completed step. Returns false when it was already recorded.
    pub fn record_step(&mut self, step: impl Into<String>) -> bool {
        let step = step.into();
        if self.completed_steps.contains(&step) {
            return false;
        }
        self.completed_steps.push(step);
        true
    }

    /// Track a created or modified file.
    pub fn record_file(&mut self, path: &str, action: &str, size: u64) {
        let now = Utc::now();
        self.files_tracking
            .entry(path.to_string())
            .and_modify(|record| {
                record.action = action.to_string();
                record.size = size;
                record.last_modified = now;
            })
            .or_insert_with(|| FileRecord {
                action: action.to_string(),
                size,
                first_seen: now,
                last_modified: now,
            });
    }

    pub fn record_error(&mut self, step: &str, error: &str, category: ErrorCategory) {
        self.error_history.push(ErrorRecord {
            timestamp: Utc::now(),
            iteration: self.iteration_count,
            step: step.to_string(),
            error: error.to_string(),
            category,
        });
    }

    pub fn add_progress(
        &mut self,
        action: impl Into<String>,
        details: impl Into<String>,
        files_affected: Vec<String>,
        status: EntryStatus,
    ) {
        self.progress_entries.push(ProgressEntry {
            timestamp: Utc::now(),
            action: action.into(),
            details: details.into(),
            files_affected,
            status,
        });
    }

    pub fn latest_summary(&self) -> Option<&ConversationSummary> {
        self.summaries.last()
    }

    /// Id for the next summary, e.g. `summary_3` or `manual_3`.
    pub fn next_summary_id(&self, prefix: &str) -> String {
        format!("{}_{}", prefix, self.summaries.len() + 1)
    }

    /// One-line status for error prompts and logs.
    pub fn context_line(&self) -> String {
        format!(
            "Step: {}, Files: {}, Completed: {}",
            self.current_step,
            self.files_tracking.len(),
            self.completed_steps.len()
        )
    }
}

/// Alias accepted by [`StateStore::resolve`] for the most recent snapshot.
pub const LATEST: &str = "latest";

/// Reads and writes the per-task state snapshots of one workspace.
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Snapshot file of `task_id`.
    pub fn path_for(&self, task_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", task_id))
    }

    /// Write the snapshot through a temp file and rename, so a crash never
    /// leaves a half-written state behind.
    pub async fn save(&self, state: &mut PersistentState) -> Result<(), StateError> {
        state.updated_at = Utc::now();
        let contents = serde_json::to_string_pretty(state)?;

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| StateError::Io(self.dir.clone(), e))?;
        let path = self.path_for(&state.task_id);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, contents)
            .await
            .map_err(|e| StateError::Io(tmp.clone(), e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| StateError::Io(path.clone(), e))?;

        tracing::debug!(task_id = %state.task_id, "Saved state to {}", path.display());
        Ok(())
    }

    async fn read(path: &Path) -> Result<Option<PersistentState>, StateError> {
        let contents = match tokio::fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StateError::Io(path.to_path_buf(), e)),
        };
        serde_json::from_str(&contents)
            .map(Some)
            .map_err(|e| StateError::Corrupt(path.to_path_buf(), e))
    }

    /// The stored state of `task_id`, if any.
    pub async fn load(&self, task_id: &str) -> Result<Option<PersistentState>, StateError> {
        Ok(Self::read(&self.path_for(task_id))
            .await?
            .filter(|state| state.task_id == task_id))
    }

    /// The most recently updated snapshot. Unreadable snapshots are skipped.
    pub async fn load_latest(&self) -> Result<Option<PersistentState>, StateError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StateError::Io(self.dir.clone(), e)),
        };

        let mut latest: Option<PersistentState> = None;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StateError::Io(self.dir.clone(), e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::read(&path).await {
                Ok(Some(state)) => {
                    if latest
                        .as_ref()
                        .map_or(true, |l| state.updated_at > l.updated_at)
                    {
                        latest = Some(state);
                    }
                }
                Ok(None) => {}
                Err(e) => tracing::warn!("Skipping state snapshot: {}", e),
            }
        }
        Ok(latest)
    }

    /// `load` by id, or `load_latest` for [`LATEST`].
    pub async fn resolve(&self, id: &str) -> Result<Option<PersistentState>, StateError> {
        if id == LATEST {
            self.load_latest().await
        } else {
            self.load(id).await
        }
    }

    /// Delete the snapshot of `task_id`. Missing files are fine.
    pub async fn cleanup(&self, task_id: &str) -> Result<(), StateError> {
        let path = self.path_for(task_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                tracing::debug!("Removed state file {}", path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StateError::Io(path, e)),
        }
    }
}
