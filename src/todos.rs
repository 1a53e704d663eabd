//! Todo tracking for console display.
//!
//! A flat list of items behind one mutex. The agent updates the `main_task`
//! entry as a run progresses, the plan workflow adds one entry per subtask,
//! and the model can replace the list wholesale through `todo_write`.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::events::{AgentEvent, EventSink};

/// Id of the entry that tracks the overall task.
pub const MAIN_TASK_ID: &str = "main_task";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Paused,
}

impl TodoStatus {
    pub fn icon(self) -> &'static str {
        match self {
            TodoStatus::Pending => "⏳",
            TodoStatus::InProgress => "🔄",
            TodoStatus::Completed => "✅",
            TodoStatus::Failed => "❌",
            TodoStatus::Paused => "⏸️",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TodoStatus::Pending => "pending",
            TodoStatus::InProgress => "in_progress",
            TodoStatus::Completed => "completed",
            TodoStatus::Failed => "failed",
            TodoStatus::Paused => "paused",
        }
    }
}

impl FromStr for TodoStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TodoStatus::Pending),
            "in_progress" => Ok(TodoStatus::InProgress),
            "completed" => Ok(TodoStatus::Completed),
            "failed" => Ok(TodoStatus::Failed),
            "paused" => Ok(TodoStatus::Paused),
            other => Err(format!("Invalid status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TodoPriority {
    High,
    #[default]
    Medium,
    Low,
}

impl FromStr for TodoPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "high" => Ok(TodoPriority::High),
            "medium" => Ok(TodoPriority::Medium),
            "low" => Ok(TodoPriority::Low),
            other => Err(format!("Invalid priority: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TodoItem {
    pub id: String,
    pub description: String,
    pub status: TodoStatus,
    #[serde(default)]
    pub priority: TodoPriority,
}

/// Shared todo list. Cloning shares the underlying list.
#[derive(Debug, Clone)]
pub struct TodoManager {
    todos: Arc<Mutex<Vec<TodoItem>>>,
    show_updates: bool,
    events: Option<EventSink>,
}

impl TodoManager {
    pub fn new(show_updates: bool) -> Self {
        Self {
            todos: Arc::new(Mutex::new(Vec::new())),
            show_updates,
            events: None,
        }
    }

    /// Broadcast updates as `AgentEvent::TodoUpdated` (when updates are shown).
    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = Some(events);
        self
    }

    fn lock(&self) -> MutexGuard<'_, Vec<TodoItem>> {
        self.todos.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Update an item's status, adding it when the id is unknown.
    pub fn update(&self, id: &str, status: TodoStatus, description: Option<&str>) {
        let description = {
            let mut todos = self.lock();
            match todos.iter_mut().find(|t| t.id == id) {
                Some(todo) => {
                    todo.status = status;
                    if let Some(desc) = description {
                        todo.description = desc.to_string();
                    }
                    todo.description.clone()
                }
                None => {
                    let desc = description
                        .map(str::to_string)
                        .unwrap_or_else(|| format!("Task {}", id));
                    todos.push(TodoItem {
                        id: id.to_string(),
                        description: desc.clone(),
                        status,
                        priority: TodoPriority::default(),
                    });
                    desc
                }
            }
        };

        tracing::debug!(todo = id, status = status.as_str(), "Todo updated");
        if self.show_updates {
            if let Some(events) = &self.events {
                events.emit(AgentEvent::TodoUpdated {
                    id: id.to_string(),
                    status,
                    description,
                });
            }
        }
    }

    /// Replace every item except `main_task` with `items`.
    pub fn replace_all(&self, items: Vec<TodoItem>) {
        {
            let mut todos = self.lock();
            todos.retain(|t| t.id == MAIN_TASK_ID);
            todos.extend(items.into_iter().filter(|t| t.id != MAIN_TASK_ID));
        }
        if self.show_updates {
            if let Some(events) = &self.events {
                for todo in self.list() {
                    events.emit(AgentEvent::TodoUpdated {
                        id: todo.id,
                        status: todo.status,
                        description: todo.description,
                    });
                }
            }
        }
    }

    pub fn list(&self) -> Vec<TodoItem> {
        self.lock().clone()
    }

    /// Count of items per status.
    pub fn status_summary(&self) -> BTreeMap<TodoStatus, usize> {
        let mut summary = BTreeMap::new();
        for todo in self.lock().iter() {
            *summary.entry(todo.status).or_insert(0) += 1;
        }
        summary
    }

    /// Numbered, human-readable list.
    pub fn render(&self) -> String {
        let todos = self.lock();
        if todos.is_empty() {
            return "📝 No todos currently tracked".to_string();
        }
        let mut out = String::from("📝 Current Todo List:");
        for (i, todo) in todos.iter().enumerate() {
            out.push_str(&format!(
                "\n  {}. {} {} [{}]",
                i + 1,
                todo.status.icon(),
                todo.description,
                todo.status.as_str().to_uppercase()
            ));
        }
        out
    }
}

impl Default for TodoManager {
    fn default() -> Self {
        Self::new(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_adds_then_modifies() {
        let todos = TodoManager::new(false);
        todos.update("a", TodoStatus::Pending, None);
        todos.update("a", TodoStatus::InProgress, Some("Write parser"));

        let list = todos.list();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].description, "Write parser");
        assert_eq!(list[0].status, TodoStatus::InProgress);
    }

    #[test]
    fn missing_description_defaults_to_task_id() {
        let todos = TodoManager::new(false);
        todos.update("42", TodoStatus::Pending, None);
        assert_eq!(todos.list()[0].description, "Task 42");
    }

    #[test]
    fn summary_counts_statuses() {
        let todos = TodoManager::new(false);
        todos.update("a", TodoStatus::Completed, None);
        todos.update("b", TodoStatus::Completed, None);
        todos.update("c", TodoStatus::Failed, None);

        let summary = todos.status_summary();
        assert_eq!(summary.get(&TodoStatus::Completed), Some(&2));
        assert_eq!(summary.get(&TodoStatus::Failed), Some(&1));
        assert_eq!(summary.get(&TodoStatus::Pending), None);
    }

    #[test]
    fn replace_all_keeps_main_task() {
        let todos = TodoManager::new(false);
        todos.update(MAIN_TASK_ID, TodoStatus::InProgress, Some("Main"));
        todos.update("old", TodoStatus::Pending, None);
        todos.replace_all(vec![TodoItem {
            id: "new".into(),
            description: "New item".into(),
            status: TodoStatus::Pending,
            priority: TodoPriority::High,
        }]);

        let ids: Vec<_> = todos.list().into_iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![MAIN_TASK_ID.to_string(), "new".to_string()]);
    }

    #[test]
    fn render_lists_items() {
        let todos = TodoManager::new(false);
        assert!(todos.render().contains("No todos"));
        todos.update("a", TodoStatus::Completed, Some("Ship it"));
        assert!(todos.render().contains("1. ✅ Ship it [COMPLETED]"));
    }

    #[tokio::test]
    async fn updates_are_broadcast_when_shown() {
        let events = EventSink::new();
        let mut rx = events.subscribe();
        let todos = TodoManager::new(true).with_events(events);
        todos.update("a", TodoStatus::InProgress, Some("Doing"));

        match rx.recv().await.unwrap() {
            AgentEvent::TodoUpdated { id, status, .. } => {
                assert_eq!(id, "a");
                assert_eq!(status, TodoStatus::InProgress);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
