//! `todo_write`: let the model maintain the shared todo list.

use std::path::Path;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::Tool;
use crate::todos::{TodoItem, TodoManager, TodoPriority, TodoStatus};

const REQUIRED_FIELDS: [&str; 4] = ["id", "content", "status", "priority"];

pub struct TodoWrite {
    todos: TodoManager,
}

impl TodoWrite {
    pub fn new(todos: TodoManager) -> Self {
        Self { todos }
    }
}

fn parse_item(raw: &Value) -> anyhow::Result<TodoItem> {
    if !REQUIRED_FIELDS.iter().all(|f| raw.get(f).is_some()) {
        anyhow::bail!("Todo missing required fields: {}", REQUIRED_FIELDS.join(", "));
    }
    let field = |name: &str| -> anyhow::Result<String> {
        match &raw[name] {
            Value::String(s) => Ok(s.clone()),
            Value::Number(n) => Ok(n.to_string()),
            _ => Err(anyhow::anyhow!("Todo field '{}' must be a string", name)),
        }
    };

    Ok(TodoItem {
        id: field("id")?,
        description: field("content")?,
        status: field("status")?.parse::<TodoStatus>().map_err(anyhow::Error::msg)?,
        priority: field("priority")?
            .parse::<TodoPriority>()
            .map_err(anyhow::Error::msg)?,
    })
}

#[async_trait]
impl Tool for TodoWrite {
    fn name(&self) -> &str {
        "todo_write"
    }

    fn description(&self) -> &str {
        "Replace the todo list used to track progress on the task. Each todo needs id, content, status (pending, in_progress, completed, failed) and priority (high, medium, low)."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "todos": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "id": {"type": "string"},
                            "content": {"type": "string"},
                            "status": {
                                "type": "string",
                                "enum": ["pending", "in_progress", "completed", "failed"]
                            },
                            "priority": {
                                "type": "string",
                                "enum": ["high", "medium", "low"]
                            }
                        },
                        "required": ["id", "content", "status", "priority"]
                    }
                }
            },
            "required": ["todos"]
        })
    }

    async fn execute(&self, args: Value, _workspace: &Path) -> anyhow::Result<String> {
        let raw = args["todos"]
            .as_array()
            .ok_or_else(|| anyhow::anyhow!("Missing 'todos' argument"))?;
        // Validate everything before touching the shared list.
        let items = raw.iter().map(parse_item).collect::<anyhow::Result<Vec<_>>>()?;
        let count = items.len();
        self.todos.replace_all(items);

        let summary = self
            .todos
            .status_summary()
            .into_iter()
            .map(|(status, n)| format!("{}: {}", status.as_str(), n))
            .collect::<Vec<_>>()
            .join(", ");
        Ok(format!("Successfully updated {} todos ({})", count, summary))
    }
}
