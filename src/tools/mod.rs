//! Tools the model can call.
//!
//! Every tool implements [`Tool`] and is registered in a [`ToolRegistry`].
//! Tools resolve relative paths against the workspace and return plain text;
//! an `Err` is reported back to the model as `Error: ...`.

mod files;
mod search;
mod terminal;
mod todo;
mod web;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

pub use files::{EditFile, ListDirectory, MultiEdit, ReadFile, WriteFile};
pub use search::{CodeAnalysis, FileSearch, GrepSearch};
pub use terminal::{effective_timeout, Bash};
pub use todo::TodoWrite;
pub use web::{FetchUrl, WebRequest, WebSearch};

use crate::llm::ToolSchema;
use crate::permissions::{normalize_path, PermissionManager};
use crate::todos::TodoManager;

/// A tool the agent can execute.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON schema of the arguments object.
    fn parameters_schema(&self) -> Value;

    async fn execute(&self, args: Value, workspace: &Path) -> anyhow::Result<String>;
}

/// Name and description, for prompts and listings.
#[derive(Debug, Clone)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
}

/// Registry of available tools, keyed by name.
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    /// Registry with every built-in tool.
    pub fn new(permissions: PermissionManager, todos: TodoManager) -> Self {
        let mut registry = Self::empty();

        registry.register(Arc::new(Bash::new(permissions.clone())));

        registry.register(Arc::new(ReadFile::new(permissions.clone())));
        registry.register(Arc::new(WriteFile::new(permissions.clone())));
        registry.register(Arc::new(EditFile::new(permissions.clone())));
        registry.register(Arc::new(MultiEdit::new(permissions.clone())));
        registry.register(Arc::new(ListDirectory::new(permissions.clone())));

        registry.register(Arc::new(FileSearch::new(permissions.clone())));
        registry.register(Arc::new(GrepSearch::new(permissions.clone())));
        registry.register(Arc::new(CodeAnalysis::new(permissions)));

        registry.register(Arc::new(WebRequest));
        registry.register(Arc::new(FetchUrl));
        registry.register(Arc::new(WebSearch));

        registry.register(Arc::new(TodoWrite::new(todos)));

        registry
    }

    pub fn empty() -> Self {
        Self {
            tools: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn list_tools(&self) -> Vec<ToolInfo> {
        self.tools
            .values()
            .map(|t| ToolInfo {
                name: t.name().to_string(),
                description: t.description().to_string(),
            })
            .collect()
    }

    /// Schemas in the function-calling format sent to the model.
    pub fn get_tool_schemas(&self) -> Vec<ToolSchema> {
        self.tools
            .values()
            .map(|t| ToolSchema::function(t.name(), t.description(), t.parameters_schema()))
            .collect()
    }

    pub async fn execute(&self, name: &str, args: Value, workspace: &Path) -> anyhow::Result<String> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("Unknown tool: {}", name))?;
        tool.execute(args, workspace).await
    }
}

/// Resolve `path` against the workspace; absolute paths are kept. `.` and
/// `..` are collapsed so permission checks see the real target.
pub fn resolve_path(workspace: &Path, path: &str) -> PathBuf {
    let candidate = Path::new(path);
    if candidate.is_absolute() {
        normalize_path(candidate)
    } else {
        normalize_path(&workspace.join(candidate))
    }
}

/// Fetch a required string argument.
pub(crate) fn required_str<'a>(args: &'a Value, key: &str) -> anyhow::Result<&'a str> {
    args[key]
        .as_str()
        .ok_or_else(|| anyhow::anyhow!("Missing '{}' argument", key))
}

/// Truncate to at most `max` bytes on a char boundary, appending a marker.
pub(crate) fn truncate_output(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n... [output truncated]", &s[..end])
}
