//! File tools: read, write, edit and list.

use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{required_str, resolve_path, Tool};
use crate::permissions::{FileOperation, PermissionManager};

/// Read a file, optionally a line range of it.
pub struct ReadFile {
    permissions: PermissionManager,
}

impl ReadFile {
    pub fn new(permissions: PermissionManager) -> Self {
        Self { permissions }
    }
}

#[async_trait]
impl Tool for ReadFile {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read the contents of a file. Use offset and limit to read a range of lines from large files."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path to the file, relative to the workspace"
                },
                "offset": {
                    "type": "integer",
                    "description": "Number of lines to skip (default: 0)"
                },
                "limit": {
                    "type": "integer",
                    "description": "Maximum number of lines to return (default: all)"
                }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, args: Value, workspace: &Path) -> anyhow::Result<String> {
        let path = required_str(&args, "path")?;
        let full_path = resolve_path(workspace, path);
        self.permissions.check_file(&full_path, FileOperation::Read)?;

        let bytes = tokio::fs::read(&full_path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => anyhow::anyhow!("File not found: {}", path),
            _ => anyhow::anyhow!("Error reading file {}: {}", path, e),
        })?;
        let content = String::from_utf8_lossy(&bytes);

        let lines: Vec<&str> = content.split_inclusive('\n').collect();
        let total = lines.len();
        let offset = (args["offset"].as_u64().unwrap_or(0) as usize).min(total);
        let end = match args["limit"].as_u64() {
            Some(limit) if limit > 0 => (offset + limit as usize).min(total),
            _ => total,
        };

        let body: String = lines[offset..end].concat();
        if offset == 0 && end == total {
            Ok(format!("File: {} ({} lines)\n{}", path, total, body))
        } else {
            Ok(format!(
                "File: {} (lines {}-{} of {})\n{}",
                path,
                offset + 1,
                end,
                total,
                body
            ))
        }
    }
}

/// Create or overwrite a file.
pub struct WriteFile {
    permissions: PermissionManager,
}

impl WriteFile {
    pub fn new(permissions: PermissionManager) -> Self {
        Self { permissions }
    }
}

#[async_trait]
impl Tool for WriteFile {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write content to a file, creating it and any missing parent directories. Overwrites existing files."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path to the file, relative to the workspace"
                },
                "content": {
                    "type": "string",
                    "description": "Full file content"
                }
            },
            "required": ["path", "content"]
        })
    }

    async fn execute(&self, args: Value, workspace: &Path) -> anyhow::Result<String> {
        let path = required_str(&args, "path")?;
        let content = required_str(&args, "content")?;
        let full_path = resolve_path(workspace, path);
        self.permissions.check_file(&full_path, FileOperation::Create)?;

        if let Some(parent) = full_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&full_path, content)
            .await
            .map_err(|e| anyhow::anyhow!("Error writing {}: {}", path, e))?;

        Ok(format!(
            "Wrote {} bytes ({} lines) to {}",
            content.len(),
            content.lines().count(),
            path
        ))
    }
}

/// Replace occurrences of `old` in `content`. Returns the new content and
/// the number of replacements, or `None` when `old` is absent.
fn replace_in(content: &str, old: &str, new: &str, replace_all: bool) -> Option<(String, usize)> {
    if old.is_empty() || !content.contains(old) {
        return None;
    }
    if replace_all {
        let count = content.matches(old).count();
        Some((content.replace(old, new), count))
    } else {
        Some((content.replacen(old, new, 1), 1))
    }
}

fn preview(s: &str) -> String {
    let short: String = s.chars().take(50).collect();
    if short.len() < s.len() {
        format!("{}...", short)
    } else {
        short
    }
}

/// Replace a string in a file.
pub struct EditFile {
    permissions: PermissionManager,
}

impl EditFile {
    pub fn new(permissions: PermissionManager) -> Self {
        Self { permissions }
    }
}

#[async_trait]
impl Tool for EditFile {
    fn name(&self) -> &str {
        "edit_file"
    }

    fn description(&self) -> &str {
        "Edit a file by replacing old_string with new_string. Replaces the first occurrence unless replace_all is true. Fails if old_string is not found."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "Path to the file"},
                "old_string": {"type": "string", "description": "Exact text to replace"},
                "new_string": {"type": "string", "description": "Replacement text"},
                "replace_all": {
                    "type": "boolean",
                    "description": "Replace every occurrence (default: false)"
                }
            },
            "required": ["path", "old_string", "new_string"]
        })
    }

    async fn execute(&self, args: Value, workspace: &Path) -> anyhow::Result<String> {
        let path = required_str(&args, "path")?;
        let old = required_str(&args, "old_string")?;
        let new = required_str(&args, "new_string")?;
        let replace_all = args["replace_all"].as_bool().unwrap_or(false);

        let full_path = resolve_path(workspace, path);
        self.permissions.check_file(&full_path, FileOperation::Edit)?;

        let content = tokio::fs::read_to_string(&full_path)
            .await
            .map_err(|e| anyhow::anyhow!("Error reading {}: {}", path, e))?;

        let (updated, replacements) = replace_in(&content, old, new, replace_all)
            .ok_or_else(|| anyhow::anyhow!("String not found in file: {}", preview(old)))?;
        tokio::fs::write(&full_path, &updated).await?;

        Ok(format!(
            "Edited {}: {} replacement(s), {} -> {} bytes",
            path,
            replacements,
            content.len(),
            updated.len()
        ))
    }
}

#[derive(Debug, Deserialize)]
struct EditSpec {
    old_string: String,
    new_string: String,
    #[serde(default)]
    replace_all: bool,
}

/// Apply several edits to one file in order.
pub struct MultiEdit {
    permissions: PermissionManager,
}

impl MultiEdit {
    pub fn new(permissions: PermissionManager) -> Self {
        Self { permissions }
    }
}

#[async_trait]
impl Tool for MultiEdit {
    fn name(&self) -> &str {
        "multi_edit"
    }

    fn description(&self) -> &str {
        "Apply multiple string replacements to a file in sequence. Edits whose old_string is not found are skipped."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "Path to the file"},
                "edits": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "old_string": {"type": "string"},
                            "new_string": {"type": "string"},
                            "replace_all": {"type": "boolean"}
                        },
                        "required": ["old_string", "new_string"]
                    }
                }
            },
            "required": ["path", "edits"]
        })
    }

    async fn execute(&self, args: Value, workspace: &Path) -> anyhow::Result<String> {
        let path = required_str(&args, "path")?;
        let edits: Vec<EditSpec> = serde_json::from_value(args["edits"].clone())
            .map_err(|e| anyhow::anyhow!("Invalid 'edits' argument: {}", e))?;

        let full_path = resolve_path(workspace, path);
        self.permissions.check_file(&full_path, FileOperation::Edit)?;

        let mut content = tokio::fs::read_to_string(&full_path)
            .await
            .map_err(|e| anyhow::anyhow!("Error reading {}: {}", path, e))?;

        let mut applied = 0;
        let mut replacements = 0;
        for edit in &edits {
            match replace_in(&content, &edit.old_string, &edit.new_string, edit.replace_all) {
                Some((updated, count)) => {
                    content = updated;
                    applied += 1;
                    replacements += count;
                }
                None => tracing::debug!("multi_edit: '{}' not found", preview(&edit.old_string)),
            }
        }
        tokio::fs::write(&full_path, &content).await?;

        Ok(format!(
            "Applied {} of {} edits to {} ({} replacement(s))",
            applied,
            edits.len(),
            path,
            replacements
        ))
    }
}

/// List a directory: directories first, then files, each sorted by name.
pub struct ListDirectory {
    permissions: PermissionManager,
}

impl ListDirectory {
    pub fn new(permissions: PermissionManager) -> Self {
        Self { permissions }
    }
}

#[async_trait]
impl Tool for ListDirectory {
    fn name(&self) -> &str {
        "list_directory"
    }

    fn description(&self) -> &str {
        "List the contents of a directory with file sizes. Hidden entries are skipped unless show_hidden is true."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Directory path relative to the workspace (default: '.')"
                },
                "show_hidden": {
                    "type": "boolean",
                    "description": "Include entries starting with '.' (default: false)"
                }
            }
        })
    }

    async fn execute(&self, args: Value, workspace: &Path) -> anyhow::Result<String> {
        let path = args["path"].as_str().unwrap_or(".");
        let show_hidden = args["show_hidden"].as_bool().unwrap_or(false);
        let dir = resolve_path(workspace, path);
        self.permissions.check_file(&dir, FileOperation::Read)?;

        let mut entries = Vec::new();
        let mut read_dir = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| anyhow::anyhow!("Error listing directory {}: {}", path, e))?;
        while let Some(entry) = read_dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if !show_hidden && name.starts_with('.') {
                continue;
            }
            let metadata = entry.metadata().await?;
            let size = if metadata.is_dir() { 0 } else { metadata.len() };
            entries.push((!metadata.is_dir(), name, size));
        }
        entries.sort();

        if entries.is_empty() {
            return Ok(format!("{} is empty", path));
        }
        let mut out = format!("{} ({} items)", path, entries.len());
        for (is_file, name, size) in &entries {
            if *is_file {
                out.push_str(&format!("\n  [file] {} ({} bytes)", name, size));
            } else {
                out.push_str(&format!("\n  [dir]  {}/", name));
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permissions::PermissionLevel;

    fn elevated() -> PermissionManager {
        PermissionManager::new(PermissionLevel::Elevated)
    }

    #[tokio::test]
    async fn write_creates_parents_and_read_ranges() {
        let dir = tempfile::tempdir().unwrap();
        WriteFile::new(elevated())
            .execute(
                json!({"path": "nested/deep/a.txt", "content": "one\ntwo\nthree\n"}),
                dir.path(),
            )
            .await
            .unwrap();

        let read = ReadFile::new(elevated());
        let all = read
            .execute(json!({"path": "nested/deep/a.txt"}), dir.path())
            .await
            .unwrap();
        assert!(all.contains("(3 lines)"));

        let part = read
            .execute(
                json!({"path": "nested/deep/a.txt", "offset": 1, "limit": 1}),
                dir.path(),
            )
            .await
            .unwrap();
        assert!(part.contains("lines 2-2 of 3"));
        assert!(part.ends_with("two\n"));
    }

    #[tokio::test]
    async fn read_missing_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let err = ReadFile::new(elevated())
            .execute(json!({"path": "nope.txt"}), dir.path())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "File not found: nope.txt");
    }

    #[tokio::test]
    async fn safe_level_cannot_write() {
        let dir = tempfile::tempdir().unwrap();
        let err = WriteFile::new(PermissionManager::new(PermissionLevel::Safe))
            .execute(json!({"path": "a.txt", "content": "x"}), dir.path())
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("Permission denied"));
        assert!(!dir.path().join("a.txt").exists());
    }

    #[tokio::test]
    async fn edit_replaces_first_or_all() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f.txt");
        std::fs::write(&file, "a a a").unwrap();
        let edit = EditFile::new(elevated());

        edit.execute(
            json!({"path": "f.txt", "old_string": "a", "new_string": "b"}),
            dir.path(),
        )
        .await
        .unwrap();
        assert_eq!(std::fs::read_to_string(&file).unwrap(), "b a a");

        let out = edit
            .execute(
                json!({"path": "f.txt", "old_string": "a", "new_string": "c", "replace_all": true}),
                dir.path(),
            )
            .await
            .unwrap();
        assert!(out.contains("2 replacement(s)"));
        assert_eq!(std::fs::read_to_string(&file).unwrap(), "b c c");

        let err = edit
            .execute(
                json!({"path": "f.txt", "old_string": "zzz", "new_string": "y"}),
                dir.path(),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("String not found in file"));
    }

    #[tokio::test]
    async fn multi_edit_applies_in_sequence_and_skips_missing() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("m.txt");
        std::fs::write(&file, "foo bar foo").unwrap();

        let out = MultiEdit::new(elevated())
            .execute(
                json!({
                    "path": "m.txt",
                    "edits": [
                        {"old_string": "foo", "new_string": "baz", "replace_all": true},
                        {"old_string": "missing", "new_string": "x"},
                        {"old_string": "baz bar", "new_string": "done"}
                    ]
                }),
                dir.path(),
            )
            .await
            .unwrap();

        assert_eq!(std::fs::read_to_string(&file).unwrap(), "done baz");
        assert!(out.contains("Applied 2 of 3 edits"));
        assert!(out.contains("3 replacement(s)"));
    }

    #[tokio::test]
    async fn list_puts_directories_first_and_hides_dotfiles() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.txt"), "12345").unwrap();
        std::fs::write(dir.path().join(".hidden"), "").unwrap();
        std::fs::create_dir(dir.path().join("zdir")).unwrap();

        let out = ListDirectory::new(elevated())
            .execute(json!({}), dir.path())
            .await
            .unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[0], ". (2 items)");
        assert!(lines[1].contains("[dir]  zdir/"));
        assert!(lines[2].contains("[file] b.txt (5 bytes)"));
        assert!(!out.contains(".hidden"));

        let with_hidden = ListDirectory::new(elevated())
            .execute(json!({"show_hidden": true}), dir.path())
            .await
            .unwrap();
        assert!(with_hidden.contains(".hidden"));
    }

    #[tokio::test]
    async fn relative_escapes_into_system_paths_are_denied() {
        let dir = tempfile::tempdir().unwrap();
        let escape = "../".repeat(dir.path().components().count());

        let err = ReadFile::new(elevated())
            .execute(json!({"path": format!("{}etc/hostname", escape)}), dir.path())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("requires admin permissions"));

        let err = ListDirectory::new(elevated())
            .execute(json!({"path": format!("{}etc", escape)}), dir.path())
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("Permission denied"));
    }
}
