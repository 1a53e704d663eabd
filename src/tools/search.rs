//! Code search tools: file globbing, regex search and simple metrics.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use regex::RegexBuilder;
use serde_json::{json, Value};
use walkdir::WalkDir;

use super::{required_str, resolve_path, Tool};
use crate::permissions::{FileOperation, PermissionManager};

const MAX_MATCHES: usize = 100;
const MAX_FILES: usize = 200;

/// Directories never worth searching.
const SKIP_DIRS: &[&str] = &[".git", "target", "node_modules", "__pycache__", ".venv"];

fn relative(path: &Path, workspace: &Path) -> String {
    path.strip_prefix(workspace)
        .unwrap_or(path)
        .to_string_lossy()
        .to_string()
}

/// Find files by name pattern anywhere below a directory.
pub struct FileSearch {
    permissions: PermissionManager,
}

impl FileSearch {
    pub fn new(permissions: PermissionManager) -> Self {
        Self { permissions }
    }
}

#[async_trait]
impl Tool for FileSearch {
    fn name(&self) -> &str {
        "file_search"
    }

    fn description(&self) -> &str {
        "Find files whose name matches a glob pattern (e.g. '*.py', 'Cargo.toml') anywhere below a directory."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": {
                    "type": "string",
                    "description": "Glob pattern for file names"
                },
                "directory": {
                    "type": "string",
                    "description": "Directory to search, relative to workspace (default: '.')"
                }
            },
            "required": ["pattern"]
        })
    }

    async fn execute(&self, args: Value, workspace: &Path) -> anyhow::Result<String> {
        let pattern = required_str(&args, "pattern")?.to_string();
        let directory = resolve_path(workspace, args["directory"].as_str().unwrap_or("."));
        self.permissions.check_file(&directory, FileOperation::Read)?;
        let full_pattern = directory.join("**").join(&pattern);
        let full_pattern = full_pattern.to_string_lossy().to_string();
        let workspace = workspace.to_path_buf();

        let files = tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<String>> {
            let mut files = Vec::new();
            for entry in glob::glob(&full_pattern)
                .map_err(|e| anyhow::anyhow!("Invalid pattern '{}': {}", pattern, e))?
                .flatten()
            {
                files.push(relative(&entry, &workspace));
                if files.len() >= MAX_FILES {
                    break;
                }
            }
            Ok(files)
        })
        .await??;

        if files.is_empty() {
            return Ok(format!(
                "No files found matching: {}",
                args["pattern"].as_str().unwrap_or_default()
            ));
        }
        let mut out = format!("Found {} file(s):\n{}", files.len(), files.join("\n"));
        if files.len() >= MAX_FILES {
            out.push_str(&format!("\n\n... (showing first {} files)", MAX_FILES));
        }
        Ok(out)
    }
}

/// Search file contents with a regex.
pub struct GrepSearch {
    permissions: PermissionManager,
}

impl GrepSearch {
    pub fn new(permissions: PermissionManager) -> Self {
        Self { permissions }
    }
}

#[async_trait]
impl Tool for GrepSearch {
    fn name(&self) -> &str {
        "grep_search"
    }

    fn description(&self) -> &str {
        "Search for a regex pattern in a file or directory. Returns matching lines with file paths and line numbers. Case-insensitive by default."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": {
                    "type": "string",
                    "description": "Regex pattern to search for"
                },
                "path": {
                    "type": "string",
                    "description": "File or directory to search, relative to workspace. Defaults to workspace root."
                },
                "file_pattern": {
                    "type": "string",
                    "description": "Optional: only search files matching this glob (e.g., '*.rs', '*.py')"
                },
                "case_sensitive": {
                    "type": "boolean",
                    "description": "Whether search is case-sensitive (default: false)"
                }
            },
            "required": ["pattern"]
        })
    }

    async fn execute(&self, args: Value, workspace: &Path) -> anyhow::Result<String> {
        let pattern = required_str(&args, "pattern")?;
        let case_sensitive = args["case_sensitive"].as_bool().unwrap_or(false);
        let regex = RegexBuilder::new(pattern)
            .case_insensitive(!case_sensitive)
            .build()
            .map_err(|e| anyhow::anyhow!("Invalid regex: {}", e))?;
        let file_glob = match args["file_pattern"].as_str() {
            Some(fp) => Some(
                glob::Pattern::new(fp)
                    .map_err(|e| anyhow::anyhow!("Invalid file pattern '{}': {}", fp, e))?,
            ),
            None => None,
        };
        let root = resolve_path(workspace, args["path"].as_str().unwrap_or("."));
        self.permissions.check_file(&root, FileOperation::Read)?;
        let workspace = workspace.to_path_buf();

        let matches = tokio::task::spawn_blocking(move || {
            let mut matches = Vec::new();
            for file in candidate_files(&root, file_glob.as_ref()) {
                let Ok(content) = std::fs::read_to_string(&file) else {
                    continue;
                };
                for (idx, line) in content.lines().enumerate() {
                    if regex.is_match(line) {
                        matches.push(format!(
                            "{}:{}: {}",
                            relative(&file, &workspace),
                            idx + 1,
                            line.trim()
                        ));
                        if matches.len() >= MAX_MATCHES {
                            return matches;
                        }
                    }
                }
            }
            matches
        })
        .await?;

        if matches.is_empty() {
            return Ok(format!("No matches found for pattern: {}", pattern));
        }
        let mut out = matches.join("\n");
        if matches.len() >= MAX_MATCHES {
            out.push_str(&format!("\n\n... (showing first {} matches)", MAX_MATCHES));
        }
        Ok(out)
    }
}

fn candidate_files(root: &Path, file_glob: Option<&glob::Pattern>) -> Vec<PathBuf> {
    if root.is_file() {
        return vec![root.to_path_buf()];
    }
    WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            !(e.file_type().is_dir()
                && e.depth() > 0
                && SKIP_DIRS.iter().any(|d| e.file_name() == *d))
        })
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            file_glob.map_or(true, |g| g.matches(&e.file_name().to_string_lossy()))
        })
        .map(|e| e.into_path())
        .collect()
}

/// Line counts and a rough complexity score for a source file.
pub struct CodeAnalysis {
    permissions: PermissionManager,
}

impl CodeAnalysis {
    pub fn new(permissions: PermissionManager) -> Self {
        Self { permissions }
    }
}

#[derive(Debug, PartialEq)]
struct CodeMetrics {
    total_lines: usize,
    code_lines: usize,
    comment_lines: usize,
    blank_lines: usize,
    functions: usize,
}

impl CodeMetrics {
    fn of(content: &str) -> Result<Self, regex::Error> {
        let lines: Vec<&str> = content.split('\n').collect();
        let blank_lines = lines.iter().filter(|l| l.trim().is_empty()).count();
        let comment_lines = lines
            .iter()
            .filter(|l| {
                let t = l.trim_start();
                t.starts_with('#') || t.starts_with("//") || t.starts_with("/*") || t.starts_with('*')
            })
            .count();
        let function_re = RegexBuilder::new(r"\b(def|function|class|fn)\s+\w+")
            .case_insensitive(true)
            .build()?;
        Ok(Self {
            total_lines: lines.len(),
            code_lines: lines.len() - blank_lines - comment_lines,
            comment_lines,
            blank_lines,
            functions: function_re.find_iter(content).count(),
        })
    }

    fn complexity(&self) -> f64 {
        self.code_lines as f64 / self.functions.max(1) as f64
    }
}

#[async_trait]
impl Tool for CodeAnalysis {
    fn name(&self) -> &str {
        "code_analysis"
    }

    fn description(&self) -> &str {
        "Analyze a source file: total, code, comment and blank line counts, number of functions/classes, and lines per function."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "Path to the source file"}
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, args: Value, workspace: &Path) -> anyhow::Result<String> {
        let path = required_str(&args, "path")?;
        let full_path = resolve_path(workspace, path);
        self.permissions.check_file(&full_path, FileOperation::Read)?;
        let bytes = tokio::fs::read(&full_path)
            .await
            .map_err(|e| anyhow::anyhow!("Error reading {}: {}", path, e))?;
        let metrics = CodeMetrics::of(&String::from_utf8_lossy(&bytes))?;

        let report = json!({
            "file": path,
            "total_lines": metrics.total_lines,
            "code_lines": metrics.code_lines,
            "comment_lines": metrics.comment_lines,
            "blank_lines": metrics.blank_lines,
            "functions": metrics.functions,
            "complexity_score": (metrics.complexity() * 100.0).round() / 100.0,
        });
        Ok(serde_json::to_string_pretty(&report)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permissions::PermissionLevel;

    fn elevated() -> PermissionManager {
        PermissionManager::new(PermissionLevel::Elevated)
    }

    fn workspace() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src/inner")).unwrap();
        std::fs::create_dir_all(dir.path().join("target")).unwrap();
        std::fs::write(dir.path().join("src/main.py"), "def Main():\n    return 1\n").unwrap();
        std::fs::write(dir.path().join("src/inner/util.py"), "# helper\nVALUE = 2\n").unwrap();
        std::fs::write(dir.path().join("src/notes.txt"), "main idea\n").unwrap();
        std::fs::write(dir.path().join("target/gen.py"), "def main(): pass\n").unwrap();
        dir
    }

    #[tokio::test]
    async fn file_search_is_recursive() {
        let dir = workspace();
        let out = FileSearch::new(elevated())
            .execute(json!({"pattern": "*.py", "directory": "src"}), dir.path())
            .await
            .unwrap();
        assert!(out.starts_with("Found 2 file(s)"));
        assert!(out.contains("src/main.py"));
        assert!(out.contains("src/inner/util.py"));

        let none = FileSearch::new(elevated())
            .execute(json!({"pattern": "*.go"}), dir.path())
            .await
            .unwrap();
        assert_eq!(none, "No files found matching: *.go");
    }

    #[tokio::test]
    async fn grep_is_case_insensitive_and_skips_build_dirs() {
        let dir = workspace();
        let out = GrepSearch::new(elevated())
            .execute(json!({"pattern": "main"}), dir.path())
            .await
            .unwrap();
        assert!(out.contains("src/main.py:1: def Main():"));
        assert!(out.contains("src/notes.txt:1: main idea"));
        assert!(!out.contains("target/"));

        let filtered = GrepSearch::new(elevated())
            .execute(
                json!({"pattern": "main", "file_pattern": "*.txt", "case_sensitive": true}),
                dir.path(),
            )
            .await
            .unwrap();
        assert_eq!(filtered, "src/notes.txt:1: main idea");
    }

    #[tokio::test]
    async fn grep_searches_a_single_file() {
        let dir = workspace();
        let out = GrepSearch::new(elevated())
            .execute(json!({"pattern": "value", "path": "src/inner/util.py"}), dir.path())
            .await
            .unwrap();
        assert_eq!(out, "src/inner/util.py:2: VALUE = 2");
    }

    #[tokio::test]
    async fn grep_rejects_bad_regex() {
        let dir = workspace();
        assert!(GrepSearch::new(elevated())
            .execute(json!({"pattern": "("}), dir.path())
            .await
            .is_err());
    }

    #[test]
    fn metrics_count_lines_and_functions() {
        let metrics = CodeMetrics::of("# c\ndef a():\n    pass\n\nclass B:\n    pass").unwrap();
        assert_eq!(
            metrics,
            CodeMetrics {
                total_lines: 6,
                code_lines: 4,
                comment_lines: 1,
                blank_lines: 1,
                functions: 2,
            }
        );
        assert_eq!(metrics.complexity(), 2.0);
    }

    #[tokio::test]
    async fn search_tools_refuse_system_paths() {
        let dir = workspace();
        let escape = format!("{}/etc", "../".repeat(dir.path().components().count()));

        let err = GrepSearch::new(elevated())
            .execute(json!({"pattern": "root", "path": escape}), dir.path())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("requires admin permissions"));

        let err = FileSearch::new(elevated())
            .execute(json!({"pattern": "passwd", "directory": "/etc"}), dir.path())
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("Permission denied"));

        let err = CodeAnalysis::new(elevated())
            .execute(json!({"path": "/etc/hostname"}), dir.path())
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("Permission denied"));
    }
}
