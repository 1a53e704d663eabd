//! Permission checks for shell commands and file operations.
//!
//! Three trust tiers. A command is split at shell control operators and
//! every segment is matched by prefix against fixed lists; the command needs
//! the highest tier any segment needs. File operations are gated by
//! operation kind and by a small set of system directories that only `admin`
//! may touch.

use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

const SAFE_COMMANDS: &[&str] = &[
    "ls",
    "dir",
    "pwd",
    "whoami",
    "date",
    "git status",
    "git log",
    "npm list",
    "pip list",
    "python --version",
    "node --version",
];

const ELEVATED_COMMANDS: &[&str] = &[
    "mkdir",
    "touch",
    "cp",
    "mv",
    "chmod",
    "python",
    "node",
    "npm install",
    "pip install",
    "pytest",
    "flake8",
    "black",
];

const ADMIN_COMMANDS: &[&str] = &["rm", "rmdir", "sudo", "su", "chown", "systemctl", "service"];

const SYSTEM_PATHS: &[&str] = &["/etc", "/usr", "/bin", "/sbin", "/var/log"];

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum PermissionLevel {
    Safe,
    #[default]
    Elevated,
    Admin,
}

impl FromStr for PermissionLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "safe" => Ok(PermissionLevel::Safe),
            "elevated" => Ok(PermissionLevel::Elevated),
            "admin" => Ok(PermissionLevel::Admin),
            other => Err(format!("unknown permission level: {}", other)),
        }
    }
}

impl std::fmt::Display for PermissionLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PermissionLevel::Safe => write!(f, "safe"),
            PermissionLevel::Elevated => write!(f, "elevated"),
            PermissionLevel::Admin => write!(f, "admin"),
        }
    }
}

/// Kind of file access being requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOperation {
    Read,
    Write,
    Edit,
    Create,
    Delete,
}

impl std::fmt::Display for FileOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FileOperation::Read => "read",
            FileOperation::Write => "write",
            FileOperation::Edit => "edit",
            FileOperation::Create => "create",
            FileOperation::Delete => "delete",
        };
        write!(f, "{}", s)
    }
}

/// Collapse `.` and `..` components without touching the filesystem.
/// `..` at the root stays at the root.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => out.push(".."),
            },
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Split a shell command at `;`, `&&`, `||`, `|`, `&`, newlines, `$(`,
/// backticks and parentheses. Redirections such as `2>&1` and `&>` are not
/// split.
fn command_segments(command: &str) -> Vec<&str> {
    let bytes = command.as_bytes();
    let mut segments = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i < bytes.len() {
        let separator = match bytes[i] {
            b';' | b'\n' | b'`' | b'|' | b'(' | b')' => 1,
            b'$' if bytes.get(i + 1) == Some(&b'(') => 2,
            b'&' => {
                let redirect = (i > 0 && matches!(bytes[i - 1], b'>' | b'<'))
                    || bytes.get(i + 1) == Some(&b'>');
                usize::from(!redirect)
            }
            _ => 0,
        };
        if separator > 0 {
            segments.push(&command[start..i]);
            i += separator;
            start = i;
        } else {
            i += 1;
        }
    }
    segments.push(&command[start..]);
    segments
        .into_iter()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

/// `segment` is `prefix` or starts with `prefix` followed by whitespace.
fn starts_with_word(segment: &str, prefix: &str) -> bool {
    segment
        .strip_prefix(prefix)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with(char::is_whitespace))
}

/// Tier a single command segment needs, `None` when it is on no list.
fn segment_tier(segment: &str) -> Option<PermissionLevel> {
    let lower = segment.to_lowercase();
    let matches = |list: &[&str]| list.iter().any(|prefix| starts_with_word(&lower, prefix));
    if matches(SAFE_COMMANDS) {
        Some(PermissionLevel::Safe)
    } else if matches(ELEVATED_COMMANDS) {
        Some(PermissionLevel::Elevated)
    } else if matches(ADMIN_COMMANDS) {
        Some(PermissionLevel::Admin)
    } else {
        None
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Permission denied: {0}")]
pub struct PermissionDenied(pub String);

/// Checks commands and file operations against a permission level.
#[derive(Debug, Clone)]
pub struct PermissionManager {
    level: PermissionLevel,
    allowed_file_patterns: Vec<glob::Pattern>,
}

impl PermissionManager {
    pub fn new(level: PermissionLevel) -> Self {
        Self {
            level,
            allowed_file_patterns: Vec::new(),
        }
    }

    /// Restrict writes to files whose name matches one of `patterns`.
    /// Invalid patterns are skipped with a warning.
    pub fn with_allowed_file_patterns(mut self, patterns: &[String]) -> Self {
        self.allowed_file_patterns = patterns
            .iter()
            .filter_map(|p| match glob::Pattern::new(p) {
                Ok(pattern) => Some(pattern),
                Err(e) => {
                    tracing::warn!("Ignoring invalid file pattern '{}': {}", p, e);
                    None
                }
            })
            .collect();
        self
    }

    pub fn level(&self) -> PermissionLevel {
        self.level
    }

    /// Check whether `command` may run. Returns the tier that granted it,
    /// the highest tier any of its segments needs.
    pub fn check_command(&self, command: &str) -> Result<PermissionLevel, PermissionDenied> {
        let mut required = PermissionLevel::Safe;
        let mut unknown = false;
        for segment in command_segments(command) {
            match segment_tier(segment) {
                Some(tier) => required = required.max(tier),
                None => unknown = true,
            }
        }

        if self.level == PermissionLevel::Admin {
            // Admin runs anything.
            return Ok(if unknown { PermissionLevel::Admin } else { required });
        }
        if !unknown && required <= self.level {
            return Ok(required);
        }
        if !unknown && required == PermissionLevel::Admin {
            return Err(PermissionDenied(format!(
                "Command '{}' requires admin permissions",
                command.trim()
            )));
        }

        Err(PermissionDenied(format!(
            "Command '{}' requires higher permissions",
            command.trim()
        )))
    }

    /// Check whether `operation` on `path` is allowed.
    pub fn check_file(&self, path: &Path, operation: FileOperation) -> Result<(), PermissionDenied> {
        let path = normalize_path(path);
        let path = path.as_path();
        if self.level != PermissionLevel::Admin
            && SYSTEM_PATHS.iter().any(|sys| path.starts_with(sys))
        {
            return Err(PermissionDenied(format!(
                "Access to system path '{}' requires admin permissions",
                path.display()
            )));
        }

        match operation {
            FileOperation::Read => Ok(()),
            FileOperation::Write | FileOperation::Edit | FileOperation::Create => {
                if self.level < PermissionLevel::Elevated {
                    return Err(PermissionDenied(format!(
                        "{} operation requires elevated permissions",
                        operation
                    )));
                }
                self.check_allowed_pattern(path)
            }
            FileOperation::Delete => {
                if self.level == PermissionLevel::Admin {
                    Ok(())
                } else {
                    Err(PermissionDenied(
                        "Delete operation requires admin permissions".to_string(),
                    ))
                }
            }
        }
    }

    fn check_allowed_pattern(&self, path: &Path) -> Result<(), PermissionDenied> {
        if self.allowed_file_patterns.is_empty() || self.level == PermissionLevel::Admin {
            return Ok(());
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        if self.allowed_file_patterns.iter().any(|p| p.matches(&name)) {
            Ok(())
        } else {
            Err(PermissionDenied(format!(
                "File '{}' does not match the allowed file patterns",
                path.display()
            )))
        }
    }
}
