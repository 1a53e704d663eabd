//! Shell command execution with permission checks.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::process::Command;

use super::{required_str, truncate_output, Tool};
use crate::permissions::PermissionManager;

const DEFAULT_TIMEOUT_SECS: u64 = 60;
const MAX_OUTPUT: usize = 10_000;

const INSTALL_MARKERS: &[&str] = &["install", "pip", "npm", "apt", "yum"];
const DOWNLOAD_MARKERS: &[&str] = &["git clone", "wget", "curl"];

/// Timeout for `command`: installs get up to 180 s, downloads up to 120 s.
pub fn effective_timeout(command: &str, requested_secs: u64) -> u64 {
    let lower = command.to_lowercase();
    if INSTALL_MARKERS.iter().any(|m| lower.contains(m)) {
        (requested_secs * 6).min(180).max(requested_secs)
    } else if DOWNLOAD_MARKERS.iter().any(|m| lower.contains(m)) {
        (requested_secs * 4).min(120).max(requested_secs)
    } else {
        requested_secs
    }
}

/// Run a shell command in the workspace.
pub struct Bash {
    permissions: PermissionManager,
}

impl Bash {
    pub fn new(permissions: PermissionManager) -> Self {
        Self { permissions }
    }
}

#[async_trait]
impl Tool for Bash {
    fn name(&self) -> &str {
        "bash"
    }

    fn description(&self) -> &str {
        "Execute a shell command in the workspace directory. Returns exit code, stdout and stderr. Install and download commands get extended timeouts."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute"
                },
                "timeout": {
                    "type": "integer",
                    "description": "Timeout in seconds (default: 60)"
                }
            },
            "required": ["command"]
        })
    }

    async fn execute(&self, args: Value, workspace: &Path) -> anyhow::Result<String> {
        let command = required_str(&args, "command")?;
        let granted = self.permissions.check_command(command)?;
        let requested = args["timeout"].as_u64().unwrap_or(DEFAULT_TIMEOUT_SECS);
        let timeout_secs = effective_timeout(command, requested);

        tracing::info!(permission = %granted, timeout_secs, "Executing command: {}", command);

        let (shell, shell_arg) = if cfg!(target_os = "windows") {
            ("cmd", "/C")
        } else {
            ("sh", "-c")
        };

        let output = tokio::time::timeout(
            Duration::from_secs(timeout_secs),
            Command::new(shell)
                .arg(shell_arg)
                .arg(command)
                .current_dir(workspace)
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| anyhow::anyhow!("Command timed out after {}s", timeout_secs))?
        .map_err(|e| anyhow::anyhow!("Failed to execute command: {}", e))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let exit_code = output.status.code().unwrap_or(-1);

        let mut result = format!("Exit code: {}\n", exit_code);
        if !stdout.is_empty() {
            result.push_str("\n--- stdout ---\n");
            result.push_str(&stdout);
        }
        if !stderr.is_empty() {
            result.push_str("\n--- stderr ---\n");
            result.push_str(&stderr);
        }
        if stdout.is_empty() && stderr.is_empty() {
            result.push_str("(No output)");
        }
        let result = truncate_output(&result, MAX_OUTPUT);

        if output.status.success() {
            Ok(result)
        } else {
            Err(anyhow::anyhow!("Command failed\n{}", result))
        }
    }
}
