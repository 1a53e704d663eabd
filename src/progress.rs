//! Human-readable `progress.md` report.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::state::PersistentState;

/// Writes the progress report for a workspace.
#[derive(Debug, Clone)]
pub struct ProgressReport {
    path: PathBuf,
    enabled: bool,
}

fn stamp(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn shorten(s: &str, max: usize) -> String {
    let short: String = s.chars().take(max).collect();
    if short.len() < s.len() {
        format!("{}...", short)
    } else {
        short
    }
}

impl ProgressReport {
    pub fn new(path: impl Into<PathBuf>, enabled: bool) -> Self {
        Self {
            path: path.into(),
            enabled,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rewrite the report from `state`.
    pub async fn update(&self, state: &PersistentState) -> std::io::Result<()> {
        if !self.enabled {
            return Ok(());
        }
        tokio::fs::write(&self.path, render(state, false)).await
    }

    /// Rewrite the report marked completed, with totals.
    pub async fn finalize(&self, state: &PersistentState) -> std::io::Result<()> {
        if !self.enabled {
            return Ok(());
        }
        tokio::fs::write(&self.path, render(state, true)).await
    }
}

pub fn render(state: &PersistentState, completed: bool) -> String {
    let now = Utc::now();
    let status = if completed {
        "Completed ✅"
    } else {
        "In Progress"
    };

    let mut out = String::new();
    let _ = writeln!(out, "# Progress Report - {}\n", shorten(&state.original_task, 80));
    let _ = writeln!(out, "**Task ID:** `{}`  ", state.task_id);
    let _ = writeln!(out, "**Started:** {}  ", stamp(&state.created_at));
    let _ = writeln!(out, "**Last Updated:** {}  ", stamp(&now));
    let _ = writeln!(out, "**Status:** {}  ", status);
    let _ = writeln!(out, "**Iterations:** {}\n", state.iteration_count);

    let _ = writeln!(out, "## Task Description\n{}\n", state.original_task);

    out.push_str("## Key Accomplishments\n");
    if state.summaries.is_empty() && state.completed_steps.is_empty() {
        out.push_str("\n_None yet._\n");
    }
    for summary in &state.summaries {
        let _ = writeln!(out, "\n### {} ({})", summary.summary_id, stamp(&summary.timestamp));
        for item in &summary.key_accomplishments {
            let _ = writeln!(out, "- {}", item);
        }
        let _ = writeln!(out, "\n**Current Focus:** {}", summary.current_focus);
    }
    if state.summaries.is_empty() {
        for step in &state.completed_steps {
            let _ = writeln!(out, "- {}", step);
        }
    }

    out.push_str("\n## Files Created/Modified\n\n");
    for (path, record) in &state.files_tracking {
        let _ = writeln!(
            out,
            "- **{}** - {} ({}, {} bytes)",
            path,
            record.action,
            stamp(&record.last_modified),
            record.size
        );
    }

    out.push_str("\n## Detailed Timeline\n\n");
    for entry in &state.progress_entries {
        let _ = writeln!(out, "### {} {}", stamp(&entry.timestamp), entry.status.icon());
        let _ = writeln!(out, "**Action:** {}", entry.action);
        let _ = writeln!(out, "**Details:** {}", entry.details);
        if !entry.files_affected.is_empty() {
            let _ = writeln!(out, "**Files:** {}", entry.files_affected.join(", "));
        }
        out.push('\n');
    }

    if !state.error_history.is_empty() {
        out.push_str("## Error History\n\n");
        for error in &state.error_history {
            let _ = writeln!(
                out,
                "- **{}** - {} [{}]: {}",
                stamp(&error.timestamp),
                error.step,
                error.category,
                shorten(&error.error, 100)
            );
        }
    }

    if completed {
        out.push_str("\n## Task Completed\n");
        let _ = writeln!(out, "**Completion Time:** {}  ", stamp(&now));
        let _ = writeln!(
            out,
            "**Total Files Created/Modified:** {}  ",
            state.files_tracking.len()
        );
        let _ = writeln!(out, "**Total Steps:** {}", state.completed_steps.len());
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;
    use crate::state::EntryStatus;

    fn sample_state() -> PersistentState {
        let mut state = PersistentState::new("Build a CLI");
        state.iteration_count = 7;
        state.record_step("Executed: cargo init");
        state.record_file("src/main.rs", "created", 120);
        state.add_progress(
            "write_file",
            "Wrote src/main.rs",
            vec!["src/main.rs".into()],
            EntryStatus::Completed,
        );
        state.record_error("Iteration 3", "connection reset", ErrorCategory::Network);
        state
    }

    #[test]
    fn in_progress_report_lists_everything() {
        let report = render(&sample_state(), false);
        assert!(report.starts_with("# Progress Report - Build a CLI"));
        assert!(report.contains("**Status:** In Progress"));
        assert!(report.contains("**Iterations:** 7"));
        assert!(report.contains("- Executed: cargo init"));
        assert!(report.contains("- **src/main.rs** - created ("));
        assert!(report.contains("**Action:** write_file"));
        assert!(report.contains("**Files:** src/main.rs"));
        assert!(report.contains("Iteration 3 [network]: connection reset"));
        assert!(!report.contains("## Task Completed"));
    }

    #[test]
    fn final_report_has_totals() {
        let report = render(&sample_state(), true);
        assert!(report.contains("**Status:** Completed ✅"));
        assert!(report.contains("**Total Files Created/Modified:** 1"));
        assert!(report.contains("**Total Steps:** 1"));
    }

    #[tokio::test]
    async fn disabled_report_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("progress.md");
        ProgressReport::new(&path, false)
            .update(&sample_state())
            .await
            .unwrap();
        assert!(!path.exists());

        ProgressReport::new(&path, true)
            .finalize(&sample_state())
            .await
            .unwrap();
        assert!(std::fs::read_to_string(&path).unwrap().contains("Task Completed"));
    }
}
