//! Completion heuristics.
//!
//! The model's final text is matched against fixed phrase lists. Nothing here
//! understands language; the lists are tuned for the way models report their
//! own results.

/// Phrases that report concrete, finished work.
pub const SUCCESS_INDICATORS: &[&str] = &[
    "file created",
    "successfully created",
    "successfully written",
    "installed successfully",
    "server started",
    "directory created",
    "successfully executed",
    "file written",
    "command completed",
    "found",
    "located",
    "search completed",
    "files found",
    "results returned",
    "listed",
    "displayed",
    "retrieved",
    "analyzed",
    "completed successfully",
    "operation successful",
    "task completed",
    "task is complete",
    "finished",
];

pub const ERROR_INDICATORS: &[&str] = &[
    "error",
    "failed",
    "exception",
    "traceback",
    "not found",
    "permission denied",
];

/// Markers of a successful tool result.
pub const TOOL_SUCCESS_PATTERNS: &[&str] = &[
    "success",
    "created",
    "written",
    "wrote",
    "installed",
    "found",
    "located",
    "listed",
    "total_items",
    "exit code: 0",
];

/// Outcome read from a final answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Complete,
    Failed,
    Undetermined,
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

/// Judge a final answer: success phrases without error phrases complete the
/// task, error phrases without success phrases fail it.
pub fn judge_final_answer(text: &str) -> Verdict {
    let lower = text.to_lowercase();
    match (
        contains_any(&lower, SUCCESS_INDICATORS),
        contains_any(&lower, ERROR_INDICATORS),
    ) {
        (true, false) => Verdict::Complete,
        (false, true) => Verdict::Failed,
        _ => Verdict::Undetermined,
    }
}

/// Whether any of the recent tool results looks like a success.
pub fn tool_results_succeeded<S: AsRef<str>>(results: &[S]) -> bool {
    results.iter().any(|r| {
        let lower = r.as_ref().to_lowercase();
        contains_any(&lower, TOOL_SUCCESS_PATTERNS)
            && !lower.contains("error")
            && !lower.contains("failed")
    })
}

/// Subtask success in the plan workflow: a concrete success phrase or a
/// successful tool result, and no error phrase in the final text.
pub fn subtask_succeeded<S: AsRef<str>>(final_text: &str, tool_results: &[S]) -> bool {
    let lower = final_text.to_lowercase();
    let claimed = contains_any(&lower, SUCCESS_INDICATORS);
    let tools_ok = tool_results_succeeded(tool_results);
    (claimed || tools_ok) && !contains_any(&lower, ERROR_INDICATORS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verdicts() {
        assert_eq!(
            judge_final_answer("Task completed. The file was written to out.txt"),
            Verdict::Complete
        );
        assert_eq!(
            judge_final_answer("The build failed with a linker error."),
            Verdict::Failed
        );
        assert_eq!(
            judge_final_answer("Fixed the error and finished the refactor."),
            Verdict::Undetermined
        );
        assert_eq!(judge_final_answer("Let me think."), Verdict::Undetermined);
    }

    #[test]
    fn not_found_is_never_a_clean_success() {
        assert_eq!(
            judge_final_answer("config.toml not found"),
            Verdict::Undetermined
        );
    }

    #[test]
    fn subtask_success_uses_tool_results() {
        let results = ["Wrote 12 bytes (1 lines) to a.txt"];
        assert!(subtask_succeeded("Done.", &results));
        assert!(!subtask_succeeded("Done, but an error remains.", &results));
        assert!(!subtask_succeeded("Done.", &["Error: Command failed"]));
        assert!(subtask_succeeded("Search completed", &[] as &[&str]));
    }
}
