//! Prompt templates for the agent.

use std::fmt::Write as _;

use crate::state::{ConversationSummary, PersistentState};
use crate::tools::ToolInfo;

use super::planner::Subtask;

/// Asked of the model every `summarization_threshold` iterations.
pub const SUMMARY_PROMPT: &str = "Analyze the recent conversation and create a concise summary focusing on:
1. Key accomplishments and completed steps
2. Current focus and what is being worked on
3. Files created or modified
4. Errors resolved
5. Next logical steps

Be concise but capture essential progress context.";

/// Sent after a final answer when the task is not finished yet.
pub const CONTINUE_NUDGE: &str = "Please continue working on the task.";

/// Sent on resume, after the restored conversation.
pub const RESUME_NOTE: &str =
    "Resuming task after an interruption. Continue from where we left off without repeating completed work.";

fn tool_list(tools: &[ToolInfo]) -> String {
    tools
        .iter()
        .map(|t| format!("- **{}**: {}", t.name, t.description))
        .collect::<Vec<_>>()
        .join("\n")
}

/// System prompt for the persistent loop, including any saved progress.
pub fn build_system_prompt(
    workspace_path: &str,
    tools: &[ToolInfo],
    state: &PersistentState,
) -> String {
    let mut prompt = format!(
        r#"You are an autonomous software engineering agent. You operate in the workspace directory: {workspace_path}

## Your Capabilities

You have access to the following tools:
{tool_descriptions}

## Rules and Guidelines

1. **Always use tools** - Don't guess. Read files, run commands and verify your work.

2. **Read before edit** - Read a file's contents before modifying it, unless you're creating it.

3. **Track your work** - Keep the todo list current with `todo_write`. Use `update_progress_md` after meaningful milestones and `save_progress` before long or risky steps.

4. **Recover from errors** - When a step fails, analyze the output and try another approach. Use `ask_user_step` when you need guidance.

5. **Delegate focused work** - Use `delegate_task` for self-contained subtasks that need their own context.

6. **Stay focused** - Only make changes related to the task.

## Response Format

When the task is finished, reply without tool calls and state clearly that the task is completed, with:
- What you did
- Files created or modified
- How to use or test the changes

If you cannot finish, say what failed and why."#,
        workspace_path = workspace_path,
        tool_descriptions = tool_list(tools)
    );

    if !state.completed_steps.is_empty() || !state.last_successful_operation.is_empty() {
        prompt.push_str("\n\n## PREVIOUS PROGRESS\n");
        if !state.completed_steps.is_empty() {
            prompt.push_str("Completed steps:\n");
            for step in &state.completed_steps {
                let _ = writeln!(prompt, "- {}", step);
            }
        }
        let _ = writeln!(prompt, "Current step: {}", state.current_step);
        if !state.last_successful_operation.is_empty() {
            let _ = writeln!(
                prompt,
                "Last successful operation: {}",
                state.last_successful_operation
            );
        }
        if !state.files_tracking.is_empty() {
            let files: Vec<_> = state.files_tracking.keys().map(String::as_str).collect();
            let _ = writeln!(prompt, "Files touched: {}", files.join(", "));
        }
    }

    if let Some(summary) = state.latest_summary() {
        prompt.push_str("\n\n## LATEST SUMMARY\n");
        prompt.push_str(&summary_section(summary));
        prompt.push_str("\nBuild on this progress without repeating completed work.");
    }

    prompt
}

/// Summary rendered for prompts and conversation compression.
pub fn summary_section(summary: &ConversationSummary) -> String {
    let join = |items: &[String]| {
        if items.is_empty() {
            "none".to_string()
        } else {
            items.join("; ")
        }
    };
    format!(
        "Key accomplishments: {}\nCurrent focus: {}\nFiles: {}\nErrors resolved: {}\nNext steps: {}",
        join(&summary.key_accomplishments),
        summary.current_focus,
        join(&summary.files_created_modified),
        join(&summary.errors_resolved),
        join(&summary.next_steps),
    )
}

/// System prompt for a delegated subtask.
pub fn delegate_system_prompt(workspace_path: &str, tools: &[ToolInfo]) -> String {
    format!(
        "You are a focused sub-agent working in {workspace_path}. Complete only the subtask you are given, using these tools:\n{}\n\nWhen done, reply without tool calls with a short report that states whether the subtask completed successfully.",
        tool_list(tools)
    )
}

pub fn plan_system_prompt(workspace_path: &str, tools: &[ToolInfo]) -> String {
    format!(
        "You are a software engineering agent that plans before acting. Workspace: {workspace_path}\n\nAvailable tools:\n{}",
        tool_list(tools)
    )
}

pub fn planning_prompt(task: &str) -> String {
    format!(
        "Create a step-by-step plan for the following task. Identify what has to be inspected, created or changed, which tools are needed, and how success can be verified.\n\nTask: {task}"
    )
}

pub fn decomposition_prompt(task: &str, tool_names: &[String]) -> String {
    format!(
        r#"Break the plan into concrete subtasks for: {task}

Available tools: {tools}

Respond with JSON only, in this format:
{{"subtasks": [{{"id": "subtask_1", "description": "...", "tools_needed": ["..."], "expected_output": "...", "verification_criteria": "...", "priority": 1}}]}}

Lower priority numbers run first."#,
        tools = tool_names.join(", ")
    )
}

pub fn execution_prompt(subtask: &Subtask) -> String {
    format!(
        "Execute this subtask now using the tools.\n\nSubtask: {}\nSuggested tools: {}\nExpected output: {}\nVerification: {}\n\nWhen finished, report concretely what was done (e.g. file created, command completed).",
        subtask.description,
        if subtask.tools_needed.is_empty() {
            "any".to_string()
        } else {
            subtask.tools_needed.join(", ")
        },
        subtask.expected_output,
        subtask.verification_criteria,
    )
}

pub fn aggregation_prompt(
    task: &str,
    completed: usize,
    failed: usize,
    results_json: &str,
) -> String {
    format!(
        "Write a final report for the task: {task}\n\nSubtasks completed: {completed}\nSubtasks failed: {failed}\n\nResults:\n{results_json}\n\nSummarize what was accomplished, what failed and what should be done next."
    )
}
