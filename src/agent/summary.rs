//! Conversation summaries and context compression.

use chrono::Utc;

use crate::llm::{ChatMessage, Role};
use crate::state::{ConversationSummary, PersistentState};

use super::prompt::summary_section;

pub const MAX_ACCOMPLISHMENTS: usize = 5;
pub const MAX_NEXT_STEPS: usize = 3;
const MAX_FOCUS_CHARS: usize = 100;
const DEFAULT_FOCUS: &str = "Continuing with task execution";
/// Messages shown to the model when it writes a summary.
pub const SUMMARY_WINDOW: usize = 10;

fn list_item(line: &str) -> Option<&str> {
    let line = line.trim();
    let rest = if let Some(rest) = line.strip_prefix(['-', '*', '•']) {
        rest
    } else {
        let digits = line.chars().take_while(char::is_ascii_digit).count();
        if digits == 0 {
            return None;
        }
        line[digits..].strip_prefix(['.', ')'])?
    };
    let item = rest.trim();
    (!item.is_empty()).then_some(item)
}

/// A non-list line announcing upcoming work, e.g. "Next steps:".
fn is_next_steps_header(line: &str) -> bool {
    let lower = line.to_lowercase();
    list_item(line).is_none()
        && ["next", "upcoming", "plan", "todo"].iter().any(|k| lower.contains(k))
}

/// Bullet or numbered lines before any next-steps header, at most five.
pub fn extract_accomplishments(text: &str) -> Vec<String> {
    text.lines()
        .take_while(|l| !is_next_steps_header(l))
        .filter_map(list_item)
        .take(MAX_ACCOMPLISHMENTS)
        .map(str::to_string)
        .collect()
}

/// First line mentioning what is being worked on, lowercased.
pub fn extract_current_focus(text: &str) -> String {
    text.lines()
        .map(|l| l.trim().to_lowercase())
        .find(|l| ["current", "focus", "working on", "now"].iter().any(|k| l.contains(k)))
        .map(|l| l.chars().take(MAX_FOCUS_CHARS).collect())
        .unwrap_or_else(|| DEFAULT_FOCUS.to_string())
}

/// List items after the first line that announces next steps, at most three.
pub fn extract_next_steps(text: &str) -> Vec<String> {
    let mut lines = text.lines();
    if !lines.by_ref().any(is_next_steps_header) {
        return Vec::new();
    }
    lines
        .filter_map(list_item)
        .take(MAX_NEXT_STEPS)
        .map(str::to_string)
        .collect()
}

/// Build a summary from the model's summary text and the current state.
pub fn build_summary(state: &PersistentState, text: &str, prefix: &str, since: u32) -> ConversationSummary {
    ConversationSummary {
        summary_id: state.next_summary_id(prefix),
        iterations_covered: (since, state.iteration_count),
        key_accomplishments: extract_accomplishments(text),
        current_focus: extract_current_focus(text),
        next_steps: extract_next_steps(text),
        files_created_modified: state.files_tracking.keys().cloned().collect(),
        errors_resolved: state
            .error_history
            .iter()
            .rev()
            .take(3)
            .rev()
            .map(|e| e.error.chars().take(50).collect())
            .collect(),
        timestamp: Utc::now(),
    }
}

/// Plain-text rendering of recent messages for the summary request.
pub fn render_recent(messages: &[ChatMessage], window: usize) -> String {
    let start = messages.len().saturating_sub(window);
    messages[start..]
        .iter()
        .map(|m| {
            let role = match m.role {
                Role::System => "system",
                Role::User => "user",
                Role::Assistant => "assistant",
                Role::Tool => "tool",
            };
            let mut line = format!("{}: {}", role, m.content.as_deref().unwrap_or_default());
            for call in m.tool_calls.iter().flatten() {
                line.push_str(&format!(
                    " [called {}({})]",
                    call.function.name, call.function.arguments
                ));
            }
            line.chars().take(500).collect::<String>()
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Replace the middle of the conversation with a summary.
///
/// Keeps the leading system messages and the first user message, then the
/// summary, then the last `retain` messages. The tail never starts on a tool
/// result, so every kept result still follows the call that produced it.
pub fn compress_conversation(
    messages: &[ChatMessage],
    summary: &ConversationSummary,
    retain: usize,
) -> Vec<ChatMessage> {
    let head_len = messages
        .iter()
        .position(|m| m.role == Role::User)
        .map(|i| i + 1)
        .unwrap_or(0);

    let mut start = messages.len().saturating_sub(retain).max(head_len);
    while start > head_len && messages[start].role == Role::Tool {
        start -= 1;
    }
    if start <= head_len {
        return messages.to_vec();
    }

    let mut compressed = messages[..head_len].to_vec();
    compressed.push(ChatMessage::user(format!(
        "CONTEXT SUMMARY: Previous Progress Summary:\n{}",
        summary_section(summary)
    )));
    compressed.extend_from_slice(&messages[start..]);
    compressed
}
