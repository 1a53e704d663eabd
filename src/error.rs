//! Agent-level errors and their recovery classification.
//!
//! Failures inside a tool never reach this type: they are handed back to the
//! model as `Error: ...` tool results. `AgentError` covers what ends or
//! interrupts a run (LLM transport, state persistence, user stop requests).

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::llm::LlmError;
use crate::state::StateError;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("LLM request failed: {0}")]
    Llm(#[from] LlmError),

    #[error("State persistence failed: {0}")]
    State(#[from] StateError),

    #[error("Execution stopped by user request")]
    Stopped,

    #[error("Task aborted: {0}")]
    Aborted(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AgentError {
    /// Category used to pick a recovery strategy.
    pub fn category(&self) -> ErrorCategory {
        match self {
            AgentError::Llm(e) => e.category(),
            AgentError::State(_) => ErrorCategory::State,
            AgentError::Stopped | AgentError::Aborted(_) => ErrorCategory::Unknown,
            AgentError::Other(e) => ErrorCategory::classify(&e.to_string()),
        }
    }
}

/// Broad classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// OS, filesystem, permissions
    System,
    /// API calls, web requests
    Network,
    /// Tool-specific errors
    Tool,
    /// Model errors (overload, context length, bad output)
    Model,
    /// Invalid input or parameters
    Input,
    /// State management issues
    State,
    Unknown,
}

impl ErrorCategory {
    /// Classify free-form error text by keyword.
    pub fn classify(message: &str) -> Self {
        let msg = message.to_lowercase();
        let has = |terms: &[&str]| terms.iter().any(|t| msg.contains(t));

        if has(&["permission", "no such file", "os error", "path"]) {
            ErrorCategory::System
        } else if has(&["connection", "timed out", "timeout", "http", "network", "dns"]) {
            ErrorCategory::Network
        } else if has(&["invalid value", "invalid argument", "missing '"]) {
            ErrorCategory::Input
        } else if has(&["state"]) {
            ErrorCategory::State
        } else if has(&["model", "token", "overloaded"]) {
            ErrorCategory::Model
        } else if has(&["tool"]) {
            ErrorCategory::Tool
        } else {
            ErrorCategory::Unknown
        }
    }

    /// The recovery strategy for this category.
    pub fn strategy(self) -> RecoveryStrategy {
        use RecoveryKind::*;
        let (kind, max_attempts, backoff_factor, timeout_secs) = match self {
            ErrorCategory::System => (Retry, 3, 2.0, 30),
            ErrorCategory::Network => (Retry, 5, 1.5, 60),
            ErrorCategory::Tool => (Fallback, 2, 1.0, 30),
            ErrorCategory::Model => (Fallback, 2, 1.0, 60),
            ErrorCategory::Input => (Delegate, 1, 1.0, 30),
            ErrorCategory::State => (Retry, 2, 1.0, 30),
            ErrorCategory::Unknown => (Delegate, 1, 1.0, 60),
        };
        RecoveryStrategy {
            kind,
            max_attempts,
            backoff_factor,
            timeout: Duration::from_secs(timeout_secs),
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorCategory::System => "system",
            ErrorCategory::Network => "network",
            ErrorCategory::Tool => "tool",
            ErrorCategory::Model => "model",
            ErrorCategory::Input => "input",
            ErrorCategory::State => "state",
            ErrorCategory::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryKind {
    /// Try the same request again after a delay
    Retry,
    /// Retry after asking the model for a simpler approach
    Fallback,
    /// Hand the problem back to the model to reason about
    Delegate,
}

/// How the agent recovers from a category of errors.
#[derive(Debug, Clone)]
pub struct RecoveryStrategy {
    pub kind: RecoveryKind,
    /// Consecutive failures tolerated before aborting.
    pub max_attempts: u32,
    pub backoff_factor: f64,
    /// Upper bound on the retried request.
    pub timeout: Duration,
}

impl RecoveryStrategy {
    /// Delay before the given (1-based) recovery attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        Duration::from_secs_f64(self.backoff_factor.powi(attempt as i32))
    }

    /// Message added to the conversation before the retry, if any.
    pub fn retry_note(&self, error: &str) -> Option<String> {
        match self.kind {
            RecoveryKind::Retry => None,
            RecoveryKind::Fallback => Some(format!(
                "The last request failed: {}. Continue with a simpler approach: smaller steps and shorter outputs.",
                error
            )),
            RecoveryKind::Delegate => Some(format!(
                "Error occurred: {}. Decide how to proceed and continue with the task.",
                error
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_common_messages() {
        assert_eq!(
            ErrorCategory::classify("error sending request: connection refused"),
            ErrorCategory::Network
        );
        assert_eq!(
            ErrorCategory::classify("Permission denied (os error 13)"),
            ErrorCategory::System
        );
        assert_eq!(
            ErrorCategory::classify("model is overloaded"),
            ErrorCategory::Model
        );
        assert_eq!(ErrorCategory::classify("boom"), ErrorCategory::Unknown);
    }

    #[test]
    fn network_errors_retry_with_growing_delay() {
        let strategy = ErrorCategory::Network.strategy();
        assert_eq!(strategy.kind, RecoveryKind::Retry);
        assert_eq!(strategy.max_attempts, 5);
        assert!(strategy.delay_for(2) > strategy.delay_for(1));
    }

    #[test]
    fn retry_notes_follow_the_recovery_kind() {
        assert_eq!(ErrorCategory::Network.strategy().retry_note("down"), None);
        let note = ErrorCategory::Model.strategy().retry_note("overloaded").unwrap();
        assert!(note.contains("overloaded"));
        assert!(note.contains("simpler approach"));
        assert!(ErrorCategory::Input
            .strategy()
            .retry_note("bad")
            .unwrap()
            .starts_with("Error occurred: bad."));
        assert_eq!(
            ErrorCategory::Network.strategy().timeout,
            Duration::from_secs(60)
        );
    }
}
