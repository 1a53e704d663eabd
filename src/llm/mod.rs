//! LLM client abstraction.
//!
//! Messages use the OpenAI chat shape internally (system/user/assistant/tool
//! roles, tool calls with JSON-encoded arguments). Provider clients convert
//! to their own wire format.

mod anthropic;
mod openrouter;
mod resilient;
#[cfg(test)]
pub(crate) mod scripted;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use anthropic::AnthropicClient;
pub use openrouter::OpenRouterClient;
pub use resilient::{BackoffConfig, ResilientClient};

use crate::config::{Config, LlmProvider};
use crate::error::ErrorCategory;
use crate::events::EventSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self::text(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::text(Role::User, content)
    }

    pub fn assistant(content: Option<String>, tool_calls: Option<Vec<ToolCall>>) -> Self {
        Self {
            role: Role::Assistant,
            content,
            tool_calls,
            tool_call_id: None,
        }
    }

    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
        }
    }

    fn text(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    /// Whether this assistant message requests tool calls.
    pub fn has_tool_calls(&self) -> bool {
        self.tool_calls.as_ref().is_some_and(|c| !c.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type", default = "function_type")]
    pub call_type: String,
    pub function: FunctionCall,
}

fn function_type() -> String {
    "function".to_string()
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: &Value) -> Self {
        Self {
            id: id.into(),
            call_type: function_type(),
            function: FunctionCall {
                name: name.into(),
                arguments: arguments.to_string(),
            },
        }
    }

    /// Parsed arguments; malformed JSON yields `Value::Null`.
    pub fn arguments(&self) -> Value {
        serde_json::from_str(&self.function.arguments).unwrap_or(Value::Null)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// JSON-encoded arguments
    pub arguments: String,
}

/// Tool definition offered to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: FunctionSchema,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionSchema {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl ToolSchema {
    pub fn function(name: &str, description: &str, parameters: Value) -> Self {
        Self {
            tool_type: function_type(),
            function: FunctionSchema {
                name: name.to_string(),
                description: description.to_string(),
                parameters,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }

    pub fn add(&self, other: &TokenUsage) -> TokenUsage {
        TokenUsage::new(
            self.prompt_tokens + other.prompt_tokens,
            self.completion_tokens + other.completion_tokens,
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct ChatResponse {
    pub content: Option<String>,
    pub tool_calls: Option<Vec<ToolCall>>,
    pub usage: Option<TokenUsage>,
    pub finish_reason: Option<String>,
    /// Model that actually served the request.
    pub model: String,
}

impl ChatResponse {
    /// Tool calls requested by the model, empty when none.
    pub fn requested_tools(&self) -> &[ToolCall] {
        self.tool_calls.as_deref().unwrap_or(&[])
    }
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("rate limited (HTTP {status})")]
    RateLimited {
        status: u16,
        retry_after: Option<Duration>,
    },

    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),
}

impl LlmError {
    /// Build the error for a non-success HTTP response.
    pub(crate) fn from_status(
        status: reqwest::StatusCode,
        headers: &reqwest::header::HeaderMap,
        body: String,
    ) -> Self {
        let code = status.as_u16();
        if code == 429 || code == 529 {
            let retry_after = headers
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            LlmError::RateLimited {
                status: code,
                retry_after,
            }
        } else {
            LlmError::Http { status: code, body }
        }
    }

    /// Whether retrying the same request can succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::RateLimited { .. } => true,
            LlmError::Http { status, .. } => *status >= 500,
            LlmError::Transport(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            LlmError::InvalidResponse(_) => false,
            LlmError::Timeout(_) => true,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            LlmError::RateLimited { .. } => ErrorCategory::Model,
            LlmError::Http { status, .. } if *status >= 500 => ErrorCategory::Network,
            LlmError::Http { .. } => ErrorCategory::Input,
            LlmError::Transport(_) => ErrorCategory::Network,
            LlmError::InvalidResponse(_) => ErrorCategory::Model,
            LlmError::Timeout(_) => ErrorCategory::Network,
        }
    }
}

/// Chat completion API.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn chat_completion(
        &self,
        model: &str,
        messages: &[ChatMessage],
        tools: Option<&[ToolSchema]>,
    ) -> Result<ChatResponse, LlmError>;
}

/// Build the configured provider client wrapped with throttling, retries and
/// model fallback.
pub fn client_from_config(config: &Config, events: EventSink) -> Arc<dyn LlmClient> {
    let inner: Arc<dyn LlmClient> = match config.provider {
        LlmProvider::Anthropic => Arc::new(
            AnthropicClient::new(config.api_key.clone())
                .with_base_url(config.api_base_url.clone())
                .with_max_tokens(config.max_tokens),
        ),
        LlmProvider::OpenRouter => Arc::new(
            OpenRouterClient::new(config.api_key.clone())
                .with_base_url(config.api_base_url.clone())
                .with_max_tokens(config.max_tokens),
        ),
    };
    Arc::new(
        ResilientClient::new(inner, config.min_request_interval)
            .with_fallback_models(config.fallback_models.clone())
            .with_events(events),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tool_call_arguments_parse_or_null() {
        let call = ToolCall::new("1", "bash", &json!({"command": "ls"}));
        assert_eq!(call.arguments()["command"], "ls");

        let mut broken = call.clone();
        broken.function.arguments = "{oops".to_string();
        assert_eq!(broken.arguments(), Value::Null);
    }

    #[test]
    fn server_errors_are_retryable_client_errors_are_not() {
        let server = LlmError::Http {
            status: 502,
            body: String::new(),
        };
        let client = LlmError::Http {
            status: 400,
            body: String::new(),
        };
        assert!(server.is_retryable());
        assert!(!client.is_retryable());
        assert_eq!(client.category(), ErrorCategory::Input);
    }

    #[test]
    fn rate_limit_reads_retry_after() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(reqwest::header::RETRY_AFTER, "7".parse().unwrap());
        let err = LlmError::from_status(
            reqwest::StatusCode::TOO_MANY_REQUESTS,
            &headers,
            String::new(),
        );
        match err {
            LlmError::RateLimited { retry_after, .. } => {
                assert_eq!(retry_after, Some(Duration::from_secs(7)))
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn messages_serialize_without_empty_fields() {
        let msg = ChatMessage::user("hi");
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value, json!({"role": "user", "content": "hi"}));
    }
}
