//! Scripted LLM client for tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use super::{ChatMessage, ChatResponse, LlmClient, LlmError, ToolCall, ToolSchema};

/// Replays queued responses in order and records every request.
pub struct ScriptedClient {
    responses: Mutex<VecDeque<Result<ChatResponse, LlmError>>>,
    requests: Mutex<Vec<(String, Vec<ChatMessage>)>>,
}

impl ScriptedClient {
    pub fn new(responses: Vec<Result<ChatResponse, LlmError>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Queue of plain successful responses.
    pub fn replies(responses: Vec<ChatResponse>) -> Self {
        Self::new(responses.into_iter().map(Ok).collect())
    }

    pub fn text(content: &str) -> ChatResponse {
        ChatResponse {
            content: Some(content.to_string()),
            model: "scripted".to_string(),
            ..ChatResponse::default()
        }
    }

    /// Response requesting the given `(name, arguments)` tool calls.
    pub fn tool_calls(calls: Vec<(&str, Value)>) -> ChatResponse {
        let tool_calls = calls
            .into_iter()
            .enumerate()
            .map(|(i, (name, args))| ToolCall::new(format!("call_{}", i), name, &args))
            .collect();
        ChatResponse {
            content: None,
            tool_calls: Some(tool_calls),
            model: "scripted".to_string(),
            ..ChatResponse::default()
        }
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn models(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|(model, _)| model.clone())
            .collect()
    }

    /// Messages sent with the request at `index`.
    pub fn request(&self, index: usize) -> Vec<ChatMessage> {
        self.requests.lock().unwrap()[index].1.clone()
    }
}

#[async_trait]
impl LlmClient for ScriptedClient {
    async fn chat_completion(
        &self,
        model: &str,
        messages: &[ChatMessage],
        _tools: Option<&[ToolSchema]>,
    ) -> Result<ChatResponse, LlmError> {
        self.requests
            .lock()
            .unwrap()
            .push((model.to_string(), messages.to_vec()));
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(LlmError::InvalidResponse("script exhausted".to_string())))
    }
}
