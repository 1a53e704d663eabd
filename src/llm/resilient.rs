//! Request throttling, retry with exponential backoff, and model fallback.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::Mutex;

use super::{ChatMessage, ChatResponse, LlmClient, LlmError, ToolSchema};
use crate::events::{AgentEvent, EventSink};

/// Backoff configuration for retried requests.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Base delay for first failure.
    pub base_delay: Duration,
    /// Maximum backoff cap.
    pub max_delay: Duration,
    /// Multiplier per consecutive failure (typically 2.0).
    pub multiplier: f64,
    /// Upper bound of the random delay added to each backoff.
    pub jitter: Duration,
    /// Retries per request before the error is returned.
    pub max_retries: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: Duration::from_millis(250),
            max_retries: 3,
        }
    }
}

impl BackoffConfig {
    /// Delay before retry number `attempt` (0-based), without jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay_secs = self.base_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped = delay_secs.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return delay;
        }
        delay + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}

/// Wraps a provider client with throttling, retries and model fallback.
///
/// After `switch_threshold` consecutive failures the client moves to the next
/// entry of `fallback_models` and stays there for the rest of the run.
pub struct ResilientClient {
    inner: Arc<dyn LlmClient>,
    min_interval: Duration,
    backoff: BackoffConfig,
    fallback_models: Vec<String>,
    switch_threshold: u32,
    last_request: Mutex<Option<Instant>>,
    consecutive_failures: AtomicU32,
    /// 0 = requested model, n = fallback_models[n - 1]
    model_index: Mutex<usize>,
    events: Option<EventSink>,
}

impl ResilientClient {
    pub fn new(inner: Arc<dyn LlmClient>, min_interval: Duration) -> Self {
        Self {
            inner,
            min_interval,
            backoff: BackoffConfig::default(),
            fallback_models: Vec::new(),
            switch_threshold: 3,
            last_request: Mutex::new(None),
            consecutive_failures: AtomicU32::new(0),
            model_index: Mutex::new(0),
            events: None,
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_fallback_models(mut self, models: Vec<String>) -> Self {
        self.fallback_models = models;
        self
    }

    pub fn with_switch_threshold(mut self, threshold: u32) -> Self {
        self.switch_threshold = threshold.max(1);
        self
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = Some(events);
        self
    }

    fn emit(&self, event: AgentEvent) {
        if let Some(events) = &self.events {
            events.emit(event);
        }
    }

    async fn active_model(&self, requested: &str) -> String {
        let index = *self.model_index.lock().await;
        match index {
            0 => requested.to_string(),
            n => self.fallback_models[n - 1].clone(),
        }
    }

    /// Move to the next fallback model. Returns false when none is left.
    async fn switch_model(&self, from: &str) -> bool {
        let mut index = self.model_index.lock().await;
        if *index >= self.fallback_models.len() {
            return false;
        }
        *index += 1;
        let to = self.fallback_models[*index - 1].clone();
        self.consecutive_failures.store(0, Ordering::SeqCst);
        tracing::warn!("Switching model {} -> {} after repeated failures", from, to);
        self.emit(AgentEvent::ModelSwitched {
            from: from.to_string(),
            to,
        });
        true
    }

    /// Sleep until at least `min_interval` has passed since the last request.
    async fn throttle(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.min_interval {
                let wait = self.min_interval - elapsed;
                tracing::debug!("Throttling request: waiting {:?}", wait);
                self.emit(AgentEvent::Throttled {
                    wait_ms: wait.as_millis() as u64,
                });
                tokio::time::sleep(wait).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[async_trait]
impl LlmClient for ResilientClient {
    async fn chat_completion(
        &self,
        model: &str,
        messages: &[ChatMessage],
        tools: Option<&[ToolSchema]>,
    ) -> Result<ChatResponse, LlmError> {
        let mut attempt = 0u32;
        loop {
            let active = self.active_model(model).await;
            self.throttle().await;

            let err = match self.inner.chat_completion(&active, messages, tools).await {
                Ok(response) => {
                    self.consecutive_failures.store(0, Ordering::SeqCst);
                    return Ok(response);
                }
                Err(e) => e,
            };

            let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
            tracing::warn!(model = %active, failures, "LLM request failed: {}", err);

            if failures >= self.switch_threshold && self.switch_model(&active).await {
                attempt = 0;
                continue;
            }
            if !err.is_retryable() || attempt >= self.backoff.max_retries {
                return Err(err);
            }

            let base = match &err {
                LlmError::RateLimited {
                    retry_after: Some(after),
                    ..
                } => (*after).min(self.backoff.max_delay),
                _ => self.backoff.delay_for(attempt),
            };
            let delay = self.backoff.jittered(base);
            attempt += 1;
            self.emit(AgentEvent::Retrying {
                attempt,
                delay_ms: delay.as_millis() as u64,
                error: err.to_string(),
            });
            tokio::time::sleep(delay).await;
        }
    }
}
