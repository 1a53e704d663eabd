//! # SWE Agent
//!
//! An autonomous software-engineering agent that works inside a workspace
//! directory through a fixed set of tools.
//!
//! This library provides:
//! - A persistent tool-calling agent loop that survives failures, summarizes
//!   long conversations and can be resumed from a saved state file
//! - A plan workflow that decomposes a task into prioritized subtasks
//! - Permission-checked file, search, shell, todo and web tools
//! - Anthropic and OpenRouter clients with throttling, backoff and model
//!   fallback
//! - An HTTP API for task submission and monitoring
//!
//! ## Architecture
//!
//! The agent follows the "tools in a loop" pattern:
//! 1. Build context with a system prompt carrying previous progress
//! 2. Call the LLM with the available tools
//! 3. Execute requested tool calls and feed the results back
//! 4. On a plain answer, decide whether the task is complete
//! 5. Save state and `progress.md` after every iteration
//!
//! ## Example
//!
//! ```rust,ignore
//! use swe_agent::{agent::Agent, events::EventSink, llm::client_from_config, Config};
//!
//! let config = Config::from_env()?;
//! let events = EventSink::new();
//! let llm = client_from_config(&config, events.clone());
//! let agent = Agent::new(config, llm, events);
//! let outcome = agent.run_task("Create a hello world script", None).await?;
//! ```

pub mod agent;
pub mod api;
pub mod config;
pub mod control;
pub mod error;
pub mod events;
pub mod llm;
pub mod permissions;
pub mod progress;
pub mod state;
pub mod todos;
pub mod tools;

pub use config::Config;
