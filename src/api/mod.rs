//! HTTP API: submit tasks, inspect their logs and stop them.
//!
//! Tasks run non-interactively in spawned tokio tasks. Agent events are
//! appended to each task's log as they arrive.

mod routes;
pub mod types;

pub use routes::{router, serve, AppState};
