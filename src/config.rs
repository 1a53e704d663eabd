//! Configuration management for SWE Agent.
//!
//! Values are layered: built-in defaults, then an optional YAML/JSON config
//! file, then environment variables. The CLI applies its flags last.
//!
//! Environment variables:
//! - `ANTHROPIC_API_KEY` - API key when the provider is `anthropic` (default).
//! - `OPENROUTER_API_KEY` - API key when the provider is `openrouter`.
//! - `LLM_PROVIDER` - Optional. `anthropic` or `openrouter`.
//! - `LLM_BASE_URL` - Optional. Override the provider API base URL.
//! - `DEFAULT_MODEL` - Optional. Model identifier.
//! - `FALLBACK_MODELS` - Optional. Comma separated models tried after repeated failures.
//! - `WORKSPACE_PATH` - Optional. The workspace directory. Defaults to current directory.
//! - `HOST` / `PORT` - Optional. HTTP server address. Defaults to `127.0.0.1:3000`.
//! - `MAX_ITERATIONS` - Optional. Maximum agent loop iterations. Defaults to `30`.
//! - `PERMISSION_LEVEL` - Optional. `safe`, `elevated` or `admin`.
//! - `MIN_REQUEST_INTERVAL_MS` - Optional. Throttle between LLM requests.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::permissions::PermissionLevel;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),

    #[error("Failed to read config file {0}: {1}")]
    Io(PathBuf, std::io::Error),

    #[error("Failed to parse config file {0}: {1}")]
    Parse(PathBuf, String),
}

/// Which LLM API to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    Anthropic,
    OpenRouter,
}

impl LlmProvider {
    /// Environment variable holding the API key for this provider.
    pub fn api_key_var(self) -> &'static str {
        match self {
            LlmProvider::Anthropic => "ANTHROPIC_API_KEY",
            LlmProvider::OpenRouter => "OPENROUTER_API_KEY",
        }
    }

    pub fn default_model(self) -> &'static str {
        match self {
            LlmProvider::Anthropic => "claude-sonnet-4-20250514",
            LlmProvider::OpenRouter => "anthropic/claude-sonnet-4",
        }
    }
}

impl FromStr for LlmProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "anthropic" => Ok(LlmProvider::Anthropic),
            "openrouter" => Ok(LlmProvider::OpenRouter),
            other => Err(format!("unknown provider: {}", other)),
        }
    }
}

/// How much of the final result the CLI prints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Minimal,
    Standard,
    #[default]
    Detailed,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "minimal" => Ok(OutputFormat::Minimal),
            "standard" => Ok(OutputFormat::Standard),
            "detailed" => Ok(OutputFormat::Detailed),
            other => Err(format!("unknown output format: {}", other)),
        }
    }
}

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub provider: LlmProvider,

    /// API key for the selected provider
    pub api_key: String,

    /// Override for the provider base URL (tests, proxies)
    pub api_base_url: Option<String>,

    /// Default LLM model identifier
    pub default_model: String,

    /// Models tried in order after repeated failures on the current one
    pub fallback_models: Vec<String>,

    /// Max tokens per completion
    pub max_tokens: u32,

    /// Workspace directory for file operations
    pub workspace_path: PathBuf,

    /// Server host
    pub host: String,

    /// Server port
    pub port: u16,

    /// Maximum iterations for the agent loop
    pub max_iterations: usize,

    pub permission_level: PermissionLevel,

    /// Ask the user for confirmation and recovery decisions
    pub interactive: bool,

    pub show_todo_updates: bool,

    pub output_format: OutputFormat,

    /// Glob patterns file writes must match (empty = any file)
    pub allowed_file_patterns: Vec<String>,

    /// Directory of per-task state snapshots, relative to the workspace
    pub state_dir: String,

    /// Progress report file name, relative to the workspace
    pub progress_file: String,

    pub progress_tracking: bool,

    /// Messages kept verbatim when the conversation is compressed
    pub context_retention: usize,

    /// Summarize the conversation every N iterations (0 disables)
    pub summarization_threshold: usize,

    /// Minimum spacing between LLM requests
    pub min_request_interval: Duration,
}

/// On-disk config file. Every field is optional and overrides the defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<LlmProvider>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_models: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interactive_mode: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permission_level: Option<PermissionLevel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub show_todo_updates: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_format: Option<OutputFormat>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_file_patterns: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress_tracking: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_retention: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summarization_threshold: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_request_interval_ms: Option<u64>,
}

impl FileConfig {
    /// Read a config file, picking the format from the extension.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        if is_yaml(path) {
            serde_yaml::from_str(&contents)
                .map_err(|e| ConfigError::Parse(path.to_path_buf(), e.to_string()))
        } else {
            serde_json::from_str(&contents)
                .map_err(|e| ConfigError::Parse(path.to_path_buf(), e.to_string()))
        }
    }

    fn sample() -> Self {
        Self {
            provider: Some(LlmProvider::Anthropic),
            model: Some(LlmProvider::Anthropic.default_model().to_string()),
            task_description: Some(
                "Analyze the codebase and provide improvement suggestions".to_string(),
            ),
            interactive_mode: Some(true),
            permission_level: Some(PermissionLevel::Elevated),
            show_todo_updates: Some(true),
            max_iterations: Some(30),
            output_format: Some(OutputFormat::Detailed),
            working_directory: Some(PathBuf::from(".")),
            allowed_file_patterns: Some(Vec::new()),
            progress_tracking: Some(true),
            context_retention: Some(8),
            summarization_threshold: Some(12),
            ..Default::default()
        }
    }
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()).map(|e| e.to_lowercase()),
        Some(ref e) if e == "yaml" || e == "yml"
    )
}

impl Config {
    /// Load configuration from environment variables only.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingEnvVar` if the provider's API key is not set.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None).map(|(config, _)| config)
    }

    /// Load defaults, overlay the config file (if any), then the environment.
    ///
    /// Returns the task description from the file alongside the config. A
    /// config path that does not exist falls back to defaults with a warning.
    pub fn load(file: Option<&Path>) -> Result<(Self, Option<String>), ConfigError> {
        let file_config = match file {
            Some(path) if path.exists() => {
                tracing::info!("Loading configuration from {}", path.display());
                FileConfig::from_path(path)?
            }
            Some(path) => {
                tracing::warn!("Config file not found: {}, using defaults", path.display());
                FileConfig::default()
            }
            None => FileConfig::default(),
        };

        let provider = match std::env::var("LLM_PROVIDER").ok() {
            Some(v) => v
                .parse()
                .map_err(|e| ConfigError::InvalidValue("LLM_PROVIDER".to_string(), e))?,
            None => file_config.provider.unwrap_or(LlmProvider::Anthropic),
        };

        let api_key = std::env::var(provider.api_key_var())
            .map_err(|_| ConfigError::MissingEnvVar(provider.api_key_var().to_string()))?;

        let mut config = Self::new(
            api_key,
            provider.default_model().to_string(),
            std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        );
        config.provider = provider;
        let task = file_config.task_description.clone();
        config.apply_file(file_config);
        config.apply_env()?;
        Ok((config, task))
    }

    fn apply_file(&mut self, file: FileConfig) {
        if let Some(v) = file.model {
            self.default_model = v;
        }
        if let Some(v) = file.fallback_models {
            self.fallback_models = v;
        }
        if let Some(v) = file.max_tokens {
            self.max_tokens = v;
        }
        if let Some(v) = file.interactive_mode {
            self.interactive = v;
        }
        if let Some(v) = file.permission_level {
            self.permission_level = v;
        }
        if let Some(v) = file.show_todo_updates {
            self.show_todo_updates = v;
        }
        if let Some(v) = file.max_iterations {
            self.max_iterations = v;
        }
        if let Some(v) = file.output_format {
            self.output_format = v;
        }
        if let Some(v) = file.working_directory {
            self.workspace_path = v;
        }
        if let Some(v) = file.allowed_file_patterns {
            self.allowed_file_patterns = v;
        }
        if let Some(v) = file.state_dir {
            self.state_dir = v;
        }
        if let Some(v) = file.progress_file {
            self.progress_file = v;
        }
        if let Some(v) = file.progress_tracking {
            self.progress_tracking = v;
        }
        if let Some(v) = file.context_retention {
            self.context_retention = v;
        }
        if let Some(v) = file.summarization_threshold {
            self.summarization_threshold = v;
        }
        if let Some(v) = file.min_request_interval_ms {
            self.min_request_interval = Duration::from_millis(v);
        }
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(v) = std::env::var("LLM_BASE_URL") {
            self.api_base_url = Some(v);
        }
        if let Ok(v) = std::env::var("DEFAULT_MODEL") {
            self.default_model = v;
        }
        if let Ok(v) = std::env::var("FALLBACK_MODELS") {
            self.fallback_models = v
                .split(',')
                .map(|m| m.trim().to_string())
                .filter(|m| !m.is_empty())
                .collect();
        }
        if let Ok(v) = std::env::var("WORKSPACE_PATH") {
            self.workspace_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("HOST") {
            self.host = v;
        }
        if let Some(v) = parse_env::<u16>("PORT")? {
            self.port = v;
        }
        if let Some(v) = parse_env::<usize>("MAX_ITERATIONS")? {
            self.max_iterations = v;
        }
        if let Some(v) = parse_env::<PermissionLevel>("PERMISSION_LEVEL")? {
            self.permission_level = v;
        }
        if let Some(v) = parse_env::<u64>("MIN_REQUEST_INTERVAL_MS")? {
            self.min_request_interval = Duration::from_millis(v);
        }
        Ok(())
    }

    /// Create a config with custom values (useful for testing).
    pub fn new(api_key: String, default_model: String, workspace_path: PathBuf) -> Self {
        Self {
            provider: LlmProvider::Anthropic,
            api_key,
            api_base_url: None,
            default_model,
            fallback_models: Vec::new(),
            max_tokens: 4096,
            workspace_path,
            host: "127.0.0.1".to_string(),
            port: 3000,
            max_iterations: 30,
            permission_level: PermissionLevel::Elevated,
            interactive: false,
            show_todo_updates: true,
            output_format: OutputFormat::Detailed,
            allowed_file_patterns: Vec::new(),
            state_dir: ".swe_agent_state".to_string(),
            progress_file: "progress.md".to_string(),
            progress_tracking: true,
            context_retention: 8,
            summarization_threshold: 12,
            min_request_interval: Duration::from_millis(100),
        }
    }

    /// Directory holding one state snapshot per task.
    pub fn state_path(&self) -> PathBuf {
        self.workspace_path.join(&self.state_dir)
    }

    /// Absolute path of the progress report.
    pub fn progress_path(&self) -> PathBuf {
        self.workspace_path.join(&self.progress_file)
    }
}

fn parse_env<T>(var: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    std::env::var(var)
        .ok()
        .map(|v| {
            v.trim()
                .parse::<T>()
                .map_err(|e| ConfigError::InvalidValue(var.to_string(), e.to_string()))
        })
        .transpose()
}

/// Write a sample configuration file (YAML or JSON by extension).
pub fn create_sample_config(path: &Path) -> anyhow::Result<()> {
    let sample = FileConfig::sample();
    let contents = if is_yaml(path) {
        serde_yaml::to_string(&sample)?
    } else {
        serde_json::to_string_pretty(&sample)?
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, contents)?;
    tracing::info!("Sample configuration created at {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_config_round_trips_through_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        create_sample_config(&path).unwrap();

        let loaded = FileConfig::from_path(&path).unwrap();
        assert_eq!(loaded.permission_level, Some(PermissionLevel::Elevated));
        assert_eq!(loaded.max_iterations, Some(30));
        assert_eq!(loaded.output_format, Some(OutputFormat::Detailed));
    }

    #[test]
    fn json_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"permission_level": "safe", "max_iterations": 5, "interactive_mode": true}"#,
        )
        .unwrap();

        let mut config = Config::new("key".into(), "model".into(), dir.path().to_path_buf());
        config.apply_file(FileConfig::from_path(&path).unwrap());
        assert_eq!(config.permission_level, PermissionLevel::Safe);
        assert_eq!(config.max_iterations, 5);
        assert!(config.interactive);
        assert_eq!(config.context_retention, 8);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            FileConfig::from_path(&path),
            Err(ConfigError::Parse(..))
        ));
    }

    #[test]
    fn parses_enums_case_insensitively() {
        assert_eq!("OpenRouter".parse::<LlmProvider>(), Ok(LlmProvider::OpenRouter));
        assert_eq!("MINIMAL".parse::<OutputFormat>(), Ok(OutputFormat::Minimal));
        assert!("verbose".parse::<OutputFormat>().is_err());
    }
}
