//! SWE Agent - command line entry point.
//!
//! `run` executes a task in the terminal, `serve` starts the HTTP API and
//! `init-config` writes a sample configuration file.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use swe_agent::agent::{Agent, TaskOutcome, TaskReport};
use swe_agent::config::{create_sample_config, Config, OutputFormat};
use swe_agent::control::{spawn_interrupt_handler, Prompter, StdinPrompter};
use swe_agent::error::AgentError;
use swe_agent::events::{AgentEvent, EventSink};
use swe_agent::permissions::PermissionLevel;
use swe_agent::{api, llm};

#[derive(Parser)]
#[command(name = "swe-agent", version)]
#[command(about = "Autonomous software engineering agent", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Run a task in the current workspace")]
    Run(RunArgs),

    #[command(about = "Write a sample configuration file (YAML or JSON by extension)")]
    InitConfig {
        #[arg(help = "Where to write the file")]
        path: PathBuf,
    },

    #[command(about = "Start the HTTP API server")]
    Serve {
        #[arg(short, long, help = "Configuration file (YAML or JSON)")]
        config: Option<PathBuf>,

        #[arg(long, help = "Enable debug logging")]
        debug: bool,
    },
}

#[derive(clap::Args)]
struct RunArgs {
    #[arg(help = "Task description (falls back to the config file, then a prompt)")]
    task: Option<String>,

    #[arg(short, long, help = "Configuration file (YAML or JSON)")]
    config: Option<PathBuf>,

    #[arg(long, help = "Plan and decompose the task into subtasks first")]
    plan: bool,

    #[arg(
        long,
        value_name = "TASK_ID",
        conflicts_with = "plan",
        help = "Resume a saved task by id, or 'latest' for the last saved one"
    )]
    resume: Option<String>,

    #[arg(long, help = "Permission level: safe, elevated or admin")]
    permission: Option<PermissionLevel>,

    #[arg(long, conflicts_with = "non_interactive", help = "Ask before completing and on errors")]
    interactive: bool,

    #[arg(long, help = "Never ask the user")]
    non_interactive: bool,

    #[arg(long, conflicts_with = "hide_todos", help = "Show todo list updates")]
    show_todos: bool,

    #[arg(long, help = "Hide todo list updates")]
    hide_todos: bool,

    #[arg(long, help = "Output format: minimal, standard or detailed")]
    output_format: Option<OutputFormat>,

    #[arg(long, help = "Maximum number of agent iterations")]
    max_iterations: Option<usize>,

    #[arg(long, help = "Working directory for all operations")]
    working_dir: Option<PathBuf>,

    #[arg(long, help = "Model to use (overrides config)")]
    model: Option<String>,

    #[arg(long, help = "Enable debug logging")]
    debug: bool,
}

impl RunArgs {
    fn apply(&self, config: &mut Config) -> anyhow::Result<()> {
        if self.interactive {
            config.interactive = true;
        } else if self.non_interactive {
            config.interactive = false;
        }
        if self.show_todos {
            config.show_todo_updates = true;
        } else if self.hide_todos {
            config.show_todo_updates = false;
        }
        if let Some(level) = self.permission {
            config.permission_level = level;
        }
        if let Some(format) = self.output_format {
            config.output_format = format;
        }
        if let Some(max) = self.max_iterations {
            config.max_iterations = max;
        }
        if let Some(model) = &self.model {
            config.default_model = model.clone();
        }
        if let Some(dir) = &self.working_dir {
            config.workspace_path = std::fs::canonicalize(dir).map_err(|e| {
                anyhow::anyhow!("Invalid working directory {}: {}", dir.display(), e)
            })?;
        }
        Ok(())
    }
}

fn init_tracing(debug: bool) {
    let default_filter = if debug {
        "swe_agent=debug,tower_http=debug"
    } else {
        "swe_agent=info,tower_http=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::InitConfig { path } => {
            init_tracing(false);
            create_sample_config(&path)?;
            println!("✅ Sample configuration written to {}", path.display());
            Ok(())
        }
        Commands::Serve { config, debug } => {
            init_tracing(debug);
            let (config, _) = Config::load(config.as_deref())?;
            info!("Loaded configuration: model={}", config.default_model);
            api::serve(config).await
        }
        Commands::Run(args) => {
            init_tracing(args.debug);
            run(args).await
        }
    }
}

enum RunResult {
    Task(TaskOutcome),
    Plan(TaskReport),
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    let (mut config, file_task) = Config::load(args.config.as_deref())?;
    args.apply(&mut config)?;

    let prompter: Option<Arc<dyn Prompter>> = if config.interactive {
        Some(Arc::new(StdinPrompter))
    } else {
        None
    };

    let task = match args.task.clone().or(file_task) {
        Some(task) if !task.trim().is_empty() => task,
        _ if args.resume.is_some() => String::new(),
        _ => match &prompter {
            Some(prompter) => prompter.ask("Enter task description:").await,
            None => String::new(),
        },
    };
    if task.trim().is_empty() && args.resume.is_none() {
        anyhow::bail!("No task description provided. Pass TASK or set task_description in the config file.");
    }

    print_banner(&config, &task);

    let format = config.output_format;
    let show_todos = config.show_todo_updates;
    let events = EventSink::new();
    let mut rx = events.subscribe();
    let client = llm::client_from_config(&config, events.clone());
    let mut agent = Agent::new(config, client, events);
    if let Some(prompter) = &prompter {
        agent = agent.with_prompter(prompter.clone());
    }
    let interrupts = spawn_interrupt_handler(agent.control().clone(), prompter.clone());

    let mut run: BoxFuture<'_, Result<RunResult, AgentError>> = if args.plan {
        agent.run_plan(&task).map(|r| r.map(RunResult::Plan)).boxed()
    } else {
        agent
            .run_task(&task, args.resume.as_deref())
            .map(|r| r.map(RunResult::Task))
            .boxed()
    };

    let result = loop {
        tokio::select! {
            result = &mut run => break result,
            event = rx.recv() => match event {
                Ok(event) => render_event(&event, format),
                Err(RecvError::Lagged(n)) => tracing::warn!("Dropped {} events", n),
                Err(RecvError::Closed) => {}
            },
        }
    };
    loop {
        match rx.try_recv() {
            Ok(event) => render_event(&event, format),
            Err(TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
    drop(run);
    interrupts.abort();

    match result? {
        RunResult::Task(outcome) => display_outcome(&outcome, format),
        RunResult::Plan(report) => display_report(&report, format),
    }
    if show_todos {
        println!("\n{}", agent.todos().render());
    }
    Ok(())
}

fn print_banner(config: &Config, task: &str) {
    if config.output_format == OutputFormat::Minimal {
        return;
    }
    println!("🚀 SWE Agent");
    if !task.is_empty() {
        println!("📋 Task: {}", task);
    }
    println!("🔐 Permission Level: {}", config.permission_level);
    println!(
        "🎛️  Interactive Mode: {}",
        if config.interactive { "Yes" } else { "No" }
    );
    println!(
        "📝 Todo Updates: {}",
        if config.show_todo_updates {
            "Enabled"
        } else {
            "Disabled"
        }
    );
    println!("📁 Working Directory: {}", config.workspace_path.display());
}

fn render_event(event: &AgentEvent, format: OutputFormat) {
    if let Some(line) = event_line(event, format) {
        println!("{}", line);
    }
}

/// Console line for an event, if the output format shows it.
fn event_line(event: &AgentEvent, format: OutputFormat) -> Option<String> {
    let detailed = format == OutputFormat::Detailed;
    if format == OutputFormat::Minimal {
        return match event {
            AgentEvent::Error { message } => Some(format!("❌ {}", message)),
            _ => None,
        };
    }

    match event {
        AgentEvent::TaskStarted { task_id, .. } => Some(format!("🆕 Task {}", task_id)),
        AgentEvent::TaskResumed {
            task_id,
            completed_steps,
            current_step,
        } => Some(format!(
            "🔄 Resuming task {} ({} steps completed, current: {})",
            task_id, completed_steps, current_step
        )),
        AgentEvent::Iteration { number } if detailed => {
            Some(format!("\n--- Iteration {} ---", number))
        }
        AgentEvent::Thinking { content } if detailed => Some(format!("💭 {}", content)),
        AgentEvent::ToolCall { name, args, .. } => {
            if detailed {
                Some(format!("🔧 {} {}", name, args))
            } else {
                Some(format!("🔧 {}", name))
            }
        }
        AgentEvent::ToolResult {
            name,
            success,
            summary,
            ..
        } if detailed => Some(format!(
            "{} {}: {}",
            if *success { "✅" } else { "❌" },
            name,
            summary
        )),
        AgentEvent::TodoUpdated {
            status,
            description,
            ..
        } => Some(format!(
            "📝 {} {} [{}]",
            status.icon(),
            description,
            status.as_str().to_uppercase()
        )),
        AgentEvent::SummaryCreated {
            summary_id,
            accomplishments,
        } => Some(format!(
            "📋 Summary {} created ({} accomplishments)",
            summary_id, accomplishments
        )),
        AgentEvent::Throttled { wait_ms } if detailed => {
            Some(format!("⏳ Throttled for {}ms", wait_ms))
        }
        AgentEvent::Retrying {
            attempt,
            delay_ms,
            error,
        } => Some(format!(
            "🔁 Retry {} in {}ms: {}",
            attempt, delay_ms, error
        )),
        AgentEvent::ModelSwitched { from, to } => {
            Some(format!("🔀 Switched model {} → {}", from, to))
        }
        AgentEvent::SubtaskStarted { id, description } => {
            Some(format!("▶️  Subtask {}: {}", id, description))
        }
        AgentEvent::SubtaskFinished { id, success, .. } => Some(format!(
            "{} Subtask {} {}",
            if *success { "✅" } else { "❌" },
            id,
            if *success { "completed" } else { "failed" }
        )),
        AgentEvent::Paused => Some("⏸️  Paused".to_string()),
        AgentEvent::Resumed => Some("▶️  Resumed".to_string()),
        AgentEvent::Error { message } => Some(format!("❌ {}", message)),
        _ => None,
    }
}

fn display_outcome(outcome: &TaskOutcome, format: OutputFormat) {
    let status = if outcome.success {
        "✅ Task completed"
    } else {
        "❌ Task failed"
    };
    match format {
        OutputFormat::Minimal => println!("\n{}", status),
        OutputFormat::Standard | OutputFormat::Detailed => {
            println!("\n📊 Results:");
            println!("{} after {} iterations", status, outcome.iterations);
            if let Some(error) = &outcome.error {
                println!("Error: {}", error);
            }
            if !outcome.success && outcome.resume_possible {
                println!(
                    "💾 State saved. Resume with: swe-agent run --resume {}",
                    outcome.task_id
                );
            }
            if format == OutputFormat::Detailed {
                println!(
                    "Tokens: {} prompt / {} completion",
                    outcome.usage.prompt_tokens, outcome.usage.completion_tokens
                );
                if let Some(response) = &outcome.final_response {
                    println!("\n📄 Final Response:\n{}", response);
                }
            }
        }
    }
}

fn display_report(report: &TaskReport, format: OutputFormat) {
    match format {
        OutputFormat::Minimal => {
            let success = report.success_rate > 0.5;
            println!(
                "\n{} Task {}",
                if success { "✅" } else { "❌" },
                if success { "completed" } else { "failed" }
            );
        }
        OutputFormat::Standard | OutputFormat::Detailed => {
            println!("\n📊 Results:");
            println!("Success Rate: {:.1}%", report.success_rate * 100.0);
            println!(
                "Subtasks: {}/{}",
                report.subtasks_completed, report.subtasks_total
            );
            if format == OutputFormat::Detailed && !report.final_report.is_empty() {
                println!("\n📄 Final Report:\n{}", report.final_report);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use swe_agent::todos::TodoStatus;

    #[test]
    fn run_flags_override_config() {
        let cli = Cli::try_parse_from([
            "swe-agent",
            "run",
            "fix the tests",
            "--non-interactive",
            "--hide-todos",
            "--permission",
            "safe",
            "--output-format",
            "minimal",
            "--max-iterations",
            "5",
            "--model",
            "test-model",
        ])
        .unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.task.as_deref(), Some("fix the tests"));

        let mut config = Config::new("key".into(), "default".into(), PathBuf::from("."));
        config.interactive = true;
        args.apply(&mut config).unwrap();
        assert!(!config.interactive);
        assert!(!config.show_todo_updates);
        assert_eq!(config.permission_level, PermissionLevel::Safe);
        assert_eq!(config.output_format, OutputFormat::Minimal);
        assert_eq!(config.max_iterations, 5);
        assert_eq!(config.default_model, "test-model");
    }

    #[test]
    fn conflicting_flags_are_rejected() {
        assert!(
            Cli::try_parse_from(["swe-agent", "run", "--interactive", "--non-interactive"])
                .is_err()
        );
        assert!(Cli::try_parse_from(["swe-agent", "run", "--output-format", "fancy"]).is_err());
        assert!(
            Cli::try_parse_from(["swe-agent", "run", "--plan", "--resume", "latest"]).is_err()
        );
        assert!(Cli::try_parse_from(["swe-agent", "run", "--resume", "latest"]).is_ok());
    }

    #[test]
    fn working_dir_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::new("key".into(), "m".into(), PathBuf::from("."));

        let cli = Cli::try_parse_from([
            "swe-agent",
            "run",
            "--working-dir",
            dir.path().to_str().unwrap(),
        ])
        .unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        args.apply(&mut config).unwrap();
        assert_eq!(config.workspace_path, dir.path().canonicalize().unwrap());

        let missing = dir.path().join("missing");
        let cli = Cli::try_parse_from([
            "swe-agent",
            "run",
            "--working-dir",
            missing.to_str().unwrap(),
        ])
        .unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert!(args.apply(&mut config).is_err());
    }

    #[test]
    fn minimal_format_only_shows_errors() {
        let call = AgentEvent::ToolCall {
            id: "1".into(),
            name: "bash".into(),
            args: json!({"command": "ls"}),
        };
        assert!(event_line(&call, OutputFormat::Minimal).is_none());
        assert_eq!(
            event_line(&call, OutputFormat::Standard).as_deref(),
            Some("🔧 bash")
        );
        assert!(event_line(&call, OutputFormat::Detailed)
            .unwrap()
            .contains("\"command\":\"ls\""));

        let error = AgentEvent::Error {
            message: "boom".into(),
        };
        assert_eq!(
            event_line(&error, OutputFormat::Minimal).as_deref(),
            Some("❌ boom")
        );
    }

    #[test]
    fn todo_updates_render_status() {
        let event = AgentEvent::TodoUpdated {
            id: "main_task".into(),
            status: TodoStatus::InProgress,
            description: "Fix bug".into(),
        };
        let line = event_line(&event, OutputFormat::Standard).unwrap();
        assert!(line.contains("Fix bug"));
        assert!(line.contains("[IN_PROGRESS]"));
    }
}
