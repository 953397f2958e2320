// Copyright (c) 2025 Corynth Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Corynth CLI.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use corynth_core::state::{ExecutionMode, ExecutionStatus};
use corynth_core::{
    ChainOrchestrator, Config, EngineError, Value, WorkflowEngine, WorkflowParser,
};
use corynth_plugins::PluginManager;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const EXIT_SUCCESS: i32 = 0;
const EXIT_FAILURE: i32 = 1;
const EXIT_CANCELLED: i32 = 2;
const EXIT_CONFIG: i32 = 3;

#[derive(Parser)]
#[command(name = "corynth")]
#[command(version, about = "Declarative workflow orchestrator", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a workflow definition
    Validate {
        /// Path to workflow file
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },

    /// Resolve and validate a workflow without executing it
    Plan {
        /// Path to workflow file
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Variable overrides as key=value (value may be JSON)
        #[arg(long = "var", value_name = "KEY=VALUE")]
        vars: Vec<String>,
    },

    /// Execute a workflow
    Apply {
        /// Path to workflow file
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Variable overrides as key=value (value may be JSON)
        #[arg(long = "var", value_name = "KEY=VALUE")]
        vars: Vec<String>,

        /// Maximum concurrent steps
        #[arg(long)]
        max_parallel: Option<usize>,
    },

    /// Inspect persisted executions
    State {
        #[command(subcommand)]
        command: StateCommands,
    },

    /// Manage plugins
    Plugin {
        #[command(subcommand)]
        command: PluginCommands,
    },

    /// Scaffold a new project directory
    Init {
        /// Target directory
        #[arg(value_name = "DIR", default_value = ".")]
        dir: PathBuf,
    },
}

#[derive(Subcommand)]
enum StateCommands {
    /// List recent executions
    List,
    /// Show one execution by id or unique prefix
    Show {
        #[arg(value_name = "ID")]
        id: String,
    },
    /// Delete one execution by id or unique prefix
    Rm {
        #[arg(value_name = "ID")]
        id: String,
    },
    /// Remove old executions
    Cleanup {
        /// Delete executions older than this many days
        #[arg(long)]
        max_age_days: Option<u64>,

        /// Keep only the newest N executions
        #[arg(long)]
        keep: Option<usize>,
    },
}

#[derive(Subcommand)]
enum PluginCommands {
    /// List discovered plugins
    List,
    /// Install a plugin from the configured repositories
    Install {
        #[arg(value_name = "NAME")]
        name: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("corynth={}", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{} {}", "Error:".red().bold(), err);
            std::process::exit(EXIT_CONFIG);
        }
    };

    let code = match run(cli.command, config).await {
        Ok(code) => code,
        Err(err) => {
            error!("{}", err);
            eprintln!("{} {:#}", "Error:".red().bold(), err);
            exit_code_for(&err)
        }
    };
    std::process::exit(code);
}

async fn run(command: Commands, config: Config) -> Result<i32> {
    match command {
        Commands::Validate { file } => validate_workflow(&file),
        Commands::Plan { file, vars } => {
            run_workflow(&file, vars, ExecutionMode::Plan, None, config).await
        }
        Commands::Apply {
            file,
            vars,
            max_parallel,
        } => run_workflow(&file, vars, ExecutionMode::Apply, max_parallel, config).await,
        Commands::State { command } => state_command(command, config).await,
        Commands::Plugin { command } => plugin_command(command, config).await,
        Commands::Init { dir } => init_project(&dir),
    }
}

/// Maps engine errors onto the documented exit codes.
fn exit_code_for(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<EngineError>() {
        Some(EngineError::Cancelled) => EXIT_CANCELLED,
        Some(EngineError::Config(_)) => EXIT_CONFIG,
        _ => EXIT_FAILURE,
    }
}

fn validate_workflow(file: &Path) -> Result<i32> {
    info!("validating workflow: {}", file.display());
    println!("{} {}", "Validating:".cyan().bold(), file.display());

    let workflow = WorkflowParser::parse_file(file)?;

    println!("{}", "✓ Workflow is valid".green().bold());
    println!("  Name: {}", workflow.name);
    if let Some(version) = &workflow.version {
        println!("  Version: {version}");
    }
    println!("  Steps: {}", workflow.steps.len());
    if !workflow.depends_on_workflows.is_empty() {
        println!("  Dependencies: {}", workflow.depends_on_workflows.len());
    }
    if !workflow.trigger_workflows.is_empty() {
        println!("  Triggers: {}", workflow.trigger_workflows.len());
    }
    Ok(EXIT_SUCCESS)
}

async fn run_workflow(
    file: &Path,
    vars: Vec<String>,
    mode: ExecutionMode,
    max_parallel: Option<usize>,
    mut config: Config,
) -> Result<i32> {
    if let Some(parallel) = max_parallel {
        config.orchestration.execution.max_concurrent = parallel.max(1);
    }

    let workflow = WorkflowParser::parse_file(file)?;
    let variables = parse_vars(vars)?;

    let store = corynth_state::open_store(&config)
        .await
        .map_err(EngineError::State)?;
    let plugins = PluginManager::new(config.plugins.clone());
    let engine = WorkflowEngine::new(plugins.clone(), store, config);
    let orchestrator = ChainOrchestrator::new(engine);

    let verb = match mode {
        ExecutionMode::Plan => "Planning",
        ExecutionMode::Apply => "Applying",
    };
    println!(
        "{} {} ({})",
        verb.cyan().bold(),
        workflow.name,
        file.display()
    );

    // Ctrl-C flips the cancellation signal; the run drains and reports
    // cancelled.
    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\ninterrupt received, cancelling run");
            let _ = cancel_tx.send(true);
        }
    });

    let result = orchestrator
        .execute_chain(&workflow, variables, mode, cancel_rx)
        .await?;

    plugins.shutdown().await;
    print_run_summary(&result);

    let code = match result.main.status {
        ExecutionStatus::Success => EXIT_SUCCESS,
        ExecutionStatus::Cancelled => EXIT_CANCELLED,
        _ => EXIT_FAILURE,
    };
    Ok(code)
}

fn print_run_summary(result: &corynth_core::ChainResult) {
    for dep in &result.dependencies {
        let marker = if dep.error.is_some() {
            "✗".red()
        } else if dep.reused {
            "↺".cyan()
        } else {
            "✓".green()
        };
        println!("  {} dependency {}", marker, dep.workflow_file);
    }

    for step in &result.main.steps {
        let marker = match step.status {
            ExecutionStatus::Success => "✓".green(),
            ExecutionStatus::Skipped => "-".dimmed(),
            ExecutionStatus::Cancelled => "⊘".yellow(),
            _ => "✗".red(),
        };
        let attempts = if step.attempts.len() > 1 {
            format!(" ({} attempts)", step.attempts.len()).dimmed().to_string()
        } else {
            String::new()
        };
        println!("  {} {}{}", marker, step.step_name, attempts);
        if let Some(err) = &step.error {
            println!("      {}", err.red());
        }
    }

    for trigger in &result.triggers {
        if trigger.fired {
            let marker = if trigger.error.is_some() {
                "✗".red()
            } else {
                "✓".green()
            };
            println!("  {} trigger {}", marker, trigger.workflow_file);
        }
    }

    match result.main.status {
        ExecutionStatus::Success => {
            println!("{}", "✓ Run succeeded".green().bold());
            if !result.main.outputs.is_empty() {
                println!("\n{}", "Outputs:".cyan().bold());
                println!(
                    "{}",
                    serde_json::to_string_pretty(&result.main.outputs)
                        .unwrap_or_else(|_| "{}".to_string())
                );
            }
        }
        ExecutionStatus::Cancelled => println!("{}", "⊘ Run cancelled".yellow().bold()),
        status => {
            println!("{} ({status})", "✗ Run failed".red().bold());
            if let Some(message) = &result.main.error_message {
                println!("  {message}");
            }
        }
    }
}

async fn state_command(command: StateCommands, config: Config) -> Result<i32> {
    let store = corynth_state::open_store(&config)
        .await
        .map_err(EngineError::State)?;

    match command {
        StateCommands::List => {
            let executions = store.list_executions().await.map_err(EngineError::State)?;
            if executions.is_empty() {
                println!("no executions recorded");
                return Ok(EXIT_SUCCESS);
            }
            for execution in executions {
                let id = execution.id.to_string();
                println!(
                    "{}  {:<24} {:<10} {}",
                    &id[..8],
                    execution.workflow_name,
                    execution.status.to_string(),
                    execution.start_time.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
        StateCommands::Show { id } => {
            let execution = store.load_execution(&id).await.map_err(EngineError::State)?;
            println!("{}", serde_json::to_string_pretty(&execution)?);
        }
        StateCommands::Rm { id } => {
            store
                .delete_execution(&id)
                .await
                .map_err(EngineError::State)?;
            println!("{} {}", "Deleted".green().bold(), id);
        }
        StateCommands::Cleanup { max_age_days, keep } => {
            let max_age = max_age_days.map(|days| std::time::Duration::from_secs(days * 86400));
            let removed = store
                .cleanup(max_age, keep)
                .await
                .map_err(EngineError::State)?;
            println!("{} {} execution(s)", "Removed".green().bold(), removed);
        }
    }
    Ok(EXIT_SUCCESS)
}

async fn plugin_command(command: PluginCommands, config: Config) -> Result<i32> {
    match command {
        PluginCommands::List => {
            let manager = PluginManager::new(config.plugins);
            let plugins = manager.discover_all().await;
            for plugin in plugins {
                println!(
                    "  {} {:<16} {:<8} {}",
                    "●".green(),
                    plugin.name.cyan(),
                    plugin.transport(),
                    plugin.metadata.description.dimmed()
                );
            }
            manager.shutdown().await;
        }
        PluginCommands::Install { name } => {
            let installer = corynth_plugins::PluginInstaller::new(&config.plugins);
            let path = installer
                .install(&name)
                .await
                .map_err(EngineError::Plugin)?;
            println!(
                "{} {} -> {}",
                "Installed".green().bold(),
                name,
                path.display()
            );
        }
    }
    Ok(EXIT_SUCCESS)
}

fn init_project(dir: &Path) -> Result<i32> {
    let workflows = dir.join("workflows");
    std::fs::create_dir_all(&workflows)
        .with_context(|| format!("cannot create '{}'", workflows.display()))?;

    let config_path = dir.join("corynth.yaml");
    if !config_path.exists() {
        std::fs::write(&config_path, SAMPLE_CONFIG).context("cannot write corynth.yaml")?;
        println!("{} {}", "Created".green().bold(), config_path.display());
    }

    let sample_path = workflows.join("hello.hcl");
    if !sample_path.exists() {
        std::fs::write(&sample_path, SAMPLE_WORKFLOW).context("cannot write hello.hcl")?;
        println!("{} {}", "Created".green().bold(), sample_path.display());
    }

    println!(
        "\nrun it with: {}",
        format!("corynth apply {}", sample_path.display()).cyan()
    );
    Ok(EXIT_SUCCESS)
}

/// Parses `--var key=value` pairs; values parse as JSON when possible and
/// fall back to plain strings.
fn parse_vars(pairs: Vec<String>) -> Result<HashMap<String, Value>> {
    let mut vars = HashMap::new();
    for pair in pairs {
        let (key, raw) = pair
            .split_once('=')
            .with_context(|| format!("--var '{pair}' is not key=value"))?;
        let value = match serde_json::from_str::<serde_json::Value>(raw) {
            Ok(json) => Value::from_json(json),
            Err(_) => Value::String(raw.to_string()),
        };
        vars.insert(key.to_string(), value);
    }
    Ok(vars)
}

const SAMPLE_CONFIG: &str = r#"plugins:
  local_path: ~/.corynth/plugins
  auto_install: true
  repositories:
    - name: official
      url: https://github.com/corynth/plugins.git
      branch: main
      priority: 10

state:
  backend: local
  state_dir: ~/.corynth/state

orchestration:
  execution:
    max_concurrent: 5
    default_timeout_seconds: 300
"#;

const SAMPLE_WORKFLOW: &str = r#"workflow "hello" {
  description = "Smallest possible workflow"
  version     = "1.0.0"

  variable "name" {
    type    = "string"
    default = "World"
  }

  step "greet" {
    plugin = "shell"
    action = "exec"
    params = {
      command = "echo Hello, ${var.name}"
    }
  }

  output "greeting" {
    value = "${step.greet.stdout}"
  }
}
"#;
