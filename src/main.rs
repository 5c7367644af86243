//! Conductor CLI Entry Point
//!
//! Provides command-line interface for workflow execution.
//!
//! # Usage
//!
//! ```bash
//! # Execute a workflow
//! conductor run workflow.yaml --config conductor.yaml
//!
//! # Pass the workflow input from a JSON file
//! conductor run workflow.yaml --input request.json
//!
//! # Override the concurrency budget and run deadline
//! conductor run workflow.yaml --parallel 8 --deadline-ms 30000
//!
//! # Print the full result as JSON
//! conductor run workflow.yaml --json
//!
//! # Check a workflow without running it
//! conductor validate workflow.yaml
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use colored::Colorize;
use log::{error, info, warn};
use serde_json::Value;

use conductor::execution::{RunOptions, StepState, WorkflowResult, WorkflowStatus};
use conductor::monitoring::ExecutionTimeline;
use conductor::workflow::{load_workflow, validate_all, WorkflowGraph};
use conductor::{load_config, Engine, EngineConfig, APP_NAME, VERSION};

#[derive(Parser)]
#[command(name = "conductor", version, about = "Workflow orchestration engine for multi-service pipelines")]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a workflow
    Run {
        /// Path to workflow YAML file
        workflow: PathBuf,

        /// JSON file holding the workflow input
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Engine configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Maximum in-flight steps
        #[arg(short, long)]
        parallel: Option<usize>,

        /// Run deadline in milliseconds
        #[arg(long)]
        deadline_ms: Option<u64>,

        /// Print the result as JSON instead of a summary
        #[arg(long)]
        json: bool,
    },
    /// Check a workflow definition without running it
    Validate {
        /// Path to workflow YAML file
        workflow: PathBuf,
    },
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

/// Prints the application banner with version information.
fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME.bold(), VERSION);
    println!("Workflow Orchestration Engine");
    println!();
}

fn read_input(path: Option<&Path>) -> Result<Value, Box<dyn std::error::Error>> {
    let Some(path) = path else {
        return Ok(Value::Object(Default::default()));
    };
    let text = fs::read_to_string(path)
        .map_err(|e| format!("Could not read input from '{}': {}", path.display(), e))?;
    Ok(serde_json::from_str(&text)?)
}

fn status_label(status: WorkflowStatus) -> String {
    let label = status.to_string();
    match status {
        WorkflowStatus::Succeeded => label.green().bold().to_string(),
        WorkflowStatus::PartialSuccess => label.yellow().bold().to_string(),
        _ => label.red().bold().to_string(),
    }
}

fn state_label(state: StepState) -> String {
    let label = format!("{:10}", state.to_string());
    match state {
        StepState::Succeeded => label.green().to_string(),
        StepState::Failed => label.red().to_string(),
        StepState::Skipped | StepState::Cancelled => label.yellow().to_string(),
        _ => label.dimmed().to_string(),
    }
}

/// Prints a per-step summary and the timeline.
fn print_summary(result: &WorkflowResult) {
    println!();
    println!(
        "Workflow '{}' v{} ({}): {}",
        result.workflow_id,
        result.version,
        result.run_id,
        status_label(result.status)
    );
    println!();

    for step in &result.steps {
        let mut line = format!("  {:20} {}", step.id, state_label(step.status));
        if step.attempts > 1 {
            line.push_str(&format!(" {} attempts", step.attempts));
        }
        if let Some(ms) = step.duration_ms {
            line.push_str(&format!(" {} ms", ms));
        }
        if step.optional {
            line.push_str(&" (optional)".dimmed().to_string());
        }
        println!("{}", line);
        if let Some(err) = &step.error {
            println!("  {:20} {}", "", err.to_string().red());
        }
    }

    if let Some(fault) = &result.fault {
        println!();
        println!("{} {}", "Fault:".red().bold(), fault);
    }

    print!("{}", ExecutionTimeline::from_events(&result.events).gantt_chart());

    if result.is_success() {
        println!();
        match serde_json::to_string_pretty(&result.output) {
            Ok(output) => println!("Output:\n{}", output),
            Err(e) => error!("Could not render output: {}", e),
        }
    }
}

async fn run_workflow(
    workflow_path: &Path,
    input: Option<&Path>,
    config_path: Option<&Path>,
    parallel: Option<usize>,
    deadline_ms: Option<u64>,
    json: bool,
) -> Result<bool, Box<dyn std::error::Error>> {
    let mut config = match config_path {
        Some(path) => load_config(path)?,
        None => EngineConfig::default(),
    };
    if let Some(parallel) = parallel {
        config = config.with_max_concurrency(parallel);
    }
    if let Some(ms) = deadline_ms {
        config = config.with_default_deadline(Some(Duration::from_millis(ms)));
    }

    let workflow = load_workflow(workflow_path).map_err(|e| {
        error!("Failed to load workflow: {}", e);
        format!(
            "Could not load workflow from '{}': {}",
            workflow_path.display(),
            e
        )
    })?;
    info!(
        "Workflow loaded: {} steps, {} endpoints",
        workflow.len(),
        workflow.endpoints().len()
    );

    let input = read_input(input)?;
    let engine = Engine::from_config(config)?;

    for endpoint in workflow.endpoints() {
        if !engine.registry().contains(&endpoint) {
            warn!("No service configured for endpoint '{}'", endpoint);
        }
    }

    let result = engine
        .run(Arc::new(workflow), input, RunOptions::default())
        .await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_summary(&result);
    }

    Ok(result.is_success())
}

fn validate_workflow(path: &Path) -> Result<bool, Box<dyn std::error::Error>> {
    let yaml = fs::read_to_string(path)
        .map_err(|e| format!("Could not read workflow from '{}': {}", path.display(), e))?;
    let graph: WorkflowGraph = serde_yaml::from_str(&yaml)?;

    let errors = validate_all(&graph);
    if errors.is_empty() {
        println!(
            "{} '{}' v{}: {} steps, {} endpoints",
            "Valid".green().bold(),
            graph.id(),
            graph.version(),
            graph.len(),
            graph.endpoints().len()
        );
        return Ok(true);
    }

    println!("{} '{}':", "Invalid".red().bold(), graph.id());
    for err in &errors {
        println!("  - {}", err);
    }
    Ok(false)
}

/// Main application entry point.
async fn run(cli: Cli) -> Result<bool, Box<dyn std::error::Error>> {
    match cli.command {
        Commands::Run {
            workflow,
            input,
            config,
            parallel,
            deadline_ms,
            json,
        } => {
            run_workflow(
                &workflow,
                input.as_deref(),
                config.as_deref(),
                parallel,
                deadline_ms,
                json,
            )
            .await
        }
        Commands::Validate { workflow } => validate_workflow(&workflow),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    setup_logging(cli.verbose);
    if !matches!(cli.command, Commands::Run { json: true, .. }) {
        print_banner();
    }

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
