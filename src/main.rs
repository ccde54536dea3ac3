use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use colored::Colorize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

use workflow_interpreter::domain::graph::node::NodeState;
use workflow_interpreter::domain::interpreter::config::{ForEachPolicy, InterpreterConfig};
use workflow_interpreter::domain::interpreter::control::{WorkflowControl, WorkflowExecutionState};
use workflow_interpreter::domain::interpreter::outcome::WorkflowOutcome;
use workflow_interpreter::domain::interpreter::scheduler::WorkflowInterpreter;
use workflow_interpreter::domain::services::InterpreterServices;
use workflow_interpreter::domain::services::event_bus::InMemoryEventBus;
use workflow_interpreter::domain::simulator::task_simulator::SimulatedTaskService;
use workflow_interpreter::{load_config, load_workflow, logger};

/// Interpreter for scientific workflow graphs
#[derive(Parser)]
#[command(name = "workflow-interpreter")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workflow against the simulated execution service
    Run {
        /// Path to the workflow graph (JSON)
        #[arg(long)]
        graph: String,

        /// Path to the interpreter settings (JSON)
        #[arg(long)]
        config: Option<String>,

        /// Workflow input as name=value, the value is parsed as JSON if possible
        #[arg(long = "input", value_name = "NAME=VALUE")]
        inputs: Vec<String>,

        /// Combine ForEach inputs as a cross product instead of zipping them
        #[arg(long)]
        cross_product: bool,

        /// Pause after every scheduler pass and wait for Enter
        #[arg(long)]
        step: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    logger::init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run { graph, config, inputs, cross_product, step } => run(&graph, config.as_deref(), &inputs, cross_product, step).await,
    }
}

async fn run(graph_path: &str, config_path: Option<&str>, raw_inputs: &[String], cross_product: bool, step: bool) -> Result<()> {
    let graph = load_workflow(graph_path).with_context(|| format!("Could not load workflow '{}'", graph_path))?;

    let mut config = match config_path {
        Some(path) => load_config(path).with_context(|| format!("Could not load config '{}'", path))?,
        None => InterpreterConfig::default(),
    };
    if cross_product {
        config.for_each_policy = ForEachPolicy::CrossProduct;
    }

    let inputs = parse_inputs(raw_inputs)?;

    let event_bus = Arc::new(InMemoryEventBus::new());
    let task_service = Arc::new(SimulatedTaskService::new(event_bus.clone()).with_jitter(Duration::from_millis(20)));
    let services = InterpreterServices::new(task_service, event_bus);

    let cancel = CancellationToken::new();
    let interpreter = WorkflowInterpreter::new(graph, services, config).with_cancellation(cancel.clone());

    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Interrupted, cancelling the workflow.");
            interrupt.cancel();
        }
    });

    if step {
        tokio::spawn(drive_steps(interpreter.control()));
    }

    let outcome = interpreter.run(inputs).await?;
    print_outcome(&outcome);

    if !outcome.is_completed() {
        bail!("Workflow {} failed", outcome.workflow_id);
    }
    Ok(())
}

fn parse_inputs(raw_inputs: &[String]) -> Result<HashMap<String, Value>> {
    let mut inputs = HashMap::new();
    for raw in raw_inputs {
        let Some((name, value)) = raw.split_once('=') else {
            bail!("Input '{}' is not of the form name=value", raw);
        };
        let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
        inputs.insert(name.trim().to_string(), value);
    }
    Ok(inputs)
}

/// Switches the run into step mode and advances it one pass per line on stdin.
async fn drive_steps(control: WorkflowControl) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut started = false;

    loop {
        match control.state() {
            WorkflowExecutionState::Running => {
                started = true;
                let _ = control.step();
            }
            WorkflowExecutionState::Paused => {
                eprintln!("{}", "Paused. Press Enter to run the next pass.".yellow());
                match lines.next_line().await {
                    Ok(Some(_)) => {
                        let _ = control.step();
                    }
                    _ => {
                        let _ = control.resume();
                        return;
                    }
                }
            }
            WorkflowExecutionState::None if started => return,
            _ => {}
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn print_outcome(outcome: &WorkflowOutcome) {
    let status = if outcome.is_completed() { format!("{:?}", outcome.status).green().bold() } else { format!("{:?}", outcome.status).red().bold() };
    println!("Workflow {}: {}", outcome.workflow_id, status);

    if !outcome.outputs.is_empty() {
        println!("{}", "Outputs:".bold());
        for (name, value) in &outcome.outputs {
            println!("  {} = {}", name.cyan(), value);
        }
    }

    println!("{}", "Nodes:".bold());
    for (node, state) in &outcome.node_states {
        let state = match state {
            NodeState::Finished => "Finished".green(),
            NodeState::Failed => "Failed".red(),
            NodeState::Executing => "Executing".yellow(),
            NodeState::Waiting => "Waiting".dimmed(),
        };
        println!("  {:<32} {}", node, state);
    }

    if !outcome.errors.is_empty() {
        println!("{}", "Errors:".bold());
        for error in &outcome.errors {
            println!("  {}", error.to_string().red());
        }
    }
}
