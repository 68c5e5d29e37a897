//! CLI definitions for the `loom` binary.

pub mod run;
pub mod runs;
pub mod workflow;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use clap_complete::Shell;
use comfy_table::{presets, Cell, Color, ContentArrangement, Table};
use console::style;
use runloom_types::dag::Dag;
use runloom_types::run::{NodeExecution, NodeStatus, RunStatus, WorkflowRun};
use serde_json::Value;

/// Execute workflow DAGs against event payloads.
#[derive(Parser)]
#[command(name = "loom", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Export spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true)]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a DAG file once against a payload.
    #[command(disable_version_flag = true)]
    Run(run::RunArgs),

    /// Preflight a DAG file without running it.
    Check {
        /// DAG file (.json, .yaml or .yml).
        dag: PathBuf,
    },

    /// Register and launch workflow versions.
    Workflow {
        #[command(subcommand)]
        action: workflow::WorkflowCommand,
    },

    /// Inspect recorded runs.
    Runs {
        #[command(subcommand)]
        action: runs::RunsCommand,
    },

    /// Start the REST API server.
    Serve {
        #[arg(short, long)]
        port: Option<u16>,

        #[arg(long)]
        host: Option<String>,

        /// Answer actions locally instead of calling the provider.
        #[arg(long)]
        dry_run: bool,
    },

    /// Generate shell completions.
    Completions {
        shell: Shell,
    },
}

// ---------------------------------------------------------------------------
// Input helpers
// ---------------------------------------------------------------------------

/// Load a DAG from JSON or YAML, chosen by file extension.
pub fn load_dag(path: &Path) -> Result<Dag> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let is_yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml" | "yml")
    );
    let dag = if is_yaml {
        serde_yaml_ng::from_str(&content)
            .with_context(|| format!("invalid workflow YAML in {}", path.display()))?
    } else {
        serde_json::from_str(&content)
            .with_context(|| format!("invalid workflow JSON in {}", path.display()))?
    };
    Ok(dag)
}

/// Parse a payload argument: inline JSON, or `@path` to read a file.
pub fn parse_payload(raw: Option<&str>) -> Result<Value> {
    let Some(raw) = raw else {
        return Ok(Value::Object(Default::default()));
    };
    let text = match raw.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read payload file {path}"))?,
        None => raw.to_string(),
    };
    serde_json::from_str(&text).context("payload is not valid JSON")
}

// ---------------------------------------------------------------------------
// Output helpers
// ---------------------------------------------------------------------------

fn status_cell(status: RunStatus) -> Cell {
    let color = match status {
        RunStatus::Success => Color::Green,
        RunStatus::Failed => Color::Red,
        RunStatus::Running => Color::Yellow,
    };
    Cell::new(status).fg(color)
}

fn node_status_cell(status: NodeStatus) -> Cell {
    let color = match status {
        NodeStatus::Done => Color::Green,
        NodeStatus::Error => Color::Red,
        NodeStatus::Skipped => Color::DarkGrey,
        _ => Color::Yellow,
    };
    Cell::new(status).fg(color)
}

/// Print a run and its nodes, as JSON or a styled summary with a table.
pub fn print_run_detail(run: &WorkflowRun, nodes: &[NodeExecution], json: bool) -> Result<()> {
    if json {
        let out = serde_json::json!({ "run": run, "nodes": nodes });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    let status = match run.status {
        RunStatus::Success => style(run.status.to_string()).green().bold(),
        RunStatus::Failed => style(run.status.to_string()).red().bold(),
        RunStatus::Running => style(run.status.to_string()).yellow().bold(),
    };
    println!();
    println!(
        "  Run {} of '{}' v{}: {}",
        style(run.id).cyan(),
        run.workflow_id,
        run.version,
        status
    );
    if let Some(error) = &run.error {
        println!("  Error: {}", style(error).red());
    }
    if let Some(finished) = run.finished_at {
        let ms = (finished - run.started_at).num_milliseconds();
        println!("  Duration: {ms} ms");
    }

    if nodes.is_empty() {
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Node").fg(Color::Cyan),
            Cell::new("Type"),
            Cell::new("Status"),
            Cell::new("Attempts"),
            Cell::new("Cached"),
            Cell::new("Error"),
        ]);
    for node in nodes {
        table.add_row(vec![
            Cell::new(&node.node_key),
            Cell::new(node.node_type),
            node_status_cell(node.status),
            Cell::new(node.attempt),
            Cell::new(if node.from_cache { "yes" } else { "" }),
            Cell::new(node.error.as_deref().unwrap_or("")),
        ]);
    }
    println!();
    println!("{table}");
    println!();
    Ok(())
}

/// Print a list of runs.
pub fn print_run_list(runs: &[WorkflowRun], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(runs)?);
        return Ok(());
    }
    if runs.is_empty() {
        println!();
        println!("  No runs recorded.");
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Run ID").fg(Color::Cyan),
            Cell::new("Version"),
            Cell::new("Status"),
            Cell::new("Started"),
            Cell::new("Error"),
        ]);
    for run in runs {
        table.add_row(vec![
            Cell::new(run.id),
            Cell::new(&run.version),
            status_cell(run.status),
            Cell::new(run.started_at.format("%Y-%m-%d %H:%M:%S")),
            Cell::new(run.error.as_deref().unwrap_or("")),
        ]);
    }
    println!();
    println!("{table}");
    println!();
    Ok(())
}
