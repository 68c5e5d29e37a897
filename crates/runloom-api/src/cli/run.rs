//! `loom run` and `loom check`.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Args;
use console::style;
use runloom_core::repository::StateStore;
use runloom_core::workflow::executor::WorkflowExecutor;
use runloom_core::workflow::preflight::check_all;
use runloom_types::event::EngineEvent;
use runloom_types::run::{NodeStatus, RunStatus};
use uuid::Uuid;

use super::{load_dag, parse_payload, print_run_detail};
use crate::state::AppState;

#[derive(Args)]
pub struct RunArgs {
    /// DAG file (.json, .yaml or .yml).
    pub dag: PathBuf,

    /// Event payload as JSON, or `@file.json`.
    #[arg(long)]
    pub payload: Option<String>,

    /// User the run acts on behalf of.
    #[arg(long, default_value = "cli")]
    pub user: String,

    /// Workflow id recorded on the run (defaults to the file stem).
    #[arg(long)]
    pub workflow_id: Option<String>,

    /// Workflow version recorded on the run.
    #[arg(long, default_value = "1.0")]
    pub version: String,

    /// Answer actions locally instead of calling the provider.
    #[arg(long)]
    pub dry_run: bool,
}

fn default_workflow_id(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("adhoc")
        .to_string()
}

pub async fn handle_run(args: RunArgs, state: &AppState, json: bool, quiet: bool) -> Result<()> {
    let dag = load_dag(&args.dag)?;
    let payload = parse_payload(args.payload.as_deref())?;
    let workflow_id = args
        .workflow_id
        .unwrap_or_else(|| default_workflow_id(&args.dag));

    let progress = (!json && !quiet).then(|| spawn_progress_printer(state));

    let run_id = state
        .engine
        .execute(dag, payload, &args.user, &workflow_id, &args.version)
        .await
        .context("run was not started")?;

    if let Some(handle) = progress {
        handle.abort();
    }

    report_run(state, &run_id, json, quiet).await
}

/// Print the settled run, failing the command if the run failed.
pub async fn report_run(state: &AppState, run_id: &Uuid, json: bool, quiet: bool) -> Result<()> {
    let store = state.engine.store();
    let run = store
        .get_run(run_id)
        .await?
        .with_context(|| format!("run {run_id} disappeared"))?;
    if !quiet {
        let nodes = store.list_nodes(run_id).await?;
        print_run_detail(&run, &nodes, json)?;
    }
    if run.status == RunStatus::Failed {
        bail!(
            "run {run_id} failed: {}",
            run.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

/// Print one line per settled node while a run executes.
fn spawn_progress_printer(state: &AppState) -> tokio::task::JoinHandle<()> {
    let mut events = state.engine.event_bus().subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                EngineEvent::NodeSettled {
                    node_key,
                    status,
                    from_cache,
                    ..
                } => {
                    let mark = match status {
                        NodeStatus::Done => style("✓").green(),
                        NodeStatus::Error => style("✗").red(),
                        _ => style("-").dim(),
                    };
                    let cached = if from_cache { " (cached)" } else { "" };
                    println!("  {mark} {node_key}{}", style(cached).dim());
                }
                EngineEvent::NodeRetrying {
                    node_key,
                    attempt,
                    delay_ms,
                    error,
                    ..
                } => {
                    println!(
                        "  {} {node_key} attempt {attempt} failed, retrying in {delay_ms} ms: {}",
                        style("↻").yellow(),
                        style(error).dim()
                    );
                }
                EngineEvent::RunFinished { .. } => break,
                _ => {}
            }
        }
    })
}

pub fn handle_check(path: &Path, json: bool) -> Result<()> {
    let dag = load_dag(path)?;
    let problems = check_all(&dag);

    if json {
        let out = serde_json::json!({
            "valid": problems.is_empty(),
            "nodes": dag.nodes.len(),
            "edges": dag.edges.len(),
            "problems": problems.iter().map(ToString::to_string).collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else if problems.is_empty() {
        println!(
            "  {} {} ({} nodes, {} edges)",
            style("✓").green(),
            path.display(),
            dag.nodes.len(),
            dag.edges.len()
        );
    } else {
        println!("  {} {}", style("✗").red(), path.display());
        for problem in &problems {
            println!("    - {problem}");
        }
    }

    if !problems.is_empty() {
        bail!("{} structural problem(s) found", problems.len());
    }
    Ok(())
}
