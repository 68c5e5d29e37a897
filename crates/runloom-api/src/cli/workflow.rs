//! `loom workflow` subcommands: register, versions, launch.

use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use clap::Subcommand;
use console::style;
use runloom_core::repository::WorkflowStore;
use runloom_core::workflow::preflight::check_all;

use super::run::report_run;
use super::{load_dag, parse_payload};
use crate::state::AppState;

#[derive(Subcommand)]
pub enum WorkflowCommand {
    /// Register (or replace) a workflow version from a DAG file.
    #[command(disable_version_flag = true)]
    Register {
        workflow_id: String,
        version: String,
        /// DAG file (.json, .yaml or .yml).
        dag: PathBuf,
    },

    /// List registered versions of a workflow.
    Versions { workflow_id: String },

    /// Launch a registered version with a raw trigger event.
    #[command(disable_version_flag = true)]
    Launch {
        workflow_id: String,
        #[arg(default_value = "1.0")]
        version: String,

        /// Trigger event as JSON, or `@file.json`.
        #[arg(long)]
        event: Option<String>,

        #[arg(long, default_value = "cli")]
        user: String,

        /// Return once the run is created instead of waiting for it.
        #[arg(long)]
        detach: bool,

        /// Answer actions locally instead of calling the provider.
        #[arg(long)]
        dry_run: bool,
    },
}

impl WorkflowCommand {
    /// Whether this command executes actions without `--dry-run`.
    pub fn needs_provider(&self) -> bool {
        matches!(self, WorkflowCommand::Launch { dry_run: false, .. })
    }
}

pub async fn handle_workflow_command(
    cmd: WorkflowCommand,
    state: &AppState,
    json: bool,
    quiet: bool,
) -> Result<()> {
    match cmd {
        WorkflowCommand::Register {
            workflow_id,
            version,
            dag,
        } => handle_register(state, &workflow_id, &version, &dag, json).await,
        WorkflowCommand::Versions { workflow_id } => {
            handle_versions(state, &workflow_id, json).await
        }
        WorkflowCommand::Launch {
            workflow_id,
            version,
            event,
            user,
            detach,
            ..
        } => {
            let event = parse_payload(event.as_deref())?;
            let launcher = state.launcher();
            if detach {
                let run_id = launcher
                    .launch_detached(&workflow_id, &version, &event, &user)
                    .await?;
                if json {
                    println!("{}", serde_json::json!({ "run_id": run_id }));
                } else if !quiet {
                    println!("  Launched run {}", style(run_id).cyan());
                }
                return Ok(());
            }
            let run_id = launcher.launch(&workflow_id, &version, &event, &user).await?;
            report_run(state, &run_id, json, quiet).await
        }
    }
}

async fn handle_register(
    state: &AppState,
    workflow_id: &str,
    version: &str,
    path: &Path,
    json: bool,
) -> Result<()> {
    let dag = load_dag(path)?;
    let problems = check_all(&dag);
    if !problems.is_empty() {
        for problem in &problems {
            eprintln!("  - {problem}");
        }
        bail!("refusing to register: {} structural problem(s)", problems.len());
    }

    state.workflows.save_version(workflow_id, version, &dag).await?;

    if json {
        let out = serde_json::json!({
            "workflow_id": workflow_id,
            "version": version,
            "nodes": dag.nodes.len(),
            "edges": dag.edges.len(),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!(
            "  {} Registered '{}' v{} ({} nodes)",
            style("*").green().bold(),
            style(workflow_id).cyan(),
            version,
            dag.nodes.len()
        );
    }
    Ok(())
}

async fn handle_versions(state: &AppState, workflow_id: &str, json: bool) -> Result<()> {
    let versions = state.workflows.list_versions(workflow_id).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&versions)?);
    } else if versions.is_empty() {
        println!("  No versions registered for '{workflow_id}'.");
    } else {
        for version in versions {
            println!("  {version}");
        }
    }
    Ok(())
}
