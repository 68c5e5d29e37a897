//! `loom runs` subcommands.

use anyhow::{Context, Result};
use clap::Subcommand;
use runloom_core::repository::StateStore;
use uuid::Uuid;

use super::{print_run_detail, print_run_list};
use crate::state::AppState;

#[derive(Subcommand)]
pub enum RunsCommand {
    /// Show a run and its node executions.
    Show { run_id: Uuid },

    /// List recent runs of a workflow, newest first.
    List {
        workflow_id: String,
        #[arg(long, default_value = "20")]
        limit: u32,
    },
}

pub async fn handle_runs_command(cmd: RunsCommand, state: &AppState, json: bool) -> Result<()> {
    let store = state.engine.store();
    match cmd {
        RunsCommand::Show { run_id } => {
            let run = store
                .get_run(&run_id)
                .await?
                .with_context(|| format!("run {run_id} not found"))?;
            let nodes = store.list_nodes(&run_id).await?;
            print_run_detail(&run, &nodes, json)
        }
        RunsCommand::List { workflow_id, limit } => {
            let runs = store.list_runs(&workflow_id, limit).await?;
            print_run_list(&runs, json)
        }
    }
}
