//! `loom`: CLI and REST API entry point for the runloom workflow engine.

mod cli;
mod http;
mod state;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use clap_complete::generate;
use runloom_infra::config::{load_global_config, resolve_data_dir};
use runloom_infra::sqlite::idempotency::purge_interval;
use runloom_observe::tracing_setup::{
    init_tracing, level_for_verbosity, shutdown_tracing, TracingOptions,
};

use cli::{Cli, Commands};
use state::{build_invoker, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(&TracingOptions {
        default_level: level_for_verbosity(cli.verbose, cli.quiet),
        json: cli.log_json,
        otel: cli.otel,
    })
    .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    let result = dispatch(cli).await;
    shutdown_tracing();
    result
}

async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    // Commands that never touch the database.
    match &cli.command {
        Commands::Completions { shell } => {
            let mut cmd = <Cli as clap::CommandFactory>::command();
            generate(*shell, &mut cmd, "loom", &mut std::io::stdout());
            return Ok(());
        }
        Commands::Check { dag } => return cli::run::handle_check(dag, cli.json),
        _ => {}
    }

    let data_dir = resolve_data_dir();
    let config = load_global_config(&data_dir).await;

    let needs_provider = match &cli.command {
        Commands::Run(args) => !args.dry_run,
        Commands::Serve { dry_run, .. } => !dry_run,
        Commands::Workflow { action } => action.needs_provider(),
        _ => false,
    };
    let invoker = build_invoker(&config, !needs_provider)?;
    let state = AppState::init(data_dir, config, invoker).await?;

    match cli.command {
        Commands::Run(args) => cli::run::handle_run(args, &state, cli.json, cli.quiet).await,
        Commands::Workflow { action } => {
            cli::workflow::handle_workflow_command(action, &state, cli.json, cli.quiet).await
        }
        Commands::Runs { action } => {
            cli::runs::handle_runs_command(action, &state, cli.json).await
        }
        Commands::Serve { port, host, .. } => serve(state, host, port).await,
        Commands::Completions { .. } | Commands::Check { .. } => Ok(()),
    }
}

async fn serve(state: AppState, host: Option<String>, port: Option<u16>) -> anyhow::Result<()> {
    let host = host.unwrap_or_else(|| state.config.server.host.clone());
    let port = port.unwrap_or(state.config.server.port);
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    println!(
        "  {} runloom API listening on {} (invoker: {})",
        console::style("⚡").bold(),
        console::style(format!("http://{addr}/api/v1")).cyan(),
        state.engine.invoker_name()
    );
    println!("  Data: {}", state.data_dir.display());
    println!("  {}", console::style("Press Ctrl+C to stop").dim());

    let every = purge_interval(state.config.engine.idempotency_ttl_secs);
    tracing::info!(every_secs = every.as_secs(), "idempotency cache purge scheduled");
    let purge = Arc::clone(&state.cache).spawn_purge_task(every);

    let router = http::router::build_router(state);
    let served = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await;
    purge.abort();
    served?;

    println!("\n  Server stopped.");
    Ok(())
}

/// Resolve on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
