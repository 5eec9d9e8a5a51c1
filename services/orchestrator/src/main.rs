//! emufleet orchestrator
//!
//! `orchestrator serve` (the default) runs the HTTP API and the run
//! scheduler. `orchestrator run-group` is spawned by the scheduler: it reads
//! one group job as JSON on stdin and writes group events to stdout, one
//! JSON object per line.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use emufleet_orchestrator::{
    api,
    config::Config,
    lease::LeaseManager,
    runner::{GroupJob, GroupRunner, StdoutSink},
    state::AppState,
};
use tokio::io::AsyncReadExt;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "orchestrator", version, about = "Emulator + Appium fleet orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the HTTP API (default).
    Serve,
    /// Run one group job read from stdin, reporting events on stdout.
    RunGroup,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            // Initialize tracing (prefer RUST_LOG, fallback to FLEET_LOG_LEVEL)
            tracing_subscriber::registry()
                .with(
                    EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| config.log_level.clone().into()),
                )
                .with(tracing_subscriber::fmt::layer().json())
                .init();
            runtime.block_on(serve(config))
        }
        Command::RunGroup => {
            // stdout carries group events; logs go to stderr.
            tracing_subscriber::registry()
                .with(
                    EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| config.log_level.clone().into()),
                )
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(std::io::stderr),
                )
                .init();
            let ok = runtime.block_on(run_group(config))?;
            if !ok {
                std::process::exit(1);
            }
            Ok(())
        }
    }
}

async fn serve(config: Config) -> Result<()> {
    info!("Starting emufleet orchestrator");
    info!(
        listen_addr = %config.listen_addr,
        isolation = ?config.isolation,
        mock_infra = config.mock_infra,
        "Configuration loaded"
    );

    let listen_addr = config.listen_addr;
    let state = match AppState::from_config(config) {
        Ok(state) => state,
        Err(e) => {
            error!(error = %e, "Failed to initialize orchestrator");
            return Err(e);
        }
    };

    // Create shutdown channel for graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let app = api::create_router(state.clone());
    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    info!(addr = %listen_addr, "Listening for connections");

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut shutdown_rx = shutdown_rx;
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    let _ = shutdown_tx.send(true);

    // Cancel running groups before stopping the servers they lease.
    info!("Stopping scheduling loops...");
    let shutdown_timeout = Duration::from_secs(10);
    if tokio::time::timeout(shutdown_timeout, state.scheduler().shutdown())
        .await
        .is_err()
    {
        warn!("Scheduling loops did not shut down in time");
    }
    state.leases().stop_all().await;

    info!("Orchestrator shutdown complete");
    Ok(())
}

/// Returns whether the group finished without a group-level error.
async fn run_group(config: Config) -> Result<bool> {
    let mut input = String::new();
    tokio::io::stdin()
        .read_to_string(&mut input)
        .await
        .context("reading group job from stdin")?;
    let job: GroupJob = serde_json::from_str(&input).context("parsing group job")?;

    info!(
        session_id = %job.session_id,
        unit = %job.unit_name,
        offset = job.offset,
        assignees = job.assignees.len(),
        "Group process started"
    );

    let leases = Arc::new(LeaseManager::from_config(&config)?);
    let runner = GroupRunner::from_config(&config, leases.clone())?;

    let result = runner.run(&job, &StdoutSink).await;
    leases.stop_all().await;

    match result {
        Ok(()) => Ok(true),
        Err(e) => {
            error!(unit = %job.unit_name, error = %e, "Group failed");
            Ok(false)
        }
    }
}
