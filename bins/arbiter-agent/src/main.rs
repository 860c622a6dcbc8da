mod aggregator;
mod compiler;
mod config;
mod ingest;
mod judge;
mod materialize;
mod runner;
mod sequencer;
mod server;

use crate::aggregator::ContestCollector;
use crate::config::Settings;
use crate::ingest::Pipeline;
use crate::judge::LineChecker;
use crate::materialize::{FsStore, MaterializeCtx};
use crate::runner::RunController;
use crate::sequencer::Sequencer;
use crate::server::AppState;
use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "arbiter-agent")]
#[command(about = "Editor companion daemon: ingests pushed problems and judges solutions", long_about = None)]
struct Cli {
    /// Path to the settings file (defaults to ./arbiter.json when present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Loopback port for the companion listener
    #[arg(short, long)]
    port: Option<u16>,

    /// Workspace root for materialized problems
    #[arg(short, long)]
    workspace: Option<PathBuf>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    info!("Arbiter agent booting...");

    let cli = Cli::parse();
    let mut settings = Settings::load_or_default(cli.config.as_deref())?;
    if let Some(port) = cli.port {
        settings.port = port;
    }
    if let Some(workspace) = cli.workspace {
        settings.workspace_root = workspace;
    }
    let settings = Arc::new(settings);

    info!(
        workspace = %settings.workspace_root.display(),
        languages = settings.languages.len(),
        "Settings loaded"
    );

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();

    // Drain UI events to the log; the editor bridge subscribes here.
    tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(encoded) => info!(event = %encoded, "ui event"),
                Err(e) => warn!(error = %e, "failed to encode ui event"),
            }
        }
    });

    let pipeline = Pipeline {
        collector: ContestCollector::new(
            settings.grace_delay(),
            settings.collect_timeout(),
            settings.processing_reset(),
        ),
        sequencer: Sequencer::new(settings.sequencer_retention()),
        mat: MaterializeCtx::new(settings.clone(), Arc::new(FsStore), events_tx.clone()),
        events: events_tx.clone(),
    };
    let runner = Arc::new(RunController::new(
        settings.clone(),
        Arc::new(LineChecker),
        events_tx.clone(),
    ));
    let state = Arc::new(AppState {
        pipeline,
        runner,
        pending: Mutex::new(None),
        events: events_tx,
    });

    let app = server::router(state);

    let addr = format!("127.0.0.1:{}", settings.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("Companion listener on {}", addr);
    info!("Ready to accept pushed problems");

    let shutdown = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "failed to install CTRL+C signal handler");
            return;
        }
        warn!("Received shutdown signal");
    };

    let serve = async { axum::serve(listener, app).await };
    tokio::select! {
        result = serve => result.context("Server error")?,
        _ = shutdown => {},
    }

    info!("Agent shutdown complete");
    Ok(())
}
