//! Gavel – Auction Service binary.
//!
//! Boots the stores, wires the components together and runs until ctrl-c:
//!   • hot store + expiry evictor
//!   • durable store (sled) + change feed
//!   • lifecycle manager (event loop, reconciler, carry worker, anti-snipe)
//!   • hot → durable synchroniser
//!   • fan-out registry + WebSocket listener

#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::{signal, sync::mpsc, sync::watch, time};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use auction_service::{
    bid_engine::BidEngine,
    config::GavelConfig,
    fanout::{ws, FanoutRegistry},
    lifecycle::LifecycleManager,
    sync::SyncWorker,
};
use gavel_store::{DurableStore, HotConfig, HotStore};

/// CLI entry-point.
#[derive(Debug, Parser)]
#[command(name = "gavel-auctiond", version, about = "Gavel auction engine")]
struct Cli {
    /// Explicit path to a configuration file (overrides default discovery).
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the service with the provided / discovered configuration.
    Run,
    /// Print the effective configuration and exit.
    ShowConfig,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .json()
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let cfg = GavelConfig::load(cli.config.as_deref()).context("configuration load failed")?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::ShowConfig => {
            println!("{}", serde_json::to_string_pretty(&cfg)?);
            Ok(())
        }
        Commands::Run => run(cfg).await,
    }
}

async fn run(cfg: GavelConfig) -> anyhow::Result<()> {
    info!(service = %cfg.service.name, "🔨 starting gavel auction service");

    // 1. Stores ---------------------------------------------------------------
    let hot = Arc::new(HotStore::new(HotConfig::from(&cfg.hot)));
    let durable = Arc::new(
        DurableStore::open(&cfg.durable.path)
            .with_context(|| format!("opening durable store at {}", cfg.durable.path))?,
    );

    // 2. Channels -------------------------------------------------------------
    let (broadcast_tx, broadcast_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // 3. Components -----------------------------------------------------------
    let lifecycle = LifecycleManager::new(
        hot.clone(),
        durable.clone(),
        cfg.clone(),
        broadcast_tx.clone(),
    );
    let registry = FanoutRegistry::new(hot.clone(), durable.clone(), cfg.fanout.clone());
    let engine = Arc::new(BidEngine::new(
        hot.clone(),
        durable.clone(),
        cfg.anti_snipe.clone(),
        cfg.fanout.clone(),
        lifecycle.snipe_sender(),
        broadcast_tx.clone(),
    ));

    // 4. Startup priming: balances flow hot ← durable exactly once.
    let sync_worker = SyncWorker::new(hot.clone(), durable.clone(), cfg.sync.cadence);
    sync_worker.prime_balances().context("balance priming failed")?;

    // 5. Background tasks -----------------------------------------------------
    let mut handles = Vec::new();
    handles.extend(lifecycle.spawn(shutdown_rx.clone()));
    handles.extend(registry.spawn(broadcast_rx, shutdown_rx.clone()));
    handles.push(sync_worker.spawn(shutdown_rx.clone()));
    let evictor = hot.clone().spawn_evictor();

    // 6. Subscription listener ------------------------------------------------
    let gateway = Arc::new(ws::GatewayState {
        engine,
        registry: registry.clone(),
        heartbeat: cfg.fanout.heartbeat,
    });
    let app = ws::router(gateway);
    let addr = cfg.listener.addr();
    info!(%addr, "subscription channel listening");

    let server = axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(async {
            let _ = signal::ctrl_c().await;
            info!("received <ctrl-c>; shutting down");
        });

    if let Err(err) = server.await {
        error!(error = %err, "listener crashed");
    }

    // 7. Graceful drain: stop accepting work, let tasks wind down.
    let _ = shutdown_tx.send(true);
    evictor.abort();
    let drain = async {
        for handle in handles {
            let _ = handle.await;
        }
    };
    if time::timeout(cfg.service.shutdown_timeout, drain).await.is_err() {
        error!("shutdown timeout exceeded; exiting with tasks still running");
    }

    info!("gavel auction service stopped");
    Ok(())
}
