//! Coffer control-plane server.
//!
//! Usage:
//!     coffer-server --bind 0.0.0.0:7070 --db sqlite:coffer.db?mode=rwc

use anyhow::{Context, Result};
use clap::Parser;
use coffer_protocol::defaults;
use coffer_server::control::{ControlConfig, ControlServer};
use coffer_server::dispatch::Dispatcher;
use coffer_server::events::EventBus;
use coffer_server::registry::Registry;
use coffer_server::scheduler::Scheduler;
use coffer_server::sweeper::{run_sweeper, SweeperConfig};
use coffer_store::Store;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "coffer-server", about = "Coffer backup control plane")]
struct Args {
    /// Control-channel bind address
    #[arg(long, env = "COFFER_BIND", default_value = defaults::DEFAULT_BIND_ADDR)]
    bind: String,

    /// State database URL
    #[arg(long, env = "COFFER_DB", default_value = defaults::DEFAULT_DB_URL)]
    db: String,

    /// Shared secret agents must present; empty disables authentication
    #[arg(long, env = "COFFER_SHARED_SECRET", default_value = "")]
    shared_secret: String,

    /// Expected agent heartbeat interval in seconds
    #[arg(long, env = "COFFER_HEARTBEAT_INTERVAL", default_value_t = 30)]
    heartbeat_interval_secs: u64,

    /// Liveness sweep cadence in seconds
    #[arg(long, env = "COFFER_SWEEP_INTERVAL", default_value_t = 30)]
    sweep_interval_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "coffer_server=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    info!("Starting Coffer server");
    info!("  Bind: {}", args.bind);
    info!("  Database: {}", args.db);

    let store = Store::open(&args.db)
        .await
        .context("failed to open state database")?;
    store.init().await.context("failed to initialize schema")?;

    let shutdown = CancellationToken::new();
    let registry = Arc::new(Registry::new(defaults::SEND_TIMEOUT));
    let events = EventBus::new(256);
    let dispatcher = Arc::new(Dispatcher::new(registry.clone(), events.clone()));

    let scheduler = Scheduler::new(store.clone(), dispatcher, shutdown.child_token());
    let loaded = scheduler.load_enabled().await?;
    info!("Scheduler loaded {} enabled policies", loaded);
    let scheduler_task = scheduler.start();

    let sweeper_task = tokio::spawn(run_sweeper(
        SweeperConfig {
            interval: Duration::from_secs(args.sweep_interval_secs),
            offline_after: Duration::from_secs(
                args.heartbeat_interval_secs * defaults::LIVENESS_MULTIPLIER as u64,
            ),
        },
        store.clone(),
        events.clone(),
        shutdown.child_token(),
    ));

    let control = ControlServer::new(
        ControlConfig {
            shared_secret: args.shared_secret,
        },
        store,
        registry.clone(),
        events,
        Arc::new(scheduler),
    );
    let listener = TcpListener::bind(&args.bind)
        .await
        .with_context(|| format!("failed to bind {}", args.bind))?;
    let control_task = tokio::spawn(control.run(listener, shutdown.child_token()));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown signal received");
    shutdown.cancel();

    // Give sessions and background tasks a grace period to wind down.
    // Cron ticks that already materialized a job leave it pending, which
    // is safe: the dispatch path is idempotent at the agent layer.
    let drain = async {
        let _ = control_task.await;
        let _ = scheduler_task.await;
        let _ = sweeper_task.await;
    };
    if tokio::time::timeout(defaults::SHUTDOWN_GRACE, drain)
        .await
        .is_err()
    {
        warn!("grace period expired, forcing shutdown");
    }
    registry.shutdown();

    info!("Coffer server stopped");
    Ok(())
}
