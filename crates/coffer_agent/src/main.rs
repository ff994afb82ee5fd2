//! Coffer backup agent.
//!
//! Usage:
//!     coffer-agent --server-addr backup.example.com:7070

use anyhow::Result;
use clap::Parser;
use coffer_agent::config::AgentConfig;
use coffer_agent::session;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "coffer_agent=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AgentConfig::parse();
    info!("Starting Coffer agent {}", config.version);
    info!("  Server: {}", config.server_addr);
    info!("  State dir: {}", config.state_dir().display());

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            signal_token.cancel();
        }
    });

    // On shutdown the supervisor stops consuming new jobs and lets the
    // in-flight destination finish; dropped queue entries are redelivered
    // by the server on the next session.
    session::run_supervisor(config, shutdown).await
}
