//! Liveness sweeper.
//!
//! The server never polls agents. Liveness comes from heartbeats and
//! stream closure; this background task covers the remaining case of a
//! session that went silent without closing, marking agents offline once
//! their last-seen exceeds the threshold.

use chrono::{Duration as ChronoDuration, Utc};
use coffer_store::Store;
use serde_json::json;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::{agent_topic, EventBus};

pub struct SweeperConfig {
    /// How often to sweep.
    pub interval: Duration,
    /// Agents silent for longer than this go offline
    /// (3 heartbeat intervals by default).
    pub offline_after: Duration,
}

pub async fn run_sweeper(
    config: SweeperConfig,
    store: Store,
    events: EventBus,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(config.interval);
    let offline_after = ChronoDuration::from_std(config.offline_after)
        .unwrap_or_else(|_| ChronoDuration::seconds(90));
    info!(offline_after_secs = offline_after.num_seconds(), "liveness sweeper started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let cutoff = Utc::now() - offline_after;
                match store.mark_agents_offline_older_than(cutoff).await {
                    Ok(swept) => {
                        for agent_id in swept {
                            warn!(agent_id = %agent_id, "agent went silent, marked offline");
                            events.publish(agent_topic(agent_id), "offline", json!({ "reason": "liveness timeout" }));
                        }
                    }
                    Err(e) => warn!("liveness sweep failed: {e}"),
                }
            }
            _ = shutdown.cancelled() => {
                debug!("liveness sweeper stopped");
                return;
            }
        }
    }
}
