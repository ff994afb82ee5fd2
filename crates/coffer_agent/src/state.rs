//! Persisted agent state and startup capability probing.
//!
//! The only durable agent-side state is its own id, written after the
//! first successful registration so reconnects land on the same record.
//! A missing or corrupt file is not an error: the agent simply
//! re-registers by hostname.

use anyhow::{Context, Result};
use coffer_protocol::{AgentId, Capabilities};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::warn;

const STATE_FILE: &str = "agent-state.json";

#[derive(Debug, Serialize, Deserialize)]
struct PersistedState {
    agent_id: AgentId,
}

/// Read the persisted agent id, if any.
pub fn load(state_dir: &Path) -> Option<AgentId> {
    let path = state_dir.join(STATE_FILE);
    let raw = std::fs::read_to_string(&path).ok()?;
    match serde_json::from_str::<PersistedState>(&raw) {
        Ok(state) => Some(state.agent_id),
        Err(e) => {
            warn!("ignoring corrupt state file {}: {}", path.display(), e);
            None
        }
    }
}

/// Persist the agent id atomically (write to temp, then rename).
pub fn save(state_dir: &Path, agent_id: AgentId) -> Result<()> {
    std::fs::create_dir_all(state_dir)
        .with_context(|| format!("failed to create state dir {}", state_dir.display()))?;

    let path = state_dir.join(STATE_FILE);
    let tmp = state_dir.join(format!("{}.tmp", STATE_FILE));
    let raw = serde_json::to_string_pretty(&PersistedState { agent_id })?;
    std::fs::write(&tmp, raw)
        .with_context(|| format!("failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, &path)
        .with_context(|| format!("failed to move state file into place at {}", path.display()))?;
    Ok(())
}

/// The hostname reported on registration; the server's natural key for
/// this agent.
pub fn hostname() -> String {
    sysinfo::System::host_name().unwrap_or_else(|| "unknown-host".to_string())
}

/// Detect which engine features are installed on this host.
pub async fn probe_capabilities() -> Capabilities {
    Capabilities {
        restic: probe("restic", &["version"]).await,
        rclone: probe("rclone", &["version"]).await,
        docker: probe("docker", &["version"]).await,
    }
}

async fn probe(binary: &str, args: &[&str]) -> bool {
    Command::new(binary)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|status| status.success())
        .unwrap_or(false)
}
