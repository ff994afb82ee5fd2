//! Agent configuration (flags with env fallbacks).

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[command(name = "coffer-agent", about = "Coffer backup agent")]
pub struct AgentConfig {
    /// Server control-channel address (host:port)
    #[arg(long, env = "COFFER_SERVER_ADDR")]
    pub server_addr: String,

    /// Shared secret presented on session open; empty sends no secret
    #[arg(long, env = "COFFER_SHARED_SECRET", default_value = "")]
    pub shared_secret: String,

    /// Directory for the persisted agent id and extracted binaries
    #[arg(long, env = "COFFER_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    /// Agent version reported on registration
    #[arg(long, env = "COFFER_VERSION", default_value = env!("CARGO_PKG_VERSION"))]
    pub version: String,

    /// Path to the backup engine binary (overrides extraction/PATH lookup)
    #[arg(long, env = "COFFER_ENGINE_PATH")]
    pub engine_path: Option<PathBuf>,

    /// Heartbeat cadence in seconds
    #[arg(long, env = "COFFER_HEARTBEAT_INTERVAL", default_value_t = 30)]
    pub heartbeat_interval_secs: u64,

    /// Hook timeout in seconds
    #[arg(long, env = "COFFER_HOOK_TIMEOUT", default_value_t = 300)]
    pub hook_timeout_secs: u64,

    /// Reconnect backoff start in seconds
    #[arg(long, default_value_t = 1)]
    pub backoff_initial_secs: u64,

    /// Reconnect backoff cap in seconds
    #[arg(long, default_value_t = 60)]
    pub backoff_max_secs: u64,

    /// Backoff multiplier per failed session
    #[arg(long, default_value_t = 2.0)]
    pub backoff_factor: f64,

    /// Fraction of random jitter applied to each backoff sleep
    #[arg(long, default_value_t = 0.2)]
    pub jitter_fraction: f64,
}

impl AgentConfig {
    pub fn state_dir(&self) -> PathBuf {
        self.state_dir.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".coffer-agent")
        })
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn hook_timeout(&self) -> Duration {
        Duration::from_secs(self.hook_timeout_secs.max(1))
    }

    pub fn backoff_initial(&self) -> Duration {
        Duration::from_secs(self.backoff_initial_secs.max(1))
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_secs(self.backoff_max_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_invocation_parses_with_defaults() {
        let config =
            AgentConfig::try_parse_from(["coffer-agent", "--server-addr", "127.0.0.1:7070"])
                .unwrap();
        assert_eq!(config.server_addr, "127.0.0.1:7070");
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(config.backoff_initial(), Duration::from_secs(1));
        assert_eq!(config.backoff_max(), Duration::from_secs(60));
        assert!(config.shared_secret.is_empty());
    }
}
