//! Canonical default values shared by the server and agent binaries.

use std::time::Duration;

/// Server control-channel bind address.
pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:7070";

/// Server state database URL.
pub const DEFAULT_DB_URL: &str = "sqlite:coffer.db?mode=rwc";

/// Heartbeat cadence on the agent.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// An agent with no traffic for this many heartbeat intervals is offline.
pub const LIVENESS_MULTIPLIER: u32 = 3;

/// Bounded timeout for one assignment send to an agent.
pub const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Deadline for transactional store operations.
pub const STORE_OP_DEADLINE: Duration = Duration::from_secs(30);

/// Deadline for point reads against the store.
pub const STORE_READ_DEADLINE: Duration = Duration::from_secs(5);

/// Grace period for sessions to close on server shutdown.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(15);

/// Capacity of the agent-side job queue. Overflow is rejected and the
/// server redelivers on the next session.
pub const AGENT_QUEUE_CAPACITY: usize = 16;

/// Maximum pending jobs replayed per reconnect.
pub const REDELIVERY_BATCH_LIMIT: i64 = 50;

/// Reconnect backoff.
pub const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
pub const BACKOFF_MAX: Duration = Duration::from_secs(60);
pub const BACKOFF_FACTOR: f64 = 2.0;
pub const JITTER_FRACTION: f64 = 0.2;
