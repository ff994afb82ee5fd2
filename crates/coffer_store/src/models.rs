//! Entity models as read from and written to the store.

use chrono::{DateTime, Utc};
use coffer_protocol::{
    AgentId, AgentStatus, Capabilities, DestinationId, DestinationKind, JobId, JobStatus,
    LogLevel, PolicyId, RetentionPolicy, SnapshotId,
};
use serde::{Deserialize, Serialize};

/// A registered backup agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub name: String,
    /// Natural key used to reunify an agent with its record on reconnect.
    pub hostname: String,
    pub os: String,
    pub arch: String,
    pub version: String,
    pub capabilities: Capabilities,
    pub status: AgentStatus,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A storage destination. `config` and `credentials` are JSON blobs of
/// `DestinationConfig` / `DestinationCredentials`; `credentials` is
/// decrypted on read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Destination {
    pub id: DestinationId,
    pub name: String,
    pub kind: DestinationKind,
    pub config: String,
    pub credentials: String,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Destination {
    pub fn new(name: impl Into<String>, kind: DestinationKind, config: String) -> Self {
        let now = Utc::now();
        Self {
            id: DestinationId::generate(),
            name: name.into(),
            kind,
            config,
            credentials: String::new(),
            enabled: true,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Declarative description of what to back up, when, and where.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    pub id: PolicyId,
    pub name: String,
    /// Owning agent. Jobs pin this value at creation time.
    pub agent_id: AgentId,
    /// Standard 5-field cron expression.
    pub schedule: String,
    pub enabled: bool,
    pub sources: Vec<String>,
    /// Repository password, decrypted on read.
    pub repo_password: String,
    pub retention: RetentionPolicy,
    pub hook_pre_backup: String,
    pub hook_post_backup: String,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Policy {
    pub fn new(
        name: impl Into<String>,
        agent_id: AgentId,
        schedule: impl Into<String>,
        sources: Vec<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: PolicyId::generate(),
            name: name.into(),
            agent_id,
            schedule: schedule.into(),
            enabled: true,
            sources,
            repo_password: String::new(),
            retention: RetentionPolicy::default(),
            hook_pre_backup: String::new(),
            hook_post_backup: String::new(),
            last_run_at: None,
            next_run_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// One destination attached to a policy, with its dispatch priority
/// (lower first).
#[derive(Debug, Clone)]
pub struct PolicyDestinationDetail {
    pub destination: Destination,
    pub priority: i32,
}

/// One execution of a policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub policy_id: PolicyId,
    pub agent_id: AgentId,
    pub status: JobStatus,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn pending(policy_id: PolicyId, agent_id: AgentId) -> Self {
        Self {
            id: JobId::generate(),
            policy_id,
            agent_id,
            status: JobStatus::Pending,
            error: None,
            started_at: None,
            ended_at: None,
            created_at: Utc::now(),
        }
    }
}

/// Per-destination outcome of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDestination {
    pub job_id: JobId,
    pub destination_id: DestinationId,
    pub status: JobStatus,
    pub snapshot_id: Option<String>,
    pub size_bytes: Option<i64>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// A log line to append for a job.
#[derive(Debug, Clone)]
pub struct NewJobLog {
    pub job_id: JobId,
    pub level: LogLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// A stored log line. Ordered by timestamp, then insertion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobLogLine {
    pub id: i64,
    pub job_id: JobId,
    pub level: LogLevel,
    pub message: String,
    pub logged_at: DateTime<Utc>,
}

/// A job with its per-destination outcomes and logs.
#[derive(Debug, Clone)]
pub struct JobDetails {
    pub job: Job,
    pub destinations: Vec<JobDestination>,
    pub logs: Vec<JobLogLine>,
}

/// Cached record of an engine-written snapshot, indexed for listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: SnapshotId,
    pub policy_id: PolicyId,
    pub destination_id: DestinationId,
    /// Opaque id assigned by the backup engine.
    pub engine_id: String,
    pub size_bytes: Option<i64>,
    pub created_at: DateTime<Utc>,
}
