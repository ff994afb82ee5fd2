//! Control-channel payload types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::ProtocolError;
use crate::ids::{AgentId, DestinationId, JobId, PolicyId};

// ============================================================================
// Canonical enums (used across all crates)
// ============================================================================

/// Lifecycle of a job as persisted by the server.
///
/// State machine: `pending -> running -> {succeeded | failed | cancelled}`.
/// Once terminal a job never re-enters a non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Created, not yet delivered or not yet started. The only state
    /// eligible for redelivery.
    #[default]
    Pending,
    /// The agent has started executing.
    Running,
    /// Every destination succeeded.
    Succeeded,
    /// At least one destination failed, or the run aborted.
    Failed,
    /// Cancelled before completion.
    Cancelled,
}

impl JobStatus {
    pub const ALL: &'static [JobStatus] = &[
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Succeeded,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "succeeded" => Ok(JobStatus::Succeeded),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" | "canceled" => Ok(JobStatus::Cancelled),
            _ => Err(format!("invalid job status: '{}'", s)),
        }
    }
}

/// Status values agents put on the wire in a [`StatusReport`].
///
/// Distinct from [`JobStatus`]: the wire enum is frozen for compatibility
/// and carries an `Unspecified` slot the server rejects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReportedStatus {
    Unspecified,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ReportedStatus {
    /// Map to the persisted status. `None` for `Unspecified`, which the
    /// server answers with `INVALID_ARGUMENT`.
    pub fn to_job_status(self) -> Option<JobStatus> {
        match self {
            ReportedStatus::Unspecified => None,
            ReportedStatus::Running => Some(JobStatus::Running),
            ReportedStatus::Completed => Some(JobStatus::Succeeded),
            ReportedStatus::Failed => Some(JobStatus::Failed),
            ReportedStatus::Cancelled => Some(JobStatus::Cancelled),
        }
    }
}

/// Log line severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            _ => Err(format!("invalid log level: '{}'", s)),
        }
    }
}

/// Reachability of an agent as tracked by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Online,
    Offline,
    #[default]
    Unknown,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Online => "online",
            AgentStatus::Offline => "offline",
            AgentStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for AgentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "online" => Ok(AgentStatus::Online),
            "offline" => Ok(AgentStatus::Offline),
            "unknown" => Ok(AgentStatus::Unknown),
            _ => Err(format!("invalid agent status: '{}'", s)),
        }
    }
}

/// Which engine features are installed on an agent host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Capabilities {
    pub restic: bool,
    pub rclone: bool,
    pub docker: bool,
}

// ============================================================================
// Session payloads
// ============================================================================

/// First frame on every connection. Carries the shared secret; an empty
/// secret means no authentication was configured on the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloPayload {
    pub secret: String,
    pub protocol_version: u8,
}

/// Agent -> Server: upsert this agent by hostname and return its stable id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub hostname: String,
    pub version: String,
    pub os: String,
    pub arch: String,
    #[serde(default)]
    pub capabilities: Capabilities,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterAck {
    pub agent_id: AgentId,
    pub agent_name: String,
}

/// Agent -> Server: open the job stream for this session. The server marks
/// the agent online, registers the session in the registry, and replays
/// pending jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenStreamRequest {
    pub agent_id: AgentId,
}

/// Lightweight host metrics carried on heartbeats. Published to observers,
/// never persisted beyond the agent's last-seen timestamp.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct AgentMetrics {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub agent_id: AgentId,
    #[serde(default)]
    pub metrics: AgentMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatAck {
    /// Reserved. Always false today; agents must not rely on it.
    pub has_pending_jobs: bool,
}

/// Agent -> Server: advance the job state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub job_id: JobId,
    pub agent_id: AgentId,
    pub status: ReportedStatus,
    #[serde(default)]
    pub message: String,
    pub timestamp: DateTime<Utc>,
    /// Per-destination outcomes, populated on terminal reports.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub destinations: Vec<DestinationOutcome>,
}

/// Outcome of one destination within a job, reported with the terminal
/// status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationOutcome {
    pub destination_id: DestinationId,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

/// One element of a per-job log stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub job_id: JobId,
    pub agent_id: AgentId,
    pub level: LogLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// End of a per-job log stream. The server flushes its buffer on receipt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogClose {
    pub job_id: JobId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogCloseAck {
    pub entries_received: u64,
}

/// Status-code taxonomy for errors that cross the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Unauthenticated,
    InvalidArgument,
    NotFound,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Unauthenticated => "UNAUTHENTICATED",
            ErrorCode::InvalidArgument => "INVALID_ARGUMENT",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
}

// ============================================================================
// Job dispatch
// ============================================================================

/// Kind of work carried by a [`JobAssignment`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobType {
    #[default]
    Backup,
}

/// Server -> Agent: one job to execute.
///
/// The inner payload is an encoded [`BackupPayload`]; it stays JSON so new
/// fields never break the wire format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobAssignment {
    pub job_id: JobId,
    pub policy_id: PolicyId,
    pub job_type: JobType,
    pub payload: Vec<u8>,
    pub scheduled_at: DateTime<Utc>,
}

impl JobAssignment {
    /// Build a backup assignment around an encoded payload.
    pub fn backup(
        job_id: JobId,
        policy_id: PolicyId,
        payload: &BackupPayload,
        scheduled_at: DateTime<Utc>,
    ) -> Result<Self, ProtocolError> {
        Ok(Self {
            job_id,
            policy_id,
            job_type: JobType::Backup,
            payload: serde_json::to_vec(payload)?,
            scheduled_at,
        })
    }

    pub fn decode_backup_payload(&self) -> Result<BackupPayload, ProtocolError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

/// Snapshot retention window (keep counts per period).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub keep_daily: u32,
    pub keep_weekly: u32,
    pub keep_monthly: u32,
    pub keep_yearly: u32,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            keep_daily: 7,
            keep_weekly: 4,
            keep_monthly: 6,
            keep_yearly: 2,
        }
    }
}

/// The unit of work an agent executes: what to back up, with what secret,
/// to which destinations, in which order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupPayload {
    /// Source references; plain paths or `docker-volume://<name>`.
    pub sources: Vec<String>,
    /// Repository password, plaintext over the authenticated channel.
    pub repo_password: String,
    /// Destinations in priority order, lowest priority value first.
    pub destinations: Vec<DispatchDestination>,
    #[serde(default)]
    pub retention: RetentionPolicy,
    /// Shell command run before the backup; empty means none.
    #[serde(default)]
    pub hook_pre_backup: String,
    /// Shell command run after the backup; empty means none.
    #[serde(default)]
    pub hook_post_backup: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// One destination inside a dispatch payload. The server pre-builds the
/// repository URL and the engine environment; `credentials` and `config`
/// stay opaque to the channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchDestination {
    pub destination_id: DestinationId,
    pub kind: DestinationKind,
    pub repo_url: String,
    #[serde(default)]
    pub credentials: String,
    #[serde(default)]
    pub config: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub priority: i32,
}

// ============================================================================
// Destination variants
// ============================================================================

/// Storage backend type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DestinationKind {
    Local,
    S3,
    Sftp,
    Rest,
    Rclone,
}

impl DestinationKind {
    pub const ALL: &'static [DestinationKind] = &[
        DestinationKind::Local,
        DestinationKind::S3,
        DestinationKind::Sftp,
        DestinationKind::Rest,
        DestinationKind::Rclone,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DestinationKind::Local => "local",
            DestinationKind::S3 => "s3",
            DestinationKind::Sftp => "sftp",
            DestinationKind::Rest => "rest",
            DestinationKind::Rclone => "rclone",
        }
    }
}

impl fmt::Display for DestinationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for DestinationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" => Ok(DestinationKind::Local),
            "s3" => Ok(DestinationKind::S3),
            "sftp" => Ok(DestinationKind::Sftp),
            "rest" => Ok(DestinationKind::Rest),
            "rclone" => Ok(DestinationKind::Rclone),
            _ => Err(format!("invalid destination kind: '{}'", s)),
        }
    }
}

/// Non-sensitive per-backend configuration. Each variant carries exactly
/// the fields its backend needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DestinationConfig {
    Local {
        path: String,
    },
    S3 {
        endpoint: String,
        bucket: String,
        #[serde(default)]
        prefix: String,
        #[serde(default)]
        region: String,
    },
    Sftp {
        host: String,
        #[serde(default = "default_sftp_port")]
        port: u16,
        user: String,
        path: String,
    },
    Rest {
        url: String,
    },
    Rclone {
        remote: String,
        path: String,
    },
}

fn default_sftp_port() -> u16 {
    22
}

impl DestinationConfig {
    pub fn kind(&self) -> DestinationKind {
        match self {
            DestinationConfig::Local { .. } => DestinationKind::Local,
            DestinationConfig::S3 { .. } => DestinationKind::S3,
            DestinationConfig::Sftp { .. } => DestinationKind::Sftp,
            DestinationConfig::Rest { .. } => DestinationKind::Rest,
            DestinationConfig::Rclone { .. } => DestinationKind::Rclone,
        }
    }

    /// Build the repository URL in the form the backup engine accepts.
    pub fn repo_url(&self) -> String {
        match self {
            DestinationConfig::Local { path } => path.clone(),
            DestinationConfig::S3 {
                endpoint,
                bucket,
                prefix,
                ..
            } => {
                let prefix = prefix.trim_matches('/');
                if prefix.is_empty() {
                    format!("s3:{}/{}", endpoint, bucket)
                } else {
                    format!("s3:{}/{}/{}", endpoint, bucket, prefix)
                }
            }
            DestinationConfig::Sftp {
                host,
                port,
                user,
                path,
            } => {
                let path = if path.starts_with('/') {
                    path.clone()
                } else {
                    format!("/{}", path)
                };
                format!("sftp://{}@{}:{}{}", user, host, port, path)
            }
            DestinationConfig::Rest { url } => format!("rest:{}", url),
            DestinationConfig::Rclone { remote, path } => {
                format!("rclone:{}:{}", remote, path)
            }
        }
    }

    /// Non-secret environment the engine needs for this backend.
    pub fn env(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        if let DestinationConfig::S3 { region, .. } = self {
            if !region.is_empty() {
                env.insert("AWS_DEFAULT_REGION".to_string(), region.clone());
            }
        }
        env
    }
}

/// Secret material per backend. Opaque to the channel; only the server's
/// dispatch path and the engine invocation look inside.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DestinationCredentials {
    #[default]
    None,
    S3 {
        access_key_id: String,
        secret_access_key: String,
    },
    Sftp {
        #[serde(default)]
        password: String,
    },
    Rest {
        username: String,
        password: String,
    },
}

impl DestinationCredentials {
    /// Engine environment variables derived from the secret material.
    pub fn env(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        match self {
            DestinationCredentials::None => {}
            DestinationCredentials::S3 {
                access_key_id,
                secret_access_key,
            } => {
                env.insert("AWS_ACCESS_KEY_ID".to_string(), access_key_id.clone());
                env.insert(
                    "AWS_SECRET_ACCESS_KEY".to_string(),
                    secret_access_key.clone(),
                );
            }
            DestinationCredentials::Sftp { .. } => {
                // The engine drives sftp through ssh config; nothing to export.
            }
            DestinationCredentials::Rest { username, password } => {
                env.insert("RESTIC_REST_USERNAME".to_string(), username.clone());
                env.insert("RESTIC_REST_PASSWORD".to_string(), password.clone());
            }
        }
        env
    }
}

// ============================================================================
// Source references
// ============================================================================

/// Reserved prefix for logical container-volume sources. Resolved on the
/// agent to the volume's host mountpoint.
pub const DOCKER_VOLUME_PREFIX: &str = "docker-volume://";

const DOCKER_VOLUME_UNDERSCORE_PREFIX: &str = "docker_volume://";

/// A parsed source reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceRef {
    /// Filesystem path, passed to the engine unchanged.
    Path(String),
    /// Named container volume; the name may be empty here, resolution
    /// rejects it.
    DockerVolume(String),
}

/// Parse one source reference. Only the hyphenated `docker-volume://` form
/// is recognized; the underscore variant is rejected outright.
pub fn parse_source_ref(raw: &str) -> Result<SourceRef, ProtocolError> {
    if let Some(name) = raw.strip_prefix(DOCKER_VOLUME_PREFIX) {
        return Ok(SourceRef::DockerVolume(name.to_string()));
    }
    if raw.starts_with(DOCKER_VOLUME_UNDERSCORE_PREFIX) {
        return Err(ProtocolError::InvalidSourceRef(raw.to_string()));
    }
    Ok(SourceRef::Path(raw.to_string()))
}
