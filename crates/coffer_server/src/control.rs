//! Control channel server.
//!
//! One TCP connection per agent session. The first frame must be `Hello`
//! (session auth), then `Register` and `OpenStream` establish the agent's
//! identity and job stream; heartbeats, status reports, and log streams
//! multiplex over the same connection until it drops.
//!
//! Individual RPC failures never cascade: a bad payload gets an error
//! frame back and the session continues; a failed heartbeat write is
//! logged and swallowed; only transport errors and fatal store failures
//! on the job state machine end the session.

use anyhow::{bail, Context as _, Result};
use chrono::Utc;
use coffer_protocol::{
    wire, AgentId, AgentStatus, ErrorCode, ErrorPayload, Frame, HeartbeatAck, HeartbeatRequest,
    HelloPayload, JobAssignment, JobId, JobStatus, LogClose, LogCloseAck, LogEntry, OpCode,
    OpenStreamRequest, RegisterAck, RegisterRequest, SnapshotId, StatusReport,
};
use coffer_store::{JobDestination, NewJobLog, Snapshot, Store, StoreError};
use serde_json::json;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::events::{agent_topic, job_topic, EventBus};
use crate::registry::Registry;

/// Deadline for the Hello frame after connect.
const HELLO_DEADLINE: Duration = Duration::from_secs(10);

/// Per-session outbound frame queue.
const OUTBOUND_QUEUE: usize = 64;

/// Per-session assignment queue between registry and socket.
const ASSIGN_QUEUE: usize = 16;

/// Narrow seam to the scheduler. The control channel only ever needs
/// pending-job redelivery; implementations spawn and return immediately.
pub trait PendingDispatcher: Send + Sync {
    fn dispatch_pending(&self, agent_id: AgentId);
}

pub struct ControlConfig {
    /// Shared secret agents must present. Empty disables authentication
    /// (dev mode).
    pub shared_secret: String,
}

pub struct ControlServer {
    config: ControlConfig,
    store: Store,
    registry: Arc<Registry>,
    events: EventBus,
    pending: Arc<dyn PendingDispatcher>,
}

impl ControlServer {
    pub fn new(
        config: ControlConfig,
        store: Store,
        registry: Arc<Registry>,
        events: EventBus,
        pending: Arc<dyn PendingDispatcher>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            store,
            registry,
            events,
            pending,
        })
    }

    /// Accept loop. Each connection runs as its own session task.
    pub async fn run(
        self: Arc<Self>,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<()> {
        if self.config.shared_secret.is_empty() {
            warn!("agent authentication disabled: no shared secret configured");
        }
        info!(addr = %listener.local_addr()?, "control channel listening");

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = accepted.context("accept failed")?;
                    let server = self.clone();
                    let session_shutdown = shutdown.child_token();
                    tokio::spawn(async move {
                        server.handle_session(stream, peer, session_shutdown).await;
                    });
                }
                _ = shutdown.cancelled() => {
                    info!("control channel stopped");
                    return Ok(());
                }
            }
        }
    }

    async fn handle_session(
        self: Arc<Self>,
        stream: TcpStream,
        peer: SocketAddr,
        shutdown: CancellationToken,
    ) {
        let _ = stream.set_nodelay(true);
        let (mut reader, writer) = stream.into_split();

        let (out_tx, out_rx) = mpsc::channel::<Frame>(OUTBOUND_QUEUE);
        let writer_task = tokio::spawn(write_loop(writer, out_rx));

        let mut session = Session::new(self.clone(), out_tx);
        debug!(%peer, "agent session opened");

        if let Err(e) = session.run(&mut reader, &shutdown).await {
            debug!(%peer, "agent session ended: {e:#}");
        }
        session.cleanup().await;

        // Closing the outbound queue ends the writer.
        drop(session);
        let _ = writer_task.await;
        debug!(%peer, "agent session closed");
    }
}

async fn write_loop(mut writer: OwnedWriteHalf, mut rx: mpsc::Receiver<Frame>) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = wire::write_frame(&mut writer, &frame).await {
            debug!("session write failed: {e}");
            break;
        }
    }
}

/// State scoped to one agent session.
struct Session {
    server: Arc<ControlServer>,
    out: mpsc::Sender<Frame>,
    /// Set once OpenStream succeeds.
    stream: Option<OpenedStream>,
    /// Log lines buffered per job for the lifetime of each log stream.
    log_buffers: HashMap<JobId, Vec<NewJobLog>>,
}

struct OpenedStream {
    agent_id: AgentId,
    generation: u64,
    forward_task: JoinHandle<()>,
}

impl Session {
    fn new(server: Arc<ControlServer>, out: mpsc::Sender<Frame>) -> Self {
        Self {
            server,
            out,
            stream: None,
            log_buffers: HashMap::new(),
        }
    }

    async fn run(
        &mut self,
        reader: &mut OwnedReadHalf,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        self.authenticate(reader).await?;

        loop {
            tokio::select! {
                frame = wire::read_frame(reader) => {
                    let frame = frame.context("session read failed")?;
                    self.handle_frame(frame).await?;
                }
                _ = shutdown.cancelled() => {
                    debug!("session closing for shutdown");
                    return Ok(());
                }
            }
        }
    }

    /// Validate the Hello preamble. Rejection sends `UNAUTHENTICATED` and
    /// ends the session with no side effects.
    async fn authenticate(&mut self, reader: &mut OwnedReadHalf) -> Result<()> {
        let frame = tokio::time::timeout(HELLO_DEADLINE, wire::read_frame(reader))
            .await
            .context("timed out waiting for hello")?
            .context("failed to read hello")?;

        if frame.header.opcode != OpCode::Hello {
            self.send_error(
                JobId::nil(),
                ErrorCode::InvalidArgument,
                "expected hello as the first frame",
            )
            .await;
            bail!("first frame was {:?}, not hello", frame.header.opcode);
        }

        let hello: HelloPayload = match frame.parse() {
            Ok(hello) => hello,
            Err(e) => {
                self.send_error(JobId::nil(), ErrorCode::InvalidArgument, "malformed hello")
                    .await;
                bail!("malformed hello: {e}");
            }
        };

        let configured = &self.server.config.shared_secret;
        if !configured.is_empty() && hello.secret != *configured {
            self.send_error(
                JobId::nil(),
                ErrorCode::Unauthenticated,
                "invalid shared secret",
            )
            .await;
            bail!("agent failed authentication");
        }
        Ok(())
    }

    async fn handle_frame(&mut self, frame: Frame) -> Result<()> {
        match frame.header.opcode {
            OpCode::Register => self.handle_register(&frame).await,
            OpCode::OpenStream => self.handle_open_stream(&frame).await,
            OpCode::Heartbeat => self.handle_heartbeat(&frame).await,
            OpCode::StatusReport => self.handle_status_report(&frame).await,
            OpCode::LogEntry => self.handle_log_entry(&frame).await,
            OpCode::LogClose => self.handle_log_close(&frame).await,
            OpCode::Error => {
                if let Ok(err) = frame.parse::<ErrorPayload>() {
                    warn!(code = %err.code, "agent reported error: {}", err.message);
                }
                Ok(())
            }
            other => {
                warn!(opcode = ?other, "unexpected opcode from agent");
                Ok(())
            }
        }
    }

    async fn handle_register(&mut self, frame: &Frame) -> Result<()> {
        let request: RegisterRequest = match frame.parse() {
            Ok(request) => request,
            Err(e) => {
                self.send_error(
                    JobId::nil(),
                    ErrorCode::InvalidArgument,
                    "malformed register request",
                )
                .await;
                debug!("malformed register request: {e}");
                return Ok(());
            }
        };

        // Registration is the one store write the session cannot proceed
        // without; a failure here aborts.
        let agent = self
            .server
            .store
            .upsert_agent_by_hostname(&request)
            .await
            .context("agent registration failed")?;

        info!(agent_id = %agent.id, hostname = %agent.hostname, version = %agent.version, "agent registered");
        self.send_json(
            OpCode::RegisterAck,
            JobId::nil(),
            &RegisterAck {
                agent_id: agent.id,
                agent_name: agent.name,
            },
        )
        .await;
        Ok(())
    }

    async fn handle_open_stream(&mut self, frame: &Frame) -> Result<()> {
        let request: OpenStreamRequest = match frame.parse() {
            Ok(request) => request,
            Err(e) => {
                self.send_error(
                    JobId::nil(),
                    ErrorCode::InvalidArgument,
                    "malformed open-stream request",
                )
                .await;
                debug!("malformed open-stream request: {e}");
                return Ok(());
            }
        };

        if self.stream.is_some() {
            self.send_error(
                JobId::nil(),
                ErrorCode::InvalidArgument,
                "job stream already open for this session",
            )
            .await;
            return Ok(());
        }

        let agent_id = request.agent_id;
        let Some(agent) = self.server.store.get_agent(agent_id).await? else {
            self.send_error(JobId::nil(), ErrorCode::NotFound, "unknown agent")
                .await;
            return Ok(());
        };

        if let Err(e) = self
            .server
            .store
            .set_agent_status(agent_id, AgentStatus::Online, Some(Utc::now()))
            .await
        {
            warn!(agent_id = %agent_id, "failed to mark agent online: {e}");
        }

        // Register the stream's send side, replacing any stale session.
        let (assign_tx, mut assign_rx) = mpsc::channel::<JobAssignment>(ASSIGN_QUEUE);
        let generation = self
            .server
            .registry
            .register(agent_id, &agent.hostname, assign_tx);

        // Forward assignments from the registry channel onto the socket.
        let out = self.out.clone();
        let forward_task = tokio::spawn(async move {
            while let Some(assignment) = assign_rx.recv().await {
                let frame = match Frame::json(OpCode::Assign, assignment.job_id, &assignment) {
                    Ok(frame) => frame,
                    Err(e) => {
                        error!(job_id = %assignment.job_id, "failed to encode assignment: {e}");
                        continue;
                    }
                };
                if out.send(frame).await.is_err() {
                    break;
                }
            }
        });

        self.stream = Some(OpenedStream {
            agent_id,
            generation,
            forward_task,
        });

        info!(agent_id = %agent_id, hostname = %agent.hostname, "agent online, job stream open");
        self.server.events.publish(
            agent_topic(agent_id),
            "online",
            json!({ "hostname": agent.hostname }),
        );

        // Exactly once per session, fire-and-forget.
        self.server.pending.dispatch_pending(agent_id);
        Ok(())
    }

    async fn handle_heartbeat(&mut self, frame: &Frame) -> Result<()> {
        let heartbeat: HeartbeatRequest = match frame.parse() {
            Ok(heartbeat) => heartbeat,
            Err(e) => {
                self.send_error(
                    JobId::nil(),
                    ErrorCode::InvalidArgument,
                    "malformed heartbeat",
                )
                .await;
                debug!("malformed heartbeat: {e}");
                return Ok(());
            }
        };

        // A dropped heartbeat write must not break the agent's loop.
        if let Err(e) = self
            .server
            .store
            .set_agent_status(heartbeat.agent_id, AgentStatus::Online, Some(Utc::now()))
            .await
        {
            warn!(agent_id = %heartbeat.agent_id, "heartbeat store write failed: {e}");
        }

        self.server.events.publish(
            agent_topic(heartbeat.agent_id),
            "metrics",
            json!({
                "cpu_percent": heartbeat.metrics.cpu_percent,
                "memory_percent": heartbeat.metrics.memory_percent,
                "disk_percent": heartbeat.metrics.disk_percent,
            }),
        );

        self.send_json(
            OpCode::HeartbeatAck,
            JobId::nil(),
            &HeartbeatAck {
                has_pending_jobs: false,
            },
        )
        .await;
        Ok(())
    }

    async fn handle_status_report(&mut self, frame: &Frame) -> Result<()> {
        let report: StatusReport = match frame.parse() {
            Ok(report) => report,
            Err(e) => {
                self.send_error(
                    frame.header.job_id,
                    ErrorCode::InvalidArgument,
                    "malformed status report",
                )
                .await;
                debug!("malformed status report: {e}");
                return Ok(());
            }
        };

        let Some(status) = report.status.to_job_status() else {
            self.send_error(
                report.job_id,
                ErrorCode::InvalidArgument,
                "unknown job status",
            )
            .await;
            return Ok(());
        };

        let Some(job) = self.server.store.get_job(report.job_id).await? else {
            self.send_error(report.job_id, ErrorCode::NotFound, "unknown job")
                .await;
            return Ok(());
        };

        if status.is_terminal() {
            self.record_destination_outcomes(&job, &report).await;
        }

        let error = match status {
            JobStatus::Failed | JobStatus::Cancelled if !report.message.is_empty() => {
                Some(report.message.as_str())
            }
            _ => None,
        };

        // The job state machine is the one path where a store failure is
        // fatal to the session.
        self.server
            .store
            .update_job_status(report.job_id, status, Some(report.timestamp), error)
            .await
            .map_err(|e| match e {
                StoreError::NotFound(_) => anyhow::anyhow!("job vanished mid-report"),
                other => anyhow::anyhow!("job status write failed: {other}"),
            })?;

        info!(job_id = %report.job_id, status = %status, "job status reported");
        self.server.events.publish(
            job_topic(report.job_id),
            "status",
            json!({
                "status": status.as_str(),
                "message": report.message,
            }),
        );
        Ok(())
    }

    /// Persist per-destination outcomes from a terminal report and cache
    /// engine snapshots. Failures are warnings: the job itself is the
    /// primary object.
    async fn record_destination_outcomes(&self, job: &coffer_store::Job, report: &StatusReport) {
        for outcome in &report.destinations {
            let jd = JobDestination {
                job_id: report.job_id,
                destination_id: outcome.destination_id,
                status: outcome.status,
                snapshot_id: outcome.snapshot_id.clone(),
                size_bytes: outcome.size_bytes.map(|b| b as i64),
                error: outcome.error.clone(),
                started_at: Some(outcome.started_at),
                ended_at: Some(outcome.ended_at),
            };
            if let Err(e) = self.server.store.update_job_destination(&jd).await {
                warn!(job_id = %report.job_id, destination_id = %outcome.destination_id,
                    "failed to record destination outcome: {e}");
                continue;
            }

            if outcome.status == JobStatus::Succeeded {
                if let Some(engine_id) = &outcome.snapshot_id {
                    let snapshot = Snapshot {
                        id: SnapshotId::generate(),
                        policy_id: job.policy_id,
                        destination_id: outcome.destination_id,
                        engine_id: engine_id.clone(),
                        size_bytes: outcome.size_bytes.map(|b| b as i64),
                        created_at: outcome.ended_at,
                    };
                    if let Err(e) = self.server.store.insert_snapshot(&snapshot).await {
                        warn!(job_id = %report.job_id, "failed to cache snapshot: {e}");
                    }
                }
            }
        }
    }

    async fn handle_log_entry(&mut self, frame: &Frame) -> Result<()> {
        let entry: LogEntry = match frame.parse() {
            Ok(entry) => entry,
            Err(e) => {
                debug!("dropping malformed log entry: {e}");
                return Ok(());
            }
        };

        // Live tail for observers, buffered for the bulk flush on close.
        self.server.events.publish(
            job_topic(entry.job_id),
            "log",
            json!({
                "level": entry.level.as_str(),
                "message": entry.message,
                "timestamp": entry.timestamp,
            }),
        );

        self.log_buffers
            .entry(entry.job_id)
            .or_default()
            .push(NewJobLog {
                job_id: entry.job_id,
                level: entry.level,
                message: entry.message,
                timestamp: entry.timestamp,
            });
        Ok(())
    }

    async fn handle_log_close(&mut self, frame: &Frame) -> Result<()> {
        let close: LogClose = match frame.parse() {
            Ok(close) => close,
            Err(e) => {
                debug!("malformed log close: {e}");
                return Ok(());
            }
        };

        let entries = self.log_buffers.remove(&close.job_id).unwrap_or_default();
        let count = entries.len() as u64;

        // Persistence failure after a finished backup is logged, not
        // surfaced: the job is the primary object.
        if let Err(e) = self.server.store.bulk_insert_logs(&entries).await {
            warn!(job_id = %close.job_id, count, "failed to persist job logs: {e}");
        } else {
            debug!(job_id = %close.job_id, count, "job logs flushed");
        }

        self.send_json(
            OpCode::LogCloseAck,
            close.job_id,
            &LogCloseAck {
                entries_received: count,
            },
        )
        .await;
        Ok(())
    }

    /// Session teardown: flush stranded log buffers, release the registry
    /// entry, mark the agent offline, and fail jobs the session left
    /// running. Runs against the store with its own lifetime, independent
    /// of the dead connection.
    async fn cleanup(&mut self) {
        for (job_id, entries) in self.log_buffers.drain() {
            if entries.is_empty() {
                continue;
            }
            warn!(job_id = %job_id, count = entries.len(), "flushing log stream left open by session");
            if let Err(e) = self.server.store.bulk_insert_logs(&entries).await {
                warn!(job_id = %job_id, "failed to flush stranded logs: {e}");
            }
        }

        let Some(stream) = self.stream.take() else {
            return;
        };
        stream.forward_task.abort();

        // Only the session that owns the current registry entry tears the
        // agent down; a replaced session must not mark the new one offline.
        if !self
            .server
            .registry
            .deregister(stream.agent_id, stream.generation)
        {
            return;
        }

        let agent_id = stream.agent_id;
        if let Err(e) = self
            .server
            .store
            .set_agent_status(agent_id, AgentStatus::Offline, Some(Utc::now()))
            .await
        {
            warn!(agent_id = %agent_id, "failed to mark agent offline: {e}");
        }

        match self
            .server
            .store
            .fail_running_jobs_for_agent(agent_id, "agent disconnected while job was running")
            .await
        {
            Ok(failed) => {
                for job_id in failed {
                    warn!(job_id = %job_id, agent_id = %agent_id, "job failed: agent session lost");
                    self.server.events.publish(
                        job_topic(job_id),
                        "status",
                        json!({
                            "status": JobStatus::Failed.as_str(),
                            "message": "agent disconnected while job was running",
                        }),
                    );
                }
            }
            Err(e) => warn!(agent_id = %agent_id, "failed to settle orphaned jobs: {e}"),
        }

        info!(agent_id = %agent_id, "agent offline");
        self.server
            .events
            .publish(agent_topic(agent_id), "offline", json!({}));
    }

    async fn send_json<T: serde::Serialize>(&self, opcode: OpCode, job_id: JobId, value: &T) {
        match Frame::json(opcode, job_id, value) {
            Ok(frame) => {
                let _ = self.out.send(frame).await;
            }
            Err(e) => error!("failed to encode {:?} frame: {e}", opcode),
        }
    }

    async fn send_error(&self, job_id: JobId, code: ErrorCode, message: &str) {
        self.send_json(
            OpCode::Error,
            job_id,
            &ErrorPayload {
                code,
                message: message.to_string(),
            },
        )
        .await;
    }
}
