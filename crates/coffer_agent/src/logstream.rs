//! Per-job log stream and status reporting over the session's outbound
//! queue.
//!
//! A job's log stream is append-only, finite, and non-restartable: open a
//! writer, push entries one at a time, close it exactly once. Closing
//! tells the server "no more entries for this job" and triggers its bulk
//! flush. Send failures are swallowed — the session may already be gone,
//! and losing live logs must never fail the job itself.

use chrono::Utc;
use coffer_protocol::{
    AgentId, DestinationOutcome, Frame, JobId, LogClose, LogEntry, LogLevel, OpCode,
    ReportedStatus, StatusReport,
};
use tokio::sync::mpsc;
use tracing::debug;

pub type Outbound = mpsc::Sender<Frame>;

/// Writer handle for one job's log stream.
pub struct LogWriter {
    out: Outbound,
    job_id: JobId,
    agent_id: AgentId,
    entries: u64,
}

impl LogWriter {
    pub fn open(out: Outbound, job_id: JobId, agent_id: AgentId) -> Self {
        Self {
            out,
            job_id,
            agent_id,
            entries: 0,
        }
    }

    pub async fn log(&mut self, level: LogLevel, message: impl Into<String>) {
        let entry = LogEntry {
            job_id: self.job_id,
            agent_id: self.agent_id,
            level,
            message: message.into(),
            timestamp: Utc::now(),
        };
        match Frame::json(OpCode::LogEntry, self.job_id, &entry) {
            Ok(frame) => {
                if self.out.send(frame).await.is_err() {
                    debug!(job_id = %self.job_id, "log entry dropped, session gone");
                } else {
                    self.entries += 1;
                }
            }
            Err(e) => debug!("failed to encode log entry: {e}"),
        }
    }

    pub async fn debug(&mut self, message: impl Into<String>) {
        self.log(LogLevel::Debug, message).await;
    }

    pub async fn info(&mut self, message: impl Into<String>) {
        self.log(LogLevel::Info, message).await;
    }

    pub async fn warn(&mut self, message: impl Into<String>) {
        self.log(LogLevel::Warn, message).await;
    }

    pub async fn error(&mut self, message: impl Into<String>) {
        self.log(LogLevel::Error, message).await;
    }

    pub fn entries(&self) -> u64 {
        self.entries
    }

    /// Signal end-of-stream. Consumes the writer; there is no reopening.
    pub async fn close(self) {
        let close = LogClose {
            job_id: self.job_id,
        };
        match Frame::json(OpCode::LogClose, self.job_id, &close) {
            Ok(frame) => {
                let _ = self.out.send(frame).await;
            }
            Err(e) => debug!("failed to encode log close: {e}"),
        }
    }
}

/// Send one status report. The terminal report carries the
/// per-destination outcomes.
pub async fn report_status(
    out: &Outbound,
    agent_id: AgentId,
    job_id: JobId,
    status: ReportedStatus,
    message: &str,
    destinations: Vec<DestinationOutcome>,
) {
    let report = StatusReport {
        job_id,
        agent_id,
        status,
        message: message.to_string(),
        timestamp: Utc::now(),
        destinations,
    };
    match Frame::json(OpCode::StatusReport, job_id, &report) {
        Ok(frame) => {
            if out.send(frame).await.is_err() {
                debug!(job_id = %job_id, status = ?status, "status report dropped, session gone");
            }
        }
        Err(e) => debug!("failed to encode status report: {e}"),
    }
}
