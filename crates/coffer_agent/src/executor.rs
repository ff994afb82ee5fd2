//! Serial job executor.
//!
//! One task owns a bounded queue and runs one job to completion before
//! reading the next — per-agent serialization is enforced here. Enqueue
//! is non-blocking; overflow is rejected and the server redelivers on the
//! next session. Duplicate job ids are dropped, which makes redelivery
//! after a half-torn session harmless.

use chrono::Utc;
use coffer_protocol::{
    BackupPayload, DestinationOutcome, JobAssignment, JobId, JobStatus, ReportedStatus,
};
use coffer_protocol::defaults;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::docker;
use crate::engine;
use crate::hooks;
use crate::logstream::{report_status, LogWriter, Outbound};

/// Everything a job run needs from the session.
#[derive(Clone)]
pub struct ExecutorContext {
    pub agent_id: coffer_protocol::AgentId,
    pub out: Outbound,
    pub engine: PathBuf,
    pub hook_timeout: Duration,
}

/// Enqueue side of the executor.
#[derive(Clone)]
pub struct ExecutorHandle {
    tx: mpsc::Sender<JobAssignment>,
    known: Arc<Mutex<HashSet<JobId>>>,
}

impl ExecutorHandle {
    #[cfg(test)]
    fn detached(capacity: usize) -> (Self, mpsc::Receiver<JobAssignment>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                tx,
                known: Arc::new(Mutex::new(HashSet::new())),
            },
            rx,
        )
    }

    /// Non-blocking enqueue. Returns false when the queue is full; the
    /// job is not lost, the server keeps it pending and redelivers.
    pub fn enqueue(&self, assignment: JobAssignment) -> bool {
        let job_id = assignment.job_id;
        {
            let known = self.known.lock().expect("executor lock poisoned");
            if known.contains(&job_id) {
                debug!(job_id = %job_id, "duplicate assignment dropped");
                return true;
            }
        }

        match self.tx.try_send(assignment) {
            Ok(()) => {
                self.known
                    .lock()
                    .expect("executor lock poisoned")
                    .insert(job_id);
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(job_id = %job_id, "job queue full, rejecting assignment");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!(job_id = %job_id, "executor stopped, rejecting assignment");
                false
            }
        }
    }

    pub fn queued(&self) -> usize {
        self.known.lock().expect("executor lock poisoned").len()
    }
}

/// Spawn the serial executor loop. Cancellation stops consumption of new
/// jobs; a job already picked runs until its current destination
/// finishes.
pub fn spawn_executor(
    ctx: ExecutorContext,
    cancel: CancellationToken,
) -> (ExecutorHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<JobAssignment>(defaults::AGENT_QUEUE_CAPACITY);
    let known = Arc::new(Mutex::new(HashSet::new()));
    let handle = ExecutorHandle {
        tx,
        known: known.clone(),
    };

    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                maybe = rx.recv() => {
                    let Some(assignment) = maybe else { break };
                    let job_id = assignment.job_id;
                    run_job(&ctx, assignment, &cancel).await;
                    known.lock().expect("executor lock poisoned").remove(&job_id);
                }
            }
        }
        debug!("executor stopped");
    });

    (handle, task)
}

/// Execute one job end to end and report every transition.
pub async fn run_job(ctx: &ExecutorContext, assignment: JobAssignment, cancel: &CancellationToken) {
    let job_id = assignment.job_id;

    let payload = match assignment.decode_backup_payload() {
        Ok(payload) => payload,
        Err(e) => {
            warn!(job_id = %job_id, "undecodable job payload: {e}");
            report_status(
                &ctx.out,
                ctx.agent_id,
                job_id,
                ReportedStatus::Failed,
                &format!("failed to deserialize job payload: {}", e),
                vec![],
            )
            .await;
            return;
        }
    };

    info!(job_id = %job_id, destinations = payload.destinations.len(), "starting backup job");
    report_status(
        &ctx.out,
        ctx.agent_id,
        job_id,
        ReportedStatus::Running,
        "",
        vec![],
    )
    .await;
    let mut log = LogWriter::open(ctx.out.clone(), job_id, ctx.agent_id);

    let (status, message, outcomes) = execute_backup(ctx, &payload, &mut log, cancel).await;

    // Terminal status is the last event on the status channel; the log
    // stream closes after it.
    report_status(&ctx.out, ctx.agent_id, job_id, status, &message, outcomes).await;
    log.close().await;
    info!(job_id = %job_id, status = ?status, "job finished");
}

async fn execute_backup(
    ctx: &ExecutorContext,
    payload: &BackupPayload,
    log: &mut LogWriter,
    cancel: &CancellationToken,
) -> (ReportedStatus, String, Vec<DestinationOutcome>) {
    // Source resolution is fatal to the job.
    let sources = match docker::resolve_sources(&payload.sources).await {
        Ok(sources) => sources,
        Err(e) => {
            let message = format!("failed to resolve sources: {:#}", e);
            log.error(message.clone()).await;
            return (ReportedStatus::Failed, message, vec![]);
        }
    };

    // Pre-hook failure fails the job and skips the backup entirely.
    if let Err(e) = hooks::run_hook(&payload.hook_pre_backup, ctx.hook_timeout, log, "pre-backup").await
    {
        let message = format!("{:#}", e);
        log.error(message.clone()).await;
        return (ReportedStatus::Failed, message, vec![]);
    }

    let mut outcomes = Vec::with_capacity(payload.destinations.len());
    let mut any_failed = false;
    let mut cancelled = false;

    for dest in &payload.destinations {
        if cancel.is_cancelled() {
            cancelled = true;
            log.warn("shutdown requested, skipping remaining destinations")
                .await;
            break;
        }

        let started_at = Utc::now();
        log.info(format!("backing up to {} destination {}", dest.kind, dest.destination_id))
            .await;

        match engine::run_backup(
            &ctx.engine,
            &sources,
            dest,
            &payload.repo_password,
            &payload.tags,
            log,
        )
        .await
        {
            Ok(summary) => {
                // Retention is best effort; the destination stays
                // succeeded even when forget fails.
                if let Err(e) =
                    engine::run_forget(&ctx.engine, dest, &payload.repo_password, &payload.retention)
                        .await
                {
                    log.warn(format!("retention failed: {:#}", e)).await;
                }

                outcomes.push(DestinationOutcome {
                    destination_id: dest.destination_id,
                    status: JobStatus::Succeeded,
                    snapshot_id: summary.snapshot_id,
                    size_bytes: summary.bytes_processed,
                    error: None,
                    started_at,
                    ended_at: Utc::now(),
                });
            }
            Err(e) => {
                // One failed destination does not abort the job; every
                // destination still gets its attempt.
                any_failed = true;
                let message = format!("{:#}", e);
                log.error(format!("destination failed: {}", message)).await;
                outcomes.push(DestinationOutcome {
                    destination_id: dest.destination_id,
                    status: JobStatus::Failed,
                    snapshot_id: None,
                    size_bytes: None,
                    error: Some(message),
                    started_at,
                    ended_at: Utc::now(),
                });
            }
        }
    }

    // The post-hook always runs, even after failures or cancellation.
    if let Err(e) =
        hooks::run_hook(&payload.hook_post_backup, ctx.hook_timeout, log, "post-backup").await
    {
        log.warn(format!("{:#}", e)).await;
    }

    if cancelled {
        (
            ReportedStatus::Cancelled,
            "job cancelled before completion".to_string(),
            outcomes,
        )
    } else if any_failed {
        (
            ReportedStatus::Failed,
            "one or more destinations failed".to_string(),
            outcomes,
        )
    } else {
        log.info("backup completed successfully").await;
        (
            ReportedStatus::Completed,
            "backup completed successfully".to_string(),
            outcomes,
        )
    }
}
