//! Session supervisor.
//!
//! One loop owns the agent's connection lifecycle: connect, authenticate,
//! register, open the job stream, then run the heartbeat loop and the
//! read loop concurrently. The first error from either side tears the
//! session down, and the supervisor sleeps with jittered exponential
//! backoff before reconnecting. Backoff resets after any session that
//! stayed up for at least one heartbeat interval.

use anyhow::{bail, Context, Result};
use coffer_protocol::{
    wire, AgentId, ErrorPayload, Frame, HeartbeatRequest, HelloPayload, JobAssignment, JobId,
    OpCode, OpenStreamRequest, RegisterAck, RegisterRequest, PROTOCOL_VERSION,
};
use rand::Rng;
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::AgentConfig;
use crate::executor::{spawn_executor, ExecutorContext, ExecutorHandle};
use crate::logstream::Outbound;
use crate::metrics::Sampler;
use crate::state;

/// Deadline for the registration handshake.
const HANDSHAKE_DEADLINE: Duration = Duration::from_secs(10);

/// Per-session outbound frame queue.
const OUTBOUND_QUEUE: usize = 64;

/// Run sessions until shutdown, reconnecting with backoff.
pub async fn run_supervisor(config: AgentConfig, shutdown: CancellationToken) -> Result<()> {
    let state_dir = config.state_dir();
    std::fs::create_dir_all(&state_dir)
        .with_context(|| format!("failed to create state dir {}", state_dir.display()))?;

    let engine = crate::engine::resolve_engine(&state_dir, config.engine_path.as_deref()).await?;
    info!("Backup engine: {}", engine.display());

    let capabilities = state::probe_capabilities().await;
    info!(
        restic = capabilities.restic,
        rclone = capabilities.rclone,
        docker = capabilities.docker,
        "capabilities probed"
    );

    let mut backoff = config.backoff_initial();
    loop {
        if shutdown.is_cancelled() {
            break;
        }

        let started = Instant::now();
        match run_session(&config, &state_dir, &engine, capabilities, &shutdown).await {
            Ok(()) => info!("session closed"),
            Err(e) => warn!("session failed: {e:#}"),
        }
        if shutdown.is_cancelled() {
            break;
        }

        if started.elapsed() >= config.heartbeat_interval() {
            backoff = config.backoff_initial();
        }

        let delay = jittered(backoff, config.jitter_fraction);
        info!("reconnecting in {:.1}s", delay.as_secs_f64());
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.cancelled() => break,
        }
        backoff = next_backoff(backoff, config.backoff_factor, config.backoff_max());
    }

    info!("agent stopped");
    Ok(())
}

async fn run_session(
    config: &AgentConfig,
    state_dir: &Path,
    engine: &Path,
    capabilities: coffer_protocol::Capabilities,
    shutdown: &CancellationToken,
) -> Result<()> {
    let stream = TcpStream::connect(&config.server_addr)
        .await
        .with_context(|| format!("failed to connect to {}", config.server_addr))?;
    let _ = stream.set_nodelay(true);
    info!("connected to {}", config.server_addr);
    let (mut reader, writer) = stream.into_split();

    let (out_tx, out_rx) = mpsc::channel::<Frame>(OUTBOUND_QUEUE);
    let writer_task = tokio::spawn(write_loop(writer, out_rx));

    let agent_id = handshake(config, state_dir, capabilities, &mut reader, &out_tx).await?;

    // The session token links the heartbeat loop, the executor, and the
    // read loop: whichever fails first tears the others down.
    let session_cancel = CancellationToken::new();

    let (executor, exec_task) = spawn_executor(
        ExecutorContext {
            agent_id,
            out: out_tx.clone(),
            engine: engine.to_path_buf(),
            hook_timeout: config.hook_timeout(),
        },
        session_cancel.clone(),
    );

    let heartbeat_task = tokio::spawn(heartbeat_loop(
        out_tx.clone(),
        agent_id,
        config.heartbeat_interval(),
        session_cancel.clone(),
    ));

    let result = read_loop(&mut reader, &executor, shutdown, &session_cancel).await;

    // Stop heartbeats and new-job consumption; the in-flight destination
    // finishes naturally before the executor exits.
    session_cancel.cancel();
    let _ = heartbeat_task.await;
    let _ = exec_task.await;
    drop(out_tx);
    drop(executor);
    let _ = writer_task.await;

    result
}

/// Hello, Register, persist the id, OpenStream. Returns the agent id.
async fn handshake(
    config: &AgentConfig,
    state_dir: &Path,
    capabilities: coffer_protocol::Capabilities,
    reader: &mut OwnedReadHalf,
    out: &Outbound,
) -> Result<AgentId> {
    send_json(
        out,
        OpCode::Hello,
        &HelloPayload {
            secret: config.shared_secret.clone(),
            protocol_version: PROTOCOL_VERSION,
        },
    )
    .await?;

    send_json(
        out,
        OpCode::Register,
        &RegisterRequest {
            hostname: state::hostname(),
            version: config.version.clone(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            capabilities,
        },
    )
    .await?;

    let agent_id = loop {
        let frame = tokio::time::timeout(HANDSHAKE_DEADLINE, wire::read_frame(reader))
            .await
            .context("timed out waiting for registration")?
            .context("connection lost during registration")?;
        match frame.header.opcode {
            OpCode::RegisterAck => {
                let ack: RegisterAck = frame.parse()?;
                break ack.agent_id;
            }
            OpCode::Error => {
                let err: ErrorPayload = frame.parse()?;
                bail!("server rejected session: {} ({})", err.message, err.code);
            }
            other => debug!(opcode = ?other, "ignoring frame during handshake"),
        }
    };

    match state::load(state_dir) {
        Some(persisted) if persisted == agent_id => {}
        previous => {
            if let Some(previous) = previous {
                info!(%previous, current = %agent_id, "agent id changed, hostname reunification");
            }
            if let Err(e) = state::save(state_dir, agent_id) {
                warn!("failed to persist agent id: {e:#}");
            }
        }
    }
    info!(agent_id = %agent_id, "registered");

    send_json(out, OpCode::OpenStream, &OpenStreamRequest { agent_id }).await?;
    Ok(agent_id)
}

async fn read_loop(
    reader: &mut OwnedReadHalf,
    executor: &ExecutorHandle,
    shutdown: &CancellationToken,
    session_cancel: &CancellationToken,
) -> Result<()> {
    loop {
        tokio::select! {
            frame = wire::read_frame(reader) => {
                let frame = frame.context("server connection lost")?;
                handle_frame(frame, executor);
            }
            _ = shutdown.cancelled() => {
                info!("shutdown requested, closing session");
                return Ok(());
            }
            _ = session_cancel.cancelled() => {
                bail!("session torn down");
            }
        }
    }
}

fn handle_frame(frame: Frame, executor: &ExecutorHandle) {
    match frame.header.opcode {
        OpCode::Assign => match frame.parse::<JobAssignment>() {
            Ok(assignment) => {
                // Rejected assignments are not lost: the server keeps the
                // job pending and redelivers on the next session.
                executor.enqueue(assignment);
            }
            Err(e) => warn!("undecodable assignment: {e}"),
        },
        // `has_pending_jobs` is reserved; nothing to do with the ack.
        OpCode::HeartbeatAck => {}
        OpCode::LogCloseAck => debug!("log stream flushed by server"),
        OpCode::Error => {
            if let Ok(err) = frame.parse::<ErrorPayload>() {
                warn!(code = %err.code, "server error: {}", err.message);
            }
        }
        other => warn!(opcode = ?other, "unexpected frame from server"),
    }
}

async fn heartbeat_loop(
    out: Outbound,
    agent_id: AgentId,
    interval: Duration,
    session_cancel: CancellationToken,
) {
    let mut sampler = Sampler::new();
    let mut ticker = tokio::time::interval(interval);
    // The first tick fires immediately, which doubles as a liveness
    // refresh right after reconnect.
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let metrics = sampler.sample();
                let request = HeartbeatRequest { agent_id, metrics };
                let frame = match Frame::json(OpCode::Heartbeat, JobId::nil(), &request) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!("failed to encode heartbeat: {e}");
                        continue;
                    }
                };
                if out.send(frame).await.is_err() {
                    warn!("heartbeat send failed, tearing session down");
                    session_cancel.cancel();
                    return;
                }
            }
            _ = session_cancel.cancelled() => return,
        }
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

async fn send_json<T: serde::Serialize>(out: &Outbound, opcode: OpCode, value: &T) -> Result<()> {
    let frame = Frame::json(opcode, JobId::nil(), value)?;
    out.send(frame)
        .await
        .map_err(|_| anyhow::anyhow!("session outbound queue closed"))
}

fn next_backoff(current: Duration, factor: f64, max: Duration) -> Duration {
    Duration::from_secs_f64((current.as_secs_f64() * factor).min(max.as_secs_f64()))
}

fn jittered(base: Duration, fraction: f64) -> Duration {
    let spread = fraction.clamp(0.0, 1.0);
    let factor = 1.0 + spread * (rand::thread_rng().gen::<f64>() * 2.0 - 1.0);
    base.mul_f64(factor.max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let max = Duration::from_secs(60);
        let mut backoff = Duration::from_secs(1);
        let mut seen = Vec::new();
        for _ in 0..8 {
            seen.push(backoff.as_secs());
            backoff = next_backoff(backoff, 2.0, max);
        }
        assert_eq!(seen, vec![1, 2, 4, 8, 16, 32, 60, 60]);
    }

    #[test]
    fn jitter_stays_within_the_fraction() {
        let base = Duration::from_secs(10);
        for _ in 0..100 {
            let delay = jittered(base, 0.2);
            assert!(delay >= Duration::from_secs(8), "delay {:?}", delay);
            assert!(delay <= Duration::from_secs(12), "delay {:?}", delay);
        }
    }

    #[test]
    fn zero_jitter_is_exact() {
        let base = Duration::from_secs(10);
        assert_eq!(jittered(base, 0.0), base);
    }
}
