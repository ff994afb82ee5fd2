//! Pre/post-backup shell hooks.
//!
//! Hooks run through `sh -c` with a bounded timeout. Stdout is forwarded
//! to the job's log stream line by line; stderr is drained concurrently
//! (and forwarded at warn) so a chatty hook can never block on a full
//! pipe.

use anyhow::{bail, Context, Result};
use coffer_protocol::LogLevel;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::logstream::LogWriter;

/// Run one hook command. An empty command is a no-op. Non-zero exit or
/// timeout is an error; the caller decides whether that fails the job.
pub async fn run_hook(
    command: &str,
    timeout: Duration,
    log: &mut LogWriter,
    label: &str,
) -> Result<()> {
    if command.trim().is_empty() {
        return Ok(());
    }
    log.info(format!("running {} hook", label)).await;

    let mut child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("failed to spawn {} hook", label))?;

    let stdout = child
        .stdout
        .take()
        .with_context(|| format!("failed to capture {} hook stdout", label))?;
    let stderr = child
        .stderr
        .take()
        .with_context(|| format!("failed to capture {} hook stderr", label))?;

    // One reader task per pipe; both feed the same line channel so the
    // child can never stall on an unread pipe.
    let (line_tx, mut line_rx) = mpsc::channel::<(LogLevel, String)>(64);
    let stdout_reader = tokio::spawn(forward_lines(stdout, LogLevel::Info, line_tx.clone()));
    let stderr_reader = tokio::spawn(forward_lines(stderr, LogLevel::Warn, line_tx));

    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);
    let mut lines_done = false;

    let status = loop {
        tokio::select! {
            maybe = line_rx.recv(), if !lines_done => match maybe {
                Some((level, line)) => log.log(level, line).await,
                None => lines_done = true,
            },
            waited = child.wait() => {
                break waited.with_context(|| format!("failed waiting for {} hook", label))?;
            }
            _ = &mut deadline => {
                let _ = child.kill().await;
                // Unblock the readers (their sends fail once the receiver
                // is closed) so awaiting them cannot hang.
                line_rx.close();
                let _ = stdout_reader.await;
                let _ = stderr_reader.await;
                bail!("{} hook timed out after {:?}", label, timeout);
            }
        }
    };

    // Forward whatever the hook printed before exiting; the channel
    // closes once both readers are done.
    while let Some((level, line)) = line_rx.recv().await {
        log.log(level, line).await;
    }
    let _ = stdout_reader.await;
    let _ = stderr_reader.await;

    if !status.success() {
        bail!("{} hook exited with {}", label, status);
    }
    Ok(())
}

async fn forward_lines<R: AsyncRead + Unpin>(
    reader: R,
    level: LogLevel,
    tx: mpsc::Sender<(LogLevel, String)>,
) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        if tx.send((level, line)).await.is_err() {
            break;
        }
    }
}
