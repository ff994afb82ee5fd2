//! Backup engine (restic) wrapper.
//!
//! One engine invocation per destination: `backup` with `--json` progress
//! on stdout, then `forget` with the retention keep counts. Progress
//! lines are newline-delimited JSON; each parseable line is forwarded to
//! the job's log stream and the summary line yields the snapshot id and
//! byte counts. Unparseable lines are dropped silently.

use anyhow::{bail, Context, Result};
use coffer_protocol::{DispatchDestination, RetentionPolicy};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;

use crate::logstream::LogWriter;

/// Lines of engine stderr kept for error messages.
const STDERR_TAIL_LINES: usize = 8;

/// Extracted from the engine's `summary` progress event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackupSummary {
    pub snapshot_id: Option<String>,
    pub bytes_processed: Option<u64>,
}

/// Run one backup into one destination repository.
pub async fn run_backup(
    binary: &Path,
    sources: &[String],
    dest: &DispatchDestination,
    repo_password: &str,
    tags: &[String],
    log: &mut LogWriter,
) -> Result<BackupSummary> {
    let mut cmd = Command::new(binary);
    cmd.arg("backup")
        .args(sources)
        .arg("--repo")
        .arg(&dest.repo_url)
        .arg("--json");
    for tag in tags {
        cmd.arg("--tag").arg(tag);
    }
    cmd.env("RESTIC_PASSWORD", repo_password)
        .envs(&dest.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().context("failed to spawn backup engine")?;
    let stdout = child
        .stdout
        .take()
        .context("failed to capture engine stdout")?;
    let stderr = child
        .stderr
        .take()
        .context("failed to capture engine stderr")?;
    let stderr_task = tokio::spawn(collect_tail(stderr));

    let mut summary = BackupSummary::default();
    let mut lines = BufReader::new(stdout).lines();
    while let Some(line) = lines
        .next_line()
        .await
        .context("failed to read engine output")?
    {
        if let Some(forward) = apply_progress_line(&line, &mut summary) {
            log.info(forward).await;
        }
    }

    let status = child.wait().await.context("failed waiting for engine")?;
    let stderr_tail = stderr_task.await.unwrap_or_default();
    if !status.success() {
        bail!(
            "backup engine exited with {}: {}",
            status,
            stderr_tail.trim()
        );
    }
    Ok(summary)
}

/// Apply the retention window after a successful backup. The caller
/// treats failure as a warning, never as a destination failure.
pub async fn run_forget(
    binary: &Path,
    dest: &DispatchDestination,
    repo_password: &str,
    retention: &RetentionPolicy,
) -> Result<()> {
    let output = Command::new(binary)
        .arg("forget")
        .arg("--repo")
        .arg(&dest.repo_url)
        .arg("--json")
        .arg("--prune")
        .arg("--keep-daily")
        .arg(retention.keep_daily.to_string())
        .arg("--keep-weekly")
        .arg(retention.keep_weekly.to_string())
        .arg("--keep-monthly")
        .arg(retention.keep_monthly.to_string())
        .arg("--keep-yearly")
        .arg(retention.keep_yearly.to_string())
        .env("RESTIC_PASSWORD", repo_password)
        .envs(&dest.env)
        .stdin(Stdio::null())
        .output()
        .await
        .context("failed to run retention")?;

    if !output.status.success() {
        bail!(
            "retention exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

/// Parse one engine stdout line. Returns the line to forward to the log
/// stream, or `None` for lines that are not JSON (dropped). The summary
/// event fills in snapshot id and processed bytes.
pub(crate) fn apply_progress_line(line: &str, summary: &mut BackupSummary) -> Option<String> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    let value: serde_json::Value = serde_json::from_str(trimmed).ok()?;

    if value.get("message_type").and_then(|v| v.as_str()) == Some("summary") {
        summary.snapshot_id = value
            .get("snapshot_id")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        summary.bytes_processed = value.get("total_bytes_processed").and_then(|v| v.as_u64());
    }
    Some(trimmed.to_string())
}

async fn collect_tail<R: AsyncRead + Unpin>(reader: R) -> String {
    let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    tail.into_iter().collect::<Vec<_>>().join("\n")
}

// ============================================================================
// Engine binary resolution & extraction
// ============================================================================

#[cfg(feature = "embedded-engine")]
static EMBEDDED_ENGINE: &[u8] = include_bytes!(env!("COFFER_EMBEDDED_ENGINE"));

const ENGINE_NAME: &str = "restic";

/// Decide which engine binary to run:
/// explicit override, then a previously extracted (or embedded) copy in
/// the state directory, then `restic` on PATH.
pub async fn resolve_engine(state_dir: &Path, override_path: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = override_path {
        if !path.exists() {
            bail!("engine binary {} does not exist", path.display());
        }
        return Ok(path.to_path_buf());
    }

    let bin_dir = state_dir.join("bin");

    #[cfg(feature = "embedded-engine")]
    {
        return ensure_extracted(&bin_dir, ENGINE_NAME, EMBEDDED_ENGINE).await;
    }

    #[cfg(not(feature = "embedded-engine"))]
    {
        let extracted = bin_dir.join(ENGINE_NAME);
        if extracted.exists() {
            return Ok(extracted);
        }
        tracing::debug!("no extracted engine, relying on PATH");
        Ok(PathBuf::from(ENGINE_NAME))
    }
}

/// Extract `bytes` to `<dir>/<name>` atomically (write to temp, then
/// rename). Idempotent: a size match short-circuits on subsequent starts.
pub async fn ensure_extracted(dir: &Path, name: &str, bytes: &[u8]) -> Result<PathBuf> {
    let target = dir.join(name);
    if let Ok(meta) = tokio::fs::metadata(&target).await {
        if meta.len() == bytes.len() as u64 {
            return Ok(target);
        }
    }

    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("failed to create {}", dir.display()))?;
    let tmp = dir.join(format!("{}.tmp", name));
    tokio::fs::write(&tmp, bytes)
        .await
        .with_context(|| format!("failed to write {}", tmp.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o755))
            .await
            .context("failed to mark engine executable")?;
    }

    tokio::fs::rename(&tmp, &target)
        .await
        .with_context(|| format!("failed to move engine into place at {}", target.display()))?;
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn unparseable_lines_are_dropped() {
        let mut summary = BackupSummary::default();
        assert_eq!(apply_progress_line("", &mut summary), None);
        assert_eq!(apply_progress_line("not json at all", &mut summary), None);
        assert_eq!(summary, BackupSummary::default());
    }

    #[test]
    fn status_lines_are_forwarded_verbatim() {
        let mut summary = BackupSummary::default();
        let line = r#"{"message_type":"status","percent_done":0.42}"#;
        assert_eq!(apply_progress_line(line, &mut summary), Some(line.to_string()));
        assert!(summary.snapshot_id.is_none());
    }

    #[test]
    fn summary_line_fills_snapshot_and_bytes() {
        let mut summary = BackupSummary::default();
        let line = r#"{"message_type":"summary","snapshot_id":"ab12cd34","total_bytes_processed":42000}"#;
        assert!(apply_progress_line(line, &mut summary).is_some());
        assert_eq!(summary.snapshot_id.as_deref(), Some("ab12cd34"));
        assert_eq!(summary.bytes_processed, Some(42_000));
    }

    #[tokio::test]
    async fn extraction_is_atomic_and_idempotent() {
        let dir = TempDir::new().unwrap();
        let bin_dir = dir.path().join("bin");

        let first = ensure_extracted(&bin_dir, "engine", b"fake engine v1")
            .await
            .unwrap();
        assert_eq!(std::fs::read(&first).unwrap(), b"fake engine v1");
        let mtime = std::fs::metadata(&first).unwrap().modified().unwrap();

        // Same size: the short-circuit leaves the file untouched.
        let second = ensure_extracted(&bin_dir, "engine", b"fake engine v2")
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(std::fs::read(&second).unwrap(), b"fake engine v1");
        assert_eq!(
            std::fs::metadata(&second).unwrap().modified().unwrap(),
            mtime
        );

        // A different size re-extracts.
        let third = ensure_extracted(&bin_dir, "engine", b"a much longer fake engine build")
            .await
            .unwrap();
        assert_eq!(
            std::fs::read(&third).unwrap(),
            b"a much longer fake engine build"
        );
        assert!(!bin_dir.join("engine.tmp").exists());
    }

    #[tokio::test]
    async fn override_path_must_exist() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope");
        assert!(resolve_engine(dir.path(), Some(&missing)).await.is_err());

        let present = dir.path().join("engine");
        std::fs::write(&present, b"x").unwrap();
        let resolved = resolve_engine(dir.path(), Some(&present)).await.unwrap();
        assert_eq!(resolved, present);
    }
}
