//! Source resolution.
//!
//! `docker-volume://<name>` references are resolved to the volume's host
//! mountpoint via the local container runtime. Any resolution failure is
//! fatal to the job.

use anyhow::{bail, Context, Result};
use coffer_protocol::{parse_source_ref, SourceRef};
use std::process::Stdio;
use tokio::process::Command;

/// Resolve every source reference in order. Plain paths pass through
/// unchanged.
pub async fn resolve_sources(sources: &[String]) -> Result<Vec<String>> {
    let mut resolved = Vec::with_capacity(sources.len());
    for raw in sources {
        match parse_source_ref(raw)? {
            SourceRef::Path(path) => resolved.push(path),
            SourceRef::DockerVolume(name) => resolved.push(resolve_volume(&name).await?),
        }
    }
    Ok(resolved)
}

/// Ask the container runtime for a volume's host mountpoint.
pub async fn resolve_volume(name: &str) -> Result<String> {
    if name.is_empty() {
        bail!("docker volume reference has an empty name");
    }

    let output = Command::new("docker")
        .args(["volume", "inspect", "--format", "{{ .Mountpoint }}", name])
        .stdin(Stdio::null())
        .output()
        .await
        .context("docker is not available")?;

    if !output.status.success() {
        bail!(
            "docker volume '{}' not found: {}",
            name,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    let mountpoint = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if mountpoint.is_empty() {
        bail!("docker volume '{}' has no mountpoint", name);
    }
    Ok(mountpoint)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn plain_paths_pass_through_unchanged() {
        let sources = vec!["/var/lib/data".to_string(), "/etc".to_string()];
        let resolved = resolve_sources(&sources).await.unwrap();
        assert_eq!(resolved, sources);
    }

    #[tokio::test]
    async fn empty_volume_name_is_fatal() {
        let sources = vec!["docker-volume://".to_string()];
        let err = resolve_sources(&sources).await.unwrap_err();
        assert!(err.to_string().contains("empty name"));
    }

    #[tokio::test]
    async fn underscore_prefix_is_rejected() {
        let sources = vec!["docker_volume://pgdata".to_string()];
        assert!(resolve_sources(&sources).await.is_err());
    }
}
