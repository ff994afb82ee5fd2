//! Dispatcher: the thin contract between "this job needs to go out" and
//! the registry.

use chrono::Utc;
use coffer_protocol::{
    BackupPayload, DestinationConfig, DestinationCredentials, DispatchDestination, JobAssignment,
    ProtocolError,
};
use coffer_store::{Job, Policy, PolicyDestinationDetail};
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::events::{job_topic, EventBus};
use crate::registry::{Registry, RegistryError};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("failed to build dispatch payload: {0}")]
    Payload(#[from] ProtocolError),
}

impl DispatchError {
    /// Failures that leave the job pending for redelivery rather than
    /// indicating a broken policy.
    pub fn is_retriable(&self) -> bool {
        matches!(self, DispatchError::Registry(_))
    }
}

pub struct Dispatcher {
    registry: Arc<Registry>,
    events: EventBus,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>, events: EventBus) -> Self {
        Self { registry, events }
    }

    /// Build the payload for (job, policy, destinations) and push it to the
    /// job's pinned agent. On `AgentNotConnected`/`SendFailed` the job
    /// simply stays pending; the caller logs and moves on.
    pub async fn dispatch(
        &self,
        job: &Job,
        policy: &Policy,
        destinations: &[PolicyDestinationDetail],
    ) -> Result<(), DispatchError> {
        let payload = build_backup_payload(policy, destinations)?;
        let assignment = JobAssignment::backup(job.id, policy.id, &payload, Utc::now())?;
        // Credentials live only inside `payload`/`assignment` for the
        // duration of this send.
        drop(payload);

        self.registry.dispatch(job.agent_id, assignment).await?;

        debug!(job_id = %job.id, agent_id = %job.agent_id, policy = %policy.name, "job dispatched");
        self.events.publish(
            job_topic(job.id),
            "dispatched",
            json!({
                "job_id": job.id,
                "policy_id": policy.id,
                "agent_id": job.agent_id,
            }),
        );
        Ok(())
    }
}

/// Assemble the wire payload for one policy run. Destinations arrive in
/// priority order from the store and keep that order on the wire; each
/// one gets its repository URL and engine environment built from its
/// typed config and (already decrypted) credentials.
pub fn build_backup_payload(
    policy: &Policy,
    destinations: &[PolicyDestinationDetail],
) -> Result<BackupPayload, ProtocolError> {
    let mut dispatch_destinations = Vec::with_capacity(destinations.len());
    for detail in destinations {
        let dest = &detail.destination;
        let config: DestinationConfig = serde_json::from_str(&dest.config)?;

        let credentials = if dest.credentials.trim().is_empty() {
            DestinationCredentials::None
        } else {
            serde_json::from_str(&dest.credentials)?
        };

        let mut env = config.env();
        env.extend(credentials.env());

        dispatch_destinations.push(DispatchDestination {
            destination_id: dest.id,
            kind: dest.kind,
            repo_url: config.repo_url(),
            credentials: dest.credentials.clone(),
            config: dest.config.clone(),
            env,
            priority: detail.priority,
        });
    }

    Ok(BackupPayload {
        sources: policy.sources.clone(),
        repo_password: policy.repo_password.clone(),
        destinations: dispatch_destinations,
        retention: policy.retention,
        hook_pre_backup: policy.hook_pre_backup.clone(),
        hook_post_backup: policy.hook_post_backup.clone(),
        tags: vec![policy.name.clone()],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use coffer_protocol::{AgentId, DestinationKind};
    use coffer_store::Destination;

    fn policy() -> Policy {
        let mut policy = Policy::new(
            "nightly",
            AgentId::generate(),
            "0 2 * * *",
            vec!["/data".to_string()],
        );
        policy.repo_password = "hunter2".to_string();
        policy
    }

    fn detail(kind: DestinationKind, config: &str, credentials: &str, priority: i32) -> PolicyDestinationDetail {
        let mut dest = Destination::new("d", kind, config.to_string());
        dest.credentials = credentials.to_string();
        PolicyDestinationDetail {
            destination: dest,
            priority,
        }
    }

    #[test]
    fn payload_keeps_priority_order_and_builds_urls() {
        let details = vec![
            detail(
                DestinationKind::Local,
                r#"{"type":"local","path":"/backup"}"#,
                "",
                0,
            ),
            detail(
                DestinationKind::S3,
                r#"{"type":"s3","endpoint":"s3.amazonaws.com","bucket":"b","prefix":"p","region":"us-east-1"}"#,
                r#"{"type":"s3","access_key_id":"AKIA1","secret_access_key":"sk"}"#,
                5,
            ),
        ];

        let payload = build_backup_payload(&policy(), &details).unwrap();
        assert_eq!(payload.destinations.len(), 2);
        assert_eq!(payload.destinations[0].repo_url, "/backup");
        assert_eq!(payload.destinations[0].priority, 0);
        assert_eq!(payload.destinations[1].repo_url, "s3:s3.amazonaws.com/b/p");

        let env = &payload.destinations[1].env;
        assert_eq!(env.get("AWS_ACCESS_KEY_ID").map(String::as_str), Some("AKIA1"));
        assert_eq!(env.get("AWS_DEFAULT_REGION").map(String::as_str), Some("us-east-1"));

        assert_eq!(payload.repo_password, "hunter2");
        assert_eq!(payload.tags, vec!["nightly".to_string()]);
    }

    #[test]
    fn malformed_destination_config_is_an_error() {
        let details = vec![detail(DestinationKind::Local, "not json", "", 0)];
        assert!(build_backup_payload(&policy(), &details).is_err());
    }

    #[test]
    fn empty_destination_set_builds_an_empty_payload() {
        let payload = build_backup_payload(&policy(), &[]).unwrap();
        assert!(payload.destinations.is_empty());
    }
}
