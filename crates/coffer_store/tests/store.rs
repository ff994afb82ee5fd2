//! Store integration tests against in-memory SQLite.

use chrono::Utc;
use coffer_protocol::{
    Capabilities, DestinationKind, JobStatus, LogLevel, RegisterRequest,
};
use coffer_store::{Destination, Job, NewJobLog, Policy, Store, StoreError};

async fn setup() -> Store {
    let store = Store::open_in_memory().await.unwrap();
    store.init().await.unwrap();
    store
}

fn register_request(hostname: &str) -> RegisterRequest {
    RegisterRequest {
        hostname: hostname.to_string(),
        version: "0.1.0".to_string(),
        os: "linux".to_string(),
        arch: "x86_64".to_string(),
        capabilities: Capabilities {
            restic: true,
            rclone: false,
            docker: true,
        },
    }
}

fn local_destination(name: &str) -> Destination {
    Destination::new(
        name,
        DestinationKind::Local,
        r#"{"type":"local","path":"/backup"}"#.to_string(),
    )
}

#[tokio::test]
async fn registering_same_hostname_twice_yields_same_id() {
    let store = setup().await;

    let first = store
        .upsert_agent_by_hostname(&register_request("host-a"))
        .await
        .unwrap();

    let mut again = register_request("host-a");
    again.version = "0.2.0".to_string();
    let second = store.upsert_agent_by_hostname(&again).await.unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(second.version, "0.2.0");

    let all = store.list_agents().await.unwrap();
    assert_eq!(all.len(), 1);
}

#[tokio::test]
async fn destination_delete_is_refused_while_referenced() {
    let store = setup().await;

    let agent = store
        .upsert_agent_by_hostname(&register_request("host-a"))
        .await
        .unwrap();
    let dest = local_destination("primary");
    store.create_destination(&dest).await.unwrap();

    let policy = Policy::new("nightly", agent.id, "0 2 * * *", vec!["/data".to_string()]);
    store
        .create_policy(&policy, &[(dest.id, 0)])
        .await
        .unwrap();

    let err = store.delete_destination(dest.id).await.unwrap_err();
    assert!(matches!(err, StoreError::DestinationInUse(id) if id == dest.id));

    // After the policy is soft-deleted the destination can go.
    store.soft_delete_policy(policy.id).await.unwrap();
    store.delete_destination(dest.id).await.unwrap();
    assert!(store.get_destination(dest.id).await.unwrap().is_none());
}

#[tokio::test]
async fn policy_destinations_come_back_in_priority_order() {
    let store = setup().await;

    let agent = store
        .upsert_agent_by_hostname(&register_request("host-a"))
        .await
        .unwrap();
    let d1 = local_destination("slow");
    let d2 = local_destination("fast");
    store.create_destination(&d1).await.unwrap();
    store.create_destination(&d2).await.unwrap();

    let policy = Policy::new("nightly", agent.id, "0 2 * * *", vec!["/data".to_string()]);
    store
        .create_policy(&policy, &[(d1.id, 10), (d2.id, 1)])
        .await
        .unwrap();

    let (_, details) = store
        .get_policy_with_destinations(policy.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(details.len(), 2);
    assert_eq!(details[0].destination.id, d2.id);
    assert_eq!(details[0].priority, 1);
    assert_eq!(details[1].destination.id, d1.id);
}

#[tokio::test]
async fn soft_deleted_and_disabled_policies_are_not_listed() {
    let store = setup().await;

    let agent = store
        .upsert_agent_by_hostname(&register_request("host-a"))
        .await
        .unwrap();

    let enabled = Policy::new("on", agent.id, "0 2 * * *", vec![]);
    let mut disabled = Policy::new("off", agent.id, "0 2 * * *", vec![]);
    disabled.enabled = false;
    let deleted = Policy::new("gone", agent.id, "0 2 * * *", vec![]);

    store.create_policy(&enabled, &[]).await.unwrap();
    store.create_policy(&disabled, &[]).await.unwrap();
    store.create_policy(&deleted, &[]).await.unwrap();
    store.soft_delete_policy(deleted.id).await.unwrap();

    let listed = store.list_enabled_policies().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, enabled.id);
}

#[tokio::test]
async fn terminal_status_writes_are_idempotent() {
    let store = setup().await;

    let agent = store
        .upsert_agent_by_hostname(&register_request("host-a"))
        .await
        .unwrap();
    let policy = Policy::new("nightly", agent.id, "0 2 * * *", vec![]);
    store.create_policy(&policy, &[]).await.unwrap();

    let job = Job::pending(policy.id, agent.id);
    store.create_job_with_destinations(&job, &[]).await.unwrap();

    store
        .update_job_status(job.id, JobStatus::Running, None, None)
        .await
        .unwrap();
    let loaded = store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(loaded.status, JobStatus::Running);
    assert!(loaded.started_at.is_some());

    store
        .update_job_status(job.id, JobStatus::Succeeded, None, None)
        .await
        .unwrap();
    let ended_at = store
        .get_job(job.id)
        .await
        .unwrap()
        .unwrap()
        .ended_at
        .expect("terminal job has ended_at");

    // Same terminal again: no-op, never an error.
    store
        .update_job_status(job.id, JobStatus::Succeeded, None, None)
        .await
        .unwrap();
    // A different terminal over a terminal row is also a no-op.
    store
        .update_job_status(job.id, JobStatus::Failed, None, Some("late"))
        .await
        .unwrap();
    // And a terminal row never goes back to running.
    store
        .update_job_status(job.id, JobStatus::Running, None, None)
        .await
        .unwrap();

    let settled = store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(settled.status, JobStatus::Succeeded);
    assert_eq!(settled.ended_at, Some(ended_at));
    assert!(settled.error.is_none());
}

#[tokio::test]
async fn pending_cannot_be_written_through_status_updates() {
    let store = setup().await;

    let agent = store
        .upsert_agent_by_hostname(&register_request("host-a"))
        .await
        .unwrap();
    let policy = Policy::new("nightly", agent.id, "0 2 * * *", vec![]);
    store.create_policy(&policy, &[]).await.unwrap();
    let job = Job::pending(policy.id, agent.id);
    store.create_job_with_destinations(&job, &[]).await.unwrap();

    let err = store
        .update_job_status(job.id, JobStatus::Pending, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidTransition(..)));
}

#[tokio::test]
async fn pending_jobs_replay_in_creation_order() {
    let store = setup().await;

    let agent = store
        .upsert_agent_by_hostname(&register_request("host-a"))
        .await
        .unwrap();
    let policy = Policy::new("nightly", agent.id, "0 2 * * *", vec![]);
    store.create_policy(&policy, &[]).await.unwrap();

    let mut created = Vec::new();
    for _ in 0..3 {
        let job = Job::pending(policy.id, agent.id);
        store.create_job_with_destinations(&job, &[]).await.unwrap();
        created.push(job.id);
        // Job ids are time-ordered at millisecond resolution.
        tokio::time::sleep(std::time::Duration::from_millis(3)).await;
    }

    let pending = store
        .list_pending_jobs_for_agent(agent.id, 50)
        .await
        .unwrap();
    let ids: Vec<_> = pending.into_iter().map(|j| j.id).collect();
    assert_eq!(ids, created);

    // A limit returns the oldest first.
    let limited = store
        .list_pending_jobs_for_agent(agent.id, 1)
        .await
        .unwrap();
    assert_eq!(limited[0].id, created[0]);
}

#[tokio::test]
async fn running_jobs_are_failed_when_the_agent_goes_away() {
    let store = setup().await;

    let agent = store
        .upsert_agent_by_hostname(&register_request("host-a"))
        .await
        .unwrap();
    let policy = Policy::new("nightly", agent.id, "0 2 * * *", vec![]);
    store.create_policy(&policy, &[]).await.unwrap();

    let running = Job::pending(policy.id, agent.id);
    store
        .create_job_with_destinations(&running, &[])
        .await
        .unwrap();
    store
        .update_job_status(running.id, JobStatus::Running, None, None)
        .await
        .unwrap();

    let pending = Job::pending(policy.id, agent.id);
    store
        .create_job_with_destinations(&pending, &[])
        .await
        .unwrap();

    let failed = store
        .fail_running_jobs_for_agent(agent.id, "agent became unresponsive")
        .await
        .unwrap();
    assert_eq!(failed, vec![running.id]);

    let loaded = store.get_job(running.id).await.unwrap().unwrap();
    assert_eq!(loaded.status, JobStatus::Failed);
    assert_eq!(loaded.error.as_deref(), Some("agent became unresponsive"));

    // The pending job is untouched and still eligible for redelivery.
    let still_pending = store.get_job(pending.id).await.unwrap().unwrap();
    assert_eq!(still_pending.status, JobStatus::Pending);
}

#[tokio::test]
async fn logs_flush_in_bulk_and_read_back_in_order() {
    let store = setup().await;

    let agent = store
        .upsert_agent_by_hostname(&register_request("host-a"))
        .await
        .unwrap();
    let policy = Policy::new("nightly", agent.id, "0 2 * * *", vec![]);
    store.create_policy(&policy, &[]).await.unwrap();
    let job = Job::pending(policy.id, agent.id);
    store.create_job_with_destinations(&job, &[]).await.unwrap();

    let base = Utc::now();
    let entries: Vec<NewJobLog> = (0..5)
        .map(|i| NewJobLog {
            job_id: job.id,
            level: if i == 4 { LogLevel::Warn } else { LogLevel::Info },
            message: format!("line {}", i),
            timestamp: base + chrono::Duration::milliseconds(i),
        })
        .collect();

    let inserted = store.bulk_insert_logs(&entries).await.unwrap();
    assert_eq!(inserted, 5);
    assert_eq!(store.bulk_insert_logs(&[]).await.unwrap(), 0);

    let logs = store.list_job_logs(job.id).await.unwrap();
    assert_eq!(logs.len(), 5);
    assert_eq!(logs[0].message, "line 0");
    assert_eq!(logs[4].message, "line 4");
    assert_eq!(logs[4].level, LogLevel::Warn);

    let details = store.get_job_with_details(job.id).await.unwrap().unwrap();
    assert_eq!(details.logs.len(), 5);
}

#[tokio::test]
async fn job_destination_outcomes_roll_up() {
    let store = setup().await;

    let agent = store
        .upsert_agent_by_hostname(&register_request("host-a"))
        .await
        .unwrap();
    let d1 = local_destination("one");
    let d2 = local_destination("two");
    store.create_destination(&d1).await.unwrap();
    store.create_destination(&d2).await.unwrap();
    let policy = Policy::new("nightly", agent.id, "0 2 * * *", vec![]);
    store
        .create_policy(&policy, &[(d1.id, 0), (d2.id, 1)])
        .await
        .unwrap();

    let job = Job::pending(policy.id, agent.id);
    store
        .create_job_with_destinations(&job, &[d1.id, d2.id])
        .await
        .unwrap();

    let details = store.get_job_with_details(job.id).await.unwrap().unwrap();
    assert_eq!(details.destinations.len(), 2);
    assert!(details
        .destinations
        .iter()
        .all(|jd| jd.status == JobStatus::Pending));

    let now = Utc::now();
    let mut jd = details.destinations[0].clone();
    jd.status = JobStatus::Succeeded;
    jd.snapshot_id = Some("abc123".to_string());
    jd.size_bytes = Some(42_000);
    jd.started_at = Some(now);
    jd.ended_at = Some(now);
    store.update_job_destination(&jd).await.unwrap();

    let details = store.get_job_with_details(job.id).await.unwrap().unwrap();
    let updated = details
        .destinations
        .iter()
        .find(|j| j.destination_id == jd.destination_id)
        .unwrap();
    assert_eq!(updated.status, JobStatus::Succeeded);
    assert_eq!(updated.snapshot_id.as_deref(), Some("abc123"));
}

#[tokio::test]
async fn status_counts_cover_all_jobs() {
    let store = setup().await;

    let agent = store
        .upsert_agent_by_hostname(&register_request("host-a"))
        .await
        .unwrap();
    let policy = Policy::new("nightly", agent.id, "0 2 * * *", vec![]);
    store.create_policy(&policy, &[]).await.unwrap();

    for terminal in [None, Some(JobStatus::Succeeded), Some(JobStatus::Failed)] {
        let job = Job::pending(policy.id, agent.id);
        store.create_job_with_destinations(&job, &[]).await.unwrap();
        if let Some(status) = terminal {
            store
                .update_job_status(job.id, status, None, None)
                .await
                .unwrap();
        }
    }

    let counts = store.count_jobs_by_status().await.unwrap();
    assert_eq!(counts.get(&JobStatus::Pending), Some(&1));
    assert_eq!(counts.get(&JobStatus::Succeeded), Some(&1));
    assert_eq!(counts.get(&JobStatus::Failed), Some(&1));
}
