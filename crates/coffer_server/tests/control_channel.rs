//! Control-channel integration tests: a real TCP server stack with a
//! scripted agent on the other end.

use chrono::Utc;
use coffer_protocol::{
    wire, AgentId, AgentMetrics, AgentStatus, Capabilities, DestinationKind, DestinationOutcome,
    ErrorCode, ErrorPayload, Frame, HeartbeatRequest, HelloPayload, JobAssignment, JobId,
    JobStatus, LogClose, LogCloseAck, LogEntry, LogLevel, OpCode, OpenStreamRequest, RegisterAck,
    RegisterRequest, ReportedStatus, StatusReport, PROTOCOL_VERSION,
};
use coffer_server::control::{ControlConfig, ControlServer};
use coffer_server::dispatch::Dispatcher;
use coffer_server::events::EventBus;
use coffer_server::registry::Registry;
use coffer_server::scheduler::Scheduler;
use coffer_store::{Destination, Policy, Store};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

struct TestStack {
    store: Store,
    registry: Arc<Registry>,
    scheduler: Scheduler,
    addr: SocketAddr,
    _shutdown: CancellationToken,
}

async fn start_stack(secret: &str) -> TestStack {
    let store = Store::open_in_memory().await.unwrap();
    store.init().await.unwrap();

    let shutdown = CancellationToken::new();
    let registry = Arc::new(Registry::new(Duration::from_millis(500)));
    let events = EventBus::new(64);
    let dispatcher = Arc::new(Dispatcher::new(registry.clone(), events.clone()));
    let scheduler = Scheduler::new(store.clone(), dispatcher, shutdown.child_token());

    let control = ControlServer::new(
        ControlConfig {
            shared_secret: secret.to_string(),
        },
        store.clone(),
        registry.clone(),
        events,
        Arc::new(scheduler.clone()),
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(control.run(listener, shutdown.child_token()));

    TestStack {
        store,
        registry,
        scheduler,
        addr,
        _shutdown: shutdown,
    }
}

async fn connect(addr: SocketAddr) -> TcpStream {
    TcpStream::connect(addr).await.unwrap()
}

async fn send<T: serde::Serialize>(stream: &mut TcpStream, opcode: OpCode, job_id: JobId, value: &T) {
    let frame = Frame::json(opcode, job_id, value).unwrap();
    wire::write_frame(stream, &frame).await.unwrap();
}

async fn recv(stream: &mut TcpStream) -> Frame {
    tokio::time::timeout(Duration::from_secs(5), wire::read_frame(stream))
        .await
        .expect("timed out waiting for frame")
        .expect("stream closed")
}

async fn hello(stream: &mut TcpStream, secret: &str) {
    send(
        stream,
        OpCode::Hello,
        JobId::nil(),
        &HelloPayload {
            secret: secret.to_string(),
            protocol_version: PROTOCOL_VERSION,
        },
    )
    .await;
}

async fn register(stream: &mut TcpStream, hostname: &str) -> AgentId {
    send(
        stream,
        OpCode::Register,
        JobId::nil(),
        &RegisterRequest {
            hostname: hostname.to_string(),
            version: "0.1.0".to_string(),
            os: "linux".to_string(),
            arch: "x86_64".to_string(),
            capabilities: Capabilities {
                restic: true,
                rclone: false,
                docker: false,
            },
        },
    )
    .await;
    let frame = recv(stream).await;
    assert_eq!(frame.header.opcode, OpCode::RegisterAck);
    let ack: RegisterAck = frame.parse().unwrap();
    ack.agent_id
}

/// Poll until `predicate` holds or a deadline passes.
async fn wait_for<F, Fut>(what: &str, mut predicate: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if predicate().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {}", what);
}

async fn seed_policy(store: &Store, agent_id: AgentId) -> (Policy, Destination) {
    let dest = Destination::new(
        "local",
        DestinationKind::Local,
        r#"{"type":"local","path":"/backup"}"#.to_string(),
    );
    store.create_destination(&dest).await.unwrap();
    let mut policy = Policy::new(
        "nightly",
        agent_id,
        "0 2 * * *",
        vec!["/data".to_string()],
    );
    policy.repo_password = "hunter2".to_string();
    store.create_policy(&policy, &[(dest.id, 0)]).await.unwrap();
    (policy, dest)
}

#[tokio::test]
async fn wrong_secret_is_rejected_with_no_side_effects() {
    let stack = start_stack("s1").await;

    let mut stream = connect(stack.addr).await;
    hello(&mut stream, "s2").await;

    let frame = recv(&mut stream).await;
    assert_eq!(frame.header.opcode, OpCode::Error);
    let err: ErrorPayload = frame.parse().unwrap();
    assert_eq!(err.code, ErrorCode::Unauthenticated);

    // The session is gone; no agent record was created, nothing in the
    // registry.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(stack.store.list_agents().await.unwrap().is_empty());
    assert_eq!(stack.registry.online_count(), 0);
}

#[tokio::test]
async fn empty_secret_disables_authentication() {
    let stack = start_stack("").await;

    let mut stream = connect(stack.addr).await;
    hello(&mut stream, "").await;
    let agent_id = register(&mut stream, "dev-host").await;
    assert!(!agent_id.is_nil());
}

#[tokio::test]
async fn registering_twice_reunifies_by_hostname() {
    let stack = start_stack("s1").await;

    let mut first = connect(stack.addr).await;
    hello(&mut first, "s1").await;
    let id1 = register(&mut first, "host-a").await;
    drop(first);

    // Same hostname, fresh connection (agent lost its state file).
    let mut second = connect(stack.addr).await;
    hello(&mut second, "s1").await;
    let id2 = register(&mut second, "host-a").await;

    assert_eq!(id1, id2);
    assert_eq!(stack.store.list_agents().await.unwrap().len(), 1);
}

#[tokio::test]
async fn full_backup_lifecycle_over_the_wire() {
    let stack = start_stack("s1").await;

    let mut stream = connect(stack.addr).await;
    hello(&mut stream, "s1").await;
    let agent_id = register(&mut stream, "host-a").await;

    send(
        &mut stream,
        OpCode::OpenStream,
        JobId::nil(),
        &OpenStreamRequest { agent_id },
    )
    .await;

    let registry = stack.registry.clone();
    wait_for("agent to come online", || {
        let registry = registry.clone();
        async move { registry.is_online(agent_id) }
    })
    .await;
    let agent = stack.store.get_agent(agent_id).await.unwrap().unwrap();
    assert_eq!(agent.status, AgentStatus::Online);

    // Materialize a job while the agent is online: it arrives as an
    // assignment on the open stream.
    let (policy, dest) = seed_policy(&stack.store, agent_id).await;
    let job_id = stack.scheduler.trigger_now(policy.id).await.unwrap();

    let frame = recv(&mut stream).await;
    assert_eq!(frame.header.opcode, OpCode::Assign);
    let assignment: JobAssignment = frame.parse().unwrap();
    assert_eq!(assignment.job_id, job_id);
    let payload = assignment.decode_backup_payload().unwrap();
    assert_eq!(payload.sources, vec!["/data".to_string()]);
    assert_eq!(payload.repo_password, "hunter2");
    assert_eq!(payload.destinations.len(), 1);
    assert_eq!(payload.destinations[0].repo_url, "/backup");

    // Running, then logs, then the terminal report, then log close.
    send(
        &mut stream,
        OpCode::StatusReport,
        job_id,
        &StatusReport {
            job_id,
            agent_id,
            status: ReportedStatus::Running,
            message: String::new(),
            timestamp: Utc::now(),
            destinations: vec![],
        },
    )
    .await;

    for i in 0..3 {
        send(
            &mut stream,
            OpCode::LogEntry,
            job_id,
            &LogEntry {
                job_id,
                agent_id,
                level: LogLevel::Info,
                message: format!("processed {} files", i * 10),
                timestamp: Utc::now(),
            },
        )
        .await;
    }

    let now = Utc::now();
    send(
        &mut stream,
        OpCode::StatusReport,
        job_id,
        &StatusReport {
            job_id,
            agent_id,
            status: ReportedStatus::Completed,
            message: "backup completed successfully".to_string(),
            timestamp: now,
            destinations: vec![DestinationOutcome {
                destination_id: dest.id,
                status: JobStatus::Succeeded,
                snapshot_id: Some("snap-1234".to_string()),
                size_bytes: Some(42_000),
                error: None,
                started_at: now,
                ended_at: now,
            }],
        },
    )
    .await;

    send(&mut stream, OpCode::LogClose, job_id, &LogClose { job_id }).await;
    let frame = recv(&mut stream).await;
    assert_eq!(frame.header.opcode, OpCode::LogCloseAck);
    let ack: LogCloseAck = frame.parse().unwrap();
    assert_eq!(ack.entries_received, 3);

    let store = stack.store.clone();
    wait_for("job to settle", || {
        let store = store.clone();
        async move {
            store
                .get_job(job_id)
                .await
                .unwrap()
                .map(|j| j.status == JobStatus::Succeeded)
                .unwrap_or(false)
        }
    })
    .await;

    let details = stack
        .store
        .get_job_with_details(job_id)
        .await
        .unwrap()
        .unwrap();
    assert!(details.job.ended_at.is_some());
    assert_eq!(details.destinations.len(), 1);
    assert_eq!(details.destinations[0].status, JobStatus::Succeeded);
    assert_eq!(details.destinations[0].snapshot_id.as_deref(), Some("snap-1234"));
    assert_eq!(details.logs.len(), 3);

    let snapshots = stack
        .store
        .list_snapshots_by_policy(policy.id)
        .await
        .unwrap();
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].engine_id, "snap-1234");

    // Disconnect: exactly one online -> offline transition.
    drop(stream);
    let store = stack.store.clone();
    wait_for("agent to go offline", || {
        let store = store.clone();
        async move {
            store
                .get_agent(agent_id)
                .await
                .unwrap()
                .map(|a| a.status == AgentStatus::Offline)
                .unwrap_or(false)
        }
    })
    .await;
    assert_eq!(stack.registry.online_count(), 0);
}

#[tokio::test]
async fn jobs_created_offline_are_redelivered_on_reconnect() {
    let stack = start_stack("s1").await;

    // Register once so the agent record exists, then drop the session.
    let mut stream = connect(stack.addr).await;
    hello(&mut stream, "s1").await;
    let agent_id = register(&mut stream, "host-a").await;
    drop(stream);

    let (policy, _dest) = seed_policy(&stack.store, agent_id).await;

    // Trigger while offline: the job is created pending, nothing is sent.
    let job_id = stack.scheduler.trigger_now(policy.id).await.unwrap();
    let job = stack.store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);

    // Reconnect and open the stream: the pending job is replayed.
    let mut stream = connect(stack.addr).await;
    hello(&mut stream, "s1").await;
    let same_id = register(&mut stream, "host-a").await;
    assert_eq!(same_id, agent_id);
    send(
        &mut stream,
        OpCode::OpenStream,
        JobId::nil(),
        &OpenStreamRequest { agent_id },
    )
    .await;

    let frame = recv(&mut stream).await;
    assert_eq!(frame.header.opcode, OpCode::Assign);
    let assignment: JobAssignment = frame.parse().unwrap();
    assert_eq!(assignment.job_id, job_id);
}

#[tokio::test]
async fn heartbeats_refresh_liveness_and_ack() {
    let stack = start_stack("s1").await;

    let mut stream = connect(stack.addr).await;
    hello(&mut stream, "s1").await;
    let agent_id = register(&mut stream, "host-a").await;

    send(
        &mut stream,
        OpCode::Heartbeat,
        JobId::nil(),
        &HeartbeatRequest {
            agent_id,
            metrics: AgentMetrics {
                cpu_percent: 12.5,
                memory_percent: 40.0,
                disk_percent: 73.0,
            },
        },
    )
    .await;

    let frame = recv(&mut stream).await;
    assert_eq!(frame.header.opcode, OpCode::HeartbeatAck);
    let ack: coffer_protocol::HeartbeatAck = frame.parse().unwrap();
    assert!(!ack.has_pending_jobs);

    let agent = stack.store.get_agent(agent_id).await.unwrap().unwrap();
    assert_eq!(agent.status, AgentStatus::Online);
    assert!(agent.last_seen_at.is_some());
}

#[tokio::test]
async fn invalid_status_and_unknown_job_are_rejected() {
    let stack = start_stack("s1").await;

    let mut stream = connect(stack.addr).await;
    hello(&mut stream, "s1").await;
    let agent_id = register(&mut stream, "host-a").await;

    // Unknown enum value: INVALID_ARGUMENT, no side effects.
    let job_id = JobId::generate();
    send(
        &mut stream,
        OpCode::StatusReport,
        job_id,
        &StatusReport {
            job_id,
            agent_id,
            status: ReportedStatus::Unspecified,
            message: String::new(),
            timestamp: Utc::now(),
            destinations: vec![],
        },
    )
    .await;
    let frame = recv(&mut stream).await;
    assert_eq!(frame.header.opcode, OpCode::Error);
    let err: ErrorPayload = frame.parse().unwrap();
    assert_eq!(err.code, ErrorCode::InvalidArgument);

    // Job id that does not exist: NOT_FOUND, no side effects.
    send(
        &mut stream,
        OpCode::StatusReport,
        job_id,
        &StatusReport {
            job_id,
            agent_id,
            status: ReportedStatus::Running,
            message: String::new(),
            timestamp: Utc::now(),
            destinations: vec![],
        },
    )
    .await;
    let frame = recv(&mut stream).await;
    assert_eq!(frame.header.opcode, OpCode::Error);
    let err: ErrorPayload = frame.parse().unwrap();
    assert_eq!(err.code, ErrorCode::NotFound);

    // The session survives both rejections.
    let _ = register(&mut stream, "host-a").await;
}

#[tokio::test]
async fn running_jobs_fail_when_the_session_drops() {
    let stack = start_stack("s1").await;

    let mut stream = connect(stack.addr).await;
    hello(&mut stream, "s1").await;
    let agent_id = register(&mut stream, "host-a").await;
    send(
        &mut stream,
        OpCode::OpenStream,
        JobId::nil(),
        &OpenStreamRequest { agent_id },
    )
    .await;
    let registry = stack.registry.clone();
    wait_for("agent to come online", || {
        let registry = registry.clone();
        async move { registry.is_online(agent_id) }
    })
    .await;

    let (policy, _dest) = seed_policy(&stack.store, agent_id).await;
    let job_id = stack.scheduler.trigger_now(policy.id).await.unwrap();

    // Consume the assignment and report running, then vanish.
    let frame = recv(&mut stream).await;
    assert_eq!(frame.header.opcode, OpCode::Assign);
    send(
        &mut stream,
        OpCode::StatusReport,
        job_id,
        &StatusReport {
            job_id,
            agent_id,
            status: ReportedStatus::Running,
            message: String::new(),
            timestamp: Utc::now(),
            destinations: vec![],
        },
    )
    .await;

    let store = stack.store.clone();
    wait_for("job to start", || {
        let store = store.clone();
        async move {
            store
                .get_job(job_id)
                .await
                .unwrap()
                .map(|j| j.status == JobStatus::Running)
                .unwrap_or(false)
        }
    })
    .await;

    drop(stream);

    let store = stack.store.clone();
    wait_for("orphaned job to fail", || {
        let store = store.clone();
        async move {
            store
                .get_job(job_id)
                .await
                .unwrap()
                .map(|j| j.status == JobStatus::Failed)
                .unwrap_or(false)
        }
    })
    .await;

    let job = stack.store.get_job(job_id).await.unwrap().unwrap();
    assert!(job
        .error
        .as_deref()
        .unwrap_or_default()
        .contains("disconnected"));
}
