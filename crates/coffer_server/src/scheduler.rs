//! Cron-driven scheduler.
//!
//! One cron entry per enabled policy, keyed by policy id. A 1-second tick
//! loop materializes a pending job for each due entry and hands it to the
//! dispatcher. Singleton mode: a tick is deferred to the next cron match
//! while a previous run of the same policy is still executing — enforced
//! with an in-memory in-flight flag for the materialization window and a
//! store check for the execution window. The agent's serial executor is
//! the second line of enforcement.

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use coffer_protocol::defaults;
use coffer_protocol::{AgentId, DestinationId, JobId, JobStatus, PolicyId};
use coffer_store::{Job, Policy, Store};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::control::PendingDispatcher;
use crate::dispatch::Dispatcher;

/// Cadence of the tick loop.
const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Parse a standard 5-field cron expression.
///
/// The cron engine wants a seconds field, so a literal `0` is prepended;
/// anything that is not exactly 5 fields is rejected.
pub fn parse_schedule(expr: &str) -> Result<cron::Schedule> {
    let trimmed = expr.trim();
    let fields = trimmed.split_whitespace().count();
    if fields != 5 {
        bail!(
            "schedule '{}' must be a standard 5-field cron expression",
            expr
        );
    }
    cron::Schedule::from_str(&format!("0 {}", trimmed))
        .with_context(|| format!("invalid cron expression '{}'", expr))
}

struct CronEntry {
    schedule: cron::Schedule,
    next_fire: Option<DateTime<Utc>>,
    /// True while a tick for this entry is materializing a job.
    tick_in_flight: bool,
}

pub(crate) struct SchedulerInner {
    store: Store,
    dispatcher: Arc<Dispatcher>,
    entries: Mutex<HashMap<PolicyId, CronEntry>>,
    shutdown: CancellationToken,
}

/// Handle to the scheduler. Cheap to clone.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    pub fn new(store: Store, dispatcher: Arc<Dispatcher>, shutdown: CancellationToken) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                store,
                dispatcher,
                entries: Mutex::new(HashMap::new()),
                shutdown,
            }),
        }
    }

    /// Load every enabled policy into the cron table. Called once at boot.
    pub async fn load_enabled(&self) -> Result<usize> {
        let policies = self.inner.store.list_enabled_policies().await?;
        let mut added = 0;
        for policy in &policies {
            match self.add_policy(policy) {
                Ok(()) => added += 1,
                Err(e) => warn!(policy = %policy.name, "skipping policy with bad schedule: {e:#}"),
            }
        }
        Ok(added)
    }

    /// Register a cron entry for a policy. Disabled policies are ignored.
    pub fn add_policy(&self, policy: &Policy) -> Result<()> {
        if !policy.enabled {
            return Ok(());
        }
        let schedule = parse_schedule(&policy.schedule)?;
        let next_fire = schedule.upcoming(Utc).next();
        let mut entries = self.inner.entries.lock().expect("scheduler lock poisoned");
        entries.insert(
            policy.id,
            CronEntry {
                schedule,
                next_fire,
                tick_in_flight: false,
            },
        );
        debug!(policy_id = %policy.id, next_fire = ?next_fire, "cron entry registered");
        Ok(())
    }

    /// Remove a policy's cron entry. Idempotent.
    pub fn remove_policy(&self, id: PolicyId) {
        let mut entries = self.inner.entries.lock().expect("scheduler lock poisoned");
        entries.remove(&id);
    }

    /// Remove-then-add: covers schedule changes and enable/disable flips
    /// in one step.
    pub fn update_policy(&self, policy: &Policy) -> Result<()> {
        self.remove_policy(policy.id);
        self.add_policy(policy)
    }

    pub fn entry_count(&self) -> usize {
        self.inner
            .entries
            .lock()
            .expect("scheduler lock poisoned")
            .len()
    }

    /// Synchronous equivalent of one tick: bypasses the cron schedule but
    /// uses the same job-creation path, including the singleton check.
    pub async fn trigger_now(&self, id: PolicyId) -> Result<JobId> {
        let (policy, destinations) = self
            .inner
            .store
            .get_policy_with_destinations(id)
            .await?
            .ok_or_else(|| anyhow!("policy {} not found", id))?;

        if self.inner.store.has_running_job(id).await? {
            bail!("policy {} already has a running job", id);
        }

        let next_fire = {
            let entries = self.inner.entries.lock().expect("scheduler lock poisoned");
            entries.get(&id).and_then(|e| e.next_fire)
        };
        self.inner
            .materialize_and_dispatch(&policy, &destinations, next_fire)
            .await
    }

    /// Replay pending jobs to a reconnected agent.
    pub async fn dispatch_pending(&self, agent_id: AgentId) -> Result<usize> {
        self.inner.dispatch_pending(agent_id).await
    }

    /// Start the tick loop. Runs until the shutdown token fires.
    pub fn start(&self) -> tokio::task::JoinHandle<()> {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(TICK_INTERVAL);
            info!("scheduler tick loop started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        inner.clone().fire_due_entries();
                    }
                    _ = inner.shutdown.cancelled() => {
                        info!("scheduler tick loop stopped");
                        break;
                    }
                }
            }
        })
    }
}

impl SchedulerInner {
    /// Collect due entries and spawn one run per entry. The next fire time
    /// advances whether the tick runs or defers, so a deferred tick fires
    /// at the following cron match, never in parallel.
    fn fire_due_entries(self: Arc<Self>) {
        let now = Utc::now();
        let due = {
            let mut entries = self.entries.lock().expect("scheduler lock poisoned");
            let mut due = Vec::new();
            for (id, entry) in entries.iter_mut() {
                let Some(next) = entry.next_fire else { continue };
                if next > now {
                    continue;
                }
                entry.next_fire = entry.schedule.after(&now).next();
                if entry.tick_in_flight {
                    debug!(policy_id = %id, "previous tick still in flight, deferring");
                    continue;
                }
                entry.tick_in_flight = true;
                due.push((*id, entry.next_fire));
            }
            due
        };

        for (policy_id, next_fire) in due {
            let inner = self.clone();
            tokio::spawn(async move {
                if let Err(e) = inner.run_tick(policy_id, next_fire).await {
                    warn!(policy_id = %policy_id, "cron tick failed: {e:#}");
                }
                inner.clear_tick_flag(policy_id);
            });
        }
    }

    fn clear_tick_flag(&self, id: PolicyId) {
        let mut entries = self.entries.lock().expect("scheduler lock poisoned");
        if let Some(entry) = entries.get_mut(&id) {
            entry.tick_in_flight = false;
        }
    }

    async fn run_tick(&self, policy_id: PolicyId, next_fire: Option<DateTime<Utc>>) -> Result<()> {
        // Re-read the policy at fire time: destinations or the enabled flag
        // may have changed since the entry was registered.
        let Some((policy, destinations)) = self
            .store
            .get_policy_with_destinations(policy_id)
            .await?
        else {
            debug!(policy_id = %policy_id, "policy gone at fire time");
            return Ok(());
        };
        if !policy.enabled {
            debug!(policy_id = %policy_id, "policy disabled at fire time");
            return Ok(());
        }

        if self.store.has_running_job(policy_id).await? {
            info!(policy = %policy.name, "previous run still executing, deferring to next fire");
            return Ok(());
        }

        self.materialize_and_dispatch(&policy, &destinations, next_fire)
            .await?;
        Ok(())
    }

    /// The shared job-creation path for cron ticks and manual triggers.
    async fn materialize_and_dispatch(
        &self,
        policy: &Policy,
        destinations: &[coffer_store::PolicyDestinationDetail],
        next_fire: Option<DateTime<Utc>>,
    ) -> Result<JobId> {
        let job = Job::pending(policy.id, policy.agent_id);
        let destination_ids: Vec<DestinationId> =
            destinations.iter().map(|d| d.destination.id).collect();

        tokio::time::timeout(
            defaults::STORE_OP_DEADLINE,
            self.store.create_job_with_destinations(&job, &destination_ids),
        )
        .await
        .map_err(|_| anyhow!("job creation timed out"))??;
        info!(job_id = %job.id, policy = %policy.name, "job materialized");

        // Best effort: losing the schedule timestamps must not lose the job.
        if let Err(e) = self
            .store
            .update_policy_schedule(policy.id, Utc::now(), next_fire)
            .await
        {
            warn!(policy_id = %policy.id, "failed to record schedule timestamps: {e}");
        }

        match self.dispatcher.dispatch(&job, policy, destinations).await {
            Ok(()) => {}
            Err(e) if e.is_retriable() => {
                warn!(job_id = %job.id, agent_id = %policy.agent_id, "agent unavailable, job stays pending: {e}");
            }
            Err(e) => {
                warn!(job_id = %job.id, "dispatch failed, job stays pending: {e:#}");
            }
        }
        Ok(job.id)
    }

    async fn dispatch_pending(&self, agent_id: AgentId) -> Result<usize> {
        let jobs = self
            .store
            .list_pending_jobs_for_agent(agent_id, defaults::REDELIVERY_BATCH_LIMIT)
            .await?;
        if jobs.is_empty() {
            return Ok(0);
        }
        info!(agent_id = %agent_id, count = jobs.len(), "redelivering pending jobs");

        let mut delivered = 0;
        for job in jobs {
            // Re-resolve the policy per job to pick up destination changes
            // made since the job was created.
            let Some((policy, destinations)) = self
                .store
                .get_policy_with_destinations(job.policy_id)
                .await?
            else {
                info!(job_id = %job.id, "policy deleted, cancelling orphaned job");
                self.store
                    .update_job_status(
                        job.id,
                        JobStatus::Cancelled,
                        None,
                        Some("policy was deleted"),
                    )
                    .await?;
                continue;
            };

            match self.dispatcher.dispatch(&job, &policy, &destinations).await {
                Ok(()) => delivered += 1,
                Err(e) if e.is_retriable() => {
                    // The agent is gone; nothing later in the batch can be
                    // delivered either.
                    warn!(job_id = %job.id, "redelivery stopped, jobs stay pending: {e}");
                    break;
                }
                Err(e) => {
                    // A payload that cannot be built is specific to this
                    // job; later jobs in the batch still get their chance.
                    warn!(job_id = %job.id, "job payload could not be built, leaving it pending: {e:#}");
                }
            }
        }
        Ok(delivered)
    }
}

impl PendingDispatcher for Scheduler {
    fn dispatch_pending(&self, agent_id: AgentId) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            match inner.dispatch_pending(agent_id).await {
                Ok(0) => {}
                Ok(n) => info!(agent_id = %agent_id, delivered = n, "pending jobs redelivered"),
                Err(e) => warn!(agent_id = %agent_id, "pending redelivery failed: {e:#}"),
            }
        });
    }
}
