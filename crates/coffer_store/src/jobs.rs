//! Job records, per-destination outcomes, and job logs.
//!
//! `update_job_status` is the linearization point for the job state
//! machine: a compare-and-set that never lets a terminal row change again
//! and treats repeated terminal writes as no-ops.

use chrono::{DateTime, Utc};
use coffer_protocol::{AgentId, DestinationId, JobId, JobStatus, PolicyId};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::collections::HashMap;
use tracing::debug;

use crate::error::{Result, StoreError};
use crate::models::{Job, JobDestination, JobDetails, JobLogLine, NewJobLog};
use crate::Store;

const TERMINAL_FILTER: &str = "('succeeded','failed','cancelled')";

impl Store {
    /// Create a job and one pending destination row per destination, in a
    /// single transaction.
    pub async fn create_job_with_destinations(
        &self,
        job: &Job,
        destination_ids: &[DestinationId],
    ) -> Result<()> {
        let mut tx = self.pool().begin().await?;
        sqlx::query(
            r#"
            INSERT INTO jobs (id, policy_id, agent_id, status, error, started_at, ended_at, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(job.id.to_string())
        .bind(job.policy_id.to_string())
        .bind(job.agent_id.to_string())
        .bind(job.status.as_str())
        .bind(&job.error)
        .bind(job.started_at)
        .bind(job.ended_at)
        .bind(job.created_at)
        .execute(&mut *tx)
        .await?;

        for destination_id in destination_ids {
            sqlx::query(
                "INSERT INTO job_destinations (job_id, destination_id, status) VALUES (?, ?, 'pending')",
            )
            .bind(job.id.to_string())
            .bind(destination_id.to_string())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_job(&self, id: JobId) -> Result<Option<Job>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(self.pool())
            .await?;

        row.map(|row| row_to_job(&row)).transpose()
    }

    pub async fn get_job_with_details(&self, id: JobId) -> Result<Option<JobDetails>> {
        let Some(job) = self.get_job(id).await? else {
            return Ok(None);
        };

        let rows = sqlx::query(
            "SELECT * FROM job_destinations WHERE job_id = ? ORDER BY destination_id",
        )
        .bind(id.to_string())
        .fetch_all(self.pool())
        .await?;
        let destinations = rows
            .iter()
            .map(row_to_job_destination)
            .collect::<Result<Vec<_>>>()?;

        let logs = self.list_job_logs(id).await?;

        Ok(Some(JobDetails {
            job,
            destinations,
            logs,
        }))
    }

    /// Recent jobs for an agent, newest first.
    pub async fn list_jobs_by_agent(
        &self,
        agent_id: AgentId,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Job>> {
        let rows = sqlx::query(
            "SELECT * FROM jobs WHERE agent_id = ? ORDER BY id DESC LIMIT ? OFFSET ?",
        )
        .bind(agent_id.to_string())
        .bind(limit.max(0))
        .bind(offset.max(0))
        .fetch_all(self.pool())
        .await?;

        rows.iter().map(row_to_job).collect()
    }

    /// Pending jobs for redelivery, in creation order. Job ids are
    /// time-ordered, so primary-key order is creation order.
    pub async fn list_pending_jobs_for_agent(
        &self,
        agent_id: AgentId,
        limit: i64,
    ) -> Result<Vec<Job>> {
        let rows = sqlx::query(
            "SELECT * FROM jobs WHERE agent_id = ? AND status = 'pending' ORDER BY id ASC LIMIT ?",
        )
        .bind(agent_id.to_string())
        .bind(limit.max(0))
        .fetch_all(self.pool())
        .await?;

        rows.iter().map(row_to_job).collect()
    }

    /// Advance the job state machine.
    ///
    /// Idempotent on terminal states: re-writing a terminal status over a
    /// terminal row is a no-op, never an error. A terminal row is never
    /// moved back to a non-terminal state.
    pub async fn update_job_status(
        &self,
        id: JobId,
        status: JobStatus,
        ended_at: Option<DateTime<Utc>>,
        error: Option<&str>,
    ) -> Result<()> {
        let result = match status {
            JobStatus::Pending => {
                return Err(StoreError::InvalidTransition(id, status.as_str().to_string()));
            }
            JobStatus::Running => {
                sqlx::query(
                    "UPDATE jobs SET status = 'running', started_at = COALESCE(started_at, ?) \
                     WHERE id = ? AND status IN ('pending','running')",
                )
                .bind(Utc::now())
                .bind(id.to_string())
                .execute(self.pool())
                .await?
            }
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled => {
                sqlx::query(&format!(
                    "UPDATE jobs SET status = ?, ended_at = ?, error = ? \
                     WHERE id = ? AND status NOT IN {}",
                    TERMINAL_FILTER
                ))
                .bind(status.as_str())
                .bind(ended_at.unwrap_or_else(Utc::now))
                .bind(error)
                .bind(id.to_string())
                .execute(self.pool())
                .await?
            }
        };

        if result.rows_affected() == 0 {
            return match self.get_job(id).await? {
                None => Err(StoreError::NotFound(format!("job {}", id))),
                Some(job) if job.status.is_terminal() => {
                    debug!(job_id = %id, status = %status, "job already terminal, status write is a no-op");
                    Ok(())
                }
                Some(_) => Ok(()),
            };
        }
        Ok(())
    }

    /// Record one destination's outcome.
    pub async fn update_job_destination(&self, jd: &JobDestination) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE job_destinations
            SET status = ?, snapshot_id = ?, size_bytes = ?, error = ?, started_at = ?, ended_at = ?
            WHERE job_id = ? AND destination_id = ?
            "#,
        )
        .bind(jd.status.as_str())
        .bind(&jd.snapshot_id)
        .bind(jd.size_bytes)
        .bind(&jd.error)
        .bind(jd.started_at)
        .bind(jd.ended_at)
        .bind(jd.job_id.to_string())
        .bind(jd.destination_id.to_string())
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!(
                "job destination {}/{}",
                jd.job_id, jd.destination_id
            )));
        }
        Ok(())
    }

    /// Whether the policy has a job currently executing. The scheduler's
    /// singleton check.
    pub async fn has_running_job(&self, policy_id: PolicyId) -> Result<bool> {
        let row = sqlx::query(
            "SELECT EXISTS(SELECT 1 FROM jobs WHERE policy_id = ? AND status = 'running') AS busy",
        )
        .bind(policy_id.to_string())
        .fetch_one(self.pool())
        .await?;
        Ok(row.get::<i64, _>("busy") != 0)
    }

    /// Fail every running job owned by an agent (the agent went away while
    /// they were executing). Returns the affected job ids.
    pub async fn fail_running_jobs_for_agent(
        &self,
        agent_id: AgentId,
        error: &str,
    ) -> Result<Vec<JobId>> {
        let rows = sqlx::query("SELECT id FROM jobs WHERE agent_id = ? AND status = 'running'")
            .bind(agent_id.to_string())
            .fetch_all(self.pool())
            .await?;

        let mut failed = Vec::with_capacity(rows.len());
        for row in rows {
            let raw: String = row.get("id");
            let id: JobId = raw.parse().map_err(|e| StoreError::corrupt("jobs.id", e))?;
            self.update_job_status(id, JobStatus::Failed, None, Some(error))
                .await?;
            failed.push(id);
        }
        Ok(failed)
    }

    pub async fn count_jobs_by_status(&self) -> Result<HashMap<JobStatus, i64>> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM jobs GROUP BY status")
            .fetch_all(self.pool())
            .await?;

        let mut counts = HashMap::new();
        for row in rows {
            let raw: String = row.get("status");
            let status: JobStatus = raw
                .parse()
                .map_err(|e| StoreError::corrupt("jobs.status", e))?;
            counts.insert(status, row.get::<i64, _>("n"));
        }
        Ok(counts)
    }

    /// Append log lines in one transaction. Returns the number inserted.
    pub async fn bulk_insert_logs(&self, entries: &[NewJobLog]) -> Result<u64> {
        if entries.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool().begin().await?;
        for entry in entries {
            sqlx::query(
                "INSERT INTO job_logs (job_id, level, message, logged_at) VALUES (?, ?, ?, ?)",
            )
            .bind(entry.job_id.to_string())
            .bind(entry.level.as_str())
            .bind(&entry.message)
            .bind(entry.timestamp)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(entries.len() as u64)
    }

    pub async fn list_job_logs(&self, job_id: JobId) -> Result<Vec<JobLogLine>> {
        let rows =
            sqlx::query("SELECT * FROM job_logs WHERE job_id = ? ORDER BY logged_at ASC, id ASC")
                .bind(job_id.to_string())
                .fetch_all(self.pool())
                .await?;

        rows.iter().map(row_to_log).collect()
    }
}

fn row_to_job(row: &SqliteRow) -> Result<Job> {
    let id: String = row.get("id");
    let policy_id: String = row.get("policy_id");
    let agent_id: String = row.get("agent_id");
    let status: String = row.get("status");

    Ok(Job {
        id: id.parse().map_err(|e| StoreError::corrupt("jobs.id", e))?,
        policy_id: policy_id
            .parse()
            .map_err(|e| StoreError::corrupt("jobs.policy_id", e))?,
        agent_id: agent_id
            .parse()
            .map_err(|e| StoreError::corrupt("jobs.agent_id", e))?,
        status: status
            .parse()
            .map_err(|e| StoreError::corrupt("jobs.status", e))?,
        error: row.get("error"),
        started_at: row.get("started_at"),
        ended_at: row.get("ended_at"),
        created_at: row.get("created_at"),
    })
}

fn row_to_job_destination(row: &SqliteRow) -> Result<JobDestination> {
    let job_id: String = row.get("job_id");
    let destination_id: String = row.get("destination_id");
    let status: String = row.get("status");

    Ok(JobDestination {
        job_id: job_id
            .parse()
            .map_err(|e| StoreError::corrupt("job_destinations.job_id", e))?,
        destination_id: destination_id
            .parse()
            .map_err(|e| StoreError::corrupt("job_destinations.destination_id", e))?,
        status: status
            .parse()
            .map_err(|e| StoreError::corrupt("job_destinations.status", e))?,
        snapshot_id: row.get("snapshot_id"),
        size_bytes: row.get("size_bytes"),
        error: row.get("error"),
        started_at: row.get("started_at"),
        ended_at: row.get("ended_at"),
    })
}

fn row_to_log(row: &SqliteRow) -> Result<JobLogLine> {
    let job_id: String = row.get("job_id");
    let level: String = row.get("level");

    Ok(JobLogLine {
        id: row.get("id"),
        job_id: job_id
            .parse()
            .map_err(|e| StoreError::corrupt("job_logs.job_id", e))?,
        level: level
            .parse()
            .map_err(|e| StoreError::corrupt("job_logs.level", e))?,
        message: row.get("message"),
        logged_at: row.get("logged_at"),
    })
}
