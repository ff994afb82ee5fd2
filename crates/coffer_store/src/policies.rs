//! Policy records and their destination associations.

use chrono::{DateTime, Utc};
use coffer_protocol::{DestinationId, PolicyId, RetentionPolicy};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::error::{Result, StoreError};
use crate::models::{Policy, PolicyDestinationDetail};
use crate::Store;

impl Store {
    /// Create a policy with its destination associations in one
    /// transaction. `destinations` pairs destination ids with priorities
    /// (lower dispatches first).
    pub async fn create_policy(
        &self,
        policy: &Policy,
        destinations: &[(DestinationId, i32)],
    ) -> Result<()> {
        let repo_password = self.encrypt(&policy.repo_password)?;
        let sources = serde_json::to_string(&policy.sources)?;

        let mut tx = self.pool().begin().await?;
        sqlx::query(
            r#"
            INSERT INTO policies (
                id, name, agent_id, schedule, enabled, sources, repo_password,
                keep_daily, keep_weekly, keep_monthly, keep_yearly,
                hook_pre_backup, hook_post_backup, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(policy.id.to_string())
        .bind(&policy.name)
        .bind(policy.agent_id.to_string())
        .bind(&policy.schedule)
        .bind(policy.enabled)
        .bind(&sources)
        .bind(&repo_password)
        .bind(policy.retention.keep_daily)
        .bind(policy.retention.keep_weekly)
        .bind(policy.retention.keep_monthly)
        .bind(policy.retention.keep_yearly)
        .bind(&policy.hook_pre_backup)
        .bind(&policy.hook_post_backup)
        .bind(policy.created_at)
        .bind(policy.updated_at)
        .execute(&mut *tx)
        .await?;

        for (destination_id, priority) in destinations {
            sqlx::query(
                "INSERT INTO policy_destinations (policy_id, destination_id, priority) VALUES (?, ?, ?)",
            )
            .bind(policy.id.to_string())
            .bind(destination_id.to_string())
            .bind(priority)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_policy(&self, id: PolicyId) -> Result<Option<Policy>> {
        let row = sqlx::query("SELECT * FROM policies WHERE id = ? AND deleted_at IS NULL")
            .bind(id.to_string())
            .fetch_optional(self.pool())
            .await?;

        row.map(|row| self.row_to_policy(&row)).transpose()
    }

    /// Policy together with its destinations in priority order (lowest
    /// first). Destination credentials come back decrypted.
    pub async fn get_policy_with_destinations(
        &self,
        id: PolicyId,
    ) -> Result<Option<(Policy, Vec<PolicyDestinationDetail>)>> {
        let Some(policy) = self.get_policy(id).await? else {
            return Ok(None);
        };

        let rows = sqlx::query(
            r#"
            SELECT d.*, pd.priority AS pd_priority
            FROM policy_destinations pd
            JOIN destinations d ON d.id = pd.destination_id
            WHERE pd.policy_id = ?
            ORDER BY pd.priority ASC, d.id ASC
            "#,
        )
        .bind(id.to_string())
        .fetch_all(self.pool())
        .await?;

        let mut details = Vec::with_capacity(rows.len());
        for row in &rows {
            details.push(PolicyDestinationDetail {
                destination: self.row_to_destination(row)?,
                priority: row.get("pd_priority"),
            });
        }
        Ok(Some((policy, details)))
    }

    pub async fn list_enabled_policies(&self) -> Result<Vec<Policy>> {
        let rows = sqlx::query(
            "SELECT * FROM policies WHERE enabled = 1 AND deleted_at IS NULL ORDER BY name",
        )
        .fetch_all(self.pool())
        .await?;

        rows.iter().map(|row| self.row_to_policy(row)).collect()
    }

    /// Maintenance escape hatch: soft-deleted records included.
    pub async fn list_policies_including_deleted(&self) -> Result<Vec<Policy>> {
        let rows = sqlx::query("SELECT * FROM policies ORDER BY name")
            .fetch_all(self.pool())
            .await?;

        rows.iter().map(|row| self.row_to_policy(row)).collect()
    }

    /// Update a policy and replace its destination set in one transaction.
    pub async fn update_policy(
        &self,
        policy: &Policy,
        destinations: &[(DestinationId, i32)],
    ) -> Result<()> {
        let repo_password = self.encrypt(&policy.repo_password)?;
        let sources = serde_json::to_string(&policy.sources)?;

        let mut tx = self.pool().begin().await?;
        let result = sqlx::query(
            r#"
            UPDATE policies SET
                name = ?, agent_id = ?, schedule = ?, enabled = ?, sources = ?,
                repo_password = ?, keep_daily = ?, keep_weekly = ?, keep_monthly = ?,
                keep_yearly = ?, hook_pre_backup = ?, hook_post_backup = ?, updated_at = ?
            WHERE id = ? AND deleted_at IS NULL
            "#,
        )
        .bind(&policy.name)
        .bind(policy.agent_id.to_string())
        .bind(&policy.schedule)
        .bind(policy.enabled)
        .bind(&sources)
        .bind(&repo_password)
        .bind(policy.retention.keep_daily)
        .bind(policy.retention.keep_weekly)
        .bind(policy.retention.keep_monthly)
        .bind(policy.retention.keep_yearly)
        .bind(&policy.hook_pre_backup)
        .bind(&policy.hook_post_backup)
        .bind(Utc::now())
        .bind(policy.id.to_string())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("policy {}", policy.id)));
        }

        sqlx::query("DELETE FROM policy_destinations WHERE policy_id = ?")
            .bind(policy.id.to_string())
            .execute(&mut *tx)
            .await?;
        for (destination_id, priority) in destinations {
            sqlx::query(
                "INSERT INTO policy_destinations (policy_id, destination_id, priority) VALUES (?, ?, ?)",
            )
            .bind(policy.id.to_string())
            .bind(destination_id.to_string())
            .bind(priority)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn soft_delete_policy(&self, id: PolicyId) -> Result<()> {
        let result = sqlx::query(
            "UPDATE policies SET deleted_at = ?, updated_at = ? WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(Utc::now())
        .bind(Utc::now())
        .bind(id.to_string())
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("policy {}", id)));
        }
        Ok(())
    }

    /// Best-effort schedule bookkeeping after a tick fires.
    pub async fn update_policy_schedule(
        &self,
        id: PolicyId,
        last_run: DateTime<Utc>,
        next_run: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE policies SET last_run_at = ?, next_run_at = ?, updated_at = ? WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(last_run)
        .bind(next_run)
        .bind(Utc::now())
        .bind(id.to_string())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    fn row_to_policy(&self, row: &SqliteRow) -> Result<Policy> {
        let id: String = row.get("id");
        let agent_id: String = row.get("agent_id");
        let sources: String = row.get("sources");
        let repo_password: String = row.get("repo_password");

        Ok(Policy {
            id: id
                .parse()
                .map_err(|e| StoreError::corrupt("policies.id", e))?,
            name: row.get("name"),
            agent_id: agent_id
                .parse()
                .map_err(|e| StoreError::corrupt("policies.agent_id", e))?,
            schedule: row.get("schedule"),
            enabled: row.get("enabled"),
            sources: serde_json::from_str(&sources)
                .map_err(|e| StoreError::corrupt("policies.sources", e))?,
            repo_password: self.decrypt(&repo_password)?,
            retention: RetentionPolicy {
                keep_daily: row.get::<i64, _>("keep_daily") as u32,
                keep_weekly: row.get::<i64, _>("keep_weekly") as u32,
                keep_monthly: row.get::<i64, _>("keep_monthly") as u32,
                keep_yearly: row.get::<i64, _>("keep_yearly") as u32,
            },
            hook_pre_backup: row.get("hook_pre_backup"),
            hook_post_backup: row.get("hook_post_backup"),
            last_run_at: row.get("last_run_at"),
            next_run_at: row.get("next_run_at"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }
}
