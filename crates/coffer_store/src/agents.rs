//! Agent records.

use chrono::{DateTime, Utc};
use coffer_protocol::{AgentId, AgentStatus, Capabilities, RegisterRequest};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::error::{Result, StoreError};
use crate::models::Agent;
use crate::Store;

impl Store {
    /// Look up the agent by hostname and update its metadata, or insert a
    /// new record. Hostname is the natural key: an agent that lost its
    /// persisted id reunifies with its existing record here.
    pub async fn upsert_agent_by_hostname(&self, reg: &RegisterRequest) -> Result<Agent> {
        let now = Utc::now();
        let capabilities = serde_json::to_string(&reg.capabilities)?;

        if let Some(existing) = self.get_agent_by_hostname(&reg.hostname).await? {
            sqlx::query(
                "UPDATE agents SET os = ?, arch = ?, version = ?, capabilities = ?, updated_at = ? WHERE id = ?",
            )
            .bind(&reg.os)
            .bind(&reg.arch)
            .bind(&reg.version)
            .bind(&capabilities)
            .bind(now)
            .bind(existing.id.to_string())
            .execute(self.pool())
            .await?;

            return Ok(Agent {
                os: reg.os.clone(),
                arch: reg.arch.clone(),
                version: reg.version.clone(),
                capabilities: reg.capabilities,
                updated_at: now,
                ..existing
            });
        }

        let agent = Agent {
            id: AgentId::generate(),
            name: reg.hostname.clone(),
            hostname: reg.hostname.clone(),
            os: reg.os.clone(),
            arch: reg.arch.clone(),
            version: reg.version.clone(),
            capabilities: reg.capabilities,
            status: AgentStatus::Offline,
            last_seen_at: None,
            created_at: now,
            updated_at: now,
        };

        sqlx::query(
            r#"
            INSERT INTO agents (id, name, hostname, os, arch, version, capabilities, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(agent.id.to_string())
        .bind(&agent.name)
        .bind(&agent.hostname)
        .bind(&agent.os)
        .bind(&agent.arch)
        .bind(&agent.version)
        .bind(&capabilities)
        .bind(agent.status.as_str())
        .bind(agent.created_at)
        .bind(agent.updated_at)
        .execute(self.pool())
        .await?;

        Ok(agent)
    }

    pub async fn get_agent(&self, id: AgentId) -> Result<Option<Agent>> {
        let row = sqlx::query("SELECT * FROM agents WHERE id = ? AND deleted_at IS NULL")
            .bind(id.to_string())
            .fetch_optional(self.pool())
            .await?;

        row.map(|row| row_to_agent(&row)).transpose()
    }

    pub async fn get_agent_by_hostname(&self, hostname: &str) -> Result<Option<Agent>> {
        let row = sqlx::query("SELECT * FROM agents WHERE hostname = ? AND deleted_at IS NULL")
            .bind(hostname)
            .fetch_optional(self.pool())
            .await?;

        row.map(|row| row_to_agent(&row)).transpose()
    }

    pub async fn list_agents(&self) -> Result<Vec<Agent>> {
        let rows = sqlx::query("SELECT * FROM agents WHERE deleted_at IS NULL ORDER BY name")
            .fetch_all(self.pool())
            .await?;

        rows.iter().map(row_to_agent).collect()
    }

    /// Maintenance escape hatch: soft-deleted records included.
    pub async fn list_agents_including_deleted(&self) -> Result<Vec<Agent>> {
        let rows = sqlx::query("SELECT * FROM agents ORDER BY name")
            .fetch_all(self.pool())
            .await?;

        rows.iter().map(row_to_agent).collect()
    }

    /// Update reachability. `last_seen` is only written when provided.
    pub async fn set_agent_status(
        &self,
        id: AgentId,
        status: AgentStatus,
        last_seen: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE agents SET status = ?, last_seen_at = COALESCE(?, last_seen_at), updated_at = ? WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(status.as_str())
        .bind(last_seen)
        .bind(Utc::now())
        .bind(id.to_string())
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("agent {}", id)));
        }
        Ok(())
    }

    /// Liveness sweep: every online agent whose last-seen is older than the
    /// cutoff goes offline. Returns the ids that transitioned.
    pub async fn mark_agents_offline_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<AgentId>> {
        let rows = sqlx::query(
            r#"
            SELECT id FROM agents
            WHERE deleted_at IS NULL AND status = 'online'
              AND (last_seen_at IS NULL OR last_seen_at < ?)
            "#,
        )
        .bind(cutoff)
        .fetch_all(self.pool())
        .await?;

        let mut swept = Vec::with_capacity(rows.len());
        for row in rows {
            let raw: String = row.get("id");
            let id: AgentId = raw
                .parse()
                .map_err(|e| StoreError::corrupt("agents.id", e))?;
            self.set_agent_status(id, AgentStatus::Offline, None).await?;
            swept.push(id);
        }
        Ok(swept)
    }

    pub async fn soft_delete_agent(&self, id: AgentId) -> Result<()> {
        let result = sqlx::query(
            "UPDATE agents SET deleted_at = ?, updated_at = ? WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(Utc::now())
        .bind(Utc::now())
        .bind(id.to_string())
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("agent {}", id)));
        }
        Ok(())
    }
}

fn row_to_agent(row: &SqliteRow) -> Result<Agent> {
    let id: String = row.get("id");
    let status: String = row.get("status");
    let capabilities: String = row.get("capabilities");
    let capabilities: Capabilities = serde_json::from_str(&capabilities)
        .map_err(|e| StoreError::corrupt("agents.capabilities", e))?;

    Ok(Agent {
        id: id.parse().map_err(|e| StoreError::corrupt("agents.id", e))?,
        name: row.get("name"),
        hostname: row.get("hostname"),
        os: row.get("os"),
        arch: row.get("arch"),
        version: row.get("version"),
        capabilities,
        status: status
            .parse()
            .map_err(|e| StoreError::corrupt("agents.status", e))?,
        last_seen_at: row.get("last_seen_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}
