//! Snapshot cache. Not in the hot path of the job loop; kept for fast
//! listing.

use coffer_protocol::PolicyId;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::error::{Result, StoreError};
use crate::models::Snapshot;
use crate::Store;

impl Store {
    pub async fn insert_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO snapshots (id, policy_id, destination_id, engine_id, size_bytes, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(snapshot.id.to_string())
        .bind(snapshot.policy_id.to_string())
        .bind(snapshot.destination_id.to_string())
        .bind(&snapshot.engine_id)
        .bind(snapshot.size_bytes)
        .bind(snapshot.created_at)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn list_snapshots_by_policy(&self, policy_id: PolicyId) -> Result<Vec<Snapshot>> {
        let rows =
            sqlx::query("SELECT * FROM snapshots WHERE policy_id = ? ORDER BY created_at DESC")
                .bind(policy_id.to_string())
                .fetch_all(self.pool())
                .await?;

        rows.iter().map(row_to_snapshot).collect()
    }

    /// Drop the cached record for an engine snapshot id (e.g. after the
    /// engine forgot it). Returns whether a row existed.
    pub async fn delete_snapshot_by_engine_id(&self, engine_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM snapshots WHERE engine_id = ?")
            .bind(engine_id)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

fn row_to_snapshot(row: &SqliteRow) -> Result<Snapshot> {
    let id: String = row.get("id");
    let policy_id: String = row.get("policy_id");
    let destination_id: String = row.get("destination_id");

    Ok(Snapshot {
        id: id
            .parse()
            .map_err(|e| StoreError::corrupt("snapshots.id", e))?,
        policy_id: policy_id
            .parse()
            .map_err(|e| StoreError::corrupt("snapshots.policy_id", e))?,
        destination_id: destination_id
            .parse()
            .map_err(|e| StoreError::corrupt("snapshots.destination_id", e))?,
        engine_id: row.get("engine_id"),
        size_bytes: row.get("size_bytes"),
        created_at: row.get("created_at"),
    })
}
