//! Destination records.
//!
//! Credentials are encrypted on write and decrypted on read through the
//! store's cipher seam. Deletes are refused while any live policy still
//! references the destination.

use chrono::Utc;
use coffer_protocol::DestinationId;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::error::{Result, StoreError};
use crate::models::Destination;
use crate::Store;

impl Store {
    pub async fn create_destination(&self, dest: &Destination) -> Result<()> {
        let credentials = self.encrypt(&dest.credentials)?;
        sqlx::query(
            r#"
            INSERT INTO destinations (id, name, kind, config, credentials, enabled, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(dest.id.to_string())
        .bind(&dest.name)
        .bind(dest.kind.as_str())
        .bind(&dest.config)
        .bind(&credentials)
        .bind(dest.enabled)
        .bind(dest.created_at)
        .bind(dest.updated_at)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn get_destination(&self, id: DestinationId) -> Result<Option<Destination>> {
        let row = sqlx::query("SELECT * FROM destinations WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(self.pool())
            .await?;

        row.map(|row| self.row_to_destination(&row)).transpose()
    }

    pub async fn list_destinations(&self) -> Result<Vec<Destination>> {
        let rows = sqlx::query("SELECT * FROM destinations ORDER BY name")
            .fetch_all(self.pool())
            .await?;

        rows.iter()
            .map(|row| self.row_to_destination(row))
            .collect()
    }

    pub async fn update_destination(&self, dest: &Destination) -> Result<()> {
        let credentials = self.encrypt(&dest.credentials)?;
        let result = sqlx::query(
            "UPDATE destinations SET name = ?, kind = ?, config = ?, credentials = ?, enabled = ?, updated_at = ? WHERE id = ?",
        )
        .bind(&dest.name)
        .bind(dest.kind.as_str())
        .bind(&dest.config)
        .bind(&credentials)
        .bind(dest.enabled)
        .bind(Utc::now())
        .bind(dest.id.to_string())
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("destination {}", dest.id)));
        }
        Ok(())
    }

    /// Delete a destination. Refused while any non-deleted policy still
    /// references it.
    pub async fn delete_destination(&self, id: DestinationId) -> Result<()> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS refs FROM policy_destinations pd
            JOIN policies p ON p.id = pd.policy_id
            WHERE pd.destination_id = ? AND p.deleted_at IS NULL
            "#,
        )
        .bind(id.to_string())
        .fetch_one(self.pool())
        .await?;
        let refs: i64 = row.get("refs");
        if refs > 0 {
            return Err(StoreError::DestinationInUse(id));
        }

        // Drop stale associations from soft-deleted policies, then the row.
        let mut tx = self.pool().begin().await?;
        sqlx::query("DELETE FROM policy_destinations WHERE destination_id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM destinations WHERE id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("destination {}", id)));
        }
        Ok(())
    }

    pub(crate) fn row_to_destination(&self, row: &SqliteRow) -> Result<Destination> {
        let id: String = row.get("id");
        let kind: String = row.get("kind");
        let credentials: String = row.get("credentials");

        Ok(Destination {
            id: id
                .parse()
                .map_err(|e| StoreError::corrupt("destinations.id", e))?,
            name: row.get("name"),
            kind: kind
                .parse()
                .map_err(|e| StoreError::corrupt("destinations.kind", e))?,
            config: row.get("config"),
            credentials: self.decrypt(&credentials)?,
            enabled: row.get("enabled"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }
}
