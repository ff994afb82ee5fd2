//! Schema creation. Every statement is idempotent.

use crate::error::Result;
use crate::Store;

impl Store {
    pub(crate) async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS agents (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                hostname TEXT NOT NULL UNIQUE,
                os TEXT NOT NULL DEFAULT '',
                arch TEXT NOT NULL DEFAULT '',
                version TEXT NOT NULL DEFAULT '',
                capabilities TEXT NOT NULL DEFAULT '{}',
                status TEXT NOT NULL DEFAULT 'unknown',
                last_seen_at TEXT,
                deleted_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(self.pool())
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS destinations (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                kind TEXT NOT NULL,
                config TEXT NOT NULL DEFAULT '{}',
                credentials TEXT NOT NULL DEFAULT '',
                enabled INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(self.pool())
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS policies (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                agent_id TEXT NOT NULL REFERENCES agents(id),
                schedule TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                sources TEXT NOT NULL DEFAULT '[]',
                repo_password TEXT NOT NULL DEFAULT '',
                keep_daily INTEGER NOT NULL DEFAULT 7,
                keep_weekly INTEGER NOT NULL DEFAULT 4,
                keep_monthly INTEGER NOT NULL DEFAULT 6,
                keep_yearly INTEGER NOT NULL DEFAULT 2,
                hook_pre_backup TEXT NOT NULL DEFAULT '',
                hook_post_backup TEXT NOT NULL DEFAULT '',
                last_run_at TEXT,
                next_run_at TEXT,
                deleted_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(self.pool())
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS policy_destinations (
                policy_id TEXT NOT NULL REFERENCES policies(id),
                destination_id TEXT NOT NULL REFERENCES destinations(id),
                priority INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (policy_id, destination_id)
            )
            "#,
        )
        .execute(self.pool())
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                policy_id TEXT NOT NULL,
                agent_id TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                error TEXT,
                started_at TEXT,
                ended_at TEXT,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(self.pool())
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS job_destinations (
                job_id TEXT NOT NULL REFERENCES jobs(id),
                destination_id TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                snapshot_id TEXT,
                size_bytes INTEGER,
                error TEXT,
                started_at TEXT,
                ended_at TEXT,
                PRIMARY KEY (job_id, destination_id)
            )
            "#,
        )
        .execute(self.pool())
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS job_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id TEXT NOT NULL,
                level TEXT NOT NULL,
                message TEXT NOT NULL,
                logged_at TEXT NOT NULL
            )
            "#,
        )
        .execute(self.pool())
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS snapshots (
                id TEXT PRIMARY KEY,
                policy_id TEXT NOT NULL,
                destination_id TEXT NOT NULL,
                engine_id TEXT NOT NULL,
                size_bytes INTEGER,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(self.pool())
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_agent_status ON jobs(agent_id, status)")
            .execute(self.pool())
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_policy_status ON jobs(policy_id, status)")
            .execute(self.pool())
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_job_logs_job ON job_logs(job_id)")
            .execute(self.pool())
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_snapshots_engine ON snapshots(engine_id)")
            .execute(self.pool())
            .await?;

        Ok(())
    }
}
