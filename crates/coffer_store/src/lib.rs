//! Durable storage for the Coffer control plane.
//!
//! SQLite via sqlx. The store is the single writer for policies,
//! destinations, jobs, and their associations; job state transitions
//! linearize here. Soft-deleted rows are filtered from every list/get by
//! default.

pub mod cipher;
pub mod error;
pub mod models;

mod agents;
mod destinations;
mod jobs;
mod policies;
mod schema;
mod snapshots;

pub use cipher::{PassthroughCipher, SecretCipher};
pub use error::{Result, StoreError};
pub use models::{
    Agent, Destination, Job, JobDestination, JobDetails, JobLogLine, NewJobLog, Policy,
    PolicyDestinationDetail, Snapshot,
};

use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::info;

/// Handle to the state database. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    cipher: Arc<dyn SecretCipher>,
}

impl Store {
    /// Open (or create) the database at `url`, e.g.
    /// `sqlite:coffer.db?mode=rwc`.
    pub async fn open(url: &str) -> Result<Self> {
        Self::open_with_cipher(url, Arc::new(PassthroughCipher)).await
    }

    /// Open with an explicit credential cipher. Encryption-at-rest is an
    /// external collaborator; this is its injection point.
    pub async fn open_with_cipher(url: &str, cipher: Arc<dyn SecretCipher>) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await?;
        Self::apply_pragmas(&pool).await?;
        info!("Connected to state database");
        Ok(Self { pool, cipher })
    }

    /// In-memory database for tests. Single connection so every query sees
    /// the same memory instance.
    pub async fn open_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Self::apply_pragmas(&pool).await?;
        Ok(Self {
            pool,
            cipher: Arc::new(PassthroughCipher),
        })
    }

    async fn apply_pragmas(pool: &SqlitePool) -> Result<()> {
        sqlx::query("PRAGMA journal_mode=WAL").execute(pool).await?;
        sqlx::query("PRAGMA synchronous=NORMAL")
            .execute(pool)
            .await?;
        sqlx::query("PRAGMA foreign_keys=ON").execute(pool).await?;
        Ok(())
    }

    /// Create the schema. Idempotent.
    pub async fn init(&self) -> Result<()> {
        self.ensure_schema().await
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub(crate) fn encrypt(&self, plaintext: &str) -> Result<String> {
        self.cipher
            .encrypt(plaintext)
            .map_err(StoreError::Crypto)
    }

    pub(crate) fn decrypt(&self, stored: &str) -> Result<String> {
        self.cipher.decrypt(stored).map_err(StoreError::Crypto)
    }
}
