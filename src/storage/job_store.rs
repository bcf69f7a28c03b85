//! Job Store: the one active job descriptor, persisted across restarts.
//!
//! The descriptor is only a hint for resuming polling after a restart. The
//! backend stays the source of truth, so callers treat every store error as
//! "nothing persisted" and carry on.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;

use rusqlite::OptionalExtension;
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::storage::database::{open_connection, Database};

/// The job this installation is tracking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub job_id: String,
    pub is_polling: bool,
    /// Controller instance that submitted the job. Only it resumes polling.
    pub owner_instance: String,
    /// Unix seconds.
    pub created_at: i64,
}

impl JobDescriptor {
    /// Descriptor for a job that was just submitted by `owner_instance`.
    pub fn new(job_id: impl Into<String>, owner_instance: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            is_polling: true,
            owner_instance: owner_instance.into(),
            created_at: current_timestamp(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// JobStore Trait
// ─────────────────────────────────────────────────────────────────────────────

/// Persistence for the single active [`JobDescriptor`].
pub trait JobStore: Send + Sync {
    fn load(&self) -> Pin<Box<dyn Future<Output = Result<Option<JobDescriptor>, AppError>> + Send + '_>>;

    /// Replaces any existing descriptor.
    fn save<'a>(
        &'a self,
        descriptor: &'a JobDescriptor,
    ) -> Pin<Box<dyn Future<Output = Result<(), AppError>> + Send + 'a>>;

    fn clear(&self) -> Pin<Box<dyn Future<Output = Result<(), AppError>> + Send + '_>>;
}

// ─────────────────────────────────────────────────────────────────────────────
// SQLite implementation
// ─────────────────────────────────────────────────────────────────────────────

/// [`JobStore`] backed by the `active_job` table.
#[derive(Debug, Clone)]
pub struct DatabaseJobStore {
    db_path: PathBuf,
}

impl DatabaseJobStore {
    pub fn new(db: &Database) -> Self {
        Self {
            db_path: db.db_path().clone(),
        }
    }

    pub async fn load(&self) -> Result<Option<JobDescriptor>, AppError> {
        let db_path = self.db_path.clone();

        tokio::task::spawn_blocking(move || {
            let conn = open_connection(&db_path)?;

            let descriptor = conn
                .query_row(
                    r#"
                    SELECT job_id, is_polling, owner_instance, created_at
                    FROM active_job
                    WHERE slot = 1
                    "#,
                    [],
                    |row| {
                        Ok(JobDescriptor {
                            job_id: row.get(0)?,
                            is_polling: row.get::<_, i64>(1)? != 0,
                            owner_instance: row.get(2)?,
                            created_at: row.get(3)?,
                        })
                    },
                )
                .optional()
                .map_err(|e| AppError::Storage(format!("Failed to load job descriptor: {e}")))?;

            // An empty job id cannot be resumed; treat it as absent.
            Ok::<_, AppError>(descriptor.filter(|d| !d.job_id.is_empty()))
        })
        .await
        .map_err(|e| AppError::Internal(format!("Load descriptor task failed: {e}")))?
    }

    pub async fn save(&self, descriptor: &JobDescriptor) -> Result<(), AppError> {
        let db_path = self.db_path.clone();
        let descriptor = descriptor.clone();

        tokio::task::spawn_blocking(move || {
            let conn = open_connection(&db_path)?;

            conn.execute(
                r#"
                INSERT INTO active_job (slot, job_id, is_polling, owner_instance, created_at)
                VALUES (1, ?1, ?2, ?3, ?4)
                ON CONFLICT(slot) DO UPDATE SET
                    job_id = excluded.job_id,
                    is_polling = excluded.is_polling,
                    owner_instance = excluded.owner_instance,
                    created_at = excluded.created_at
                "#,
                rusqlite::params![
                    descriptor.job_id,
                    descriptor.is_polling as i64,
                    descriptor.owner_instance,
                    descriptor.created_at,
                ],
            )
            .map_err(|e| AppError::Storage(format!("Failed to save job descriptor: {e}")))?;

            Ok::<_, AppError>(())
        })
        .await
        .map_err(|e| AppError::Internal(format!("Save descriptor task failed: {e}")))?
    }

    pub async fn clear(&self) -> Result<(), AppError> {
        let db_path = self.db_path.clone();

        tokio::task::spawn_blocking(move || {
            let conn = open_connection(&db_path)?;
            conn.execute("DELETE FROM active_job", [])
                .map_err(|e| AppError::Storage(format!("Failed to clear job descriptor: {e}")))?;
            Ok::<_, AppError>(())
        })
        .await
        .map_err(|e| AppError::Internal(format!("Clear descriptor task failed: {e}")))?
    }
}

impl JobStore for DatabaseJobStore {
    fn load(&self) -> Pin<Box<dyn Future<Output = Result<Option<JobDescriptor>, AppError>> + Send + '_>> {
        Box::pin(DatabaseJobStore::load(self))
    }

    fn save<'a>(
        &'a self,
        descriptor: &'a JobDescriptor,
    ) -> Pin<Box<dyn Future<Output = Result<(), AppError>> + Send + 'a>> {
        Box::pin(DatabaseJobStore::save(self, descriptor))
    }

    fn clear(&self) -> Pin<Box<dyn Future<Output = Result<(), AppError>> + Send + '_>> {
        Box::pin(DatabaseJobStore::clear(self))
    }
}

/// Returns current unix timestamp in seconds.
fn current_timestamp() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn test_store() -> (TempDir, DatabaseJobStore) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let db = Database::init(temp_dir.path().join("test.db"))
            .await
            .expect("Failed to init database");
        (temp_dir, DatabaseJobStore::new(&db))
    }

    #[tokio::test]
    async fn load_empty_store_returns_none() {
        let (_dir, store) = test_store().await;
        assert_eq!(store.load().await.unwrap(), None);
    }

    #[tokio::test]
    async fn save_then_load() {
        let (_dir, store) = test_store().await;
        let descriptor = JobDescriptor::new("job-123", "instance-a");

        store.save(&descriptor).await.unwrap();
        assert_eq!(store.load().await.unwrap(), Some(descriptor));
    }

    #[tokio::test]
    async fn save_replaces_previous_descriptor() {
        let (_dir, store) = test_store().await;
        store.save(&JobDescriptor::new("old", "a")).await.unwrap();
        store.save(&JobDescriptor::new("new", "b")).await.unwrap();

        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded.job_id, "new");
        assert_eq!(loaded.owner_instance, "b");
        assert!(loaded.is_polling);
    }

    #[tokio::test]
    async fn clear_removes_descriptor() {
        let (_dir, store) = test_store().await;
        store.save(&JobDescriptor::new("job-1", "a")).await.unwrap();
        store.clear().await.unwrap();
        assert_eq!(store.load().await.unwrap(), None);

        // Clearing an empty store is fine.
        store.clear().await.unwrap();
    }

    #[tokio::test]
    async fn empty_job_id_reads_as_absent() {
        let (_dir, store) = test_store().await;
        store.save(&JobDescriptor::new("", "a")).await.unwrap();
        assert_eq!(store.load().await.unwrap(), None);
    }

    #[tokio::test]
    async fn descriptor_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("test.db");

        let db = Database::init(path.clone()).await.unwrap();
        DatabaseJobStore::new(&db)
            .save(&JobDescriptor::new("job-9", "a"))
            .await
            .unwrap();

        let reopened = Database::init(path).await.unwrap();
        let loaded = DatabaseJobStore::new(&reopened).load().await.unwrap();
        assert_eq!(loaded.map(|d| d.job_id), Some("job-9".to_string()));
    }
}
