//! SQLite database module with schema migrations.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::Connection;

use crate::error::AppError;

/// Current schema version. Increment when adding new migrations.
const SCHEMA_VERSION: i32 = 1;

/// V1 schema: active job descriptor, status log and log flags.
const V1_SCHEMA: &str = r#"
-- The single job this installation is tracking (at most one row)
CREATE TABLE IF NOT EXISTS active_job (
    slot INTEGER PRIMARY KEY NOT NULL CHECK (slot = 1),
    job_id TEXT NOT NULL,
    is_polling INTEGER NOT NULL,
    owner_instance TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

-- Status log entries, in insertion order
CREATE TABLE IF NOT EXISTS status_log (
    id INTEGER PRIMARY KEY NOT NULL,
    timestamp INTEGER NOT NULL,
    severity TEXT NOT NULL,
    text TEXT NOT NULL
);

-- Whether the status log belongs to a live deployment
CREATE TABLE IF NOT EXISTS log_flags (
    slot INTEGER PRIMARY KEY NOT NULL CHECK (slot = 1),
    is_active INTEGER NOT NULL
);
"#;

/// SQLite database handle.
#[derive(Debug, Clone)]
pub struct Database {
    db_path: PathBuf,
}

impl Database {
    /// Initializes the database at the given path.
    /// Creates parent directories if needed, opens the SQLite file, and runs migrations.
    pub async fn init(db_path: PathBuf) -> Result<Self, AppError> {
        let path = db_path.clone();

        tokio::task::spawn_blocking(move || {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    AppError::Storage(format!("Failed to create database directory: {e}"))
                })?;
            }

            let mut conn = Connection::open(&path)
                .map_err(|e| AppError::Storage(format!("Failed to open database: {e}")))?;

            configure_connection(&conn)?;
            run_migrations(&mut conn)?;

            Ok::<_, AppError>(())
        })
        .await
        .map_err(|e| AppError::Internal(format!("Database init task failed: {e}")))??;

        Ok(Self { db_path })
    }

    /// Returns the database path for use by the stores.
    pub fn db_path(&self) -> &PathBuf {
        &self.db_path
    }

    /// Simple health check: executes SELECT 1.
    pub async fn health_check(&self) -> Result<(), AppError> {
        let db_path = self.db_path.clone();

        tokio::task::spawn_blocking(move || {
            let conn = open_connection(&db_path)?;
            conn.query_row("SELECT 1", [], |_| Ok(()))
                .map_err(|e| AppError::Storage(format!("Health check failed: {e}")))?;
            Ok::<_, AppError>(())
        })
        .await
        .map_err(|e| AppError::Internal(format!("Health check task failed: {e}")))?
    }
}

/// Opens a configured connection. Stores call this inside `spawn_blocking`.
pub(crate) fn open_connection(path: &Path) -> Result<Connection, AppError> {
    let conn = Connection::open(path)
        .map_err(|e| AppError::Storage(format!("Failed to open database: {e}")))?;
    configure_connection(&conn)?;
    Ok(conn)
}

/// Configures connection with busy timeout and WAL mode.
fn configure_connection(conn: &Connection) -> Result<(), AppError> {
    conn.busy_timeout(Duration::from_secs(10))
        .map_err(|e| AppError::Storage(format!("Failed to set busy timeout: {e}")))?;

    conn.pragma_update(None, "journal_mode", "WAL")
        .map_err(|e| AppError::Storage(format!("Failed to set WAL mode: {e}")))?;

    Ok(())
}

/// Runs database migrations using PRAGMA user_version.
fn run_migrations(conn: &mut Connection) -> Result<(), AppError> {
    let current_version: i32 = conn
        .pragma_query_value(None, "user_version", |row| row.get(0))
        .map_err(|e| AppError::Storage(format!("Failed to get schema version: {e}")))?;

    if current_version >= SCHEMA_VERSION {
        return Ok(());
    }

    let tx = conn
        .transaction()
        .map_err(|e| AppError::Storage(format!("Failed to start migration transaction: {e}")))?;

    if current_version < 1 {
        tx.execute_batch(V1_SCHEMA)
            .map_err(|e| AppError::Storage(format!("V1 migration failed: {e}")))?;
    }

    tx.pragma_update(None, "user_version", SCHEMA_VERSION)
        .map_err(|e| AppError::Storage(format!("Failed to update schema version: {e}")))?;

    tx.commit()
        .map_err(|e| AppError::Storage(format!("Failed to commit migration: {e}")))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_db_path() -> (TempDir, PathBuf) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let db_path = temp_dir.path().join("nested").join("test.db");
        (temp_dir, db_path)
    }

    #[tokio::test]
    async fn init_creates_db_file_and_tables() {
        let (_temp_dir, db_path) = test_db_path();

        let db = Database::init(db_path.clone())
            .await
            .expect("Failed to init database");
        assert!(db_path.exists(), "Database file should exist");
        db.health_check().await.expect("Health check failed");

        let conn = Connection::open(&db_path).expect("Failed to open db");
        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .expect("Failed to prepare")
            .query_map([], |row| row.get(0))
            .expect("Failed to query")
            .collect::<Result<Vec<_>, _>>()
            .expect("Failed to collect");

        assert!(tables.contains(&"active_job".to_string()));
        assert!(tables.contains(&"status_log".to_string()));
        assert!(tables.contains(&"log_flags".to_string()));

        let version: i32 = conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .expect("Failed to read version");
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[tokio::test]
    async fn init_is_idempotent() {
        let (_temp_dir, db_path) = test_db_path();

        Database::init(db_path.clone()).await.expect("First init failed");
        Database::init(db_path.clone()).await.expect("Second init failed");
    }

    #[tokio::test]
    async fn active_job_holds_a_single_row() {
        let (_temp_dir, db_path) = test_db_path();
        Database::init(db_path.clone()).await.expect("Failed to init database");

        let conn = open_connection(&db_path).expect("Failed to open db");
        let result = conn.execute(
            "INSERT INTO active_job (slot, job_id, is_polling, owner_instance, created_at) VALUES (2, 'j', 1, 'i', 0)",
            [],
        );
        assert!(result.is_err(), "Only slot 1 may be used");
    }
}
