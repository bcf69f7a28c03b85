//! Status Log: the user-visible, append-only event history of a deployment.
//!
//! Entries are kept in memory for reads and written through to a [`LogStore`]
//! so the history can be shown again after a restart. A store failure is
//! logged and swallowed: the in-memory log stays authoritative for the
//! session.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};
use tracing::warn;

use crate::error::AppError;
use crate::storage::database::{open_connection, Database};

/// Capacity of the live-entry broadcast channel.
const LIVE_CHANNEL_CAPACITY: usize = 256;

// ─────────────────────────────────────────────────────────────────────────────
// Entries
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Success => "success",
            Severity::Warning => "warning",
            Severity::Error => "error",
        }
    }

    /// Parses a stored severity. Unknown values read as `Info`.
    pub fn parse(s: &str) -> Self {
        match s {
            "success" => Severity::Success,
            "warning" => Severity::Warning,
            "error" => Severity::Error,
            _ => Severity::Info,
        }
    }
}

/// One immutable log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusMessage {
    pub id: u64,
    /// Unix milliseconds.
    pub timestamp: i64,
    pub severity: Severity,
    pub text: String,
}

/// Everything a [`LogStore`] remembers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistedLog {
    pub entries: Vec<StatusMessage>,
    pub is_active: bool,
}

// ─────────────────────────────────────────────────────────────────────────────
// LogStore Trait
// ─────────────────────────────────────────────────────────────────────────────

/// Durable backing for a [`StatusLog`].
pub trait LogStore: Send + Sync {
    fn load(&self) -> Pin<Box<dyn Future<Output = Result<PersistedLog, AppError>> + Send + '_>>;

    fn append<'a>(
        &'a self,
        entry: &'a StatusMessage,
    ) -> Pin<Box<dyn Future<Output = Result<(), AppError>> + Send + 'a>>;

    fn clear(&self) -> Pin<Box<dyn Future<Output = Result<(), AppError>> + Send + '_>>;

    fn set_active(&self, active: bool) -> Pin<Box<dyn Future<Output = Result<(), AppError>> + Send + '_>>;
}

/// [`LogStore`] backed by the `status_log` and `log_flags` tables.
#[derive(Debug, Clone)]
pub struct DatabaseLogStore {
    db_path: PathBuf,
}

impl DatabaseLogStore {
    pub fn new(db: &Database) -> Self {
        Self {
            db_path: db.db_path().clone(),
        }
    }

    pub async fn load(&self) -> Result<PersistedLog, AppError> {
        let db_path = self.db_path.clone();

        tokio::task::spawn_blocking(move || {
            let conn = open_connection(&db_path)?;

            let mut stmt = conn
                .prepare("SELECT id, timestamp, severity, text FROM status_log ORDER BY id ASC")
                .map_err(|e| AppError::Storage(format!("Failed to prepare query: {e}")))?;

            let entries = stmt
                .query_map([], |row| {
                    let severity: String = row.get(2)?;
                    Ok(StatusMessage {
                        id: row.get::<_, i64>(0)? as u64,
                        timestamp: row.get(1)?,
                        severity: Severity::parse(&severity),
                        text: row.get(3)?,
                    })
                })
                .map_err(|e| AppError::Storage(format!("Failed to query status log: {e}")))?
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| AppError::Storage(format!("Failed to collect status log: {e}")))?;

            let is_active = conn
                .query_row("SELECT is_active FROM log_flags WHERE slot = 1", [], |row| {
                    row.get::<_, i64>(0)
                })
                .map(|v| v != 0)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(false),
                    other => Err(AppError::Storage(format!("Failed to read log flags: {other}"))),
                })?;

            Ok::<_, AppError>(PersistedLog { entries, is_active })
        })
        .await
        .map_err(|e| AppError::Internal(format!("Load status log task failed: {e}")))?
    }

    pub async fn append(&self, entry: &StatusMessage) -> Result<(), AppError> {
        let db_path = self.db_path.clone();
        let entry = entry.clone();

        tokio::task::spawn_blocking(move || {
            let conn = open_connection(&db_path)?;
            conn.execute(
                "INSERT INTO status_log (id, timestamp, severity, text) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![
                    entry.id as i64,
                    entry.timestamp,
                    entry.severity.as_str(),
                    entry.text,
                ],
            )
            .map_err(|e| AppError::Storage(format!("Failed to append status entry: {e}")))?;
            Ok::<_, AppError>(())
        })
        .await
        .map_err(|e| AppError::Internal(format!("Append status task failed: {e}")))?
    }

    pub async fn clear(&self) -> Result<(), AppError> {
        let db_path = self.db_path.clone();

        tokio::task::spawn_blocking(move || {
            let conn = open_connection(&db_path)?;
            conn.execute("DELETE FROM status_log", [])
                .map_err(|e| AppError::Storage(format!("Failed to clear status log: {e}")))?;
            Ok::<_, AppError>(())
        })
        .await
        .map_err(|e| AppError::Internal(format!("Clear status log task failed: {e}")))?
    }

    pub async fn set_active(&self, active: bool) -> Result<(), AppError> {
        let db_path = self.db_path.clone();

        tokio::task::spawn_blocking(move || {
            let conn = open_connection(&db_path)?;
            conn.execute(
                r#"
                INSERT INTO log_flags (slot, is_active) VALUES (1, ?1)
                ON CONFLICT(slot) DO UPDATE SET is_active = excluded.is_active
                "#,
                [active as i64],
            )
            .map_err(|e| AppError::Storage(format!("Failed to update log flags: {e}")))?;
            Ok::<_, AppError>(())
        })
        .await
        .map_err(|e| AppError::Internal(format!("Set log flag task failed: {e}")))?
    }
}

impl LogStore for DatabaseLogStore {
    fn load(&self) -> Pin<Box<dyn Future<Output = Result<PersistedLog, AppError>> + Send + '_>> {
        Box::pin(DatabaseLogStore::load(self))
    }

    fn append<'a>(
        &'a self,
        entry: &'a StatusMessage,
    ) -> Pin<Box<dyn Future<Output = Result<(), AppError>> + Send + 'a>> {
        Box::pin(DatabaseLogStore::append(self, entry))
    }

    fn clear(&self) -> Pin<Box<dyn Future<Output = Result<(), AppError>> + Send + '_>> {
        Box::pin(DatabaseLogStore::clear(self))
    }

    fn set_active(&self, active: bool) -> Pin<Box<dyn Future<Output = Result<(), AppError>> + Send + '_>> {
        Box::pin(DatabaseLogStore::set_active(self, active))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// StatusLog
// ─────────────────────────────────────────────────────────────────────────────

struct LogState {
    entries: Vec<StatusMessage>,
    next_id: u64,
    is_active: bool,
}

/// Shared handle to the status log. Clones refer to the same log.
#[derive(Clone)]
pub struct StatusLog {
    state: Arc<Mutex<LogState>>,
    store: Option<Arc<dyn LogStore>>,
    live: broadcast::Sender<StatusMessage>,
}

impl StatusLog {
    /// A log that is never persisted.
    pub fn in_memory() -> Self {
        Self::from_parts(PersistedLog::default(), None)
    }

    /// Restores the log from `store` and writes through to it afterwards.
    ///
    /// A store that cannot be read yields an empty log.
    pub async fn load(store: Arc<dyn LogStore>) -> Self {
        let persisted = match store.load().await {
            Ok(persisted) => persisted,
            Err(e) => {
                warn!("[STORE] Failed to load status log, starting empty: {}", e);
                PersistedLog::default()
            }
        };
        Self::from_parts(persisted, Some(store))
    }

    fn from_parts(persisted: PersistedLog, store: Option<Arc<dyn LogStore>>) -> Self {
        let next_id = persisted.entries.iter().map(|e| e.id).max().map_or(1, |id| id + 1);
        let (live, _) = broadcast::channel(LIVE_CHANNEL_CAPACITY);

        Self {
            state: Arc::new(Mutex::new(LogState {
                entries: persisted.entries,
                next_id,
                is_active: persisted.is_active,
            })),
            store,
            live,
        }
    }

    /// Receives every entry appended after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusMessage> {
        self.live.subscribe()
    }

    /// Appends an entry and returns it.
    pub async fn append(&self, severity: Severity, text: impl Into<String>) -> StatusMessage {
        let mut state = self.state.lock().await;

        let entry = StatusMessage {
            id: state.next_id,
            timestamp: current_timestamp_millis(),
            severity,
            text: text.into(),
        };
        state.next_id += 1;
        state.entries.push(entry.clone());

        // Held across the write so the store sees entries in id order.
        if let Some(store) = &self.store {
            if let Err(e) = store.append(&entry).await {
                warn!("[STORE] Failed to persist status entry {}: {}", entry.id, e);
            }
        }
        drop(state);

        // No receivers is fine.
        let _ = self.live.send(entry.clone());
        entry
    }

    pub async fn info(&self, text: impl Into<String>) -> StatusMessage {
        self.append(Severity::Info, text).await
    }

    pub async fn success(&self, text: impl Into<String>) -> StatusMessage {
        self.append(Severity::Success, text).await
    }

    pub async fn warning(&self, text: impl Into<String>) -> StatusMessage {
        self.append(Severity::Warning, text).await
    }

    pub async fn error(&self, text: impl Into<String>) -> StatusMessage {
        self.append(Severity::Error, text).await
    }

    /// All entries in insertion order.
    pub async fn entries(&self) -> Vec<StatusMessage> {
        self.state.lock().await.entries.clone()
    }

    /// Removes every entry. Ids keep increasing.
    pub async fn clear(&self) {
        let mut state = self.state.lock().await;
        state.entries.clear();

        if let Some(store) = &self.store {
            if let Err(e) = store.clear().await {
                warn!("[STORE] Failed to clear persisted status log: {}", e);
            }
        }
    }

    /// Marks the log as belonging to a live deployment, or not.
    pub async fn set_active(&self, active: bool) {
        let mut state = self.state.lock().await;
        if state.is_active == active {
            return;
        }
        state.is_active = active;

        if let Some(store) = &self.store {
            if let Err(e) = store.set_active(active).await {
                warn!("[STORE] Failed to persist log flag: {}", e);
            }
        }
    }

    pub async fn is_active(&self) -> bool {
        self.state.lock().await.is_active
    }
}

fn current_timestamp_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn test_store() -> (TempDir, Arc<DatabaseLogStore>) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let db = Database::init(temp_dir.path().join("test.db"))
            .await
            .expect("Failed to init database");
        (temp_dir, Arc::new(DatabaseLogStore::new(&db)))
    }

    /// Store whose every call fails.
    struct BrokenStore;

    impl LogStore for BrokenStore {
        fn load(&self) -> Pin<Box<dyn Future<Output = Result<PersistedLog, AppError>> + Send + '_>> {
            Box::pin(async { Err(AppError::Storage("disk gone".into())) })
        }

        fn append<'a>(
            &'a self,
            _entry: &'a StatusMessage,
        ) -> Pin<Box<dyn Future<Output = Result<(), AppError>> + Send + 'a>> {
            Box::pin(async { Err(AppError::Storage("disk gone".into())) })
        }

        fn clear(&self) -> Pin<Box<dyn Future<Output = Result<(), AppError>> + Send + '_>> {
            Box::pin(async { Err(AppError::Storage("disk gone".into())) })
        }

        fn set_active(&self, _active: bool) -> Pin<Box<dyn Future<Output = Result<(), AppError>> + Send + '_>> {
            Box::pin(async { Err(AppError::Storage("disk gone".into())) })
        }
    }

    #[tokio::test]
    async fn entries_keep_insertion_order_and_duplicates() {
        let log = StatusLog::in_memory();
        log.info("Polling").await;
        log.info("Polling").await;
        log.error("Boom").await;

        let entries = log.entries().await;
        let texts: Vec<_> = entries.iter().map(|e| e.text.as_str()).collect();
        assert_eq!(texts, ["Polling", "Polling", "Boom"]);
        assert_eq!(entries.iter().map(|e| e.id).collect::<Vec<_>>(), [1, 2, 3]);
        assert_eq!(entries[2].severity, Severity::Error);
    }

    #[tokio::test]
    async fn severity_serializes_lowercase() {
        let log = StatusLog::in_memory();
        let entry = log.warning("careful").await;
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["severity"], "warning");
    }

    #[tokio::test]
    async fn log_survives_reload_and_ids_continue() {
        let (_dir, store) = test_store().await;

        let log = StatusLog::load(store.clone()).await;
        log.info("first").await;
        log.success("second").await;
        log.set_active(true).await;

        let reloaded = StatusLog::load(store).await;
        let entries = reloaded.entries().await;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].severity, Severity::Success);
        assert!(reloaded.is_active().await);

        let next = reloaded.info("third").await;
        assert_eq!(next.id, 3);
    }

    #[tokio::test]
    async fn clear_empties_memory_and_store() {
        let (_dir, store) = test_store().await;

        let log = StatusLog::load(store.clone()).await;
        log.info("old deployment").await;
        log.clear().await;
        assert!(log.entries().await.is_empty());

        let reloaded = StatusLog::load(store).await;
        assert!(reloaded.entries().await.is_empty());
    }

    #[tokio::test]
    async fn store_failures_never_reach_the_caller() {
        let log = StatusLog::load(Arc::new(BrokenStore)).await;
        log.info("still recorded").await;
        log.set_active(true).await;
        log.clear().await;
        log.error("after clear").await;

        let entries = log.entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, 2);
        assert!(log.is_active().await);
    }

    #[tokio::test]
    async fn subscribers_see_new_entries() {
        let log = StatusLog::in_memory();
        let mut rx = log.subscribe();
        log.info("live").await;
        assert_eq!(rx.recv().await.unwrap().text, "live");
    }
}
