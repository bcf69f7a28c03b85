//! Application state: the database, status log and polling controller wired
//! to the real HTTP collaborators.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::info;

use crate::backend::HttpBackend;
use crate::config::{BackendConfig, ControllerConfig};
use crate::controller::PollingController;
use crate::error::AppError;
use crate::jobs::JobClient;
use crate::storage::{Database, DatabaseJobStore, DatabaseLogStore, StatusLog};

/// Database file inside the data directory.
const DB_FILE_NAME: &str = "vault-jobs.db";

/// File holding this installation's controller instance id.
const INSTANCE_ID_FILE_NAME: &str = "instance-id";

/// The controller as wired in production.
pub type LiveController = PollingController<JobClient<HttpBackend, HttpBackend>, HttpBackend>;

// ─────────────────────────────────────────────────────────────────────────────
// Application State
// ─────────────────────────────────────────────────────────────────────────────

pub struct AppState {
    pub log: StatusLog,
    pub controller: LiveController,
}

impl AppState {
    /// Opens and checks the database under `data_dir`, then builds the controller.
    ///
    /// Without an explicit `instance_id` the id stored in the data directory
    /// is used, so a restarted process can resume its own job.
    pub async fn init(
        data_dir: &Path,
        backend: &BackendConfig,
        config: ControllerConfig,
        instance_id: Option<String>,
    ) -> Result<Self, AppError> {
        let db = Database::init(data_dir.join(DB_FILE_NAME)).await?;
        db.health_check().await?;
        let instance_id = match instance_id {
            Some(id) => id,
            None => load_or_create_instance_id(data_dir).await?,
        };

        let http = HttpBackend::from_config(backend)?;
        let jobs = JobClient::new(http.clone(), http.clone(), config.credits_per_account);
        let log = StatusLog::load(Arc::new(DatabaseLogStore::new(&db))).await;
        let store = Arc::new(DatabaseJobStore::new(&db));

        info!("[STORE] Controller instance {}", instance_id);
        let controller = PollingController::new(jobs, http, store, log.clone(), config, instance_id);

        Ok(Self {
            log,
            controller,
        })
    }

    /// Opens only the persisted status log, for commands that do not talk to
    /// the backend.
    pub async fn open_log(data_dir: &Path) -> Result<StatusLog, AppError> {
        let db = Database::init(data_dir.join(DB_FILE_NAME)).await?;
        Ok(StatusLog::load(Arc::new(DatabaseLogStore::new(&db))).await)
    }
}

/// Reads the instance id from `data_dir`, generating and saving one if absent.
pub async fn load_or_create_instance_id(data_dir: &Path) -> Result<String, AppError> {
    let path: PathBuf = data_dir.join(INSTANCE_ID_FILE_NAME);

    match tokio::fs::read_to_string(&path).await {
        Ok(contents) if !contents.trim().is_empty() => return Ok(contents.trim().to_string()),
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(AppError::Storage(format!(
                "Failed to read instance id: {e}"
            )))
        }
    }

    let id = uuid::Uuid::new_v4().to_string();
    tokio::fs::create_dir_all(data_dir)
        .await
        .map_err(|e| AppError::Storage(format!("Failed to create data directory: {e}")))?;
    tokio::fs::write(&path, &id)
        .await
        .map_err(|e| AppError::Storage(format!("Failed to write instance id: {e}")))?;

    Ok(id)
}
