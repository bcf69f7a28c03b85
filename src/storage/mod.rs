//! Local SQLite persistence for the active job and the status log.

mod database;
pub mod job_store;
pub mod status_log;

pub use database::Database;
pub use job_store::{DatabaseJobStore, JobDescriptor, JobStore};
pub use status_log::{DatabaseLogStore, LogStore, Severity, StatusLog, StatusMessage};
