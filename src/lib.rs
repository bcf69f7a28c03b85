//! Job tracking and reconciliation for vault account deployments.
//!
//! A deployment is submitted to the job backend, polled until it finishes,
//! and every unit of progress is added to the user's statistics exactly once
//! per polling session. The active job and the status log are kept in SQLite
//! so tracking can resume after a restart.

pub mod backend;
pub mod config;
pub mod controller;
pub mod error;
pub mod jobs;
pub mod reconcile;
pub mod state;
pub mod storage;

pub use controller::{ControllerSnapshot, Phase, PollingController, ResumeOutcome, SubmitRequest};
pub use error::AppError;
