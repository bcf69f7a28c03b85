use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vault_jobs::config::{BackendConfig, ControllerConfig};
use vault_jobs::state::AppState;
use vault_jobs::storage::StatusMessage;
use vault_jobs::{AppError, Phase, ResumeOutcome, SubmitRequest};

/// Deploy vault accounts and track the job until it finishes.
#[derive(Parser, Debug)]
#[command(name = "vault-jobs", version, about, long_about = None)]
struct Cli {
    /// Directory holding the local database and instance id.
    #[arg(long, env = "VAULT_DATA_DIR", default_value = ".vault-jobs")]
    data_dir: PathBuf,

    /// Controller instance id. Defaults to the one stored in the data directory.
    #[arg(long, env = "VAULT_INSTANCE_ID")]
    instance_id: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Submit a new deployment and follow it.
    Deploy {
        /// Number of accounts to create.
        #[arg(short, long)]
        count: u32,
        #[arg(long)]
        region: String,
        #[arg(long)]
        currency: String,
    },
    /// Re-attach to a deployment left running by an earlier run.
    Resume,
    /// Print the status log.
    Log {
        /// Print entries as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Delete the status log.
    ClearLog,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vault_jobs=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            let p = e.to_presentation();
            eprintln!("{}: {}", p.title, p.message);
            if let Some(action) = p.action {
                eprintln!("  {}", action);
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode, AppError> {
    match cli.command {
        Command::Deploy {
            count,
            region,
            currency,
        } => {
            let state = live_state(&cli.data_dir, cli.instance_id).await?;
            let live = state.log.subscribe();

            // An unfinished deployment from an earlier run comes first.
            if let ResumeOutcome::Resumed { job_id } = state.controller.resume().await? {
                eprintln!(
                    "Deployment {} from an earlier run is still in progress. Following it instead; deploy again once it finishes.",
                    job_id
                );
                follow(&state, live).await;
                return Ok(ExitCode::FAILURE);
            }

            state
                .controller
                .submit(SubmitRequest {
                    count,
                    region,
                    currency,
                })
                .await?;

            Ok(follow(&state, live).await)
        }

        Command::Resume => {
            let state = live_state(&cli.data_dir, cli.instance_id).await?;
            let live = state.log.subscribe();

            match state.controller.resume().await? {
                ResumeOutcome::Resumed { .. } | ResumeOutcome::AlreadyActive => {
                    Ok(follow(&state, live).await)
                }
                ResumeOutcome::Cleared { job_id } => {
                    println!("Deployment {} already finished. Nothing to resume.", job_id);
                    Ok(ExitCode::SUCCESS)
                }
                ResumeOutcome::OwnedElsewhere { job_id } => {
                    println!(
                        "Deployment {} is being tracked by another instance. Not resuming.",
                        job_id
                    );
                    Ok(ExitCode::SUCCESS)
                }
                ResumeOutcome::NothingToResume => {
                    println!("Nothing to resume.");
                    Ok(ExitCode::SUCCESS)
                }
            }
        }

        Command::Log { json } => {
            let log = AppState::open_log(&cli.data_dir).await?;
            let entries = log.entries().await;

            if json {
                let out = serde_json::to_string_pretty(&entries)
                    .map_err(|e| AppError::Internal(format!("Failed to encode log: {e}")))?;
                println!("{}", out);
            } else {
                for entry in &entries {
                    print_entry(entry);
                }
            }
            Ok(ExitCode::SUCCESS)
        }

        Command::ClearLog => {
            let log = AppState::open_log(&cli.data_dir).await?;
            log.clear().await;
            log.set_active(false).await;
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn live_state(data_dir: &Path, instance_id: Option<String>) -> Result<AppState, AppError> {
    let backend = BackendConfig::from_env()?;
    AppState::init(data_dir, &backend, ControllerConfig::from_env(), instance_id).await
}

/// Prints log entries until the session ends or Ctrl-C detaches from it.
async fn follow(state: &AppState, mut live: broadcast::Receiver<StatusMessage>) -> ExitCode {
    let mut snapshots = state.controller.subscribe();
    let mut detached = false;

    while snapshots.borrow_and_update().phase.is_busy() {
        tokio::select! {
            entry = live.recv() => match entry {
                Ok(entry) => print_entry(&entry),
                Err(RecvError::Lagged(skipped)) => warn!("Skipped {} log entries", skipped),
                Err(RecvError::Closed) => break,
            },
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                state.controller.detach().await;
                detached = true;
                break;
            }
        }
    }

    while let Ok(entry) = live.try_recv() {
        print_entry(&entry);
    }

    if detached {
        eprintln!("Detached. The deployment keeps running; use `vault-jobs resume` to follow it again.");
        return ExitCode::SUCCESS;
    }

    match state.controller.snapshot().phase {
        Phase::Completed => ExitCode::SUCCESS,
        _ => ExitCode::FAILURE,
    }
}

fn print_entry(entry: &StatusMessage) {
    println!("{:>4} {:<7} {}", entry.id, entry.severity.as_str(), entry.text);
}
