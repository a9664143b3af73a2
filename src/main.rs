use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use billfetch::carrier::Credentials;
use billfetch::cli::{Cli, Command};
use billfetch::config::BillfetchConfig;
use billfetch::error::BillfetchError;
use billfetch::orchestrator::JobOrchestrator;
use billfetch::state_machine::JobStatus;
use billfetch::status::{MemoryStatusStore, RedisStatusStore, StatusStore};
use billfetch::storage::{ArtifactUploader, S3Store};
use billfetch::ui::{self, JobProgress};

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_level.into()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_line_number(true)
                .with_writer(std::io::stderr),
        )
        .init();

    let config = BillfetchConfig::load(cli.config.as_deref())?;

    match cli.command {
        Command::Run {
            username,
            password,
            carrier,
        } => {
            let credentials = Credentials::new(username, password, &carrier).map_err(BillfetchError::from)?;
            run_job(&config, cli.memory_store, credentials).await
        }
        Command::Status { job_id } => {
            let store = status_store(&config, cli.memory_store).await?;
            let status = store.get(&job_id).await.map_err(BillfetchError::from)?;
            ui::print_status(&job_id, status);
            Ok(if status.is_some() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Command::Forget { job_id } => {
            let store = status_store(&config, cli.memory_store).await?;
            if store.get(&job_id).await.map_err(BillfetchError::from)?.is_none() {
                return Err(BillfetchError::JobNotFound(job_id).into());
            }
            store.delete(&job_id).await.map_err(BillfetchError::from)?;
            info!(job_id = %job_id, "status removed");
            Ok(ExitCode::SUCCESS)
        }
        Command::Upload { dir } => upload_dir(&config, &dir).await,
    }
}

async fn run_job(config: &BillfetchConfig, memory_store: bool, credentials: Credentials) -> Result<ExitCode> {
    let carrier = credentials.carrier;
    let orchestrator = JobOrchestrator::from_config(config, memory_store).await?;
    let handle = orchestrator.submit(credentials).await;
    let progress = JobProgress::start(&handle.job_id, carrier);

    let report = handle.wait().await?;
    progress.complete(&report);
    ui::print_report(&report);

    Ok(match report.status {
        JobStatus::Completed => ExitCode::SUCCESS,
        _ => ExitCode::FAILURE,
    })
}

async fn status_store(config: &BillfetchConfig, memory_store: bool) -> Result<Arc<dyn StatusStore>> {
    if memory_store {
        return Ok(Arc::new(MemoryStatusStore::new()));
    }
    let store = RedisStatusStore::connect(&config.status)
        .await
        .map_err(BillfetchError::from)?;
    Ok(Arc::new(store))
}

async fn upload_dir(config: &BillfetchConfig, dir: &Path) -> Result<ExitCode> {
    let store = S3Store::from_config(&config.storage)
        .await
        .map_err(BillfetchError::from)?;
    let uploader = ArtifactUploader::new(Arc::new(store), &config.storage);
    let keys = uploader
        .upload_directory(dir)
        .await
        .with_context(|| format!("uploading {}", dir.display()))?;
    let locations: Vec<String> = keys.iter().map(|key| uploader.location(key)).collect();
    ui::print_uploaded(&locations);

    Ok(if keys.is_empty() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}
