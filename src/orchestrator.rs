use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;

use futures::FutureExt;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{Instrument, error, info, info_span, warn};

use crate::browser::{SessionFactory, WebDriverFactory};
use crate::carrier::{Carrier, Credentials, PortalProfile};
use crate::config::BillfetchConfig;
use crate::error::{BillfetchError, panic_message};
use crate::notify::{DeliveryOutcome, NotificationDispatcher, NotificationPayload};
use crate::portal::{AutomationError, JobWorkspace, PortalAutomationEngine};
use crate::state_machine::{Job, JobReport, JobStatus};
use crate::status::{MemoryStatusStore, RedisStatusStore, StatusStore};
use crate::storage::{ArtifactUploader, ObjectStore, S3Store, UploadError};

/// Why a job ended `failed`. Its message is what the webhook receives.
#[derive(Debug, Error)]
enum JobFailure {
    #[error("no portal automation is configured for carrier {0}")]
    NoEngine(Carrier),

    #[error(transparent)]
    Automation(#[from] AutomationError),

    #[error(transparent)]
    Upload(#[from] UploadError),

    #[error("no artifacts were uploaded")]
    NothingUploaded,

    #[error("job panicked: {0}")]
    Panicked(String),
}

/// Everything one job run needs. Shared read-only by every running job.
pub struct Pipeline {
    pub sessions: Arc<dyn SessionFactory>,
    /// One engine per supported carrier.
    pub engines: Vec<PortalAutomationEngine>,
    pub uploader: ArtifactUploader,
    pub status: Arc<dyn StatusStore>,
    pub notifier: NotificationDispatcher,
    /// Terminal notifications are skipped when unset.
    pub webhook_url: Option<String>,
    pub download_root: PathBuf,
}

/// Accepts jobs and runs each one as an independent background task.
#[derive(Clone)]
pub struct JobOrchestrator {
    inner: Arc<Pipeline>,
}

/// A running job and the signal that it finished.
pub struct JobHandle {
    pub job_id: String,
    completion: JoinHandle<JobReport>,
}

impl JobHandle {
    /// Wait for the job to reach its terminal status.
    pub async fn wait(self) -> Result<JobReport, BillfetchError> {
        let JobHandle { job_id, completion } = self;
        completion
            .await
            .map_err(|err| BillfetchError::Join(job_id, err))
    }
}

impl JobOrchestrator {
    pub fn new(pipeline: Pipeline) -> Self {
        Self {
            inner: Arc::new(pipeline),
        }
    }

    /// Wire the production pipeline: WebDriver sessions, S3 storage, and
    /// Redis (or in-process) status tracking.
    pub async fn from_config(config: &BillfetchConfig, memory_store: bool) -> Result<Self, BillfetchError> {
        let store: Arc<dyn ObjectStore> = Arc::new(S3Store::from_config(&config.storage).await?);
        let status: Arc<dyn StatusStore> = if memory_store {
            Arc::new(MemoryStatusStore::new())
        } else {
            Arc::new(RedisStatusStore::connect(&config.status).await?)
        };
        if config.notify.webhook_url.is_none() {
            warn!("no webhook configured, terminal notifications are disabled");
        }

        Ok(Self::new(Pipeline {
            sessions: Arc::new(WebDriverFactory::new(&config.browser)),
            engines: vec![PortalAutomationEngine::new(
                PortalProfile::for_carrier(Carrier::Ups),
                &config.portal,
            )],
            uploader: ArtifactUploader::new(store, &config.storage),
            status,
            notifier: NotificationDispatcher::new(&config.notify),
            webhook_url: config.notify.webhook_url.clone(),
            download_root: config.browser.download_root.clone(),
        }))
    }

    /// Record the job as pending and start it in the background.
    pub async fn submit(&self, credentials: Credentials) -> JobHandle {
        let job = Job::new(credentials);
        let job_id = job.id.clone();
        info!(job_id = %job_id, carrier = %job.credentials.carrier, "job accepted");
        self.inner.record(&job_id, JobStatus::Pending).await;

        let pipeline = Arc::clone(&self.inner);
        let span = info_span!("job", job_id = %job_id);
        let completion = tokio::spawn(async move { pipeline.execute(job).await }.instrument(span));
        JobHandle { job_id, completion }
    }
}

impl Pipeline {
    async fn execute(&self, mut job: Job) -> JobReport {
        self.transition(&mut job, JobStatus::Processing).await;

        let outcome = AssertUnwindSafe(self.process(&job))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| Err(JobFailure::Panicked(panic_message(payload.as_ref()))));
        let (status, uploaded_keys, message) = match outcome {
            Ok((keys, message)) => (JobStatus::Completed, keys, message),
            Err(failure) => {
                error!(error = %failure, "job failed");
                (JobStatus::Failed, Vec::new(), failure.to_string())
            }
        };
        self.transition(&mut job, status).await;

        let notification = self.notify(&job, &message).await;
        let report = JobReport::from_job(&job, uploaded_keys, message, notification);
        info!(
            status = %report.status,
            duration_ms = report.duration_ms,
            notified = notification.is_some_and(|outcome| outcome.is_delivered()),
            "job finished"
        );
        report
    }

    async fn process(&self, job: &Job) -> Result<(Vec<String>, String), JobFailure> {
        let carrier = job.credentials.carrier;
        let engine = self
            .engines
            .iter()
            .find(|engine| engine.profile().carrier == carrier)
            .ok_or(JobFailure::NoEngine(carrier))?;

        let workspace = JobWorkspace::new(&self.download_root, &job.id);
        let run = engine
            .run(self.sessions.as_ref(), &job.id, &job.credentials, &workspace)
            .await?;
        info!(
            pages = run.pages_visited,
            artifacts = run.artifacts.len(),
            dir = %run.download_dir.display(),
            "automation finished"
        );

        let keys = self.uploader.upload_directory(&run.download_dir).await?;
        if keys.is_empty() {
            return Err(JobFailure::NothingUploaded);
        }
        let locations: Vec<String> = keys.iter().map(|key| self.uploader.location(key)).collect();
        let message = format!("uploaded {} file(s): {}", keys.len(), locations.join(", "));
        Ok((keys, message))
    }

    async fn transition(&self, job: &mut Job, next: JobStatus) {
        if let Err(err) = job.advance(next) {
            error!(error = %err, "status transition rejected");
            return;
        }
        info!(status = %next, "job status changed");
        self.record(&job.id, next).await;
    }

    /// Persist a status. A store outage is logged and never holds up the job.
    async fn record(&self, job_id: &str, status: JobStatus) {
        if let Err(err) = self.status.set(job_id, status).await {
            warn!(job_id, %status, error = %err, "failed to persist job status, continuing");
        }
    }

    async fn notify(&self, job: &Job, message: &str) -> Option<DeliveryOutcome> {
        let Some(endpoint) = self.webhook_url.as_deref() else {
            warn!("no webhook configured, skipping notification");
            return None;
        };
        let payload = NotificationPayload {
            job_id: job.id.clone(),
            status: job.status.terminal()?,
            message: message.to_string(),
        };
        Some(self.notifier.notify(endpoint, &payload).await)
    }
}
