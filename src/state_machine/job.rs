use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::TransitionError;
use crate::carrier::Credentials;
use crate::notify::DeliveryOutcome;

/// Lifecycle status of a retrieval job, as written to the status store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    fn stage(&self) -> u8 {
        match self {
            JobStatus::Pending => 0,
            JobStatus::Processing => 1,
            JobStatus::Completed | JobStatus::Failed => 2,
        }
    }

    /// A status only moves to a strictly later stage, and never leaves a
    /// terminal one.
    pub fn can_advance_to(&self, next: JobStatus) -> bool {
        !self.is_terminal() && next.stage() > self.stage()
    }

    /// The notification-facing view of a terminal status.
    pub fn terminal(&self) -> Option<TerminalStatus> {
        match self {
            JobStatus::Completed => Some(TerminalStatus::Completed),
            JobStatus::Failed => Some(TerminalStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// The two outcomes a job can end in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TerminalStatus {
    Completed,
    Failed,
}

/// One invoice retrieval run for one set of portal credentials.
#[derive(Debug)]
pub struct Job {
    pub id: String,
    pub status: JobStatus,
    pub credentials: Credentials,
    pub status_history: Vec<JobStatus>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(credentials: Credentials) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            status: JobStatus::Pending,
            credentials,
            status_history: vec![JobStatus::Pending],
            created_at: now,
            updated_at: now,
        }
    }

    /// Move the job forward. Backward moves and moves out of a terminal
    /// status are rejected and leave the job untouched.
    pub fn advance(&mut self, next: JobStatus) -> Result<(), TransitionError> {
        if !self.status.can_advance_to(next) {
            return Err(TransitionError::new(self.status, next));
        }
        self.status = next;
        self.status_history.push(next);
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// Summary produced when a job reaches its terminal status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobReport {
    pub job_id: String,
    pub status: JobStatus,
    pub status_history: Vec<JobStatus>,
    pub uploaded_keys: Vec<String>,
    pub message: String,
    pub notification: Option<DeliveryOutcome>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: i64,
}

impl JobReport {
    pub fn from_job(
        job: &Job,
        uploaded_keys: Vec<String>,
        message: String,
        notification: Option<DeliveryOutcome>,
    ) -> Self {
        let now = Utc::now();
        Self {
            job_id: job.id.clone(),
            status: job.status,
            status_history: job.status_history.clone(),
            uploaded_keys,
            message,
            notification,
            started_at: job.created_at,
            completed_at: now,
            duration_ms: (now - job.created_at).num_milliseconds(),
        }
    }
}
