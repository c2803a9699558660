//! Async job tracker
//!
//! Hands user deletions to the batch-job system and answers status queries
//! with one live round trip each. Nothing polls in the background.
//!
//! A submitted job keeps the identity guard for its username until a status
//! query observes a terminal state; the record and the guard token are then
//! dropped together. The username of a finished job stays known, so later
//! polls return the same body. If the submission itself fails, the token is
//! released before the error is returned and no record is kept.

use super::formation::{BatchJobSystem, JobSystemError};
use crate::config::FormationSettings;
use crate::error::AppError;
use crate::models::{JobStatusResponse, Operation};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use identity_guard::{GuardError, GuardToken, IdentityGuard};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{info, warn};

/// Engine-level job state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "Queued",
            JobState::Running => "Running",
            JobState::Succeeded => "Succeeded",
            JobState::Failed => "Failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map a native batch-job status onto [`JobState`]
///
/// Unrecognised states are reported as `Running`: the job exists and has not
/// been reported finished.
pub fn map_remote_state(native: &str) -> JobState {
    match native.trim().to_ascii_lowercase().as_str() {
        "submitted" | "queued" | "pending" | "idle" | "held" => JobState::Queued,
        "running" | "importing" | "submitting" => JobState::Running,
        "completed" | "succeeded" | "success" => JobState::Succeeded,
        "failed" | "canceled" | "cancelled" | "error" => JobState::Failed,
        other => {
            warn!(remote_status = %other, "Unrecognised batch-job status, treating as running");
            JobState::Running
        }
    }
}

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error(transparent)]
    Guard(#[from] GuardError),

    #[error("deletion job submission failed: {0}")]
    SubmissionFailed(JobSystemError),

    #[error("job status query failed: {0}")]
    Status(JobSystemError),

    #[error("neither a deletion job template id nor name is configured")]
    NoTemplate,
}

impl From<TrackerError> for AppError {
    fn from(err: TrackerError) -> Self {
        let message = err.to_string();
        match err {
            TrackerError::Guard(e) => e.into(),
            TrackerError::SubmissionFailed(_) => AppError::SubmissionFailed(message),
            TrackerError::Status(JobSystemError::Rejected { status: 404, .. }) => {
                AppError::NotFound(message)
            }
            TrackerError::Status(_) => AppError::UpstreamUnavailable(message),
            TrackerError::NoTemplate => AppError::Internal(message),
        }
    }
}

/// Handle to a submitted deletion
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeletionJob {
    pub username: String,
    pub job_id: String,
    pub submitted_at: DateTime<Utc>,
    pub last_status: JobState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_polled: Option<DateTime<Utc>>,
}

struct TrackedJob {
    record: DeletionJob,
    _token: GuardToken,
}

/// Finished jobs remembered for repeat polls
const FINISHED_CAPACITY: usize = 1024;

struct FinishedJob {
    username: String,
    finished_at: DateTime<Utc>,
}

enum TemplateSource {
    Fixed(String),
    Named { name: String, resolved: OnceCell<String> },
}

pub struct JobTracker {
    system: Arc<dyn BatchJobSystem>,
    guard: IdentityGuard,
    template: TemplateSource,
    jobs: DashMap<String, TrackedJob>,
    finished: DashMap<String, FinishedJob>,
}

impl JobTracker {
    /// A configured template id wins over a template name
    pub fn new(
        system: Arc<dyn BatchJobSystem>,
        guard: IdentityGuard,
        settings: &FormationSettings,
    ) -> Result<Self, TrackerError> {
        let non_empty = |v: &Option<String>| {
            v.as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };

        let template = match (
            non_empty(&settings.deletion_app_id),
            non_empty(&settings.deletion_app_name),
        ) {
            (Some(id), _) => TemplateSource::Fixed(id),
            (None, Some(name)) => TemplateSource::Named {
                name,
                resolved: OnceCell::new(),
            },
            (None, None) => return Err(TrackerError::NoTemplate),
        };

        Ok(Self {
            system,
            guard,
            template,
            jobs: DashMap::new(),
            finished: DashMap::new(),
        })
    }

    /// Resolve a named template up front
    ///
    /// Failure is logged, not fatal; resolution is retried on first submit.
    pub async fn init(&self) {
        if let TemplateSource::Named { name, .. } = &self.template {
            match self.template_id().await {
                Ok(id) => {
                    info!(template = %name, template_id = %id, "Deletion job template resolved")
                }
                Err(e) => {
                    warn!(template = %name, error = %e, "Deletion job template not resolved yet")
                }
            }
        }
    }

    async fn template_id(&self) -> Result<String, JobSystemError> {
        match &self.template {
            TemplateSource::Fixed(id) => Ok(id.clone()),
            TemplateSource::Named { name, resolved } => resolved
                .get_or_try_init(|| self.system.resolve_template(name))
                .await
                .cloned(),
        }
    }

    /// Submit a deletion and return without waiting for it to run
    pub async fn submit(&self, username: &str) -> Result<DeletionJob, TrackerError> {
        let token = self
            .guard
            .acquire(username, Operation::DeleteAsync.as_str())
            .await?;

        let launched = match self.template_id().await {
            Ok(template_id) => self.system.launch(&template_id, username).await,
            Err(e) => Err(e),
        };

        let job_id = match launched {
            Ok(job_id) => job_id,
            Err(e) => {
                drop(token);
                warn!(username = %username, error = %e, "Deletion job submission failed");
                return Err(TrackerError::SubmissionFailed(e));
            }
        };

        let record = DeletionJob {
            username: username.to_string(),
            job_id: job_id.clone(),
            submitted_at: Utc::now(),
            last_status: JobState::Queued,
            last_polled: None,
        };
        self.jobs.insert(
            job_id.clone(),
            TrackedJob {
                record: record.clone(),
                _token: token,
            },
        );

        info!(username = %username, job_id = %job_id, "Deletion job submitted");
        Ok(record)
    }

    /// Live status of a job
    ///
    /// Works for any job id the batch-job system knows, tracked here or not.
    pub async fn status(&self, job_id: &str) -> Result<JobStatusResponse, TrackerError> {
        let native = self
            .system
            .status(job_id)
            .await
            .map_err(TrackerError::Status)?;
        let state = map_remote_state(&native);
        let polled_at = Utc::now();

        let username = self.jobs.get_mut(job_id).map(|mut tracked| {
            let job = &mut tracked.record;
            if job.last_status != state {
                info!(
                    username = %job.username,
                    job_id = %job_id,
                    from = %job.last_status,
                    to = %state,
                    "Deletion job status changed"
                );
            }
            job.last_status = state;
            job.last_polled = Some(polled_at);
            job.username.clone()
        });

        if state.is_terminal() {
            if let Some((_, tracked)) = self.jobs.remove(job_id) {
                self.remember_finished(job_id, tracked.record.username, polled_at);
                info!(job_id = %job_id, status = %state, "Deletion job finished, identity released");
            }
        }
        let username = username.or_else(|| {
            self.finished
                .get(job_id)
                .map(|finished| finished.username.clone())
        });

        Ok(JobStatusResponse {
            analysis_id: job_id.to_string(),
            username,
            status: state.as_str().to_string(),
            remote_status: native,
            polled_at,
        })
    }

    fn remember_finished(&self, job_id: &str, username: String, finished_at: DateTime<Utc>) {
        self.finished.insert(
            job_id.to_string(),
            FinishedJob {
                username,
                finished_at,
            },
        );
        if self.finished.len() <= FINISHED_CAPACITY {
            return;
        }

        let oldest = self
            .finished
            .iter()
            .min_by_key(|entry| entry.value().finished_at)
            .map(|entry| entry.key().clone());
        if let Some(oldest) = oldest {
            self.finished.remove(&oldest);
        }
    }

    /// Jobs still holding their identity, oldest first
    pub fn jobs(&self) -> Vec<DeletionJob> {
        let mut jobs: Vec<DeletionJob> = self
            .jobs
            .iter()
            .map(|entry| entry.value().record.clone())
            .collect();
        jobs.sort_by_key(|j| j.submitted_at);
        jobs
    }
}
