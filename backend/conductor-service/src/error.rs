//! Error types for Conductor Service
//!
//! `ErrorKind` is the taxonomy every failure is reported under; `AppError`
//! carries it to HTTP clients.
use actix_web::{error::ResponseError, http::StatusCode, HttpResponse};
use identity_guard::GuardError;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type for conductor-service operations
pub type Result<T> = std::result::Result<T, AppError>;

/// Failure taxonomy shared by runs, jobs and HTTP errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed request, rejected before any step runs
    ValidationError,
    /// A backend could not be reached or did not answer in time
    UpstreamUnavailable,
    /// A backend gave a definite failure for one step
    StepFailed,
    /// At least one compensation could not undo its step
    CompensationFailed,
    /// Another operation holds the identity
    Conflict,
    /// Async submission never created a job
    SubmissionFailed,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ValidationError => "validation_error",
            ErrorKind::UpstreamUnavailable => "upstream_unavailable",
            ErrorKind::StepFailed => "step_failed",
            ErrorKind::CompensationFailed => "compensation_failed",
            ErrorKind::Conflict => "conflict",
            ErrorKind::SubmissionFailed => "submission_failed",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// JSON error body
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
    pub status: u16,
    pub code: String,
}

/// Application error types
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Operation in progress: {0}")]
    Conflict(String),

    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("Submission failed: {0}")]
    SubmissionFailed(String),

    #[error("Backend call failed: {0}")]
    StepFailed(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Taxonomy code, or a transport-level code for errors outside it
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Validation(_) => ErrorKind::ValidationError.as_str(),
            AppError::Conflict(_) => ErrorKind::Conflict.as_str(),
            AppError::UpstreamUnavailable(_) => ErrorKind::UpstreamUnavailable.as_str(),
            AppError::SubmissionFailed(_) => ErrorKind::SubmissionFailed.as_str(),
            AppError::StepFailed(_) => ErrorKind::StepFailed.as_str(),
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::Timeout(_) => "TIMEOUT",
            AppError::Internal(_) => "INTERNAL",
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::UpstreamUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::SubmissionFailed(_) | AppError::StepFailed(_) => StatusCode::BAD_GATEWAY,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        let body = ErrorBody {
            error: status
                .canonical_reason()
                .unwrap_or("Error")
                .to_string(),
            message: self.to_string(),
            status: status.as_u16(),
            code: self.code().to_string(),
        };

        HttpResponse::build(status).json(body)
    }
}

impl From<GuardError> for AppError {
    fn from(err: GuardError) -> Self {
        match err {
            GuardError::Conflict { .. } => AppError::Conflict(err.to_string()),
            GuardError::InvalidKey(_) => AppError::Validation(err.to_string()),
        }
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(err: validator::ValidationErrors) -> Self {
        AppError::Validation(err.to_string())
    }
}
