//! Request and response models for the lifecycle API
use crate::error::AppError;
use crate::validators;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use validator::Validate;

/// Body of `POST /users/`
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateUserRequest {
    #[validate(custom(function = "crate::validators::validate_username"))]
    pub username: String,

    #[validate(length(min = 1))]
    pub first_name: String,

    #[validate(length(min = 1))]
    pub last_name: String,

    #[validate(email)]
    pub email: String,

    /// Directory uidNumber
    #[validate(custom(function = "crate::validators::validate_uid_number"))]
    pub user_uid: String,

    #[validate(length(min = 1))]
    pub password: String,

    #[validate(length(min = 1))]
    pub department: String,

    #[validate(length(min = 1))]
    pub organization: String,

    #[validate(length(min = 1))]
    pub title: String,

    /// Directory groups beyond the everyone/community defaults
    #[serde(default)]
    #[validate(custom(function = "crate::validators::validate_names"))]
    pub groups: Vec<String>,

    /// Mailing lists to subscribe `email` to
    #[serde(default)]
    #[validate(custom(function = "crate::validators::validate_names"))]
    pub mailing_lists: Vec<String>,

    #[serde(default)]
    #[validate(nested)]
    pub datastore_services: Vec<DatastoreService>,

    /// Concurrent job limit; the configured default applies when absent
    #[serde(default)]
    pub job_limit: Option<u32>,
}

/// Data store service path to register a user for; also the body of
/// `POST /datastore/users/{username}/services`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct DatastoreService {
    #[validate(length(min = 1))]
    pub irods_path: String,
    #[serde(default)]
    pub irods_user: Option<String>,
}

/// Optional body of `DELETE /users/{username}`
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct DeleteUserRequest {
    /// Addresses to unsubscribe
    #[serde(default)]
    #[validate(custom(function = "crate::validators::validate_names"))]
    pub emails: Vec<String>,

    /// Lists to unsubscribe them from
    #[serde(default)]
    #[validate(custom(function = "crate::validators::validate_names"))]
    pub mailing_lists: Vec<String>,
}

/// Body of `POST /users/{username}/password`
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct PasswordChangeRequest {
    #[validate(length(min = 1))]
    pub password: String,
}

/// Body of `POST /mailinglists/{list}/members`
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct MemberRequest {
    #[validate(email)]
    pub email: String,
}

/// Body of `POST /terrain/users/{username}/job-limits`
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct JobLimitRequest {
    #[validate(range(min = 1))]
    pub limit: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    DeleteSync,
    DeleteAsync,
    Validate,
    ChangePassword,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::DeleteSync => "delete_sync",
            Operation::DeleteAsync => "delete_async",
            Operation::Validate => "validate",
            Operation::ChangePassword => "change_password",
        }
    }

    /// Whether the operation changes backend state
    pub fn is_mutating(&self) -> bool {
        !matches!(self, Operation::Validate)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub enum RequestPayload {
    Create(CreateUserRequest),
    Delete(DeleteUserRequest),
    Password(PasswordChangeRequest),
    Empty,
}

/// A validated lifecycle request; immutable once built
#[derive(Debug, Clone)]
pub struct LifecycleRequest {
    username: String,
    operation: Operation,
    payload: RequestPayload,
}

impl LifecycleRequest {
    pub fn create(request: CreateUserRequest) -> Result<Self, AppError> {
        request.validate()?;
        Ok(Self {
            username: request.username.clone(),
            operation: Operation::Create,
            payload: RequestPayload::Create(request),
        })
    }

    pub fn delete_sync(username: &str, request: DeleteUserRequest) -> Result<Self, AppError> {
        check_username(username)?;
        request.validate()?;
        Ok(Self {
            username: username.to_string(),
            operation: Operation::DeleteSync,
            payload: RequestPayload::Delete(request),
        })
    }

    pub fn validate_user(username: &str) -> Result<Self, AppError> {
        check_username(username)?;
        Ok(Self {
            username: username.to_string(),
            operation: Operation::Validate,
            payload: RequestPayload::Empty,
        })
    }

    pub fn change_password(
        username: &str,
        request: PasswordChangeRequest,
    ) -> Result<Self, AppError> {
        check_username(username)?;
        request.validate()?;
        Ok(Self {
            username: username.to_string(),
            operation: Operation::ChangePassword,
            payload: RequestPayload::Password(request),
        })
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn payload(&self) -> &RequestPayload {
        &self.payload
    }
}

/// Reject malformed usernames before any backend is touched
pub fn check_username(username: &str) -> Result<(), AppError> {
    if validators::is_valid_username(username) {
        Ok(())
    } else {
        Err(AppError::Validation(format!(
            "invalid username `{username}`: expected 1-64 characters of [a-z0-9._-] starting with a letter or digit"
        )))
    }
}

/// Response of `DELETE /async/users/{username}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsyncDeletionResponse {
    pub analysis_id: String,
    pub username: String,
    pub status: String,
    pub submitted_at: DateTime<Utc>,
}

/// Response of `GET /async/status/{analysis_id}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusResponse {
    pub analysis_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    pub status: String,
    pub remote_status: String,
    pub polled_at: DateTime<Utc>,
}

/// Presence of one identity across backends
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceSummary {
    pub username: String,
    pub backends: BTreeMap<String, Presence>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Presence {
    Present,
    Absent,
    Unknown,
}

/// Acknowledgement of a single management call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenericResponse {
    pub success: bool,
    pub message: String,
}

impl GenericResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExistsResponse {
    pub subject: String,
    pub exists: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupsResponse {
    pub username: String,
    pub groups: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobLimitResponse {
    pub username: String,
    pub concurrent_jobs: u32,
}
