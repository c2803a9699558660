//! Steps and the fixed per-operation plans
//!
//! Plan order is a contract: dependencies are created before dependents and
//! removed after them. `plan` never reorders based on request contents; a
//! step with nothing to do is still planned and later recorded as skipped.
use crate::adapters::{
    AccountSpec, AdapterError, AdapterOutcome, Backend, Password, ResourceSpec, ServiceAdapter,
    Undo,
};
use crate::error::{AppError, ErrorKind};
use crate::models::{
    CreateUserRequest, DeleteUserRequest, LifecycleRequest, Operation, PasswordChangeRequest,
    RequestPayload,
};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepName {
    Identity,
    Storage,
    Registration,
    Notification,
}

impl StepName {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepName::Identity => "directory",
            StepName::Storage => "storage",
            StepName::Registration => "registration",
            StepName::Notification => "notify",
        }
    }
}

impl fmt::Display for StepName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One adapter capability with its arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Capability {
    Exists,
    Create(ResourceSpec),
    Delete(ResourceSpec),
    Register(ResourceSpec),
}

/// What a capability call produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    Outcome(AdapterOutcome),
    Presence(bool),
}

impl Capability {
    pub fn label(&self) -> &'static str {
        match self {
            Capability::Exists => "exists",
            Capability::Create(_) => "create",
            Capability::Delete(_) => "delete",
            Capability::Register(_) => "register",
        }
    }

    /// Whether the arguments leave nothing for the adapter to do
    pub fn is_empty(&self) -> bool {
        match self {
            Capability::Exists => false,
            Capability::Create(spec) | Capability::Delete(spec) | Capability::Register(spec) => {
                spec.is_empty()
            }
        }
    }

    pub async fn invoke(
        &self,
        adapter: &dyn ServiceAdapter,
        username: &str,
    ) -> Result<Invocation, AdapterError> {
        match self {
            Capability::Exists => adapter.exists(username).await.map(Invocation::Presence),
            Capability::Create(spec) => adapter.create(username, spec).await.map(Invocation::Outcome),
            Capability::Delete(spec) => adapter.delete(username, spec).await.map(Invocation::Outcome),
            Capability::Register(spec) => {
                adapter.register(username, spec).await.map(Invocation::Outcome)
            }
        }
    }
}

impl From<Undo> for Capability {
    fn from(undo: Undo) -> Self {
        match undo {
            Undo::Create(spec) => Capability::Create(spec),
            Undo::Delete(spec) => Capability::Delete(spec),
            Undo::Register(spec) => Capability::Register(spec),
        }
    }
}

/// How a succeeded step is undone
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compensation {
    /// The step cannot be reversed
    None,
    /// Always the same call, whatever was there before
    Invoke(Capability),
    /// Put back the state the adapter read before changing it
    Restore,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub name: StepName,
    pub backend: Backend,
    pub action: Capability,
    pub compensation: Compensation,
}

impl Step {
    fn new(name: StepName, backend: Backend, action: Capability, compensation: Compensation) -> Self {
        Self {
            name,
            backend,
            action,
            compensation,
        }
    }

    pub fn is_reversible(&self) -> bool {
        !matches!(self.compensation, Compensation::None)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// An earlier step failed or the run was cancelled first
    NotReached,
    AlreadyInState,
    BackendDisabled,
    NothingRequested,
    Cancelled,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::NotReached => "not reached",
            SkipReason::AlreadyInState => "already in desired state",
            SkipReason::BackendDisabled => "backend disabled",
            SkipReason::NothingRequested => "nothing requested",
            SkipReason::Cancelled => "request cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepResult {
    Succeeded(String),
    Failed { kind: ErrorKind, detail: String },
    Skipped(SkipReason),
}

impl StepResult {
    pub fn is_succeeded(&self) -> bool {
        matches!(self, StepResult::Succeeded(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, StepResult::Failed { .. })
    }
}

/// Values the plans need from configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanDefaults {
    pub default_job_limit: u32,
}

/// Build the fixed step sequence for a request
pub fn plan(request: &LifecycleRequest, defaults: &PlanDefaults) -> Result<Vec<Step>, AppError> {
    match (request.operation(), request.payload()) {
        (Operation::Create, RequestPayload::Create(create)) => plan_create(create, defaults),
        (Operation::DeleteSync, RequestPayload::Delete(delete)) => Ok(plan_delete(delete)),
        (Operation::ChangePassword, RequestPayload::Password(change)) => {
            Ok(plan_password(change))
        }
        (Operation::Validate, _) => Ok(vec![Step::new(
            StepName::Identity,
            Backend::Directory,
            Capability::Exists,
            Compensation::None,
        )]),
        (Operation::DeleteAsync, _) => Err(AppError::Validation(
            "asynchronous deletion is submitted to the job tracker, not run as steps".to_string(),
        )),
        (operation, _) => Err(AppError::Internal(format!(
            "request payload does not match operation `{operation}`"
        ))),
    }
}

fn plan_create(req: &CreateUserRequest, defaults: &PlanDefaults) -> Result<Vec<Step>, AppError> {
    let uid_number = req
        .user_uid
        .trim()
        .parse::<u32>()
        .map_err(|_| {
            AppError::Validation(format!(
                "user_uid `{}` is not a positive integer",
                req.user_uid
            ))
        })?;

    let account = ResourceSpec::Account(AccountSpec {
        first_name: req.first_name.clone(),
        last_name: req.last_name.clone(),
        email: req.email.clone(),
        uid_number,
        password: Password::new(req.password.clone()),
        department: req.department.clone(),
        organization: req.organization.clone(),
        title: req.title.clone(),
        groups: req.groups.clone(),
    });
    let storage = ResourceSpec::Storage {
        password: Password::new(req.password.clone()),
        services: req.datastore_services.clone(),
    };
    let limit = ResourceSpec::JobLimit {
        concurrent_jobs: req.job_limit.unwrap_or(defaults.default_job_limit),
    };
    let subscriptions = ResourceSpec::Subscriptions {
        addresses: vec![req.email.clone()],
        lists: req.mailing_lists.clone(),
    };

    Ok(vec![
        Step::new(
            StepName::Identity,
            Backend::Directory,
            Capability::Create(account),
            Compensation::Invoke(Capability::Delete(ResourceSpec::Identity)),
        ),
        Step::new(
            StepName::Storage,
            Backend::Storage,
            Capability::Create(storage),
            Compensation::Invoke(Capability::Delete(ResourceSpec::Identity)),
        ),
        Step::new(
            StepName::Registration,
            Backend::JobLimits,
            Capability::Register(limit),
            Compensation::Restore,
        ),
        Step::new(
            StepName::Notification,
            Backend::MailingList,
            Capability::Register(subscriptions),
            Compensation::Restore,
        ),
    ])
}

fn plan_delete(req: &DeleteUserRequest) -> Vec<Step> {
    let subscriptions = ResourceSpec::Subscriptions {
        addresses: req.emails.clone(),
        lists: req.mailing_lists.clone(),
    };

    vec![
        Step::new(
            StepName::Notification,
            Backend::MailingList,
            Capability::Delete(subscriptions),
            Compensation::Restore,
        ),
        Step::new(
            StepName::Registration,
            Backend::JobLimits,
            Capability::Delete(ResourceSpec::Identity),
            Compensation::Restore,
        ),
        Step::new(
            StepName::Storage,
            Backend::Storage,
            Capability::Delete(ResourceSpec::Identity),
            Compensation::None,
        ),
        Step::new(
            StepName::Identity,
            Backend::Directory,
            Capability::Delete(ResourceSpec::Identity),
            Compensation::None,
        ),
    ]
}

/// Directory first; the data store password follows it
fn plan_password(req: &PasswordChangeRequest) -> Vec<Step> {
    let password = ResourceSpec::Password(Password::new(req.password.clone()));
    vec![
        Step::new(
            StepName::Identity,
            Backend::Directory,
            Capability::Register(password.clone()),
            Compensation::None,
        ),
        Step::new(
            StepName::Storage,
            Backend::Storage,
            Capability::Register(password),
            Compensation::None,
        ),
    ]
}
