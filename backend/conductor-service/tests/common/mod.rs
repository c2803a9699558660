//! Shared fakes for integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use conductor_service::adapters::{
    AdapterError, AdapterOutcome, AdapterRegistry, Backend, Detail, Membership, Query,
    ResourceSpec, ServiceAdapter, Undo,
};
use conductor_service::config::FormationSettings;
use conductor_service::jobs::{BatchJobSystem, JobSystemError};
use conductor_service::models::CreateUserRequest;
use conductor_service::orchestration::{Coordinator, PlanDefaults};
use identity_guard::{AcquireMode, IdentityGuard};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Calls across every fake, in order, as `backend:capability`
pub type CallLog = Arc<Mutex<Vec<String>>>;

/// In-memory backend that tracks whether the user is present
pub struct FakeAdapter {
    backend: Backend,
    log: CallLog,
    present: Mutex<bool>,
    failures: Mutex<HashMap<&'static str, AdapterError>>,
    delay: Mutex<Option<Duration>>,
}

impl FakeAdapter {
    pub fn new(backend: Backend, log: CallLog) -> Arc<Self> {
        Arc::new(Self {
            backend,
            log,
            present: Mutex::new(false),
            failures: Mutex::new(HashMap::new()),
            delay: Mutex::new(None),
        })
    }

    /// Make every call of `capability` fail with `err`
    pub fn fail_on(&self, capability: &'static str, err: AdapterError) {
        self.failures.lock().unwrap().insert(capability, err);
    }

    pub fn set_present(&self, present: bool) {
        *self.present.lock().unwrap() = present;
    }

    pub fn is_present(&self) -> bool {
        *self.present.lock().unwrap()
    }

    /// Sleep this long inside every call
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    async fn enter(&self, capability: &'static str) -> Result<(), AdapterError> {
        log_call(&self.log, self.backend, capability);

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        match self.failures.lock().unwrap().get(capability) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn put(&self) -> AdapterOutcome {
        let mut present = self.present.lock().unwrap();
        if *present {
            AdapterOutcome::AlreadyExists
        } else {
            *present = true;
            AdapterOutcome::reversible(
                format!("{} applied", self.backend),
                Undo::Delete(ResourceSpec::Identity),
            )
        }
    }
}

#[async_trait]
impl ServiceAdapter for FakeAdapter {
    fn backend(&self) -> Backend {
        self.backend
    }

    async fn exists(&self, _username: &str) -> Result<bool, AdapterError> {
        self.enter("exists").await?;
        Ok(self.is_present())
    }

    async fn create(&self, _: &str, _: &ResourceSpec) -> Result<AdapterOutcome, AdapterError> {
        self.enter("create").await?;
        Ok(self.put())
    }

    async fn delete(&self, _: &str, _: &ResourceSpec) -> Result<AdapterOutcome, AdapterError> {
        self.enter("delete").await?;
        let mut present = self.present.lock().unwrap();
        if *present {
            *present = false;
            Ok(AdapterOutcome::reversible(
                format!("{} removed", self.backend),
                Undo::Register(ResourceSpec::Identity),
            ))
        } else {
            Ok(AdapterOutcome::AlreadyAbsent)
        }
    }

    async fn register(&self, _: &str, _: &ResourceSpec) -> Result<AdapterOutcome, AdapterError> {
        self.enter("register").await?;
        Ok(self.put())
    }
}

fn log_call(log: &CallLog, backend: Backend, capability: &str) {
    log.lock()
        .unwrap()
        .push(format!("{}:{}", backend.as_str(), capability));
}

/// Job-limit backend holding one override, with the real adapter's
/// read-before-write answers
pub struct FakeJobLimits {
    log: CallLog,
    limit: Mutex<Option<u32>>,
}

impl FakeJobLimits {
    pub fn new(log: CallLog, limit: Option<u32>) -> Arc<Self> {
        Arc::new(Self {
            log,
            limit: Mutex::new(limit),
        })
    }

    pub fn limit(&self) -> Option<u32> {
        *self.limit.lock().unwrap()
    }
}

fn restore_limit(prior: Option<u32>) -> Undo {
    match prior {
        Some(concurrent_jobs) => Undo::Register(ResourceSpec::JobLimit { concurrent_jobs }),
        None => Undo::Delete(ResourceSpec::Identity),
    }
}

#[async_trait]
impl ServiceAdapter for FakeJobLimits {
    fn backend(&self) -> Backend {
        Backend::JobLimits
    }

    async fn exists(&self, _: &str) -> Result<bool, AdapterError> {
        log_call(&self.log, Backend::JobLimits, "exists");
        Ok(self.limit().is_some())
    }

    async fn create(&self, u: &str, spec: &ResourceSpec) -> Result<AdapterOutcome, AdapterError> {
        self.register(u, spec).await
    }

    async fn delete(&self, _: &str, _: &ResourceSpec) -> Result<AdapterOutcome, AdapterError> {
        log_call(&self.log, Backend::JobLimits, "delete");
        match self.limit.lock().unwrap().take() {
            Some(prior) => Ok(AdapterOutcome::reversible(
                format!("job limit override {prior} removed"),
                restore_limit(Some(prior)),
            )),
            None => Ok(AdapterOutcome::AlreadyAbsent),
        }
    }

    async fn register(&self, _: &str, spec: &ResourceSpec) -> Result<AdapterOutcome, AdapterError> {
        log_call(&self.log, Backend::JobLimits, "register");
        let ResourceSpec::JobLimit { concurrent_jobs } = spec else {
            return Err(AdapterError::mismatched_spec(Backend::JobLimits, "register", spec));
        };
        let mut limit = self.limit.lock().unwrap();
        let prior = *limit;
        if prior == Some(*concurrent_jobs) {
            return Ok(AdapterOutcome::AlreadyExists);
        }
        *limit = Some(*concurrent_jobs);
        Ok(AdapterOutcome::reversible(
            format!("job limit set to {concurrent_jobs}"),
            restore_limit(prior),
        ))
    }

    async fn query(&self, _: &str, query: &Query) -> Result<Detail, AdapterError> {
        match query {
            Query::JobLimit => Ok(Detail::JobLimit(self.limit())),
            other => Err(AdapterError::Unsupported {
                backend: Backend::JobLimits,
                capability: other.label(),
            }),
        }
    }
}

/// Mailing lists as a set of list/address pairs
pub struct FakeRoster {
    log: CallLog,
    members: Mutex<BTreeSet<Membership>>,
    failures: Mutex<HashMap<&'static str, AdapterError>>,
}

impl FakeRoster {
    pub fn new(log: CallLog, members: &[(&str, &str)]) -> Arc<Self> {
        Arc::new(Self {
            log,
            members: Mutex::new(
                members
                    .iter()
                    .map(|(list, address)| Membership::new(*list, *address))
                    .collect(),
            ),
            failures: Mutex::new(HashMap::new()),
        })
    }

    pub fn fail_on(&self, capability: &'static str, err: AdapterError) {
        self.failures.lock().unwrap().insert(capability, err);
    }

    pub fn members(&self) -> BTreeSet<Membership> {
        self.members.lock().unwrap().clone()
    }

    fn enter(&self, capability: &'static str) -> Result<(), AdapterError> {
        log_call(&self.log, Backend::MailingList, capability);
        match self.failures.lock().unwrap().get(capability) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn pairs(spec: &ResourceSpec, capability: &'static str) -> Result<Vec<Membership>, AdapterError> {
        spec.memberships()
            .ok_or_else(|| AdapterError::mismatched_spec(Backend::MailingList, capability, spec))
    }
}

#[async_trait]
impl ServiceAdapter for FakeRoster {
    fn backend(&self) -> Backend {
        Backend::MailingList
    }

    async fn create(&self, u: &str, spec: &ResourceSpec) -> Result<AdapterOutcome, AdapterError> {
        self.register(u, spec).await
    }

    async fn delete(&self, _: &str, spec: &ResourceSpec) -> Result<AdapterOutcome, AdapterError> {
        self.enter("delete")?;
        let mut members = self.members.lock().unwrap();
        let removed: Vec<Membership> = Self::pairs(spec, "delete")?
            .into_iter()
            .filter(|pair| members.remove(pair))
            .collect();
        if removed.is_empty() {
            return Ok(AdapterOutcome::AlreadyAbsent);
        }
        Ok(AdapterOutcome::reversible(
            format!("removed {} subscriptions", removed.len()),
            Undo::Register(ResourceSpec::Memberships(removed)),
        ))
    }

    async fn register(&self, _: &str, spec: &ResourceSpec) -> Result<AdapterOutcome, AdapterError> {
        self.enter("register")?;
        let mut members = self.members.lock().unwrap();
        let added: Vec<Membership> = Self::pairs(spec, "register")?
            .into_iter()
            .filter(|pair| members.insert(pair.clone()))
            .collect();
        if added.is_empty() {
            return Ok(AdapterOutcome::AlreadyExists);
        }
        Ok(AdapterOutcome::reversible(
            format!("added {} subscriptions", added.len()),
            Undo::Delete(ResourceSpec::Memberships(added)),
        ))
    }

    async fn query(&self, _: &str, query: &Query) -> Result<Detail, AdapterError> {
        match query {
            Query::Membership { list, address } => Ok(Detail::Member(
                self.members()
                    .contains(&Membership::new(list.as_str(), address.as_str())),
            )),
            other => Err(AdapterError::Unsupported {
                backend: Backend::MailingList,
                capability: other.label(),
            }),
        }
    }
}

/// Coordinator over fakes that remember prior state
pub struct StatefulHarness {
    pub log: CallLog,
    pub directory: Arc<FakeAdapter>,
    pub storage: Arc<FakeAdapter>,
    pub job_limits: Arc<FakeJobLimits>,
    pub roster: Arc<FakeRoster>,
    pub guard: IdentityGuard,
    pub coordinator: Arc<Coordinator>,
}

impl StatefulHarness {
    pub fn new(limit: Option<u32>, members: &[(&str, &str)]) -> Self {
        let log: CallLog = Arc::default();
        let directory = FakeAdapter::new(Backend::Directory, log.clone());
        let storage = FakeAdapter::new(Backend::Storage, log.clone());
        let job_limits = FakeJobLimits::new(log.clone(), limit);
        let roster = FakeRoster::new(log.clone(), members);

        let registry = AdapterRegistry::new()
            .with(directory.clone())
            .with(storage.clone())
            .with(job_limits.clone())
            .with(roster.clone());
        let guard = IdentityGuard::new(AcquireMode::FailFast);
        let coordinator = Arc::new(Coordinator::new(
            registry,
            guard.clone(),
            Duration::from_secs(2),
            PlanDefaults {
                default_job_limit: 2,
            },
        ));

        Self {
            log,
            directory,
            storage,
            job_limits,
            roster,
            guard,
            coordinator,
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

/// Four fake backends behind one coordinator
pub struct Harness {
    pub log: CallLog,
    pub directory: Arc<FakeAdapter>,
    pub storage: Arc<FakeAdapter>,
    pub job_limits: Arc<FakeAdapter>,
    pub mailing_list: Arc<FakeAdapter>,
    pub guard: IdentityGuard,
    pub coordinator: Arc<Coordinator>,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(true, Duration::from_secs(2))
    }

    pub fn without_mailing_list() -> Self {
        Self::build(false, Duration::from_secs(2))
    }

    pub fn with_call_timeout(timeout: Duration) -> Self {
        Self::build(true, timeout)
    }

    fn build(mailing_list_enabled: bool, call_timeout: Duration) -> Self {
        let log: CallLog = Arc::default();
        let directory = FakeAdapter::new(Backend::Directory, log.clone());
        let storage = FakeAdapter::new(Backend::Storage, log.clone());
        let job_limits = FakeAdapter::new(Backend::JobLimits, log.clone());
        let mailing_list = FakeAdapter::new(Backend::MailingList, log.clone());

        let mut registry = AdapterRegistry::new()
            .with(directory.clone())
            .with(storage.clone())
            .with(job_limits.clone());
        if mailing_list_enabled {
            registry = registry.with(mailing_list.clone());
        }

        let guard = IdentityGuard::new(AcquireMode::FailFast);
        let coordinator = Arc::new(Coordinator::new(
            registry,
            guard.clone(),
            call_timeout,
            PlanDefaults {
                default_job_limit: 2,
            },
        ));

        Self {
            log,
            directory,
            storage,
            job_limits,
            mailing_list,
            guard,
            coordinator,
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) {
        self.log.lock().unwrap().clear();
    }

    /// Every fake reports the user as present
    pub fn provision_all(&self) {
        for adapter in [
            &self.directory,
            &self.storage,
            &self.job_limits,
            &self.mailing_list,
        ] {
            adapter.set_present(true);
        }
    }
}

pub fn unavailable(backend: Backend) -> AdapterError {
    AdapterError::unavailable(backend, "connection refused")
}

pub fn partial(backend: Backend) -> AdapterError {
    AdapterError::partial(
        backend,
        &rejected(backend),
        &AdapterError::unavailable(backend, "cleanup connection refused"),
    )
}

pub fn rejected(backend: Backend) -> AdapterError {
    AdapterError::Rejected {
        backend,
        status: 403,
        message: "forbidden".to_string(),
    }
}

pub fn create_request(username: &str, mailing_lists: &[&str]) -> CreateUserRequest {
    CreateUserRequest {
        username: username.to_string(),
        first_name: "Alice".to_string(),
        last_name: "Liddell".to_string(),
        email: format!("{username}@example.org"),
        user_uid: "10042".to_string(),
        password: "correct horse".to_string(),
        department: "Plant Sciences".to_string(),
        organization: "University of Arizona".to_string(),
        title: "Researcher".to_string(),
        groups: Vec::new(),
        mailing_lists: mailing_lists.iter().map(|s| s.to_string()).collect(),
        datastore_services: Vec::new(),
        job_limit: None,
    }
}

/// Batch-job system with scripted answers
pub struct ScriptedJobSystem {
    job_ids: Mutex<VecDeque<String>>,
    statuses: Mutex<HashMap<String, String>>,
    launch_failure: Mutex<Option<JobSystemError>>,
    launches: Mutex<Vec<(String, String)>>,
    resolutions: AtomicUsize,
}

impl ScriptedJobSystem {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            job_ids: Mutex::new(VecDeque::new()),
            statuses: Mutex::new(HashMap::new()),
            launch_failure: Mutex::new(None),
            launches: Mutex::new(Vec::new()),
            resolutions: AtomicUsize::new(0),
        })
    }

    /// Next id `launch` hands out; later launches get `J-<n>`
    pub fn next_job_id(&self, id: &str) {
        self.job_ids.lock().unwrap().push_back(id.to_string());
    }

    pub fn set_status(&self, job_id: &str, status: &str) {
        self.statuses
            .lock()
            .unwrap()
            .insert(job_id.to_string(), status.to_string());
    }

    pub fn fail_launch(&self, err: JobSystemError) {
        *self.launch_failure.lock().unwrap() = Some(err);
    }

    pub fn clear_launch_failure(&self) {
        *self.launch_failure.lock().unwrap() = None;
    }

    pub fn launches(&self) -> Vec<(String, String)> {
        self.launches.lock().unwrap().clone()
    }

    pub fn resolutions(&self) -> usize {
        self.resolutions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BatchJobSystem for ScriptedJobSystem {
    async fn resolve_template(&self, name: &str) -> Result<String, JobSystemError> {
        self.resolutions.fetch_add(1, Ordering::SeqCst);
        if name == "missing" {
            return Err(JobSystemError::TemplateNotFound(name.to_string()));
        }
        Ok(format!("tmpl-{name}"))
    }

    async fn launch(&self, template_id: &str, username: &str) -> Result<String, JobSystemError> {
        if let Some(err) = self.launch_failure.lock().unwrap().clone() {
            return Err(err);
        }

        let mut launches = self.launches.lock().unwrap();
        launches.push((template_id.to_string(), username.to_string()));
        let job_id = self
            .job_ids
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| format!("J-{}", launches.len()));

        self.statuses
            .lock()
            .unwrap()
            .insert(job_id.clone(), "Submitted".to_string());
        Ok(job_id)
    }

    async fn status(&self, job_id: &str) -> Result<String, JobSystemError> {
        self.statuses
            .lock()
            .unwrap()
            .get(job_id)
            .cloned()
            .ok_or_else(|| JobSystemError::Rejected {
                status: 404,
                message: format!("analysis {job_id} not found"),
            })
    }
}

pub fn formation_settings(app_id: Option<&str>, app_name: Option<&str>) -> FormationSettings {
    FormationSettings {
        url: "http://formation.test/".to_string(),
        keycloak_url: "http://keycloak.test".to_string(),
        realm: "cyverse".to_string(),
        client_id: "conductor".to_string(),
        client_secret: "s3cret".to_string(),
        deletion_app_id: app_id.map(str::to_string),
        deletion_app_name: app_name.map(str::to_string),
        ..FormationSettings::default()
    }
}
