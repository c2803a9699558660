//! Service adapters
//!
//! Each backend is reached only through [`ServiceAdapter`]. The coordinator is
//! written against the trait and never sees a concrete backend.
//!
//! Adapters report idempotent no-ops explicitly: creating something that is
//! already there returns [`AdapterOutcome::AlreadyExists`], deleting something
//! that is gone returns [`AdapterOutcome::AlreadyAbsent`]. Errors are reserved
//! for real failures.
//!
//! When a change overwrites state that existed before the call (a job-limit
//! override, a set of list memberships), the adapter reads that state first
//! and hands back an [`Undo`] that restores it.

pub mod datastore;
pub mod directory;
pub mod http;
pub mod job_limits;
pub mod mailing_list;

use crate::config::Settings;
use crate::error::ErrorKind;
use crate::models::DatastoreService;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

pub use datastore::DatastoreAdapter;
pub use directory::DirectoryAdapter;
pub use job_limits::JobLimitsAdapter;
pub use mailing_list::MailingListAdapter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    Directory,
    Storage,
    JobLimits,
    MailingList,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Directory => "directory",
            Backend::Storage => "storage",
            Backend::JobLimits => "job_limits",
            Backend::MailingList => "mailing_list",
        }
    }

    pub fn all() -> [Backend; 4] {
        [
            Backend::Directory,
            Backend::Storage,
            Backend::JobLimits,
            Backend::MailingList,
        ]
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Password that never shows up in `Debug` output
#[derive(Clone, PartialEq, Eq)]
pub struct Password(String);

impl Password {
    pub fn new(password: impl Into<String>) -> Self {
        Password(password.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Password(***)")
    }
}

/// Directory account attributes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountSpec {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub uid_number: u32,
    pub password: Password,
    pub department: String,
    pub organization: String,
    pub title: String,
    /// Extra groups on top of the configured defaults
    pub groups: Vec<String>,
}

/// One address on one mailing list
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Membership {
    pub list: String,
    pub address: String,
}

impl Membership {
    pub fn new(list: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            list: list.into(),
            address: address.into(),
        }
    }
}

/// What a capability call should create, remove or register
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceSpec {
    /// The identity alone, no extra attributes
    Identity,
    Account(AccountSpec),
    Storage {
        password: Password,
        services: Vec<DatastoreService>,
    },
    /// New password for an existing account
    Password(Password),
    /// Directory groups to join or leave
    Groups(Vec<String>),
    /// Data store service paths
    Services(Vec<DatastoreService>),
    JobLimit {
        concurrent_jobs: u32,
    },
    /// Every address paired with every list
    Subscriptions {
        addresses: Vec<String>,
        lists: Vec<String>,
    },
    /// Exact list/address pairs
    Memberships(Vec<Membership>),
}

impl ResourceSpec {
    pub fn name(&self) -> &'static str {
        match self {
            ResourceSpec::Identity => "identity",
            ResourceSpec::Account(_) => "account",
            ResourceSpec::Storage { .. } => "storage",
            ResourceSpec::Password(_) => "password",
            ResourceSpec::Groups(_) => "groups",
            ResourceSpec::Services(_) => "services",
            ResourceSpec::JobLimit { .. } => "job_limit",
            ResourceSpec::Subscriptions { .. } => "subscriptions",
            ResourceSpec::Memberships(_) => "memberships",
        }
    }

    /// Nothing to apply (an empty subscription, group or service set)
    pub fn is_empty(&self) -> bool {
        match self {
            ResourceSpec::Subscriptions { addresses, lists } => {
                addresses.is_empty() || lists.is_empty()
            }
            ResourceSpec::Memberships(pairs) => pairs.is_empty(),
            ResourceSpec::Groups(groups) => groups.is_empty(),
            ResourceSpec::Services(services) => services.is_empty(),
            _ => false,
        }
    }

    /// List/address pairs named by a subscription spec, list-major
    pub fn memberships(&self) -> Option<Vec<Membership>> {
        match self {
            ResourceSpec::Subscriptions { addresses, lists } => Some(
                lists
                    .iter()
                    .flat_map(|list| addresses.iter().map(move |a| Membership::new(list, a)))
                    .collect(),
            ),
            ResourceSpec::Memberships(pairs) => Some(pairs.clone()),
            _ => None,
        }
    }
}

/// Capability call that puts a backend back the way it was
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Undo {
    Create(ResourceSpec),
    Delete(ResourceSpec),
    Register(ResourceSpec),
}

/// A state change made by an adapter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub detail: String,
    /// Restores the state read before the change, when the adapter took one
    pub undo: Option<Undo>,
}

/// Successful answer of a capability call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterOutcome {
    /// The backend changed state
    Applied(Change),
    /// Create/register found the desired state already in place
    AlreadyExists,
    /// Delete found nothing to remove
    AlreadyAbsent,
}

impl AdapterOutcome {
    pub fn applied(detail: impl Into<String>) -> Self {
        AdapterOutcome::Applied(Change {
            detail: detail.into(),
            undo: None,
        })
    }

    /// A change together with the call that reverts it
    pub fn reversible(detail: impl Into<String>, undo: Undo) -> Self {
        AdapterOutcome::Applied(Change {
            detail: detail.into(),
            undo: Some(undo),
        })
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, AdapterOutcome::Applied(_))
    }
}

/// Read-only questions beyond `exists`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    Groups,
    JobLimit,
    Membership { list: String, address: String },
}

impl Query {
    pub fn label(&self) -> &'static str {
        match self {
            Query::Groups => "groups",
            Query::JobLimit => "job_limit",
            Query::Membership { .. } => "membership",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Detail {
    Groups(Vec<String>),
    /// `None` when the user has no override
    JobLimit(Option<u32>),
    Member(bool),
}

#[derive(Debug, Clone, Error)]
pub enum AdapterError {
    /// Network failure, timeout or 5xx
    #[error("{backend} unavailable: {message}")]
    Unavailable { backend: Backend, message: String },

    /// Definite refusal (4xx or a directory result code)
    #[error("{backend} rejected request ({status}): {message}")]
    Rejected {
        backend: Backend,
        status: u16,
        message: String,
    },

    #[error("{backend} does not support {capability}")]
    Unsupported {
        backend: Backend,
        capability: &'static str,
    },

    /// Answer that could not be understood
    #[error("{backend} returned an unexpected response: {message}")]
    Protocol { backend: Backend, message: String },

    /// The call failed after changing state, and the adapter could not
    /// remove what it had already done
    #[error("{backend} left partial changes in place: {message}")]
    PartiallyApplied { backend: Backend, message: String },
}

impl AdapterError {
    pub fn unavailable(backend: Backend, message: impl Into<String>) -> Self {
        AdapterError::Unavailable {
            backend,
            message: message.into(),
        }
    }

    pub fn protocol(backend: Backend, message: impl Into<String>) -> Self {
        AdapterError::Protocol {
            backend,
            message: message.into(),
        }
    }

    pub fn mismatched_spec(backend: Backend, capability: &str, spec: &ResourceSpec) -> Self {
        AdapterError::Protocol {
            backend,
            message: format!("{capability} called with mismatched resource spec `{}`", spec.name()),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            AdapterError::Unavailable { .. } => ErrorKind::UpstreamUnavailable,
            _ => ErrorKind::StepFailed,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, AdapterError::Unavailable { .. })
    }

    /// Whether the backend may be left with a partial change
    pub fn is_partial(&self) -> bool {
        matches!(self, AdapterError::PartiallyApplied { .. })
    }

    /// Wrap a failure whose own cleanup also failed
    pub fn partial(backend: Backend, cause: &AdapterError, cleanup: &AdapterError) -> Self {
        AdapterError::PartiallyApplied {
            backend,
            message: format!("{cause}; cleanup failed: {cleanup}"),
        }
    }
}

/// Capability set every backend exposes
#[async_trait]
pub trait ServiceAdapter: Send + Sync {
    fn backend(&self) -> Backend;

    async fn exists(&self, _username: &str) -> Result<bool, AdapterError> {
        Err(AdapterError::Unsupported {
            backend: self.backend(),
            capability: "exists",
        })
    }

    async fn create(&self, username: &str, spec: &ResourceSpec)
        -> Result<AdapterOutcome, AdapterError>;

    async fn delete(&self, username: &str, spec: &ResourceSpec)
        -> Result<AdapterOutcome, AdapterError>;

    async fn register(
        &self,
        _username: &str,
        _spec: &ResourceSpec,
    ) -> Result<AdapterOutcome, AdapterError> {
        Err(AdapterError::Unsupported {
            backend: self.backend(),
            capability: "register",
        })
    }

    async fn query(&self, _username: &str, query: &Query) -> Result<Detail, AdapterError> {
        Err(AdapterError::Unsupported {
            backend: self.backend(),
            capability: query.label(),
        })
    }
}

/// Configured adapters; a missing backend is treated as disabled
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<Backend, Arc<dyn ServiceAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, adapter: Arc<dyn ServiceAdapter>) -> Self {
        self.adapters.insert(adapter.backend(), adapter);
        self
    }

    pub fn get(&self, backend: Backend) -> Option<Arc<dyn ServiceAdapter>> {
        self.adapters.get(&backend).cloned()
    }

    pub fn is_enabled(&self, backend: Backend) -> bool {
        self.adapters.contains_key(&backend)
    }

    /// Build the production adapters from validated settings
    pub fn from_settings(settings: &Settings) -> Result<Self, AdapterError> {
        let timeout = settings.adapters.call_timeout();

        let mut registry = Self::new()
            .with(Arc::new(DirectoryAdapter::new(
                settings.directory.clone(),
                timeout,
            )))
            .with(Arc::new(DatastoreAdapter::new(
                settings.datastore.clone(),
                timeout,
            )?))
            .with(Arc::new(JobLimitsAdapter::new(
                settings.terrain.clone(),
                timeout,
            )?));

        if settings.mailman.enabled {
            registry = registry.with(Arc::new(MailingListAdapter::new(
                settings.mailman.clone(),
                timeout,
            )?));
        }

        Ok(registry)
    }
}

impl fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut enabled: Vec<_> = self.adapters.keys().collect();
        enabled.sort();
        f.debug_struct("AdapterRegistry")
            .field("enabled", &enabled)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ReadOnly;

    #[async_trait]
    impl ServiceAdapter for ReadOnly {
        fn backend(&self) -> Backend {
            Backend::Storage
        }

        async fn create(&self, _: &str, _: &ResourceSpec) -> Result<AdapterOutcome, AdapterError> {
            Ok(AdapterOutcome::AlreadyExists)
        }

        async fn delete(&self, _: &str, _: &ResourceSpec) -> Result<AdapterOutcome, AdapterError> {
            Ok(AdapterOutcome::AlreadyAbsent)
        }
    }

    #[tokio::test]
    async fn test_default_capabilities_are_unsupported() {
        let adapter = ReadOnly;
        let err = adapter.exists("alice").await.unwrap_err();
        assert!(matches!(
            err,
            AdapterError::Unsupported { capability: "exists", .. }
        ));
        assert_eq!(err.kind(), ErrorKind::StepFailed);

        let err = adapter
            .register("alice", &ResourceSpec::Identity)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AdapterError::Unsupported { capability: "register", .. }
        ));
    }

    #[test]
    fn test_registry_missing_backend_is_disabled() {
        let registry = AdapterRegistry::new().with(Arc::new(ReadOnly));
        assert!(registry.is_enabled(Backend::Storage));
        assert!(!registry.is_enabled(Backend::MailingList));
        assert!(registry.get(Backend::Directory).is_none());
    }

    #[test]
    fn test_empty_subscriptions() {
        let spec = ResourceSpec::Subscriptions {
            addresses: vec!["a@example.org".into()],
            lists: vec![],
        };
        assert!(spec.is_empty());
        assert!(!ResourceSpec::JobLimit { concurrent_jobs: 2 }.is_empty());
    }

    #[test]
    fn test_subscriptions_expand_list_major() {
        let spec = ResourceSpec::Subscriptions {
            addresses: vec!["a@example.org".into(), "b@example.org".into()],
            lists: vec!["l1".into(), "l2".into()],
        };
        assert_eq!(
            spec.memberships().unwrap(),
            vec![
                Membership::new("l1", "a@example.org"),
                Membership::new("l1", "b@example.org"),
                Membership::new("l2", "a@example.org"),
                Membership::new("l2", "b@example.org"),
            ]
        );
        assert!(ResourceSpec::Memberships(vec![]).is_empty());
        assert!(ResourceSpec::Identity.memberships().is_none());
    }

    #[test]
    fn test_partial_failure_is_not_transient() {
        let cause = AdapterError::unavailable(Backend::Directory, "connection reset");
        let cleanup = AdapterError::unavailable(Backend::Directory, "connection refused");
        let err = AdapterError::partial(Backend::Directory, &cause, &cleanup);
        assert!(err.is_partial());
        assert!(!err.is_transient());
        assert_eq!(err.kind(), ErrorKind::StepFailed);
        assert!(err.to_string().contains("cleanup failed"));
    }

    #[test]
    fn test_password_redacted_in_debug() {
        let spec = ResourceSpec::Storage {
            password: Password::new("hunter2"),
            services: vec![],
        };
        let printed = format!("{spec:?}");
        assert!(!printed.contains("hunter2"));
        assert!(printed.contains("***"));
    }

    #[test]
    fn test_unavailable_maps_to_upstream_kind() {
        let err = AdapterError::unavailable(Backend::Directory, "connection refused");
        assert_eq!(err.kind(), ErrorKind::UpstreamUnavailable);
        assert!(err.is_transient());
        assert_eq!(err.to_string(), "directory unavailable: connection refused");
    }
}
