//! # Identity Guard
//!
//! Per-username mutual exclusion for user lifecycle operations. At most one
//! mutating operation (create, delete, async delete) may be in flight for a
//! given username at any instant; a second request for the same username is
//! either rejected immediately or waits for a bounded period.
//!
//! ## Problem
//!
//! Lifecycle operations touch several independent backends in sequence:
//! - **Interleaving**: a create and a delete for the same user racing through
//!   the directory and storage backends leave the user half-provisioned
//! - **Duplicates**: a retried HTTP request starts a second run while the
//!   first is still compensating
//! - **Async deletions**: a remote deletion job keeps running long after the
//!   HTTP request that submitted it has returned
//!
//! ## Solution
//!
//! Keep an in-process table of held keys:
//! - **Atomic acquire**: insertion goes through a single map entry, so two
//!   concurrent acquirers can never both win
//! - **Scoped release**: acquiring returns a [`GuardToken`]; dropping it frees
//!   the key on every exit path, including errors, cancellation and panics
//! - **Bounded wait**: in [`AcquireMode::Wait`] a blocked caller is woken on
//!   each release and retries until its deadline passes
//!
//! ## Architecture
//!
//! ```text
//! HTTP handler → Coordinator → IdentityGuard::acquire(username)
//!                                    ↓
//!                               GuardToken ──(held for the run)──→ Drop → release
//!
//! Async delete → JobTracker → IdentityGuard::acquire(username)
//!                                    ↓
//!                               GuardToken ──(held until job is terminal)──→ Drop
//! ```
//!
//! ## Usage Example
//!
//! ```ignore
//! use identity_guard::{AcquireMode, IdentityGuard};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let guard = IdentityGuard::new(AcquireMode::FailFast);
//!
//! let token = guard.acquire("alice", "create").await?;
//! // ... run every step for alice ...
//! drop(token); // key is free again
//! # Ok(())
//! # }
//! ```
//!
//! ## Scope
//!
//! The table lives in process memory. Guarantees hold for one conductor
//! instance only; running several replicas against the same backends needs
//! an external lock, which this crate does not provide.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

mod error;

pub use error::{GuardError, GuardResult};

/// How `acquire` behaves when the key is already held
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AcquireMode {
    /// Return `Conflict` immediately
    #[default]
    FailFast,

    /// Wait up to the given duration for the holder to release
    Wait(Duration),
}

impl AcquireMode {
    /// Build a mode from a configured wait in milliseconds (0 = fail fast)
    pub fn from_wait_ms(wait_ms: u64) -> Self {
        if wait_ms == 0 {
            AcquireMode::FailFast
        } else {
            AcquireMode::Wait(Duration::from_millis(wait_ms))
        }
    }
}

/// Who currently holds a key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Holder {
    /// Operation label, e.g. `create` or `async_delete`
    pub operation: String,

    /// When the key was acquired
    pub acquired_at: DateTime<Utc>,
}

struct Inner {
    held: DashMap<String, Holder>,
    released: Notify,
    mode: AcquireMode,
}

/// Per-key exclusion table
///
/// Cheap to clone; clones share the same table.
#[derive(Clone)]
pub struct IdentityGuard {
    inner: Arc<Inner>,
}

impl IdentityGuard {
    /// Create a guard with the given contention behavior
    pub fn new(mode: AcquireMode) -> Self {
        Self {
            inner: Arc::new(Inner {
                held: DashMap::new(),
                released: Notify::new(),
                mode,
            }),
        }
    }

    /// Configured contention behavior
    pub fn mode(&self) -> AcquireMode {
        self.inner.mode
    }

    /// Acquire `key` for `operation` using the configured mode
    ///
    /// # Returns
    ///
    /// - `Ok(GuardToken)` if the key was free (or freed within the wait)
    /// - `Err(GuardError::Conflict)` naming the current holder otherwise
    pub async fn acquire(&self, key: &str, operation: &str) -> GuardResult<GuardToken> {
        match self.inner.mode {
            AcquireMode::FailFast => self.try_acquire(key, operation),
            AcquireMode::Wait(max) => self.acquire_within(key, operation, max).await,
        }
    }

    /// Single non-blocking attempt
    pub fn try_acquire(&self, key: &str, operation: &str) -> GuardResult<GuardToken> {
        Self::validate_key(key)?;

        match self.inner.held.entry(key.to_string()) {
            Entry::Occupied(entry) => {
                let holder = entry.get().clone();
                debug!(
                    key = %key,
                    operation = %operation,
                    holder = %holder.operation,
                    "Guard key already held"
                );
                Err(GuardError::Conflict {
                    key: key.to_string(),
                    holder,
                })
            }
            Entry::Vacant(entry) => {
                entry.insert(Holder {
                    operation: operation.to_string(),
                    acquired_at: Utc::now(),
                });
                debug!(key = %key, operation = %operation, "Guard key acquired");
                Ok(GuardToken {
                    key: key.to_string(),
                    inner: Arc::clone(&self.inner),
                })
            }
        }
    }

    /// Retry on each release until `max` has elapsed
    pub async fn acquire_within(
        &self,
        key: &str,
        operation: &str,
        max: Duration,
    ) -> GuardResult<GuardToken> {
        let deadline = Instant::now() + max;

        loop {
            // Register for the wakeup before checking, so a release between
            // the check and the await is not missed.
            let released = self.inner.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            match self.try_acquire(key, operation) {
                Ok(token) => return Ok(token),
                Err(GuardError::Conflict { key, holder }) => {
                    if tokio::time::timeout_at(deadline, released).await.is_err() {
                        warn!(
                            key = %key,
                            operation = %operation,
                            holder = %holder.operation,
                            waited_ms = max.as_millis() as u64,
                            "Gave up waiting for guard key"
                        );
                        return Err(GuardError::Conflict { key, holder });
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Check whether `key` is currently held
    pub fn is_held(&self, key: &str) -> bool {
        self.inner.held.contains_key(key)
    }

    /// Current holder of `key`, if any
    pub fn holder(&self, key: &str) -> Option<Holder> {
        self.inner.held.get(key).map(|h| h.value().clone())
    }

    /// Number of keys currently held
    pub fn held_count(&self) -> usize {
        self.inner.held.len()
    }

    fn validate_key(key: &str) -> GuardResult<()> {
        if key.trim().is_empty() {
            return Err(GuardError::InvalidKey(key.to_string()));
        }
        Ok(())
    }
}

impl Default for IdentityGuard {
    fn default() -> Self {
        Self::new(AcquireMode::default())
    }
}

impl std::fmt::Debug for IdentityGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityGuard")
            .field("mode", &self.inner.mode)
            .field("held", &self.inner.held.len())
            .finish()
    }
}

/// Proof of holding a key; the key is released when this is dropped
#[must_use = "the key is released as soon as the token is dropped"]
pub struct GuardToken {
    key: String,
    inner: Arc<Inner>,
}

impl GuardToken {
    /// Key this token holds
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Release explicitly (same as dropping)
    pub fn release(self) {}
}

impl std::fmt::Debug for GuardToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardToken").field("key", &self.key).finish()
    }
}

impl Drop for GuardToken {
    fn drop(&mut self) {
        self.inner.held.remove(&self.key);
        self.inner.released.notify_waiters();
        debug!(key = %self.key, "Guard key released");
    }
}
