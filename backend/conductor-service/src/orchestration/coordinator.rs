//! Orchestration coordinator
//!
//! Executes a request's fixed step plan strictly in order, stops at the first
//! failure and compensates every succeeded step in reverse order.
//!
//! # Guarantees
//!
//! - Mutating runs hold the identity guard from planning to the final status;
//!   the token is dropped on every exit path.
//! - A step is compensated only if it succeeded. Steps after the failure are
//!   never invoked.
//! - Compensation is attempted for every succeeded step even when an earlier
//!   compensation fails, and is never retried.
//! - A `Restore` compensation replays the undo the adapter returned with its
//!   change, so a step puts back what was there before it ran rather than a
//!   fixed default.
//! - A failed step whose adapter reports partial changes counts as
//!   unrecovered: the run ends `CompensationFailed`.
//! - Cancellation stops new steps from starting. The in-flight adapter call
//!   is allowed to finish; the run is then compensated like a failure.

use super::run::{CompensationOutcome, OrchestrationRun, RunReport, RunStatus};
use super::step::{
    self, Capability, Compensation, Invocation, PlanDefaults, SkipReason, Step, StepResult,
};
use crate::adapters::{
    AdapterError, AdapterOutcome, AdapterRegistry, Backend, Detail, Query, ServiceAdapter,
};
use crate::error::{AppError, ErrorKind};
use crate::models::{self, LifecycleRequest, Presence, PresenceSummary};
use identity_guard::IdentityGuard;
use resilience::{with_deadline, DeadlineError};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct Coordinator {
    registry: AdapterRegistry,
    guard: IdentityGuard,
    call_timeout: Duration,
    defaults: PlanDefaults,
}

impl Coordinator {
    pub fn new(
        registry: AdapterRegistry,
        guard: IdentityGuard,
        call_timeout: Duration,
        defaults: PlanDefaults,
    ) -> Self {
        Self {
            registry,
            guard,
            call_timeout,
            defaults,
        }
    }

    pub fn guard(&self) -> &IdentityGuard {
        &self.guard
    }

    /// Step plan for a request, without running it
    pub fn plan_for(&self, request: &LifecycleRequest) -> Result<Vec<Step>, AppError> {
        step::plan(request, &self.defaults)
    }

    /// Run a lifecycle request to a terminal status
    ///
    /// Returns `Err` only when the run never started (validation, guard
    /// conflict). Step and compensation failures are reported in the
    /// `RunReport`.
    pub async fn execute(
        &self,
        request: LifecycleRequest,
        cancel: CancellationToken,
    ) -> Result<RunReport, AppError> {
        let steps = self.plan_for(&request)?;
        let username = request.username().to_string();
        let operation = request.operation();

        let _token = if operation.is_mutating() {
            match self.guard.acquire(&username, operation.as_str()).await {
                Ok(token) => Some(token),
                Err(e) => {
                    warn!(
                        username = %username,
                        operation = %operation,
                        error = %e,
                        "Lifecycle request rejected by identity guard"
                    );
                    return Err(e.into());
                }
            }
        } else {
            None
        };

        let mut run = OrchestrationRun::new(request, steps);
        run.transition(RunStatus::Executing)?;
        info!(
            username = %username,
            operation = %operation,
            steps = run.steps().len(),
            "Orchestration run started"
        );

        let mut stopped_at = None;
        for index in 0..run.steps().len() {
            if cancel.is_cancelled() {
                warn!(
                    username = %username,
                    operation = %operation,
                    "Request cancelled, no further steps will start"
                );
                run.mark_cancelled();
                run.record(index, StepResult::Skipped(SkipReason::Cancelled));
                stopped_at = Some(index);
                break;
            }

            let result = self.run_step(&mut run, index, &username).await;
            let failed = result.is_failed();
            run.record(index, result);
            if failed {
                stopped_at = Some(index);
                break;
            }
        }

        match stopped_at {
            None => run.transition(RunStatus::Completed)?,
            Some(index) => {
                run.transition(RunStatus::Compensating)?;
                self.compensate(&mut run, index, &username).await;
                let terminal = if run.unrecovered().is_empty() {
                    RunStatus::RolledBack
                } else {
                    RunStatus::CompensationFailed
                };
                run.transition(terminal)?;
            }
        }

        let report = run.report();
        match report.status {
            RunStatus::CompensationFailed => error!(
                username = %username,
                operation = %operation,
                unrecovered = ?report.unrecovered,
                "Orchestration run left backends inconsistent, operator intervention required"
            ),
            status => info!(
                username = %username,
                operation = %operation,
                status = ?status,
                "Orchestration run finished"
            ),
        }
        Ok(report)
    }

    async fn run_step(
        &self,
        run: &mut OrchestrationRun,
        index: usize,
        username: &str,
    ) -> StepResult {
        let step = &run.steps()[index];
        let name = step.name;

        let Some(adapter) = self.registry.get(step.backend) else {
            debug!(
                username = %username,
                step = %name,
                backend = %step.backend,
                "Backend disabled, skipping step"
            );
            return StepResult::Skipped(SkipReason::BackendDisabled);
        };
        if step.action.is_empty() {
            debug!(username = %username, step = %name, "Nothing requested, skipping step");
            return StepResult::Skipped(SkipReason::NothingRequested);
        }

        info!(username = %username, step = %name, capability = step.action.label(), "Step started");
        let answer = with_deadline(
            self.call_timeout,
            step.action.invoke(adapter.as_ref(), username),
        )
        .await;

        let result = match answer {
            Ok(Invocation::Outcome(AdapterOutcome::Applied(change))) => {
                if let Some(undo) = change.undo {
                    run.record_undo(index, undo);
                }
                StepResult::Succeeded(change.detail)
            }
            Ok(Invocation::Outcome(_)) => StepResult::Skipped(SkipReason::AlreadyInState),
            Ok(Invocation::Presence(present)) => {
                run.set_exists(present);
                StepResult::Succeeded(if present { "present" } else { "absent" }.to_string())
            }
            Err(e) => {
                if let DeadlineError::Inner(partial @ AdapterError::PartiallyApplied { .. }) = &e {
                    run.record_compensation(index, CompensationOutcome::Failed(partial.to_string()));
                }
                let (kind, detail) = describe(e, self.call_timeout);
                StepResult::Failed { kind, detail }
            }
        };

        match &result {
            StepResult::Failed { kind, detail } => {
                warn!(username = %username, step = %name, kind = %kind, detail = %detail, "Step failed")
            }
            other => info!(username = %username, step = %name, result = ?other, "Step finished"),
        }
        result
    }

    /// Undo steps `0..failed_at` in reverse order
    async fn compensate(&self, run: &mut OrchestrationRun, failed_at: usize, username: &str) {
        for index in (0..failed_at).rev() {
            if !run.results()[index].is_succeeded() {
                continue;
            }

            let step = &run.steps()[index];
            let name = step.name;
            let outcome = match &step.compensation {
                Compensation::None => {
                    warn!(username = %username, step = %name, "Step is not reversible");
                    CompensationOutcome::NotReversible
                }
                Compensation::Invoke(capability) => {
                    self.invoke_compensation(step.backend, capability, username)
                        .await
                }
                Compensation::Restore => match run.undo(index) {
                    Some(undo) => {
                        let capability = Capability::from(undo.clone());
                        debug!(username = %username, step = %name, undo = ?capability, "Restoring prior state");
                        self.invoke_compensation(step.backend, &capability, username)
                            .await
                    }
                    None => CompensationOutcome::Failed("no prior state was recorded".to_string()),
                },
            };

            match &outcome {
                CompensationOutcome::Compensated => {
                    info!(username = %username, step = %name, "Step compensated")
                }
                CompensationOutcome::Failed(detail) => {
                    error!(username = %username, step = %name, detail = %detail, "Compensation failed")
                }
                CompensationOutcome::NotReversible => {}
            }
            run.record_compensation(index, outcome);
        }
    }

    async fn invoke_compensation(
        &self,
        backend: Backend,
        capability: &Capability,
        username: &str,
    ) -> CompensationOutcome {
        let Some(adapter) = self.registry.get(backend) else {
            return CompensationOutcome::Failed(format!("{backend} is no longer configured"));
        };

        let answer = with_deadline(self.call_timeout, capability.invoke(adapter.as_ref(), username));
        match answer.await {
            Ok(_) => CompensationOutcome::Compensated,
            Err(e) => CompensationOutcome::Failed(describe(e, self.call_timeout).1),
        }
    }

    /// One guarded adapter call outside any step plan
    ///
    /// `key` is the identity the guard serializes on; `subject` is what the
    /// adapter is called with (a username, or an address for list members).
    pub async fn adjust(
        &self,
        key: &str,
        backend: Backend,
        capability: Capability,
        subject: &str,
    ) -> Result<AdapterOutcome, AppError> {
        let adapter = self.enabled(backend)?;
        let _token = self.guard.acquire(key, capability.label()).await?;

        info!(subject = %subject, backend = %backend, capability = capability.label(), "Management call started");
        match with_deadline(self.call_timeout, capability.invoke(adapter.as_ref(), subject)).await {
            Ok(Invocation::Outcome(outcome)) => Ok(outcome),
            Ok(Invocation::Presence(_)) => Err(AppError::Internal(format!(
                "`{}` does not change state",
                capability.label()
            ))),
            Err(e) => {
                warn!(subject = %subject, backend = %backend, error = %e, "Management call failed");
                Err(call_error(e, self.call_timeout))
            }
        }
    }

    /// Read-only adapter question; no guard is taken
    pub async fn query(
        &self,
        backend: Backend,
        subject: &str,
        query: &Query,
    ) -> Result<Detail, AppError> {
        let adapter = self.enabled(backend)?;
        with_deadline(self.call_timeout, adapter.query(subject, query))
            .await
            .map_err(|e| call_error(e, self.call_timeout))
    }

    /// Existence on a single backend
    pub async fn exists_on(&self, backend: Backend, subject: &str) -> Result<bool, AppError> {
        let adapter = self.enabled(backend)?;
        with_deadline(self.call_timeout, adapter.exists(subject))
            .await
            .map_err(|e| call_error(e, self.call_timeout))
    }

    fn enabled(&self, backend: Backend) -> Result<Arc<dyn ServiceAdapter>, AppError> {
        self.registry
            .get(backend)
            .ok_or_else(|| AppError::UpstreamUnavailable(format!("{backend} is not configured")))
    }

    /// Presence of `username` on every configured backend that can tell
    pub async fn presence(&self, username: &str) -> Result<PresenceSummary, AppError> {
        models::check_username(username)?;

        let mut backends = BTreeMap::new();
        for backend in Backend::all() {
            let Some(adapter) = self.registry.get(backend) else {
                continue;
            };

            let presence = match with_deadline(self.call_timeout, adapter.exists(username)).await {
                Ok(true) => Presence::Present,
                Ok(false) => Presence::Absent,
                Err(DeadlineError::Inner(AdapterError::Unsupported { .. })) => continue,
                Err(e) => {
                    warn!(username = %username, backend = %backend, error = %e, "Presence check failed");
                    Presence::Unknown
                }
            };
            backends.insert(backend.as_str().to_string(), presence);
        }

        Ok(PresenceSummary {
            username: username.to_string(),
            backends,
        })
    }
}

/// HTTP error for a failed management call
fn call_error(err: DeadlineError<AdapterError>, timeout: Duration) -> AppError {
    match err {
        DeadlineError::Inner(AdapterError::Rejected { status: 404, message, .. }) => {
            AppError::NotFound(message)
        }
        DeadlineError::Inner(e @ AdapterError::Unsupported { .. }) => AppError::Internal(e.to_string()),
        other => match describe(other, timeout) {
            (ErrorKind::UpstreamUnavailable, detail) => AppError::UpstreamUnavailable(detail),
            (_, detail) => AppError::StepFailed(detail),
        },
    }
}

fn describe(err: DeadlineError<AdapterError>, timeout: Duration) -> (ErrorKind, String) {
    match err {
        DeadlineError::Elapsed(_) => (
            ErrorKind::UpstreamUnavailable,
            format!("call timed out after {}s", timeout.as_secs()),
        ),
        DeadlineError::Inner(e) => (e.kind(), e.to_string()),
    }
}
