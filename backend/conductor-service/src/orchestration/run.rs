//! Orchestration run state and its report
//!
//! ```text
//! Pending -> Executing -> Completed
//!                      -> Compensating -> RolledBack
//!                                      -> CompensationFailed
//! ```
use super::step::{SkipReason, Step, StepResult};
use crate::adapters::Undo;
use crate::error::{AppError, ErrorKind};
use crate::models::{LifecycleRequest, Operation};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Executing,
    Compensating,
    Completed,
    RolledBack,
    CompensationFailed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::RolledBack | RunStatus::CompensationFailed
        )
    }

    fn can_transition_to(&self, next: RunStatus) -> bool {
        use RunStatus::*;
        matches!(
            (*self, next),
            (Pending, Executing)
                | (Executing, Completed)
                | (Executing, Compensating)
                | (Compensating, RolledBack)
                | (Compensating, CompensationFailed)
        )
    }
}

/// Outcome of compensating one succeeded step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompensationOutcome {
    Compensated,
    Failed(String),
    NotReversible,
}

/// A single run, owned by the coordinator for its whole duration
#[derive(Debug)]
pub struct OrchestrationRun {
    request: LifecycleRequest,
    steps: Vec<Step>,
    results: Vec<StepResult>,
    compensations: Vec<Option<CompensationOutcome>>,
    /// Prior-state snapshots handed back by adapters, per step
    undos: Vec<Option<Undo>>,
    status: RunStatus,
    cancelled: bool,
    exists: Option<bool>,
}

impl OrchestrationRun {
    pub fn new(request: LifecycleRequest, steps: Vec<Step>) -> Self {
        let n = steps.len();
        Self {
            request,
            steps,
            results: vec![StepResult::Skipped(SkipReason::NotReached); n],
            compensations: vec![None; n],
            undos: vec![None; n],
            status: RunStatus::Pending,
            cancelled: false,
            exists: None,
        }
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn results(&self) -> &[StepResult] {
        &self.results
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn transition(&mut self, next: RunStatus) -> Result<(), AppError> {
        if !self.status.can_transition_to(next) {
            return Err(AppError::Internal(format!(
                "invalid run transition {:?} -> {:?}",
                self.status, next
            )));
        }
        self.status = next;
        Ok(())
    }

    pub fn record(&mut self, index: usize, result: StepResult) {
        if let Some(slot) = self.results.get_mut(index) {
            *slot = result;
        }
    }

    pub fn record_compensation(&mut self, index: usize, outcome: CompensationOutcome) {
        if let Some(slot) = self.compensations.get_mut(index) {
            *slot = Some(outcome);
        }
    }

    pub fn record_undo(&mut self, index: usize, undo: Undo) {
        if let Some(slot) = self.undos.get_mut(index) {
            *slot = Some(undo);
        }
    }

    pub fn undo(&self, index: usize) -> Option<&Undo> {
        self.undos.get(index).and_then(Option::as_ref)
    }

    pub fn mark_cancelled(&mut self) {
        self.cancelled = true;
    }

    pub fn set_exists(&mut self, exists: bool) {
        self.exists = Some(exists);
    }

    /// Steps whose effect is still in place after compensation, including a
    /// failed step that left part of its change behind
    pub fn unrecovered(&self) -> Vec<String> {
        self.steps
            .iter()
            .zip(&self.compensations)
            .filter(|(_, c)| {
                matches!(
                    c,
                    Some(CompensationOutcome::Failed(_)) | Some(CompensationOutcome::NotReversible)
                )
            })
            .map(|(s, _)| s.name.as_str().to_string())
            .collect()
    }

    pub fn report(&self) -> RunReport {
        let steps: Vec<StepReport> = self
            .steps
            .iter()
            .zip(self.results.iter().zip(&self.compensations))
            .map(|(step, (result, compensation))| StepReport::new(step, result, compensation.as_ref()))
            .collect();

        let failed = self
            .steps
            .iter()
            .zip(&self.results)
            .find_map(|(step, result)| match result {
                StepResult::Failed { kind, .. } => Some((step.name.as_str().to_string(), *kind)),
                _ => None,
            });

        let error_kind = match (self.status, &failed) {
            (RunStatus::CompensationFailed, _) => Some(ErrorKind::CompensationFailed),
            (_, Some((_, kind))) => Some(*kind),
            _ => None,
        };

        RunReport {
            username: self.request.username().to_string(),
            operation: self.request.operation(),
            status: self.status,
            failed_step: failed.map(|(name, _)| name),
            error_kind,
            cancelled: self.cancelled,
            steps,
            unrecovered: self.unrecovered(),
            exists: self.exists,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Succeeded,
    Compensated,
    CompensationFailed,
    NotReversible,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepReport {
    pub step: String,
    pub outcome: StepOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl StepReport {
    fn new(step: &Step, result: &StepResult, compensation: Option<&CompensationOutcome>) -> Self {
        let (outcome, detail, error_kind) = match (result, compensation) {
            (StepResult::Succeeded(_), Some(CompensationOutcome::Compensated)) => {
                (StepOutcome::Compensated, None, None)
            }
            (StepResult::Succeeded(_), Some(CompensationOutcome::Failed(detail))) => (
                StepOutcome::CompensationFailed,
                Some(detail.clone()),
                Some(ErrorKind::CompensationFailed),
            ),
            (StepResult::Succeeded(_), Some(CompensationOutcome::NotReversible)) => (
                StepOutcome::NotReversible,
                Some("step cannot be undone".to_string()),
                Some(ErrorKind::CompensationFailed),
            ),
            (StepResult::Succeeded(detail), None) => {
                (StepOutcome::Succeeded, Some(detail.clone()), None)
            }
            (StepResult::Failed { kind, detail }, _) => {
                (StepOutcome::Failed, Some(detail.clone()), Some(*kind))
            }
            (StepResult::Skipped(reason), _) => {
                (StepOutcome::Skipped, Some(reason.as_str().to_string()), None)
            }
        };

        Self {
            step: step.name.as_str().to_string(),
            outcome,
            detail,
            error_kind,
        }
    }
}

/// Per-step account of a finished run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub username: String,
    pub operation: Operation,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default)]
    pub cancelled: bool,
    pub steps: Vec<StepReport>,
    /// Steps left applied; operator intervention needed
    #[serde(default)]
    pub unrecovered: Vec<String>,
    /// Presence answer of a validate run
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exists: Option<bool>,
}

impl RunReport {
    pub fn outcome_of(&self, step: &str) -> Option<StepOutcome> {
        self.steps.iter().find(|s| s.step == step).map(|s| s.outcome)
    }
}
