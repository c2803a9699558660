//! Step sequencing with compensation
pub mod coordinator;
pub mod run;
pub mod step;

pub use coordinator::Coordinator;
pub use run::{OrchestrationRun, RunReport, RunStatus, StepOutcome, StepReport};
pub use step::{Capability, Compensation, PlanDefaults, SkipReason, Step, StepName, StepResult};
