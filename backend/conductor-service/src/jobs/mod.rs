//! Asynchronous deletion through the batch-job system
pub mod formation;
pub mod tracker;

pub use formation::{BatchJobSystem, FormationClient, JobSystemError};
pub use tracker::{map_remote_state, DeletionJob, JobState, JobTracker, TrackerError};
