//! Conductor Service Library
//!
//! Coordinates a user's lifecycle across the directory, data store, job-limit
//! and mailing-list backends, and hands long-running deletions to the
//! batch-job system.
//!
//! # Modules
//!
//! - `adapters`: one capability interface per backend
//! - `orchestration`: step plans, runs and the compensating coordinator
//! - `jobs`: async deletion through the batch-job system
//! - `handlers`: HTTP surface
pub mod adapters;
pub mod config;
pub mod error;
pub mod handlers;
pub mod jobs;
pub mod models;
pub mod orchestration;
pub mod validators;

pub use config::Settings;
pub use error::{AppError, ErrorKind, Result};
