//! HTTP handlers for the lifecycle API
//!
//! - Health: greeting and liveness
//! - Users: synchronous create/delete/validate and presence
//! - Jobs: asynchronous deletion submit, status and listing
//! - Manage: single-backend groups, memberships, job limits and passwords
pub mod health;
pub mod jobs;
pub mod manage;
pub mod users;

use crate::error::AppError;
use crate::jobs::JobTracker;
use crate::orchestration::Coordinator;
use actix_web::{web, HttpRequest};
use std::sync::Arc;
use std::time::Duration;

pub use health::{health, index};
pub use jobs::{job_status, list_jobs, submit_async_delete};
pub use manage::{
    add_group, add_list_member, change_password, datastore_user_exists, directory_user_exists,
    get_job_limit, list_groups, list_member_exists, register_datastore_service, remove_group,
    remove_list_member, set_job_limit,
};
pub use users::{create_user, delete_user, get_user, validate_user};

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
    pub tracker: Arc<JobTracker>,
    /// Budget for one synchronous run
    pub request_timeout: Duration,
}

fn json_error(err: actix_web::error::JsonPayloadError, _req: &HttpRequest) -> actix_web::Error {
    AppError::Validation(format!("invalid request body: {err}")).into()
}

/// Mount every route
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.app_data(web::JsonConfig::default().error_handler(json_error))
        .route("/", web::get().to(index))
        .route("/health", web::get().to(health))
        .service(
            web::scope("/users")
                .route("", web::post().to(create_user))
                .route("/", web::post().to(create_user))
                .route("/{username}", web::get().to(get_user))
                .route("/{username}", web::delete().to(delete_user))
                .route("/{username}/validate", web::post().to(validate_user))
                .route("/{username}/password", web::post().to(change_password)),
        )
        .service(
            web::scope("/ldap/users/{username}")
                .route("/exists", web::get().to(directory_user_exists))
                .route("/groups", web::get().to(list_groups))
                .route("/groups/{group}", web::post().to(add_group))
                .route("/groups/{group}", web::delete().to(remove_group)),
        )
        .service(
            web::scope("/mailinglists/{list}/members")
                .route("", web::post().to(add_list_member))
                .route("/{email}", web::delete().to(remove_list_member))
                .route("/{email}/exists", web::get().to(list_member_exists)),
        )
        .service(
            web::scope("/terrain/users/{username}")
                .route("/job-limits", web::get().to(get_job_limit))
                .route("/job-limits", web::post().to(set_job_limit)),
        )
        .service(
            web::scope("/datastore/users/{username}")
                .route("/exists", web::get().to(datastore_user_exists))
                .route("/services", web::post().to(register_datastore_service)),
        )
        .service(
            web::scope("/async")
                .route("/users/{username}", web::delete().to(submit_async_delete))
                .route("/status/{analysis_id}", web::get().to(job_status))
                .route("/jobs", web::get().to(list_jobs)),
        );
}
