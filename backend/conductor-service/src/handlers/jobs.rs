//! Asynchronous deletion handlers
use super::AppState;
use crate::error::Result;
use crate::models::{check_username, AsyncDeletionResponse};
use actix_web::{web, HttpResponse};

/// DELETE /async/users/{username}
pub async fn submit_async_delete(
    state: web::Data<AppState>,
    username: web::Path<String>,
) -> Result<HttpResponse> {
    check_username(&username)?;
    let job = state.tracker.submit(&username).await?;

    Ok(HttpResponse::Accepted().json(AsyncDeletionResponse {
        analysis_id: job.job_id,
        username: job.username,
        status: job.last_status.as_str().to_string(),
        submitted_at: job.submitted_at,
    }))
}

/// GET /async/status/{analysis_id}
pub async fn job_status(
    state: web::Data<AppState>,
    analysis_id: web::Path<String>,
) -> Result<HttpResponse> {
    let status = state.tracker.status(&analysis_id).await?;
    Ok(HttpResponse::Ok().json(status))
}

/// GET /async/jobs
pub async fn list_jobs(state: web::Data<AppState>) -> Result<HttpResponse> {
    Ok(HttpResponse::Ok().json(state.tracker.jobs()))
}
