//! User lifecycle handlers
//!
//! Each synchronous run is spawned onto its own task with a cancellation
//! token. If the request budget runs out, or the client goes away, the token
//! is cancelled: the in-flight step finishes, no new step starts, and the
//! task compensates on its own.
use super::AppState;
use crate::error::{AppError, Result};
use crate::models::{CreateUserRequest, DeleteUserRequest, LifecycleRequest};
use crate::orchestration::{RunReport, RunStatus};
use actix_web::{web, HttpResponse};
use resilience::with_timeout;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

/// POST /users/
pub async fn create_user(
    state: web::Data<AppState>,
    payload: web::Json<CreateUserRequest>,
) -> Result<HttpResponse> {
    let request = LifecycleRequest::create(payload.into_inner())?;
    let report = run_lifecycle(&state, request).await?;
    Ok(report_response(report))
}

/// DELETE /users/{username}
///
/// The body is optional; a body that is present must parse.
pub async fn delete_user(
    state: web::Data<AppState>,
    username: web::Path<String>,
    body: web::Bytes,
) -> Result<HttpResponse> {
    let body = delete_body(&body)?;
    let request = LifecycleRequest::delete_sync(&username, body)?;
    let report = run_lifecycle(&state, request).await?;
    Ok(report_response(report))
}

/// POST /users/{username}/validate
pub async fn validate_user(
    state: web::Data<AppState>,
    username: web::Path<String>,
) -> Result<HttpResponse> {
    let request = LifecycleRequest::validate_user(&username)?;
    let report = run_lifecycle(&state, request).await?;
    Ok(report_response(report))
}

/// GET /users/{username}
pub async fn get_user(
    state: web::Data<AppState>,
    username: web::Path<String>,
) -> Result<HttpResponse> {
    let summary = state.coordinator.presence(&username).await?;
    Ok(HttpResponse::Ok().json(summary))
}

fn delete_body(raw: &[u8]) -> Result<DeleteUserRequest> {
    if raw.iter().all(u8::is_ascii_whitespace) {
        return Ok(DeleteUserRequest::default());
    }
    serde_json::from_slice(raw)
        .map_err(|e| AppError::Validation(format!("invalid request body: {e}")))
}

pub(super) async fn run_lifecycle(state: &AppState, request: LifecycleRequest) -> Result<RunReport> {
    let cancel = CancellationToken::new();
    // cancels the run if this handler is dropped mid-flight
    let on_drop = cancel.clone().drop_guard();

    let coordinator = Arc::clone(&state.coordinator);
    let username = request.username().to_string();
    let run_cancel = cancel.clone();
    let mut handle = tokio::spawn(async move { coordinator.execute(request, run_cancel).await });

    let outcome = with_timeout(state.request_timeout, &mut handle).await;
    on_drop.disarm();

    match outcome {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => {
            error!(username = %username, error = %join_err, "Orchestration task failed");
            Err(AppError::Internal("orchestration task failed".to_string()))
        }
        Err(_) => {
            cancel.cancel();
            warn!(
                username = %username,
                timeout_secs = state.request_timeout.as_secs(),
                "Lifecycle request timed out, remaining steps cancelled"
            );
            Err(AppError::Timeout(format!(
                "lifecycle request for `{username}` exceeded {}s; the run was cancelled and compensates in the background",
                state.request_timeout.as_secs()
            )))
        }
    }
}

/// 200 when completed, 409 when rolled back, 500 when compensation failed
pub(super) fn report_response(report: RunReport) -> HttpResponse {
    match report.status {
        RunStatus::Completed => HttpResponse::Ok().json(report),
        RunStatus::RolledBack => HttpResponse::Conflict().json(report),
        _ => HttpResponse::InternalServerError().json(report),
    }
}
