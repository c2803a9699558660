//! Single-backend management handlers
//!
//! One adapter call per request, under the identity guard for the subject
//! being changed. Reads skip the guard.
use super::users::{report_response, run_lifecycle};
use super::AppState;
use crate::adapters::{Backend, Detail, Membership, Query, ResourceSpec};
use crate::error::{AppError, Result};
use crate::models::{
    check_username, DatastoreService, ExistsResponse, GenericResponse, GroupsResponse,
    JobLimitRequest, JobLimitResponse, LifecycleRequest, MemberRequest, PasswordChangeRequest,
};
use crate::orchestration::Capability;
use actix_web::{web, HttpResponse};
use validator::Validate;

fn unexpected(detail: Detail) -> AppError {
    AppError::Internal(format!("unexpected adapter answer: {detail:?}"))
}

fn check_name(kind: &str, name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(AppError::Validation(format!("{kind} must not be empty")));
    }
    Ok(())
}

/// GET /ldap/users/{username}/groups
pub async fn list_groups(
    state: web::Data<AppState>,
    username: web::Path<String>,
) -> Result<HttpResponse> {
    check_username(&username)?;
    let groups = match state
        .coordinator
        .query(Backend::Directory, &username, &Query::Groups)
        .await?
    {
        Detail::Groups(groups) => groups,
        other => return Err(unexpected(other)),
    };

    Ok(HttpResponse::Ok().json(GroupsResponse {
        username: username.into_inner(),
        groups,
    }))
}

/// POST /ldap/users/{username}/groups/{group}
pub async fn add_group(
    state: web::Data<AppState>,
    path: web::Path<(String, String)>,
) -> Result<HttpResponse> {
    let (username, group) = path.into_inner();
    change_group(&state, &username, group, true).await
}

/// DELETE /ldap/users/{username}/groups/{group}
pub async fn remove_group(
    state: web::Data<AppState>,
    path: web::Path<(String, String)>,
) -> Result<HttpResponse> {
    let (username, group) = path.into_inner();
    change_group(&state, &username, group, false).await
}

async fn change_group(
    state: &AppState,
    username: &str,
    group: String,
    join: bool,
) -> Result<HttpResponse> {
    check_username(username)?;
    check_name("group", &group)?;

    let spec = ResourceSpec::Groups(vec![group.clone()]);
    let capability = if join {
        Capability::Register(spec)
    } else {
        Capability::Delete(spec)
    };
    let outcome = state
        .coordinator
        .adjust(username, Backend::Directory, capability, username)
        .await?;

    let message = match (join, outcome.is_applied()) {
        (true, true) => format!("added `{username}` to `{group}`"),
        (true, false) => format!("`{username}` already in `{group}`"),
        (false, true) => format!("removed `{username}` from `{group}`"),
        (false, false) => format!("`{username}` not in `{group}`"),
    };
    Ok(HttpResponse::Ok().json(GenericResponse::ok(message)))
}

/// GET /ldap/users/{username}/exists
pub async fn directory_user_exists(
    state: web::Data<AppState>,
    username: web::Path<String>,
) -> Result<HttpResponse> {
    exists_response(&state, Backend::Directory, username.into_inner()).await
}

/// GET /datastore/users/{username}/exists
pub async fn datastore_user_exists(
    state: web::Data<AppState>,
    username: web::Path<String>,
) -> Result<HttpResponse> {
    exists_response(&state, Backend::Storage, username.into_inner()).await
}

async fn exists_response(state: &AppState, backend: Backend, username: String) -> Result<HttpResponse> {
    check_username(&username)?;
    let exists = state.coordinator.exists_on(backend, &username).await?;
    Ok(HttpResponse::Ok().json(ExistsResponse {
        subject: username,
        exists,
    }))
}

/// POST /datastore/users/{username}/services
pub async fn register_datastore_service(
    state: web::Data<AppState>,
    username: web::Path<String>,
    payload: web::Json<DatastoreService>,
) -> Result<HttpResponse> {
    check_username(&username)?;
    let service = payload.into_inner();
    service.validate()?;

    let path = service.irods_path.clone();
    state
        .coordinator
        .adjust(
            &username,
            Backend::Storage,
            Capability::Register(ResourceSpec::Services(vec![service])),
            &username,
        )
        .await?;

    Ok(HttpResponse::Ok().json(GenericResponse::ok(format!(
        "registered `{username}` for `{path}`"
    ))))
}

/// POST /mailinglists/{list}/members
pub async fn add_list_member(
    state: web::Data<AppState>,
    list: web::Path<String>,
    payload: web::Json<MemberRequest>,
) -> Result<HttpResponse> {
    let member = payload.into_inner();
    member.validate()?;
    change_member(&state, list.into_inner(), member.email, true).await
}

/// DELETE /mailinglists/{list}/members/{email}
pub async fn remove_list_member(
    state: web::Data<AppState>,
    path: web::Path<(String, String)>,
) -> Result<HttpResponse> {
    let (list, email) = path.into_inner();
    check_name("email", &email)?;
    change_member(&state, list, email, false).await
}

async fn change_member(
    state: &AppState,
    list: String,
    email: String,
    subscribe: bool,
) -> Result<HttpResponse> {
    check_name("mailing list", &list)?;

    let spec = ResourceSpec::Memberships(vec![Membership::new(list.clone(), email.clone())]);
    let capability = if subscribe {
        Capability::Register(spec)
    } else {
        Capability::Delete(spec)
    };
    let outcome = state
        .coordinator
        .adjust(&email, Backend::MailingList, capability, &email)
        .await?;

    let message = match (subscribe, outcome.is_applied()) {
        (true, true) => format!("subscribed `{email}` to `{list}`"),
        (true, false) => format!("`{email}` already on `{list}`"),
        (false, true) => format!("unsubscribed `{email}` from `{list}`"),
        (false, false) => format!("`{email}` not on `{list}`"),
    };
    Ok(HttpResponse::Ok().json(GenericResponse::ok(message)))
}

/// GET /mailinglists/{list}/members/{email}/exists
pub async fn list_member_exists(
    state: web::Data<AppState>,
    path: web::Path<(String, String)>,
) -> Result<HttpResponse> {
    let (list, email) = path.into_inner();
    check_name("mailing list", &list)?;
    check_name("email", &email)?;

    let query = Query::Membership {
        list,
        address: email.clone(),
    };
    let exists = match state
        .coordinator
        .query(Backend::MailingList, &email, &query)
        .await?
    {
        Detail::Member(member) => member,
        other => return Err(unexpected(other)),
    };

    Ok(HttpResponse::Ok().json(ExistsResponse {
        subject: email,
        exists,
    }))
}

/// GET /terrain/users/{username}/job-limits
pub async fn get_job_limit(
    state: web::Data<AppState>,
    username: web::Path<String>,
) -> Result<HttpResponse> {
    check_username(&username)?;
    let limit = match state
        .coordinator
        .query(Backend::JobLimits, &username, &Query::JobLimit)
        .await?
    {
        Detail::JobLimit(limit) => limit,
        other => return Err(unexpected(other)),
    };
    let Some(concurrent_jobs) = limit else {
        return Err(AppError::NotFound(format!(
            "no job limit override for `{username}`"
        )));
    };

    Ok(HttpResponse::Ok().json(JobLimitResponse {
        username: username.into_inner(),
        concurrent_jobs,
    }))
}

/// POST /terrain/users/{username}/job-limits
pub async fn set_job_limit(
    state: web::Data<AppState>,
    username: web::Path<String>,
    payload: web::Json<JobLimitRequest>,
) -> Result<HttpResponse> {
    check_username(&username)?;
    let request = payload.into_inner();
    request.validate()?;

    state
        .coordinator
        .adjust(
            &username,
            Backend::JobLimits,
            Capability::Register(ResourceSpec::JobLimit {
                concurrent_jobs: request.limit,
            }),
            &username,
        )
        .await?;

    Ok(HttpResponse::Ok().json(JobLimitResponse {
        username: username.into_inner(),
        concurrent_jobs: request.limit,
    }))
}

/// POST /users/{username}/password
///
/// Directory first, then the data store; a failure part way is reported in
/// the run report like any other lifecycle run.
pub async fn change_password(
    state: web::Data<AppState>,
    username: web::Path<String>,
    payload: web::Json<PasswordChangeRequest>,
) -> Result<HttpResponse> {
    let request = LifecycleRequest::change_password(&username, payload.into_inner())?;
    let report = run_lifecycle(&state, request).await?;
    Ok(report_response(report))
}
