//! HTTP surface over fake backends
mod common;

use actix_web::{test, web, App};
use common::{
    create_request, formation_settings, unavailable, Harness, ScriptedJobSystem, StatefulHarness,
};
use conductor_service::adapters::{Backend, Membership};
use conductor_service::handlers::{configure, AppState};
use conductor_service::jobs::{JobSystemError, JobTracker};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

fn state(h: &Harness, system: Arc<ScriptedJobSystem>, request_timeout: Duration) -> AppState {
    let tracker = JobTracker::new(
        system,
        h.guard.clone(),
        &formation_settings(Some("app-1"), None),
    )
    .unwrap();

    AppState {
        coordinator: h.coordinator.clone(),
        tracker: Arc::new(tracker),
        request_timeout,
    }
}

fn default_state(h: &Harness) -> AppState {
    state(h, ScriptedJobSystem::new(), Duration::from_secs(5))
}

fn stateful_state(h: &StatefulHarness) -> AppState {
    let tracker = JobTracker::new(
        ScriptedJobSystem::new(),
        h.guard.clone(),
        &formation_settings(Some("app-1"), None),
    )
    .unwrap();

    AppState {
        coordinator: h.coordinator.clone(),
        tracker: Arc::new(tracker),
        request_timeout: Duration::from_secs(5),
    }
}

#[actix_web::test]
async fn test_index_and_health() {
    let h = Harness::new();
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(default_state(&h)))
            .configure(configure),
    )
    .await;

    let req = test::TestRequest::get().uri("/").to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["service"], "conductor-service");

    let req = test::TestRequest::get().uri("/health").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
}

#[actix_web::test]
async fn test_create_user_completes() {
    let h = Harness::new();
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(default_state(&h)))
            .configure(configure),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/users/")
        .set_json(create_request("alice", &["announce"]))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);

    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["status"], "completed");
    assert_eq!(body["username"], "alice");
    assert_eq!(body["steps"].as_array().unwrap().len(), 4);
    assert!(h.directory.is_present());
}

#[actix_web::test]
async fn test_invalid_create_rejected_before_any_step() {
    let h = Harness::new();
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(default_state(&h)))
            .configure(configure),
    )
    .await;

    let mut request = create_request("alice", &[]);
    request.email = "not-an-email".to_string();
    let req = test::TestRequest::post()
        .uri("/users/")
        .set_json(&request)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["code"], "validation_error");

    let req = test::TestRequest::post()
        .uri("/users/")
        .insert_header(("content-type", "application/json"))
        .set_payload("{\"username\": ")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);

    assert!(h.calls().is_empty());
}

#[actix_web::test]
async fn test_rolled_back_create_is_conflict() {
    let h = Harness::new();
    h.storage.fail_on("create", unavailable(Backend::Storage));
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(default_state(&h)))
            .configure(configure),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/users/")
        .set_json(create_request("alice", &[]))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 409);

    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["status"], "rolled_back");
    assert_eq!(body["failed_step"], "storage");
    assert_eq!(body["error_kind"], "upstream_unavailable");
}

#[actix_web::test]
async fn test_failed_compensation_is_server_error() {
    let h = Harness::new();
    h.storage.fail_on("create", unavailable(Backend::Storage));
    h.directory.fail_on("delete", unavailable(Backend::Directory));
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(default_state(&h)))
            .configure(configure),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/users/")
        .set_json(create_request("alice", &[]))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 500);

    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["status"], "compensation_failed");
    assert_eq!(body["unrecovered"], json!(["directory"]));
}

#[actix_web::test]
async fn test_delete_with_and_without_body() {
    let h = Harness::new();
    h.provision_all();
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(default_state(&h)))
            .configure(configure),
    )
    .await;

    let req = test::TestRequest::delete()
        .uri("/users/alice")
        .set_json(json!({ "emails": ["alice@example.org"], "mailing_lists": ["announce"] }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
    assert!(!h.mailing_list.is_present());

    let req = test::TestRequest::delete().uri("/users/bob").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["operation"], "delete_sync");
}

#[actix_web::test]
async fn test_malformed_delete_body_is_rejected() {
    let h = Harness::new();
    h.provision_all();
    h.clear_calls();
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(default_state(&h)))
            .configure(configure),
    )
    .await;

    let req = test::TestRequest::delete()
        .uri("/users/alice")
        .set_json(json!({ "emails": "alice@example.org" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["code"], "validation_error");
    assert!(h.calls().is_empty());
    assert!(h.mailing_list.is_present());
}

#[actix_web::test]
async fn test_validate_and_presence() {
    let h = Harness::new();
    h.directory.set_present(true);
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(default_state(&h)))
            .configure(configure),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/users/alice/validate")
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["exists"], true);

    let req = test::TestRequest::get().uri("/users/alice").to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["backends"]["directory"], "present");
    assert_eq!(body["backends"]["storage"], "absent");
}

#[actix_web::test]
async fn test_request_for_busy_user_conflicts() {
    let h = Harness::new();
    let _held = h.guard.try_acquire("alice", "delete_async").unwrap();
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(default_state(&h)))
            .configure(configure),
    )
    .await;

    let req = test::TestRequest::delete().uri("/users/alice").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 409);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["code"], "conflict");
    assert!(h.calls().is_empty());
}

#[actix_web::test]
async fn test_slow_run_times_out() {
    let h = Harness::new();
    h.directory.set_delay(Duration::from_millis(300));
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state(
                &h,
                ScriptedJobSystem::new(),
                Duration::from_millis(50),
            )))
            .configure(configure),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/users/")
        .set_json(create_request("alice", &[]))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 504);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["code"], "TIMEOUT");
}

#[actix_web::test]
async fn test_async_delete_lifecycle() {
    let h = Harness::new();
    let system = ScriptedJobSystem::new();
    system.next_job_id("J-42");
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state(
                &h,
                system.clone(),
                Duration::from_secs(5),
            )))
            .configure(configure),
    )
    .await;

    let req = test::TestRequest::delete()
        .uri("/async/users/bob")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 202);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["analysis_id"], "J-42");
    assert_eq!(body["status"], "Queued");

    let req = test::TestRequest::get().uri("/async/jobs").to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body.as_array().unwrap().len(), 1);

    // a sync run for the same user waits on the job
    let req = test::TestRequest::delete().uri("/users/bob").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 409);

    system.set_status("J-42", "Completed");
    let req = test::TestRequest::get()
        .uri("/async/status/J-42")
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["status"], "Succeeded");
    assert_eq!(body["username"], "bob");
    assert!(!h.guard.is_held("bob"));
}

#[actix_web::test]
async fn test_async_submission_failure() {
    let h = Harness::new();
    let system = ScriptedJobSystem::new();
    system.fail_launch(JobSystemError::Rejected {
        status: 400,
        message: "bad config".to_string(),
    });
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state(
                &h,
                system,
                Duration::from_secs(5),
            )))
            .configure(configure),
    )
    .await;

    let req = test::TestRequest::delete()
        .uri("/async/users/bob")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 502);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["code"], "submission_failed");
    assert!(!h.guard.is_held("bob"));
}

#[actix_web::test]
async fn test_async_rejects_bad_username_and_unknown_job() {
    let h = Harness::new();
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(default_state(&h)))
            .configure(configure),
    )
    .await;

    let req = test::TestRequest::delete()
        .uri("/async/users/Bad.User")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);

    let req = test::TestRequest::get()
        .uri("/async/status/nope")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 404);
}

#[actix_web::test]
async fn test_job_limit_routes() {
    let h = StatefulHarness::new(None, &[]);
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(stateful_state(&h)))
            .configure(configure),
    )
    .await;

    let req = test::TestRequest::get()
        .uri("/terrain/users/alice/job-limits")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 404);

    let req = test::TestRequest::post()
        .uri("/terrain/users/alice/job-limits")
        .set_json(json!({ "limit": 6 }))
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["concurrent_jobs"], 6);
    assert_eq!(h.job_limits.limit(), Some(6));

    let req = test::TestRequest::get()
        .uri("/terrain/users/alice/job-limits")
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body, json!({ "username": "alice", "concurrent_jobs": 6 }));

    let req = test::TestRequest::post()
        .uri("/terrain/users/alice/job-limits")
        .set_json(json!({ "limit": 0 }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);
    assert_eq!(h.job_limits.limit(), Some(6));
}

#[actix_web::test]
async fn test_mailing_list_member_routes() {
    let h = StatefulHarness::new(None, &[("announce", "bob@example.org")]);
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(stateful_state(&h)))
            .configure(configure),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/mailinglists/announce/members")
        .set_json(json!({ "email": "alice@example.org" }))
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["success"], true);

    let req = test::TestRequest::get()
        .uri("/mailinglists/announce/members/alice@example.org/exists")
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["exists"], true);

    let req = test::TestRequest::delete()
        .uri("/mailinglists/announce/members/bob@example.org")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);

    assert_eq!(
        h.roster.members().into_iter().collect::<Vec<_>>(),
        vec![Membership::new("announce", "alice@example.org")]
    );

    let req = test::TestRequest::post()
        .uri("/mailinglists/announce/members")
        .set_json(json!({ "email": "not an address" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);
}

#[actix_web::test]
async fn test_member_change_for_busy_address_conflicts() {
    let h = StatefulHarness::new(None, &[]);
    let _held = h.guard.try_acquire("alice@example.org", "register").unwrap();
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(stateful_state(&h)))
            .configure(configure),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/mailinglists/announce/members")
        .set_json(json!({ "email": "alice@example.org" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 409);
    assert!(h.roster.members().is_empty());
}

#[actix_web::test]
async fn test_directory_and_datastore_routes() {
    let h = StatefulHarness::new(None, &[]);
    h.storage.set_present(true);
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(stateful_state(&h)))
            .configure(configure),
    )
    .await;

    let req = test::TestRequest::get()
        .uri("/ldap/users/alice/exists")
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body, json!({ "subject": "alice", "exists": false }));

    let req = test::TestRequest::get()
        .uri("/datastore/users/alice/exists")
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["exists"], true);

    let req = test::TestRequest::post()
        .uri("/ldap/users/alice/groups/de-preview-access")
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["success"], true);

    let req = test::TestRequest::post()
        .uri("/datastore/users/alice/services")
        .set_json(json!({ "irods_path": "/iplant/home/shared/sandbox" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);

    let req = test::TestRequest::get()
        .uri("/ldap/users/..bad/exists")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);

    assert_eq!(
        h.calls(),
        vec![
            "directory:exists",
            "storage:exists",
            "directory:register",
            "storage:register",
        ]
    );
}

#[actix_web::test]
async fn test_password_change_route() {
    let h = Harness::new();
    h.provision_all();
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(default_state(&h)))
            .configure(configure),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/users/alice/password")
        .set_json(json!({ "password": "new secret" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["operation"], "change_password");
    assert_eq!(h.calls(), vec!["directory:register", "storage:register"]);

    h.clear_calls();
    let req = test::TestRequest::post()
        .uri("/users/alice/password")
        .set_json(json!({ "password": "" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);
    assert!(h.calls().is_empty());
}
