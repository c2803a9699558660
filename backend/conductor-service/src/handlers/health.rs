use actix_web::HttpResponse;
use serde_json::json;

/// GET /
pub async fn index() -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "service": "conductor-service",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// GET /health
pub async fn health() -> HttpResponse {
    HttpResponse::Ok().json(json!({ "status": "ok" }))
}
