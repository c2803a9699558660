use actix_web::{web, App, HttpServer};
use anyhow::Context;
use conductor_service::adapters::AdapterRegistry;
use conductor_service::config::Settings;
use conductor_service::handlers::{self, AppState};
use conductor_service::jobs::{FormationClient, JobTracker};
use conductor_service::orchestration::{Coordinator, PlanDefaults};
use identity_guard::{AcquireMode, IdentityGuard};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "conductor_service=info,info".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!("Starting conductor service");

    let settings = Settings::load().context("Failed to load configuration")?;
    settings.validate().context("Invalid configuration")?;
    settings
        .validate_formation()
        .context("Invalid batch-job system configuration")?;

    let guard = IdentityGuard::new(AcquireMode::from_wait_ms(settings.guard.wait_ms));
    let call_timeout = settings.adapters.call_timeout();

    let registry =
        AdapterRegistry::from_settings(&settings).context("Failed to build backend adapters")?;
    tracing::info!(registry = ?registry, "Backend adapters configured");

    let coordinator = Arc::new(Coordinator::new(
        registry,
        guard.clone(),
        call_timeout,
        PlanDefaults {
            default_job_limit: settings.terrain.default_job_limit,
        },
    ));

    let formation = FormationClient::new(settings.formation.clone(), call_timeout)
        .context("Failed to build batch-job system client")?;
    let tracker = JobTracker::new(Arc::new(formation), guard, &settings.formation)
        .context("Failed to build job tracker")?;
    tracker.init().await;

    let state = AppState {
        coordinator,
        tracker: Arc::new(tracker),
        request_timeout: settings.server.request_timeout(),
    };

    let bind_address = format!("{}:{}", settings.server.host, settings.server.port);
    tracing::info!("HTTP server listening on {}", bind_address);

    HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(state.clone()))
            .wrap(tracing_actix_web::TracingLogger::default())
            .configure(handlers::configure)
    })
    .bind(&bind_address)
    .with_context(|| format!("Failed to bind {bind_address}"))?
    .run()
    .await
    .context("HTTP server error")?;

    tracing::info!("Conductor service shutting down");
    Ok(())
}
