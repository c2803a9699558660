//! delete-user - synchronous user deletion from the command line.
//!
//! Runs the same coordinator as `DELETE /users/{username}`.
//!
//! Exit codes: 0 success, 1 configuration error, 3 deletion error.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use conductor_service::adapters::AdapterRegistry;
use conductor_service::config::{Settings, CONFIG_PATH_ENV};
use conductor_service::models::{DeleteUserRequest, LifecycleRequest};
use conductor_service::orchestration::{
    Compensation, Coordinator, PlanDefaults, RunReport, RunStatus, Step,
};
use identity_guard::{AcquireMode, IdentityGuard};

const EXIT_CONFIG: u8 = 1;
const EXIT_DELETION: u8 = 3;

/// Delete a user from every configured backend.
#[derive(Debug, Parser)]
#[command(name = "delete-user", version, about)]
struct Cli {
    /// Username to delete.
    username: String,

    /// JSON settings file.
    #[arg(long, short = 'c', env = CONFIG_PATH_ENV)]
    config: Option<PathBuf>,

    /// Print the step plan without touching any backend.
    #[arg(long)]
    dry_run: bool,

    /// Address to unsubscribe (repeatable).
    #[arg(long = "email")]
    emails: Vec<String>,

    /// Mailing list to unsubscribe from (repeatable).
    #[arg(long = "list")]
    lists: Vec<String>,
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    let settings = match load_settings(cli.config.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("configuration error: {e:#}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let request = match LifecycleRequest::delete_sync(
        &cli.username,
        DeleteUserRequest {
            emails: cli.emails,
            mailing_lists: cli.lists,
        },
    ) {
        Ok(request) => request,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(EXIT_DELETION);
        }
    };

    let registry = match AdapterRegistry::from_settings(&settings) {
        Ok(registry) => registry,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let coordinator = Coordinator::new(
        registry,
        IdentityGuard::new(AcquireMode::from_wait_ms(settings.guard.wait_ms)),
        settings.adapters.call_timeout(),
        PlanDefaults {
            default_job_limit: settings.terrain.default_job_limit,
        },
    );

    if cli.dry_run {
        return match coordinator.plan_for(&request) {
            Ok(steps) => {
                print_plan(&cli.username, &steps);
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("{e}");
                ExitCode::from(EXIT_DELETION)
            }
        };
    }

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("failed to start runtime: {e}");
            return ExitCode::from(EXIT_DELETION);
        }
    };

    let cancel = CancellationToken::new();
    let result = runtime.block_on(async {
        let run = coordinator.execute(request, cancel.clone());
        tokio::pin!(run);

        tokio::select! {
            result = &mut run => result,
            _ = tokio::signal::ctrl_c() => {
                eprintln!("interrupted, finishing the current step and compensating");
                cancel.cancel();
                run.await
            }
        }
    });

    match result {
        Ok(report) => {
            print_report(&report);
            if report.status == RunStatus::Completed {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(EXIT_DELETION)
            }
        }
        Err(e) => {
            eprintln!("deletion failed: {e}");
            ExitCode::from(EXIT_DELETION)
        }
    }
}

fn load_settings(path: Option<&std::path::Path>) -> anyhow::Result<Settings> {
    let settings = match path {
        Some(path) => Settings::load_from(path)?,
        None => Settings::load()?,
    };
    settings.validate()?;
    Ok(settings)
}

fn print_plan(username: &str, steps: &[Step]) {
    println!("Deletion plan for {username}:");
    for (i, step) in steps.iter().enumerate() {
        let undo = match &step.compensation {
            Compensation::None => "not reversible".to_string(),
            Compensation::Invoke(capability) => format!("undo: {}", capability.label()),
            Compensation::Restore => "undo: restore prior state".to_string(),
        };
        println!(
            "  {}. {:<13} {} on {} ({})",
            i + 1,
            step.name.as_str(),
            step.action.label(),
            step.backend,
            undo
        );
    }
}

fn print_report(report: &RunReport) {
    match serde_json::to_string_pretty(report) {
        Ok(json) => println!("{json}"),
        Err(_) => println!("{report:?}"),
    }
}
