use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use conduit_api::config::ServerConfig;
use conduit_api::engine::in_flight::InFlightRegistry;
use conduit_api::engine::task_router::TaskRouter;
use conduit_api::router::build_app_router;
use conduit_api::state::AppState;
use conduit_fleet::provider::build_provider;
use conduit_fleet::runner::RunnerRegistry;
use conduit_fleet::{FleetConfig, FleetManager, FleetSupervisor};
use conduit_scheduler::leader::new_holder_id;
use conduit_scheduler::{Scheduler, SchedulerConfig, TaskDefaults};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "conduit_api=debug,conduit_scheduler=debug,conduit_fleet=debug,tower_http=debug".into()
    });
    let registry = tracing_subscriber::registry().with(filter);
    if std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json")) {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    // --- Configuration ---
    let config = ServerConfig::from_env();
    tracing::info!(host = %config.host, port = %config.port, "Loaded server configuration");

    let scheduler_config = SchedulerConfig::from_env();
    let task_defaults = scheduler_config.task_defaults.clone();
    let fleet_config = FleetConfig::from_env();
    tracing::info!(
        fleet_id = %fleet_config.fleet_id,
        min_nodes = fleet_config.min_nodes,
        max_nodes = fleet_config.max_nodes,
        "Loaded fleet configuration",
    );

    // --- Database ---
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");

    let pool = conduit_db::create_pool(&database_url)
        .await
        .expect("Failed to connect to database");
    tracing::info!("Database connection pool created");

    conduit_db::health_check(&pool)
        .await
        .expect("Database health check failed");
    tracing::info!("Database health check passed");

    conduit_db::run_migrations(&pool)
        .await
        .expect("Failed to run database migrations");
    tracing::info!("Database migrations applied");

    // --- Fleet ---
    let provider = build_provider(&fleet_config);
    let runners = Arc::new(RunnerRegistry::http(fleet_config.runner_request_timeout));
    let fleet = Arc::new(FleetManager::new(
        pool.clone(),
        fleet_config.clone(),
        Arc::clone(&runners),
    ));
    let holder_id = new_holder_id();
    tracing::info!(%holder_id, "Process identity");

    // --- Background loops ---
    let cancel = CancellationToken::new();
    let in_flight = Arc::new(InFlightRegistry::new());

    let supervisor = FleetSupervisor::new(
        pool.clone(),
        fleet_config,
        provider,
        Arc::clone(&runners),
        holder_id.clone(),
    );
    let supervisor_cancel = cancel.clone();
    let supervisor_handle = tokio::spawn(async move {
        supervisor.run(supervisor_cancel).await;
    });

    let scheduler = Scheduler::new(pool.clone(), scheduler_config);
    let scheduler_handle = tokio::spawn(scheduler.run(cancel.clone()));

    let task_router = TaskRouter::new(
        pool.clone(),
        Arc::clone(&fleet),
        Arc::clone(&in_flight),
        task_defaults.retry_backoff,
    );
    let router_cancel = cancel.clone();
    let router_handle = tokio::spawn(async move {
        task_router.run(router_cancel).await;
    });

    tracing::info!("Background loops started (fleet supervisor, scheduler, task router)");

    // --- App state ---
    let state = AppState {
        pool,
        config: Arc::new(config.clone()),
        task_defaults: Arc::new(task_defaults),
        fleet,
        in_flight: Arc::clone(&in_flight),
    };

    let app = build_app_router(state, &config);

    // --- Start server ---
    let addr = SocketAddr::new(
        config.host.parse().expect("Invalid HOST address"),
        config.port,
    );
    tracing::info!(%addr, "Starting server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind to address");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");

    // --- Post-shutdown cleanup ---
    tracing::info!("Server stopped accepting connections, cleaning up");

    cancel.cancel();
    let grace = Duration::from_secs(config.shutdown_timeout_secs);
    let handles = [
        ("task router", router_handle),
        ("scheduler", scheduler_handle),
        ("fleet supervisor", supervisor_handle),
    ];
    for (name, handle) in handles {
        if tokio::time::timeout(grace, handle).await.is_err() {
            tracing::warn!(loop_name = name, "Background loop did not stop in time");
        }
    }

    let abandoned = in_flight.len();
    in_flight.cancel_all();
    tracing::info!(abandoned, "In-flight invocations cancelled");

    tracing::info!("Graceful shutdown complete");
}

/// Wait for a termination signal to initiate graceful shutdown.
///
/// Handles both SIGINT (Ctrl-C) and SIGTERM (on Unix).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
