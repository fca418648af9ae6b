//! Gasline Dispatch - core service for a bottled-gas delivery operation
//!
//! Wires the matrix cache, VRP solver, route assembler, event bus, and job
//! orchestrator together and runs until interrupted.

mod bus;
mod cli;
mod config;
pub mod error;
mod jobs;
mod services;
mod solver;
mod store;
mod types;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bus::{BusConfig, EventBus};
use config::Config;
use jobs::{JobRegistry, Orchestrator, OrchestratorConfig};
use services::assembler::RouteAssembler;
use services::drafts::DraftGenerator;
use services::matrix::MatrixService;
use services::matrix_cache::MatrixCache;
use services::predictor::create_predictor_with_fallback;
use services::routing::create_routing_provider_with_fallback;
use services::state::StateMachine;
use solver::{SolverConfig, VrpSolver};
use store::{MemoryStore, PgStore, Store};
use types::Coordinates;

use crate::jobs::{
    import::BulkImportHandler, optimize::OptimizeDayHandler, predict::BatchPredictHandler,
};
use crate::types::JobKind;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = cli::Cli::parse();

    dotenvy::dotenv().ok();

    let config = Config::from_env()?;

    match cli.command {
        Some(cli::Command::Migrate) => {
            let pool = store::create_pool(&config.database_url).await?;
            store::run_migrations(&pool).await?;
            info!("Migrations complete, exiting.");
            Ok(())
        }
        Some(cli::Command::Serve) | None => run_server(config).await,
    }
}

/// Build the store: Postgres normally, in-memory when `DATABASE_URL=memory`
/// (local development without a database).
async fn create_store(config: &Config) -> Result<Arc<dyn Store>> {
    if config.database_url == "memory" {
        info!("Using in-memory store (no persistence)");
        return Ok(Arc::new(MemoryStore::new()));
    }
    let pool = store::create_pool(&config.database_url).await?;
    store::run_migrations(&pool).await?;
    info!("Connected to PostgreSQL, migrations complete");
    Ok(Arc::new(PgStore::new(pool)))
}

async fn run_server(config: Config) -> Result<()> {
    let logs_dir = std::env::var("LOGS_DIR").unwrap_or_else(|_| "../logs".to_string());
    std::fs::create_dir_all(&logs_dir).ok();

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &logs_dir, "dispatch.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,gasline_dispatch=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::fmt::layer().with_writer(non_blocking).with_ansi(false))
        .init();

    info!("Starting Gasline Dispatch...");

    let store = create_store(&config).await?;

    let bus = EventBus::new(BusConfig {
        max_connections: config.bus_max_connections,
        queue_capacity: config.bus_queue_capacity,
        replay_events: config.bus_replay_events,
        replay_age: Duration::from_secs(config.bus_replay_secs),
        heartbeat: Duration::from_secs(config.bus_heartbeat_secs),
        disconnect_grace: Duration::from_secs(config.bus_disconnect_grace_secs),
        presence_samples: config.presence_samples,
    });
    let heartbeat = bus.start_heartbeat();
    info!("Event bus ready");

    let state = Arc::new(StateMachine::new(store.clone(), bus.clone()));

    let cache = Arc::new(MatrixCache::new(
        config.matrix_cache_capacity,
        Duration::from_secs(config.matrix_cache_ttl_secs),
    ));
    let provider: Arc<dyn services::routing::RoutingProvider> =
        Arc::from(create_routing_provider_with_fallback(config.valhalla_url.clone()).await);
    let matrix = Arc::new(MatrixService::new(
        cache,
        provider,
        Duration::from_secs(config.matrix_timeout_secs),
        Duration::from_secs(config.directions_timeout_secs),
        config.approx_speed_kmh,
        config.allow_approximation,
    ));

    let depot = Coordinates { lat: config.depot_lat, lng: config.depot_lng };
    let solver = Arc::new(VrpSolver::new(
        matrix.clone(),
        SolverConfig {
            default_budget_ms: config.solver_budget_ms,
            budget_ceiling_ms: config.solver_budget_ceiling_ms,
            ..Default::default()
        },
    ));
    let assembler = Arc::new(RouteAssembler::new(state.clone(), matrix.clone(), config.allow_approximation));

    let predictor: Arc<dyn services::predictor::Predictor> =
        Arc::from(create_predictor_with_fallback(config.predictor_url.clone()).await);
    let drafts = Arc::new(DraftGenerator::new(state.clone(), 0.6));

    let registry = JobRegistry::new()
        .register(
            JobKind::OptimizeDay,
            Arc::new(OptimizeDayHandler::new(state.clone(), solver, assembler, depot)),
        )
        .register(
            JobKind::BatchPredict,
            Arc::new(BatchPredictHandler::new(state.clone(), predictor, drafts)),
        )
        .register(JobKind::BulkImport, Arc::new(BulkImportHandler::new(state.clone())));

    let orchestrator = Orchestrator::new(
        store,
        bus,
        Arc::new(registry),
        OrchestratorConfig {
            workers: config.job_workers,
            max_optimize_jobs: config.max_optimize_jobs,
            stale_after: Duration::from_secs(config.job_stale_secs),
            cancel_deadline: Duration::from_secs(config.cancel_deadline_secs),
        },
    );
    let workers = orchestrator.start().await?;
    info!("Orchestrator ready: {} workers", workers.len());

    info!("Gasline Dispatch running. Ctrl-C to stop.");
    tokio::signal::ctrl_c().await?;

    info!("Shutting down...");
    heartbeat.abort();
    for worker in workers {
        worker.abort();
    }
    Ok(())
}
