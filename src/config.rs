//! Configuration management

use anyhow::{Context, Result};

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection string
    pub database_url: String,

    /// Depot coordinates (origin and terminus of every tour)
    pub depot_lat: f64,
    pub depot_lng: f64,

    /// Valhalla routing engine URL (optional, falls back to mock if unavailable)
    pub valhalla_url: Option<String>,

    /// Demand predictor URL (optional, falls back to mock if unavailable)
    pub predictor_url: Option<String>,

    /// Matrix cache capacity in entries
    pub matrix_cache_capacity: usize,
    /// Matrix cache entry TTL in seconds
    pub matrix_cache_ttl_secs: u64,
    /// Average speed used for haversine approximation, km/h
    pub approx_speed_kmh: f64,
    /// Whether the solver may fall back to approximate matrices
    pub allow_approximation: bool,

    /// Default solver budget in milliseconds
    pub solver_budget_ms: u64,
    /// Hard ceiling on the solver budget in milliseconds
    pub solver_budget_ceiling_ms: u64,

    /// Worker pool size for background jobs
    pub job_workers: usize,
    /// Max concurrent OptimizeDay jobs
    pub max_optimize_jobs: usize,
    /// Seconds a running job may go without progress before it is orphaned
    pub job_stale_secs: u64,
    /// Cooperative cancel deadline in seconds
    pub cancel_deadline_secs: u64,

    /// Hard cap on live bus connections
    pub bus_max_connections: usize,
    /// Outbound events queued per connection before it is dropped
    pub bus_queue_capacity: usize,
    /// Replay retention per room: events
    pub bus_replay_events: usize,
    /// Replay retention per room: seconds
    pub bus_replay_secs: u64,
    /// Heartbeat interval in seconds
    pub bus_heartbeat_secs: u64,
    /// How long room membership survives a disconnect, seconds
    pub bus_disconnect_grace_secs: u64,
    /// Position samples retained per driver
    pub presence_samples: usize,

    /// Per-call timeouts, seconds
    pub matrix_timeout_secs: u64,
    pub directions_timeout_secs: u64,
    pub predictor_timeout_secs: u64,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present
        dotenvy::dotenv().ok();

        let database_url = std::env::var("DATABASE_URL")
            .context("DATABASE_URL must be set")?;

        Ok(Self {
            database_url,
            depot_lat: env_parse("DEPOT_LAT", 25.048),
            depot_lng: env_parse("DEPOT_LNG", 121.532),
            valhalla_url: std::env::var("VALHALLA_URL").ok(),
            predictor_url: std::env::var("PREDICTOR_URL").ok(),
            matrix_cache_capacity: env_parse("MATRIX_CACHE_CAPACITY", 200_000),
            matrix_cache_ttl_secs: env_parse("MATRIX_CACHE_TTL_SECS", 24 * 3600),
            approx_speed_kmh: env_parse("APPROX_SPEED_KMH", 30.0),
            allow_approximation: env_parse("ALLOW_APPROXIMATION", true),
            solver_budget_ms: env_parse("SOLVER_BUDGET_MS", 30_000),
            solver_budget_ceiling_ms: env_parse("SOLVER_BUDGET_CEILING_MS", 120_000),
            job_workers: env_parse("JOB_WORKERS", 4),
            max_optimize_jobs: env_parse("MAX_OPTIMIZE_JOBS", 4),
            job_stale_secs: env_parse("JOB_STALE_SECS", 15 * 60),
            cancel_deadline_secs: env_parse("CANCEL_DEADLINE_SECS", 30),
            bus_max_connections: env_parse("BUS_MAX_CONNECTIONS", 10_000),
            bus_queue_capacity: env_parse("BUS_QUEUE_CAPACITY", 256),
            bus_replay_events: env_parse("BUS_REPLAY_EVENTS", 1000),
            bus_replay_secs: env_parse("BUS_REPLAY_SECS", 15 * 60),
            bus_heartbeat_secs: env_parse("BUS_HEARTBEAT_SECS", 20),
            bus_disconnect_grace_secs: env_parse("BUS_DISCONNECT_GRACE_SECS", 60),
            presence_samples: env_parse("PRESENCE_SAMPLES", 32),
            matrix_timeout_secs: env_parse("MATRIX_TIMEOUT_SECS", 10),
            directions_timeout_secs: env_parse("DIRECTIONS_TIMEOUT_SECS", 15),
            predictor_timeout_secs: env_parse("PREDICTOR_TIMEOUT_SECS", 20),
        })
    }
}

impl Default for Config {
    /// Defaults for tests and local development (no database).
    fn default() -> Self {
        Self {
            database_url: String::new(),
            depot_lat: 25.048,
            depot_lng: 121.532,
            valhalla_url: None,
            predictor_url: None,
            matrix_cache_capacity: 200_000,
            matrix_cache_ttl_secs: 24 * 3600,
            approx_speed_kmh: 30.0,
            allow_approximation: true,
            solver_budget_ms: 30_000,
            solver_budget_ceiling_ms: 120_000,
            job_workers: 4,
            max_optimize_jobs: 4,
            job_stale_secs: 15 * 60,
            cancel_deadline_secs: 30,
            bus_max_connections: 10_000,
            bus_queue_capacity: 256,
            bus_replay_events: 1000,
            bus_replay_secs: 15 * 60,
            bus_heartbeat_secs: 20,
            bus_disconnect_grace_secs: 60,
            presence_samples: 32,
            matrix_timeout_secs: 10,
            directions_timeout_secs: 15,
            predictor_timeout_secs: 20,
        }
    }
}
