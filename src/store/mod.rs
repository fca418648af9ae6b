//! Persistence interface
//!
//! The core treats persistence as a transactional KV store with ordered
//! index scans and an append-only event log. `MemoryStore` backs tests and
//! local development; `PgStore` is the durable Postgres implementation.
//! Optimistic version checks guard every entity update: a write carries the
//! version it read, and the store rejects it if the row has moved on.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::{create_pool, run_migrations, PgStore};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use crate::error::CoreResult;
use crate::types::{
    Customer, Driver, EventKind, Job, JobFilter, Order, OrderStatus, PredictionBatch, Route,
    RouteStop,
};

/// A state-change event as persisted for recovery. Room fan-out and
/// sequence numbers are the live broker's concern, not the log's.
#[derive(Debug, Clone)]
pub struct EventLogRow {
    pub event_id: Uuid,
    pub kind: EventKind,
    pub entity_id: Uuid,
    pub payload: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
}

/// An entity update guarded by the version the writer read.
#[derive(Debug, Clone)]
pub struct Versioned<T> {
    pub entity: T,
    pub expected_version: i64,
}

impl<T> Versioned<T> {
    pub fn new(entity: T, expected_version: i64) -> Self {
        Self { entity, expected_version }
    }
}

/// One atomic write batch. Everything commits or nothing does; any failed
/// version check aborts the batch with `VersionConflict` naming the loser.
#[derive(Debug, Clone, Default)]
pub struct TxWrite {
    pub new_orders: Vec<Order>,
    pub orders: Vec<Versioned<Order>>,
    pub new_routes: Vec<(Route, Vec<RouteStop>)>,
    pub routes: Vec<Versioned<Route>>,
    /// Upserts keyed by `(route_id, position)`.
    pub route_stops: Vec<RouteStop>,
    pub prediction_batches: Vec<PredictionBatch>,
    pub events: Vec<EventLogRow>,
}

impl TxWrite {
    pub fn is_empty(&self) -> bool {
        self.new_orders.is_empty()
            && self.orders.is_empty()
            && self.new_routes.is_empty()
            && self.routes.is_empty()
            && self.route_stops.is_empty()
            && self.prediction_batches.is_empty()
            && self.events.is_empty()
    }
}

/// Transactional store consumed by the core.
#[async_trait]
pub trait Store: Send + Sync {
    // -- orders ------------------------------------------------------------

    async fn get_order(&self, id: Uuid) -> CoreResult<Option<Order>>;

    /// Ordered scan by `(date, status)`; results sorted by creation time.
    async fn list_orders(&self, date: NaiveDate, statuses: &[OrderStatus]) -> CoreResult<Vec<Order>>;

    async fn list_customer_orders(&self, customer_id: Uuid, date: NaiveDate) -> CoreResult<Vec<Order>>;

    // -- routes ------------------------------------------------------------

    async fn get_route(&self, id: Uuid) -> CoreResult<Option<Route>>;

    async fn list_routes(&self, date: NaiveDate) -> CoreResult<Vec<Route>>;

    /// Stops ordered by position.
    async fn get_route_stops(&self, route_id: Uuid) -> CoreResult<Vec<RouteStop>>;

    // -- reference data ----------------------------------------------------

    async fn get_customer(&self, id: Uuid) -> CoreResult<Option<Customer>>;

    /// All customers when `ids` is empty.
    async fn list_customers(&self, ids: &[Uuid]) -> CoreResult<Vec<Customer>>;

    async fn upsert_customer(&self, customer: Customer) -> CoreResult<()>;

    async fn get_driver(&self, id: Uuid) -> CoreResult<Option<Driver>>;

    async fn list_active_drivers(&self) -> CoreResult<Vec<Driver>>;

    // -- jobs --------------------------------------------------------------

    async fn insert_job(&self, job: Job) -> CoreResult<()>;

    async fn get_job(&self, id: Uuid) -> CoreResult<Option<Job>>;

    /// Version-checked job update; returns the stored row with its bumped
    /// version.
    async fn update_job(&self, job: Versioned<Job>) -> CoreResult<Job>;

    async fn list_jobs(&self, filter: &JobFilter) -> CoreResult<Vec<Job>>;

    /// Running jobs whose last progress report predates `stale_before`.
    async fn stale_running_jobs(&self, stale_before: DateTime<Utc>) -> CoreResult<Vec<Job>>;

    // -- atomic batches ----------------------------------------------------

    /// Apply one atomic batch. Versions in `orders`/`routes` are checked
    /// inside the transaction; entity versions are bumped on success.
    async fn commit(&self, write: TxWrite) -> CoreResult<()>;
}
