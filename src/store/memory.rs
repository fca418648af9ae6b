//! In-memory store for tests and local development
//!
//! A single `RwLock` over the whole state makes `commit` trivially atomic:
//! version checks run first, mutations apply only when every check passed.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::types::{
    Customer, Driver, Job, JobFilter, Order, OrderStatus, Route, RouteStop,
};

use super::{EventLogRow, Store, TxWrite, Versioned};

#[derive(Default)]
struct State {
    orders: HashMap<Uuid, Order>,
    routes: HashMap<Uuid, Route>,
    route_stops: HashMap<Uuid, Vec<RouteStop>>,
    customers: HashMap<Uuid, Customer>,
    drivers: HashMap<Uuid, Driver>,
    jobs: HashMap<Uuid, Job>,
    prediction_batches: HashMap<Uuid, crate::types::PredictionBatch>,
    event_log: Vec<EventLogRow>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed reference data (tests and local development).
    pub fn seed_customer(&self, customer: Customer) {
        self.state.write().customers.insert(customer.id, customer);
    }

    pub fn seed_driver(&self, driver: Driver) {
        self.state.write().drivers.insert(driver.id, driver);
    }

    /// Direct order insert without an event, for test setup.
    pub fn seed_order(&self, order: Order) {
        self.state.write().orders.insert(order.id, order);
    }

    /// Snapshot of the append-only event log.
    pub fn event_log(&self) -> Vec<EventLogRow> {
        self.state.read().event_log.clone()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_order(&self, id: Uuid) -> CoreResult<Option<Order>> {
        Ok(self.state.read().orders.get(&id).cloned())
    }

    async fn list_orders(&self, date: NaiveDate, statuses: &[OrderStatus]) -> CoreResult<Vec<Order>> {
        let state = self.state.read();
        let mut orders: Vec<Order> = state
            .orders
            .values()
            .filter(|o| o.date == date && statuses.contains(&o.status))
            .cloned()
            .collect();
        orders.sort_by_key(|o| (o.created_at, o.id));
        Ok(orders)
    }

    async fn list_customer_orders(&self, customer_id: Uuid, date: NaiveDate) -> CoreResult<Vec<Order>> {
        let state = self.state.read();
        let mut orders: Vec<Order> = state
            .orders
            .values()
            .filter(|o| o.customer_id == customer_id && o.date == date)
            .cloned()
            .collect();
        orders.sort_by_key(|o| (o.created_at, o.id));
        Ok(orders)
    }

    async fn get_route(&self, id: Uuid) -> CoreResult<Option<Route>> {
        Ok(self.state.read().routes.get(&id).cloned())
    }

    async fn list_routes(&self, date: NaiveDate) -> CoreResult<Vec<Route>> {
        let state = self.state.read();
        let mut routes: Vec<Route> = state
            .routes
            .values()
            .filter(|r| r.date == date)
            .cloned()
            .collect();
        routes.sort_by_key(|r| (r.created_at, r.id));
        Ok(routes)
    }

    async fn get_route_stops(&self, route_id: Uuid) -> CoreResult<Vec<RouteStop>> {
        let state = self.state.read();
        let mut stops = state.route_stops.get(&route_id).cloned().unwrap_or_default();
        stops.sort_by_key(|s| s.position);
        Ok(stops)
    }

    async fn get_customer(&self, id: Uuid) -> CoreResult<Option<Customer>> {
        Ok(self.state.read().customers.get(&id).cloned())
    }

    async fn list_customers(&self, ids: &[Uuid]) -> CoreResult<Vec<Customer>> {
        let state = self.state.read();
        let mut customers: Vec<Customer> = if ids.is_empty() {
            state.customers.values().cloned().collect()
        } else {
            ids.iter().filter_map(|id| state.customers.get(id).cloned()).collect()
        };
        customers.sort_by_key(|c| c.id);
        Ok(customers)
    }

    async fn upsert_customer(&self, customer: Customer) -> CoreResult<()> {
        self.state.write().customers.insert(customer.id, customer);
        Ok(())
    }

    async fn get_driver(&self, id: Uuid) -> CoreResult<Option<Driver>> {
        Ok(self.state.read().drivers.get(&id).cloned())
    }

    async fn list_active_drivers(&self) -> CoreResult<Vec<Driver>> {
        let state = self.state.read();
        let mut drivers: Vec<Driver> = state.drivers.values().filter(|d| d.is_active).cloned().collect();
        drivers.sort_by_key(|d| d.id);
        Ok(drivers)
    }

    async fn insert_job(&self, job: Job) -> CoreResult<()> {
        self.state.write().jobs.insert(job.id, job);
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> CoreResult<Option<Job>> {
        Ok(self.state.read().jobs.get(&id).cloned())
    }

    async fn update_job(&self, update: Versioned<Job>) -> CoreResult<Job> {
        let mut state = self.state.write();
        let current = state
            .jobs
            .get(&update.entity.id)
            .ok_or_else(|| CoreError::conflict("job not found", vec![update.entity.id]))?;
        if current.version != update.expected_version {
            return Err(CoreError::VersionConflict { entity: "job", id: update.entity.id });
        }
        let mut job = update.entity;
        job.version = update.expected_version + 1;
        state.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn list_jobs(&self, filter: &JobFilter) -> CoreResult<Vec<Job>> {
        let state = self.state.read();
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|j| filter.kind.map_or(true, |k| j.kind == k))
            .filter(|j| filter.status.map_or(true, |s| j.status == s))
            .cloned()
            .collect();
        jobs.sort_by_key(|j| std::cmp::Reverse((j.created_at, j.id)));
        if let Some(limit) = filter.limit {
            jobs.truncate(limit.max(0) as usize);
        }
        Ok(jobs)
    }

    async fn stale_running_jobs(&self, stale_before: DateTime<Utc>) -> CoreResult<Vec<Job>> {
        let state = self.state.read();
        Ok(state
            .jobs
            .values()
            .filter(|j| j.status == crate::types::JobStatus::Running)
            .filter(|j| {
                j.last_progress_at
                    .or(j.started_at)
                    .map_or(true, |t| t < stale_before)
            })
            .cloned()
            .collect())
    }

    async fn commit(&self, write: TxWrite) -> CoreResult<()> {
        let mut state = self.state.write();

        // Phase 1: every version check, before any mutation.
        for update in &write.orders {
            match state.orders.get(&update.entity.id) {
                Some(current) if current.version == update.expected_version => {}
                Some(_) => {
                    return Err(CoreError::VersionConflict { entity: "order", id: update.entity.id })
                }
                None => return Err(CoreError::conflict("order not found", vec![update.entity.id])),
            }
        }
        for update in &write.routes {
            match state.routes.get(&update.entity.id) {
                Some(current) if current.version == update.expected_version => {}
                Some(_) => {
                    return Err(CoreError::VersionConflict { entity: "route", id: update.entity.id })
                }
                None => return Err(CoreError::conflict("route not found", vec![update.entity.id])),
            }
        }

        // Phase 2: apply.
        for order in write.new_orders {
            state.orders.insert(order.id, order);
        }
        for update in write.orders {
            let mut order = update.entity;
            order.version = update.expected_version + 1;
            order.updated_at = Utc::now();
            state.orders.insert(order.id, order);
        }
        for (route, stops) in write.new_routes {
            state.route_stops.insert(route.id, stops);
            state.routes.insert(route.id, route);
        }
        for update in write.routes {
            let mut route = update.entity;
            route.version = update.expected_version + 1;
            route.updated_at = Utc::now();
            state.routes.insert(route.id, route);
        }
        for stop in write.route_stops {
            let stops = state.route_stops.entry(stop.route_id).or_default();
            match stops.iter_mut().find(|s| s.position == stop.position) {
                Some(existing) => *existing = stop,
                None => stops.push(stop),
            }
        }
        for batch in write.prediction_batches {
            state.prediction_batches.insert(batch.id, batch);
        }
        state.event_log.extend(write.events);

        Ok(())
    }
}
