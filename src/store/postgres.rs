//! Postgres store
//!
//! Durable implementation of the store interface. Version checks ride in the
//! UPDATE's WHERE clause; a zero-row update inside the transaction aborts
//! the whole batch.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::info;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::types::{Customer, Driver, Job, JobFilter, Order, OrderStatus, Route, RouteStop};

use super::{Store, TxWrite, Versioned};

/// Create a database connection pool
pub async fn create_pool(database_url: &str) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Run database migrations
pub async fn run_migrations(pool: &PgPool) -> anyhow::Result<()> {
    info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn apply_order_update(
        tx: &mut Transaction<'_, Postgres>,
        update: &Versioned<Order>,
    ) -> CoreResult<()> {
        let o = &update.entity;
        let result = sqlx::query(
            r#"
            UPDATE orders SET
                items = $1, priority = $2, status = $3, assigned_route = $4,
                source = $5, version = version + 1, updated_at = NOW()
            WHERE id = $6 AND version = $7
            "#,
        )
        .bind(serde_json::to_value(o.items).map_err(CoreError::internal)?)
        .bind(o.priority)
        .bind(o.status)
        .bind(o.assigned_route)
        .bind(o.source.map(serde_json::to_value).transpose().map_err(CoreError::internal)?)
        .bind(o.id)
        .bind(update.expected_version)
        .execute(&mut **tx)
        .await
        .map_err(CoreError::internal)?;

        if result.rows_affected() == 0 {
            return Err(CoreError::VersionConflict { entity: "order", id: o.id });
        }
        Ok(())
    }

    async fn apply_route_update(
        tx: &mut Transaction<'_, Postgres>,
        update: &Versioned<Route>,
    ) -> CoreResult<()> {
        let r = &update.entity;
        let result = sqlx::query(
            r#"
            UPDATE routes SET
                status = $1, total_distance_m = $2, total_duration_s = $3,
                method = $4, polyline = $5, approximate = $6,
                version = version + 1, updated_at = NOW()
            WHERE id = $7 AND version = $8
            "#,
        )
        .bind(r.status)
        .bind(r.total_distance_m)
        .bind(r.total_duration_s)
        .bind(&r.method)
        .bind(&r.polyline)
        .bind(r.approximate)
        .bind(r.id)
        .bind(update.expected_version)
        .execute(&mut **tx)
        .await
        .map_err(CoreError::internal)?;

        if result.rows_affected() == 0 {
            return Err(CoreError::VersionConflict { entity: "route", id: r.id });
        }
        Ok(())
    }

    async fn insert_order_row(tx: &mut Transaction<'_, Postgres>, o: &Order) -> CoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO orders (
                id, customer_id, date, items, priority, status, assigned_route,
                source, version, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(o.id)
        .bind(o.customer_id)
        .bind(o.date)
        .bind(serde_json::to_value(o.items).map_err(CoreError::internal)?)
        .bind(o.priority)
        .bind(o.status)
        .bind(o.assigned_route)
        .bind(o.source.map(serde_json::to_value).transpose().map_err(CoreError::internal)?)
        .bind(o.version)
        .bind(o.created_at)
        .bind(o.updated_at)
        .execute(&mut **tx)
        .await
        .map_err(CoreError::internal)?;
        Ok(())
    }

    async fn insert_route_row(
        tx: &mut Transaction<'_, Postgres>,
        route: &Route,
        stops: &[RouteStop],
    ) -> CoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO routes (
                id, date, driver_id, status, total_distance_m, total_duration_s,
                method, polyline, approximate, job_id, version, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(route.id)
        .bind(route.date)
        .bind(route.driver_id)
        .bind(route.status)
        .bind(route.total_distance_m)
        .bind(route.total_duration_s)
        .bind(&route.method)
        .bind(&route.polyline)
        .bind(route.approximate)
        .bind(route.job_id)
        .bind(route.version)
        .bind(route.created_at)
        .bind(route.updated_at)
        .execute(&mut **tx)
        .await
        .map_err(CoreError::internal)?;

        for stop in stops {
            Self::upsert_stop_row(tx, stop).await?;
        }
        Ok(())
    }

    async fn upsert_stop_row(tx: &mut Transaction<'_, Postgres>, s: &RouteStop) -> CoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO route_stops (
                route_id, position, order_id, planned_arrival_minute,
                planned_service_minutes, actual_arrival, actual_departure, outcome
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (route_id, position)
            DO UPDATE SET
                order_id = $3, planned_arrival_minute = $4,
                planned_service_minutes = $5, actual_arrival = $6,
                actual_departure = $7, outcome = $8
            "#,
        )
        .bind(s.route_id)
        .bind(s.position)
        .bind(s.order_id)
        .bind(s.planned_arrival_minute)
        .bind(s.planned_service_minutes)
        .bind(s.actual_arrival)
        .bind(s.actual_departure)
        .bind(s.outcome)
        .execute(&mut **tx)
        .await
        .map_err(CoreError::internal)?;
        Ok(())
    }
}

#[async_trait]
impl Store for PgStore {
    async fn get_order(&self, id: Uuid) -> CoreResult<Option<Order>> {
        sqlx::query_as::<_, Order>(r#"SELECT * FROM orders WHERE id = $1"#)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(CoreError::internal)
    }

    async fn list_orders(&self, date: NaiveDate, statuses: &[OrderStatus]) -> CoreResult<Vec<Order>> {
        let status_labels: Vec<String> = statuses
            .iter()
            .map(|s| serde_json::to_value(s).unwrap().as_str().unwrap().to_string())
            .collect();
        sqlx::query_as::<_, Order>(
            r#"
            SELECT * FROM orders
            WHERE date = $1 AND status = ANY($2)
            ORDER BY created_at, id
            "#,
        )
        .bind(date)
        .bind(&status_labels)
        .fetch_all(&self.pool)
        .await
        .map_err(CoreError::internal)
    }

    async fn list_customer_orders(&self, customer_id: Uuid, date: NaiveDate) -> CoreResult<Vec<Order>> {
        sqlx::query_as::<_, Order>(
            r#"
            SELECT * FROM orders
            WHERE customer_id = $1 AND date = $2
            ORDER BY created_at, id
            "#,
        )
        .bind(customer_id)
        .bind(date)
        .fetch_all(&self.pool)
        .await
        .map_err(CoreError::internal)
    }

    async fn get_route(&self, id: Uuid) -> CoreResult<Option<Route>> {
        sqlx::query_as::<_, Route>(r#"SELECT * FROM routes WHERE id = $1"#)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(CoreError::internal)
    }

    async fn list_routes(&self, date: NaiveDate) -> CoreResult<Vec<Route>> {
        sqlx::query_as::<_, Route>(
            r#"SELECT * FROM routes WHERE date = $1 ORDER BY created_at, id"#,
        )
        .bind(date)
        .fetch_all(&self.pool)
        .await
        .map_err(CoreError::internal)
    }

    async fn get_route_stops(&self, route_id: Uuid) -> CoreResult<Vec<RouteStop>> {
        sqlx::query_as::<_, RouteStop>(
            r#"SELECT * FROM route_stops WHERE route_id = $1 ORDER BY position"#,
        )
        .bind(route_id)
        .fetch_all(&self.pool)
        .await
        .map_err(CoreError::internal)
    }

    async fn get_customer(&self, id: Uuid) -> CoreResult<Option<Customer>> {
        sqlx::query_as::<_, Customer>(r#"SELECT * FROM customers WHERE id = $1"#)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(CoreError::internal)
    }

    async fn list_customers(&self, ids: &[Uuid]) -> CoreResult<Vec<Customer>> {
        if ids.is_empty() {
            sqlx::query_as::<_, Customer>(r#"SELECT * FROM customers ORDER BY id"#)
                .fetch_all(&self.pool)
                .await
                .map_err(CoreError::internal)
        } else {
            sqlx::query_as::<_, Customer>(
                r#"SELECT * FROM customers WHERE id = ANY($1) ORDER BY id"#,
            )
            .bind(ids)
            .fetch_all(&self.pool)
            .await
            .map_err(CoreError::internal)
        }
    }

    async fn upsert_customer(&self, c: Customer) -> CoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO customers (id, name, location, service_window, service_minutes, cadence_days)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id)
            DO UPDATE SET
                name = $2, location = $3, service_window = $4,
                service_minutes = $5, cadence_days = $6
            "#,
        )
        .bind(c.id)
        .bind(&c.name)
        .bind(serde_json::to_value(c.location).map_err(CoreError::internal)?)
        .bind(serde_json::to_value(c.window).map_err(CoreError::internal)?)
        .bind(c.service_minutes)
        .bind(c.cadence_days)
        .execute(&self.pool)
        .await
        .map_err(CoreError::internal)?;
        Ok(())
    }

    async fn get_driver(&self, id: Uuid) -> CoreResult<Option<Driver>> {
        sqlx::query_as::<_, Driver>(r#"SELECT * FROM drivers WHERE id = $1"#)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(CoreError::internal)
    }

    async fn list_active_drivers(&self) -> CoreResult<Vec<Driver>> {
        sqlx::query_as::<_, Driver>(
            r#"SELECT * FROM drivers WHERE is_active = TRUE ORDER BY id"#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(CoreError::internal)
    }

    async fn insert_job(&self, j: Job) -> CoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, kind, submitter, status, input, target_key, progress,
                error_message, result, created_at, started_at, finished_at,
                last_progress_at, version
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(j.id)
        .bind(j.kind)
        .bind(j.submitter)
        .bind(j.status)
        .bind(serde_json::to_value(&j.input).map_err(CoreError::internal)?)
        .bind(&j.target_key)
        .bind(j.progress)
        .bind(&j.error_message)
        .bind(&j.result)
        .bind(j.created_at)
        .bind(j.started_at)
        .bind(j.finished_at)
        .bind(j.last_progress_at)
        .bind(j.version)
        .execute(&self.pool)
        .await
        .map_err(CoreError::internal)?;
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> CoreResult<Option<Job>> {
        sqlx::query_as::<_, Job>(r#"SELECT * FROM jobs WHERE id = $1"#)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(CoreError::internal)
    }

    async fn update_job(&self, update: Versioned<Job>) -> CoreResult<Job> {
        let j = &update.entity;
        let row = sqlx::query_as::<_, Job>(
            r#"
            UPDATE jobs SET
                status = $1, progress = $2, error_message = $3, result = $4,
                started_at = $5, finished_at = $6, last_progress_at = $7,
                version = version + 1
            WHERE id = $8 AND version = $9
            RETURNING *
            "#,
        )
        .bind(j.status)
        .bind(j.progress)
        .bind(&j.error_message)
        .bind(&j.result)
        .bind(j.started_at)
        .bind(j.finished_at)
        .bind(j.last_progress_at)
        .bind(j.id)
        .bind(update.expected_version)
        .fetch_optional(&self.pool)
        .await
        .map_err(CoreError::internal)?;

        row.ok_or(CoreError::VersionConflict { entity: "job", id: j.id })
    }

    async fn list_jobs(&self, filter: &JobFilter) -> CoreResult<Vec<Job>> {
        let kind_label = filter
            .kind
            .map(|k| serde_json::to_value(k).unwrap().as_str().unwrap().to_string());
        let status_label = filter
            .status
            .map(|s| serde_json::to_value(s).unwrap().as_str().unwrap().to_string());
        sqlx::query_as::<_, Job>(
            r#"
            SELECT * FROM jobs
            WHERE ($1::text IS NULL OR kind = $1)
              AND ($2::text IS NULL OR status = $2)
            ORDER BY created_at DESC, id DESC
            LIMIT $3
            "#,
        )
        .bind(kind_label)
        .bind(status_label)
        .bind(filter.limit.unwrap_or(100))
        .fetch_all(&self.pool)
        .await
        .map_err(CoreError::internal)
    }

    async fn stale_running_jobs(&self, stale_before: DateTime<Utc>) -> CoreResult<Vec<Job>> {
        sqlx::query_as::<_, Job>(
            r#"
            SELECT * FROM jobs
            WHERE status = 'running'
              AND COALESCE(last_progress_at, started_at, created_at) < $1
            "#,
        )
        .bind(stale_before)
        .fetch_all(&self.pool)
        .await
        .map_err(CoreError::internal)
    }

    async fn commit(&self, write: TxWrite) -> CoreResult<()> {
        if write.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await.map_err(CoreError::internal)?;

        for order in &write.new_orders {
            Self::insert_order_row(&mut tx, order).await?;
        }
        for update in &write.orders {
            Self::apply_order_update(&mut tx, update).await?;
        }
        for (route, stops) in &write.new_routes {
            Self::insert_route_row(&mut tx, route, stops).await?;
        }
        for update in &write.routes {
            Self::apply_route_update(&mut tx, update).await?;
        }
        for stop in &write.route_stops {
            Self::upsert_stop_row(&mut tx, stop).await?;
        }
        for batch in &write.prediction_batches {
            sqlx::query(
                r#"
                INSERT INTO prediction_batches (id, date, customer_count, draft_count, created_at)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(batch.id)
            .bind(batch.date)
            .bind(batch.customer_count)
            .bind(batch.draft_count)
            .bind(batch.created_at)
            .execute(&mut *tx)
            .await
            .map_err(CoreError::internal)?;
        }
        for event in &write.events {
            sqlx::query(
                r#"
                INSERT INTO event_log (event_id, kind, entity_id, payload, occurred_at)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(event.event_id)
            .bind(
                serde_json::to_value(event.kind)
                    .ok()
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_default(),
            )
            .bind(event.entity_id)
            .bind(&event.payload)
            .bind(event.occurred_at)
            .execute(&mut *tx)
            .await
            .map_err(CoreError::internal)?;
        }

        tx.commit().await.map_err(CoreError::internal)?;
        Ok(())
    }
}
