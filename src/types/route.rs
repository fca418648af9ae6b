//! Route and RouteStop entities

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Route status lifecycle:
/// `draft → optimized → dispatched → in_progress → completed`,
/// `{draft, optimized, dispatched} → cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum RouteStatus {
    Draft,
    Optimized,
    Dispatched,
    InProgress,
    Completed,
    Cancelled,
}

impl RouteStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RouteStatus::Completed | RouteStatus::Cancelled)
    }

    pub fn can_transition_to(&self, to: RouteStatus) -> bool {
        use RouteStatus::*;
        match (*self, to) {
            (Draft, Optimized) => true,
            (Optimized, Dispatched) => true,
            (Dispatched, InProgress) => true,
            (InProgress, Completed) => true,
            (Draft, Cancelled) | (Optimized, Cancelled) | (Dispatched, Cancelled) => true,
            _ => false,
        }
    }

    /// States in which orders may be (and stay) assigned to this route.
    pub fn holds_assignments(&self) -> bool {
        matches!(self, RouteStatus::Optimized | RouteStatus::Dispatched | RouteStatus::InProgress)
    }
}

/// Outcome of a single stop visit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum StopOutcome {
    Pending,
    Arrived,
    Delivered,
    Skipped,
    Failed,
}

impl StopOutcome {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StopOutcome::Delivered | StopOutcome::Skipped | StopOutcome::Failed)
    }
}

/// One vehicle's tour for an operating day.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    pub id: Uuid,
    pub date: NaiveDate,
    pub driver_id: Uuid,
    pub status: RouteStatus,
    pub total_distance_m: i64,
    pub total_duration_s: i64,
    /// How the sequence was produced, e.g. `"guided-local-search"` or
    /// `"insertion-fallback"`.
    pub method: String,
    /// Encoded polyline of the full tour (empty when no stops).
    pub polyline: String,
    /// True when any travel cost came from haversine approximation
    /// rather than the routing provider.
    pub approximate: bool,
    /// The optimize job that produced this route, if any.
    pub job_id: Option<Uuid>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A single stop on a route. Positions are contiguous from 1.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct RouteStop {
    pub route_id: Uuid,
    pub position: i32,
    pub order_id: Uuid,
    /// Planned arrival, minutes from operating-day start.
    pub planned_arrival_minute: i32,
    pub planned_service_minutes: i32,
    pub actual_arrival: Option<DateTime<Utc>>,
    pub actual_departure: Option<DateTime<Utc>>,
    pub outcome: StopOutcome,
}

impl Route {
    /// Check structural invariants against this route's stops:
    /// contiguous 1-based positions and unique orders.
    pub fn validate_stops(&self, stops: &[RouteStop]) -> bool {
        let mut seen = std::collections::HashSet::new();
        for (i, stop) in stops.iter().enumerate() {
            if stop.route_id != self.id || stop.position != (i as i32) + 1 {
                return false;
            }
            if !seen.insert(stop.order_id) {
                return false;
            }
        }
        true
    }
}
