//! Customer reference data (read-only from the core)

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::{Coordinates, TimeWindow};

/// Customer reference record as the core consumes it.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Customer {
    pub id: Uuid,
    pub name: String,
    #[sqlx(json)]
    pub location: Coordinates,
    /// Service window in minutes from operating-day start.
    #[sqlx(json)]
    #[sqlx(rename = "service_window")]
    pub window: TimeWindow,
    /// Expected time on site, minutes.
    pub service_minutes: i32,
    /// Delivery cadence in days for subscription customers, if any.
    pub cadence_days: Option<i32>,
}
