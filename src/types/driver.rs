//! Driver reference data and live positions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::{Coordinates, SizeCount, TimeWindow};

/// Driver reference record. The core only reads drivers; CRUD lives in the
/// external surface.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Driver {
    pub id: Uuid,
    pub name: String,
    /// Cylinder capacity per size.
    #[sqlx(json)]
    pub capacity: SizeCount,
    /// Shift window in minutes from operating-day start.
    #[sqlx(json)]
    pub shift: TimeWindow,
    /// Where the vehicle starts; depot when absent.
    #[sqlx(json(nullable))]
    pub start_location: Option<Coordinates>,
    pub is_active: bool,
}

impl Driver {
    pub fn shift_minutes(&self) -> u32 {
        self.shift.duration_minutes()
    }
}

/// A live position sample pushed by a driver client.
///
/// Not durable truth: the bus presence subsystem keeps a bounded ring of
/// recent samples per driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverPosition {
    pub driver_id: Uuid,
    pub location: Coordinates,
    /// Meters per second.
    pub speed: f64,
    /// Degrees clockwise from north.
    pub heading: f64,
    pub recorded_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_position: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CylinderSize;

    #[test]
    fn test_shift_minutes() {
        let driver = Driver {
            id: Uuid::new_v4(),
            name: "V1".to_string(),
            capacity: SizeCount::of(CylinderSize::Kg20, 20),
            shift: TimeWindow::new(480, 1080),
            start_location: None,
            is_active: true,
        };
        assert_eq!(driver.shift_minutes(), 600);
    }

    #[test]
    fn test_position_wire_form() {
        let pos = DriverPosition {
            driver_id: Uuid::nil(),
            location: Coordinates { lat: 25.048, lng: 121.532 },
            speed: 8.3,
            heading: 270.0,
            recorded_at: Utc::now(),
            route_id: None,
            stop_position: None,
        };
        let json = serde_json::to_string(&pos).unwrap();
        assert!(json.contains("driverId"));
        assert!(json.contains("recordedAt"));
        assert!(!json.contains("routeId"), "absent fields must be omitted: {}", json);
    }
}
