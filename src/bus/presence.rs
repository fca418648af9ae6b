//! Driver presence: bounded rings of recent position samples
//!
//! Positions are live telemetry, not durable truth; each driver keeps the
//! last N samples and the rest falls off the back.

use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;
use uuid::Uuid;

use crate::types::DriverPosition;

pub struct Presence {
    samples: RwLock<HashMap<Uuid, VecDeque<DriverPosition>>>,
    capacity: usize,
}

impl Presence {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&self, position: DriverPosition) {
        let mut samples = self.samples.write();
        let ring = samples.entry(position.driver_id).or_default();
        ring.push_back(position);
        while ring.len() > self.capacity {
            ring.pop_front();
        }
    }

    /// Most recent sample for a driver.
    pub fn latest(&self, driver_id: Uuid) -> Option<DriverPosition> {
        self.samples.read().get(&driver_id).and_then(|r| r.back().cloned())
    }

    /// All retained samples, oldest first.
    pub fn trail(&self, driver_id: Uuid) -> Vec<DriverPosition> {
        self.samples
            .read()
            .get(&driver_id)
            .map(|r| r.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop a driver's ring (end of shift).
    pub fn clear(&self, driver_id: Uuid) {
        self.samples.write().remove(&driver_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Coordinates;
    use chrono::Utc;

    fn position(driver_id: Uuid, lat: f64) -> DriverPosition {
        DriverPosition {
            driver_id,
            location: Coordinates { lat, lng: 121.5 },
            speed: 8.0,
            heading: 90.0,
            recorded_at: Utc::now(),
            route_id: None,
            stop_position: None,
        }
    }

    #[test]
    fn test_ring_bounded() {
        let presence = Presence::new(3);
        let driver = Uuid::new_v4();
        for i in 0..5 {
            presence.record(position(driver, 25.0 + i as f64 * 0.01));
        }

        let trail = presence.trail(driver);
        assert_eq!(trail.len(), 3);
        // Oldest two fell off.
        assert!((trail[0].location.lat - 25.02).abs() < 1e-9);
        assert!((presence.latest(driver).unwrap().location.lat - 25.04).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_driver_empty() {
        let presence = Presence::new(4);
        assert!(presence.latest(Uuid::new_v4()).is_none());
        assert!(presence.trail(Uuid::new_v4()).is_empty());
    }

    #[test]
    fn test_clear() {
        let presence = Presence::new(4);
        let driver = Uuid::new_v4();
        presence.record(position(driver, 25.0));
        presence.clear(driver);
        assert!(presence.latest(driver).is_none());
    }
}
