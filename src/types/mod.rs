#![allow(dead_code)]
//! Type definitions
//!
//! Wire types for the bus and job surfaces are consumed by external
//! transports as well as the core itself.

pub mod customer;
pub mod driver;
pub mod event;
pub mod job;
pub mod optimize;
pub mod order;
pub mod prediction;
pub mod route;

pub use customer::*;
pub use driver::*;
pub use event::*;
pub use job::*;
pub use optimize::*;
pub use order::*;
pub use prediction::*;
pub use route::*;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Geographic coordinates (WGS84)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lng: f64,
}

impl Coordinates {
    /// Round to 5 decimal places (~1 m resolution, ~10 m grid stability)
    /// so near-identical points hash to the same cache key.
    pub fn rounded(&self) -> (i64, i64) {
        (
            (self.lat * 100_000.0).round() as i64,
            (self.lng * 100_000.0).round() as i64,
        )
    }
}

// ==========================================================================
// Cylinder sizes and per-size counts
// ==========================================================================

/// The fixed set of cylinder sizes the operation trades in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CylinderSize {
    Kg4,
    Kg10,
    Kg16,
    Kg20,
    Kg50,
}

impl CylinderSize {
    pub const ALL: [CylinderSize; 5] = [
        CylinderSize::Kg4,
        CylinderSize::Kg10,
        CylinderSize::Kg16,
        CylinderSize::Kg20,
        CylinderSize::Kg50,
    ];

    /// Wire label, e.g. `"20kg"`.
    pub fn label(&self) -> &'static str {
        match self {
            CylinderSize::Kg4 => "4kg",
            CylinderSize::Kg10 => "10kg",
            CylinderSize::Kg16 => "16kg",
            CylinderSize::Kg20 => "20kg",
            CylinderSize::Kg50 => "50kg",
        }
    }

    pub fn parse(label: &str) -> Option<Self> {
        match label {
            "4kg" => Some(CylinderSize::Kg4),
            "10kg" => Some(CylinderSize::Kg10),
            "16kg" => Some(CylinderSize::Kg16),
            "20kg" => Some(CylinderSize::Kg20),
            "50kg" => Some(CylinderSize::Kg50),
            _ => None,
        }
    }
}

/// A statically-shaped count per cylinder size.
///
/// Used for both order demand and vehicle capacity. Serializes as the wire
/// mapping `{"20kg": 2, ...}` with zero counts omitted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SizeCount {
    pub kg4: u32,
    pub kg10: u32,
    pub kg16: u32,
    pub kg20: u32,
    pub kg50: u32,
}

impl SizeCount {
    pub fn get(&self, size: CylinderSize) -> u32 {
        match size {
            CylinderSize::Kg4 => self.kg4,
            CylinderSize::Kg10 => self.kg10,
            CylinderSize::Kg16 => self.kg16,
            CylinderSize::Kg20 => self.kg20,
            CylinderSize::Kg50 => self.kg50,
        }
    }

    pub fn set(&mut self, size: CylinderSize, count: u32) {
        match size {
            CylinderSize::Kg4 => self.kg4 = count,
            CylinderSize::Kg10 => self.kg10 = count,
            CylinderSize::Kg16 => self.kg16 = count,
            CylinderSize::Kg20 => self.kg20 = count,
            CylinderSize::Kg50 => self.kg50 = count,
        }
    }

    /// Single-size constructor, mostly for tests and drafts.
    pub fn of(size: CylinderSize, count: u32) -> Self {
        let mut sc = Self::default();
        sc.set(size, count);
        sc
    }

    pub fn is_empty(&self) -> bool {
        CylinderSize::ALL.iter().all(|s| self.get(*s) == 0)
    }

    pub fn total(&self) -> u32 {
        CylinderSize::ALL.iter().map(|s| self.get(*s)).sum()
    }

    pub fn add(&mut self, other: &SizeCount) {
        for size in CylinderSize::ALL {
            self.set(size, self.get(size) + other.get(size));
        }
    }

    /// True when every per-size count fits within `capacity`.
    pub fn fits_within(&self, capacity: &SizeCount) -> bool {
        CylinderSize::ALL
            .iter()
            .all(|s| self.get(*s) <= capacity.get(*s))
    }

    pub fn iter(&self) -> impl Iterator<Item = (CylinderSize, u32)> + '_ {
        CylinderSize::ALL.into_iter().map(|s| (s, self.get(s)))
    }
}

impl Serialize for SizeCount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        let non_zero = self.iter().filter(|(_, c)| *c > 0).count();
        let mut map = serializer.serialize_map(Some(non_zero))?;
        for (size, count) in self.iter() {
            if count > 0 {
                map.serialize_entry(size.label(), &count)?;
            }
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for SizeCount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = std::collections::BTreeMap::<String, u32>::deserialize(deserializer)?;
        let mut sc = SizeCount::default();
        for (label, count) in raw {
            let size = CylinderSize::parse(&label)
                .ok_or_else(|| D::Error::custom(format!("unknown cylinder size '{}'", label)))?;
            sc.set(size, count);
        }
        Ok(sc)
    }
}

// ==========================================================================
// Time windows (minutes from operating-day start)
// ==========================================================================

/// Inclusive time interval in minutes from the operating-day start.
///
/// Serializes as the wire pair `["08:00", "18:00"]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start_minute: u32,
    pub end_minute: u32,
}

impl TimeWindow {
    pub fn new(start_minute: u32, end_minute: u32) -> Self {
        Self { start_minute, end_minute }
    }

    pub fn contains(&self, minute: u32) -> bool {
        minute >= self.start_minute && minute <= self.end_minute
    }

    pub fn duration_minutes(&self) -> u32 {
        self.end_minute.saturating_sub(self.start_minute)
    }

    /// The smallest window covering both, used when welding atomic stops.
    pub fn union(&self, other: &TimeWindow) -> TimeWindow {
        TimeWindow {
            start_minute: self.start_minute.min(other.start_minute),
            end_minute: self.end_minute.max(other.end_minute),
        }
    }

    /// Parse `"hh:mm"` into minutes from day start.
    pub fn parse_minute(s: &str) -> Option<u32> {
        let (h, m) = s.split_once(':')?;
        let h: u32 = h.parse().ok()?;
        let m: u32 = m.parse().ok()?;
        if h > 47 || m > 59 {
            return None;
        }
        Some(h * 60 + m)
    }

    pub fn format_minute(minute: u32) -> String {
        format!("{:02}:{:02}", minute / 60, minute % 60)
    }
}

impl Serialize for TimeWindow {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        (
            TimeWindow::format_minute(self.start_minute),
            TimeWindow::format_minute(self.end_minute),
        )
            .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for TimeWindow {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let (start, end) = <(String, String)>::deserialize(deserializer)?;
        let start_minute = TimeWindow::parse_minute(&start)
            .ok_or_else(|| D::Error::custom(format!("invalid time '{}'", start)))?;
        let end_minute = TimeWindow::parse_minute(&end)
            .ok_or_else(|| D::Error::custom(format!("invalid time '{}'", end)))?;
        if end_minute < start_minute {
            return Err(D::Error::custom("window end precedes start"));
        }
        Ok(TimeWindow { start_minute, end_minute })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coordinates_rounding_stable() {
        let a = Coordinates { lat: 25.048001, lng: 121.532004 };
        let b = Coordinates { lat: 25.048004, lng: 121.531996 };
        assert_eq!(a.rounded(), b.rounded());
    }

    #[test]
    fn test_size_count_wire_mapping() {
        let sc = SizeCount { kg20: 2, kg4: 1, ..Default::default() };
        let json = serde_json::to_string(&sc).unwrap();
        assert!(json.contains("\"20kg\":2"));
        assert!(json.contains("\"4kg\":1"));
        assert!(!json.contains("50kg"), "zero counts must be omitted: {}", json);

        let back: SizeCount = serde_json::from_str(&json).unwrap();
        assert_eq!(back, sc);
    }

    #[test]
    fn test_size_count_rejects_unknown_size() {
        let result: Result<SizeCount, _> = serde_json::from_str(r#"{"12kg": 1}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_size_count_fits_within() {
        let demand = SizeCount { kg20: 6, kg10: 1, ..Default::default() };
        let cap = SizeCount { kg20: 20, kg10: 4, kg50: 2, ..Default::default() };
        assert!(demand.fits_within(&cap));

        let too_big = SizeCount { kg16: 1, ..Default::default() };
        assert!(!too_big.fits_within(&cap));
    }

    #[test]
    fn test_time_window_wire_pair() {
        let tw = TimeWindow::new(540, 1020);
        let json = serde_json::to_string(&tw).unwrap();
        assert_eq!(json, r#"["09:00","17:00"]"#);

        let back: TimeWindow = serde_json::from_str(&json).unwrap();
        assert_eq!(back, tw);
    }

    #[test]
    fn test_time_window_rejects_inverted() {
        let result: Result<TimeWindow, _> = serde_json::from_str(r#"["17:00","09:00"]"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_time_window_union() {
        let a = TimeWindow::new(540, 720);
        let b = TimeWindow::new(600, 1020);
        assert_eq!(a.union(&b), TimeWindow::new(540, 1020));
    }

    #[test]
    fn test_parse_minute() {
        assert_eq!(TimeWindow::parse_minute("08:30"), Some(510));
        assert_eq!(TimeWindow::parse_minute("24:00"), Some(1440));
        assert_eq!(TimeWindow::parse_minute("8h30"), None);
        assert_eq!(TimeWindow::parse_minute("08:61"), None);
    }
}
