//! Geographic calculations

use crate::types::Coordinates;

/// Earth radius in meters
const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Road distance coefficient (straight line to road)
pub const ROAD_COEFFICIENT: f64 = 1.3;

/// Calculate Haversine distance between two points in meters
pub fn haversine_distance_m(from: &Coordinates, to: &Coordinates) -> f64 {
    let d_lat = (to.lat - from.lat).to_radians();
    let d_lon = (to.lng - from.lng).to_radians();

    let lat1 = from.lat.to_radians();
    let lat2 = to.lat.to_radians();

    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);

    let c = 2.0 * a.sqrt().asin();

    EARTH_RADIUS_M * c
}

/// Estimate road distance in meters from straight-line distance
pub fn approx_road_distance_m(from: &Coordinates, to: &Coordinates) -> u64 {
    (haversine_distance_m(from, to) * ROAD_COEFFICIENT) as u64
}

/// Estimate travel time in seconds at the given average speed
pub fn approx_travel_time_s(from: &Coordinates, to: &Coordinates, speed_kmh: f64) -> u64 {
    let distance_m = approx_road_distance_m(from, to) as f64;
    (distance_m / (speed_kmh * 1000.0) * 3600.0) as u64
}
