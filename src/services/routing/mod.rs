//! Routing provider abstraction
//!
//! Uses Valhalla for production, mock for tests.

mod valhalla;
pub mod polyline;

pub use valhalla::{ValhallaClient, ValhallaConfig};

use anyhow::Result;
use async_trait::async_trait;

use crate::services::geo;
use crate::types::Coordinates;

/// Pairwise distance/time matrices between locations.
#[derive(Debug, Clone)]
pub struct TravelMatrix {
    /// Distance in meters [i][j] from origin i to destination j
    pub distances: Vec<Vec<u64>>,
    /// Duration in seconds [i][j] from origin i to destination j
    pub durations: Vec<Vec<u64>>,
}

impl TravelMatrix {
    pub fn empty() -> Self {
        Self { distances: vec![], durations: vec![] }
    }

    pub fn distance(&self, from: usize, to: usize) -> u64 {
        self.distances[from][to]
    }

    pub fn duration(&self, from: usize, to: usize) -> u64 {
        self.durations[from][to]
    }
}

/// Turn-by-turn directions result for one waypoint sequence.
#[derive(Debug, Clone)]
pub struct RouteDirections {
    pub distance_m: u64,
    pub duration_s: u64,
    /// Encoded polyline (precision 6).
    pub polyline: String,
}

/// Routing provider trait for abstraction (Valhalla, mock, etc.)
#[async_trait]
pub trait RoutingProvider: Send + Sync {
    /// Square matrix over `locations` for the given departure minute.
    async fn matrix(&self, locations: &[Coordinates], depart_minute: u32) -> Result<TravelMatrix>;

    /// Directions along `waypoints` in order.
    async fn directions(&self, waypoints: &[Coordinates], depart_minute: u32) -> Result<RouteDirections>;

    /// Provider name for logging
    fn name(&self) -> &'static str;
}

/// Mock routing provider for tests and offline development.
/// Uses haversine distance × road coefficient at a fixed average speed.
pub struct MockRoutingProvider {
    average_speed_kmh: f64,
}

impl Default for MockRoutingProvider {
    fn default() -> Self {
        Self { average_speed_kmh: 30.0 }
    }
}

impl MockRoutingProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_speed(average_speed_kmh: f64) -> Self {
        Self { average_speed_kmh }
    }
}

#[async_trait]
impl RoutingProvider for MockRoutingProvider {
    async fn matrix(&self, locations: &[Coordinates], _depart_minute: u32) -> Result<TravelMatrix> {
        let n = locations.len();
        if n == 0 {
            return Ok(TravelMatrix::empty());
        }

        let mut distances = vec![vec![0u64; n]; n];
        let mut durations = vec![vec![0u64; n]; n];

        for i in 0..n {
            for j in 0..n {
                if i != j {
                    distances[i][j] = geo::approx_road_distance_m(&locations[i], &locations[j]);
                    durations[i][j] =
                        geo::approx_travel_time_s(&locations[i], &locations[j], self.average_speed_kmh);
                }
            }
        }

        Ok(TravelMatrix { distances, durations })
    }

    async fn directions(&self, waypoints: &[Coordinates], _depart_minute: u32) -> Result<RouteDirections> {
        let mut distance_m = 0u64;
        let mut duration_s = 0u64;
        for pair in waypoints.windows(2) {
            distance_m += geo::approx_road_distance_m(&pair[0], &pair[1]);
            duration_s += geo::approx_travel_time_s(&pair[0], &pair[1], self.average_speed_kmh);
        }

        Ok(RouteDirections {
            distance_m,
            duration_s,
            polyline: polyline::encode(waypoints, 6),
        })
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

/// Create a routing provider with automatic Valhalla detection and fallback.
///
/// Tries Valhalla if a URL is provided, falls back to the mock provider when
/// it is unavailable or not configured.
pub async fn create_routing_provider_with_fallback(
    valhalla_url: Option<String>,
) -> Box<dyn RoutingProvider> {
    use tracing::{info, warn};

    if let Some(url) = valhalla_url {
        let client = ValhallaClient::new(ValhallaConfig::new(&url));
        match client.health_check().await {
            Ok(()) => {
                info!("Valhalla routing provider available at {}", url);
                return Box::new(client);
            }
            Err(e) => {
                warn!("Valhalla not available at {}: {}. Falling back to mock routing.", url, e);
            }
        }
    }

    info!("Using mock routing provider (Valhalla not configured or unavailable)");
    Box::new(MockRoutingProvider::new())
}
