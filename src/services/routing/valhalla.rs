//! Valhalla routing engine client
//!
//! Valhalla API documentation:
//! https://valhalla.github.io/valhalla/api/matrix/api-reference/

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::types::{Coordinates, TimeWindow};
use super::{polyline, RouteDirections, RoutingProvider, TravelMatrix};

/// Valhalla client configuration
#[derive(Debug, Clone)]
pub struct ValhallaConfig {
    /// Base URL of Valhalla server (e.g., "http://localhost:8002")
    pub base_url: String,
    /// Request timeout in seconds
    pub timeout_seconds: u64,
}

impl Default for ValhallaConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8002".to_string(),
            timeout_seconds: 15,
        }
    }
}

impl ValhallaConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Default::default()
        }
    }
}

/// Valhalla routing client
pub struct ValhallaClient {
    client: Client,
    config: ValhallaConfig,
}

impl ValhallaClient {
    pub fn new(config: ValhallaConfig) -> Self {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_seconds))
            .build()
            .expect("Failed to create HTTP client");

        Self { client, config }
    }

    /// Probe the status endpoint.
    pub async fn health_check(&self) -> Result<()> {
        let url = format!("{}/status", self.config.base_url);
        let response = self.client.get(&url).send().await?;
        if response.status().is_success() {
            Ok(())
        } else {
            anyhow::bail!("Valhalla returned status {}", response.status())
        }
    }

    fn locations(points: &[Coordinates]) -> Vec<ValhallaLocation> {
        points
            .iter()
            .map(|c| ValhallaLocation {
                lat: c.lat,
                lon: c.lng,
                // 500m snap radius: customer coordinates are building
                // centroids that may sit off the road edge
                radius: Some(500),
            })
            .collect()
    }

    fn depart_time(depart_minute: u32) -> String {
        // Valhalla takes a local "today at hh:mm" departure for time-aware
        // costing; the operating day starts at midnight.
        format!("current:{}", TimeWindow::format_minute(depart_minute))
    }
}

#[async_trait]
impl RoutingProvider for ValhallaClient {
    async fn matrix(&self, locations: &[Coordinates], depart_minute: u32) -> Result<TravelMatrix> {
        let n = locations.len();

        if n == 0 {
            return Ok(TravelMatrix::empty());
        }
        if n == 1 {
            return Ok(TravelMatrix {
                distances: vec![vec![0]],
                durations: vec![vec![0]],
            });
        }

        let locs = Self::locations(locations);
        let request = MatrixRequest {
            sources: locs.clone(),
            targets: locs,
            costing: "auto".to_string(),
            units: "kilometers".to_string(),
            date_time: Some(Self::depart_time(depart_minute)),
        };
        let url = format!("{}/sources_to_targets", self.config.base_url);

        debug!("Requesting distance matrix from Valhalla for {} locations", n);

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .context("Failed to send matrix request to Valhalla")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Valhalla matrix returned error {}: {}", status, body);
        }

        let matrix_response: MatrixResponse = response
            .json()
            .await
            .context("Failed to parse Valhalla matrix response")?;

        let mut distances = vec![vec![0u64; n]; n];
        let mut durations = vec![vec![0u64; n]; n];

        for (i, row) in matrix_response.sources_to_targets.iter().enumerate() {
            for (j, cell) in row.iter().enumerate() {
                // Distance comes back in kilometers
                distances[i][j] = cell.distance.map(|d| (d * 1000.0) as u64).unwrap_or_else(|| {
                    warn!("No distance for pair {} -> {}", i, j);
                    u64::MAX / 2
                });
                durations[i][j] = cell.time.map(|t| t as u64).unwrap_or_else(|| {
                    warn!("No duration for pair {} -> {}", i, j);
                    u64::MAX / 2
                });
            }
        }

        Ok(TravelMatrix { distances, durations })
    }

    async fn directions(&self, waypoints: &[Coordinates], depart_minute: u32) -> Result<RouteDirections> {
        if waypoints.len() < 2 {
            return Ok(RouteDirections {
                distance_m: 0,
                duration_s: 0,
                polyline: String::new(),
            });
        }

        let request = RouteRequest {
            locations: Self::locations(waypoints),
            costing: "auto".to_string(),
            // Geometry only; no turn-by-turn narrative needed
            directions_type: "none".to_string(),
            date_time: Some(Self::depart_time(depart_minute)),
        };
        let url = format!("{}/route", self.config.base_url);

        debug!("Requesting directions from Valhalla for {} waypoints", waypoints.len());

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .context("Failed to send route request to Valhalla")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Valhalla route returned error {}: {}", status, body);
        }

        let route_response: RouteResponse = response
            .json()
            .await
            .context("Failed to parse Valhalla route response")?;

        let trip = route_response.trip;
        let shapes: Vec<String> = trip.legs.into_iter().map(|l| l.shape).collect();
        let joined = polyline::join_legs(&shapes, 6)?;

        Ok(RouteDirections {
            distance_m: (trip.summary.length * 1000.0) as u64,
            duration_s: trip.summary.time as u64,
            polyline: joined,
        })
    }

    fn name(&self) -> &'static str {
        "valhalla"
    }
}

// Valhalla API types

#[derive(Debug, Serialize, Clone)]
struct ValhallaLocation {
    lat: f64,
    lon: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    radius: Option<u32>,
}

#[derive(Debug, Serialize)]
struct MatrixRequest {
    sources: Vec<ValhallaLocation>,
    targets: Vec<ValhallaLocation>,
    costing: String,
    units: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    date_time: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MatrixResponse {
    sources_to_targets: Vec<Vec<MatrixCell>>,
}

#[derive(Debug, Deserialize)]
struct MatrixCell {
    /// Distance in kilometers (when units="kilometers")
    distance: Option<f64>,
    /// Time in seconds
    time: Option<f64>,
}

#[derive(Debug, Serialize)]
struct RouteRequest {
    locations: Vec<ValhallaLocation>,
    costing: String,
    directions_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    date_time: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RouteResponse {
    trip: Trip,
}

#[derive(Debug, Deserialize)]
struct Trip {
    legs: Vec<Leg>,
    summary: TripSummary,
}

#[derive(Debug, Deserialize)]
struct Leg {
    /// Encoded polyline shape
    shape: String,
}

#[derive(Debug, Deserialize)]
struct TripSummary {
    /// Kilometers
    length: f64,
    /// Seconds
    time: f64,
}
