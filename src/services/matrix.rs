//! Matrix service: cache + routing provider + approximation fallback
//!
//! The solver asks this service for a full square matrix over its points.
//! Cached pairs are served without touching the provider; on any miss the
//! provider is queried once for the whole square (guarded by a per-call
//! timeout and a circuit breaker) and the result is cached. When the
//! provider is down and approximation is allowed, missing pairs are filled
//! with haversine estimates and the matrix is flagged approximate.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{CoreError, CoreResult};
use crate::services::breaker::CircuitBreaker;
use crate::services::geo;
use crate::services::matrix_cache::{bucket_for_minute, MatrixCache, MatrixSource, MatrixValue};
use crate::services::routing::{RouteDirections, RoutingProvider, TravelMatrix};
use crate::types::Coordinates;

/// A square matrix plus whether any entry came from approximation.
#[derive(Debug, Clone)]
pub struct BuiltMatrix {
    pub travel: TravelMatrix,
    pub approximate: bool,
}

pub struct MatrixService {
    cache: Arc<MatrixCache>,
    provider: Arc<dyn RoutingProvider>,
    breaker: CircuitBreaker,
    matrix_timeout: Duration,
    directions_timeout: Duration,
    approx_speed_kmh: f64,
    allow_approximation: bool,
}

impl MatrixService {
    pub fn new(
        cache: Arc<MatrixCache>,
        provider: Arc<dyn RoutingProvider>,
        matrix_timeout: Duration,
        directions_timeout: Duration,
        approx_speed_kmh: f64,
        allow_approximation: bool,
    ) -> Self {
        Self {
            cache,
            provider,
            breaker: CircuitBreaker::with_defaults(),
            matrix_timeout,
            directions_timeout,
            approx_speed_kmh,
            allow_approximation,
        }
    }

    /// Build the full square matrix over `points` for the given departure.
    pub async fn square_matrix(
        &self,
        points: &[Coordinates],
        depart_minute: u32,
    ) -> CoreResult<BuiltMatrix> {
        let n = points.len();
        if n == 0 {
            return Ok(BuiltMatrix { travel: TravelMatrix::empty(), approximate: false });
        }

        let bucket = bucket_for_minute(depart_minute);

        let mut distances = vec![vec![0u64; n]; n];
        let mut durations = vec![vec![0u64; n]; n];
        let mut misses = 0usize;

        for i in 0..n {
            for j in 0..n {
                if i == j {
                    continue;
                }
                match self.cache.get(&points[i], &points[j], bucket) {
                    Some(v) => {
                        distances[i][j] = v.distance_m;
                        durations[i][j] = v.duration_s;
                    }
                    None => misses += 1,
                }
            }
        }

        if misses == 0 {
            debug!("matrix fully served from cache ({} points)", n);
            return Ok(BuiltMatrix {
                travel: TravelMatrix { distances, durations },
                approximate: false,
            });
        }

        match self.fetch_square(points, depart_minute).await {
            Ok(travel) => {
                for i in 0..n {
                    for j in 0..n {
                        if i != j {
                            self.cache.put(
                                &points[i],
                                &points[j],
                                bucket,
                                MatrixValue {
                                    distance_m: travel.distance(i, j),
                                    duration_s: travel.duration(i, j),
                                    source: MatrixSource::Provider,
                                },
                            );
                        }
                    }
                }
                Ok(BuiltMatrix { travel, approximate: false })
            }
            Err(err) => {
                if !self.allow_approximation {
                    return Err(err);
                }
                warn!("routing provider unavailable, approximating {} missing pairs: {}", misses, err);
                for i in 0..n {
                    for j in 0..n {
                        if i == j {
                            continue;
                        }
                        if self.cache.get(&points[i], &points[j], bucket).is_none() {
                            let d = geo::approx_road_distance_m(&points[i], &points[j]);
                            let t = geo::approx_travel_time_s(&points[i], &points[j], self.approx_speed_kmh);
                            distances[i][j] = d;
                            durations[i][j] = t;
                            self.cache.put(
                                &points[i],
                                &points[j],
                                bucket,
                                MatrixValue { distance_m: d, duration_s: t, source: MatrixSource::Approximate },
                            );
                        }
                    }
                }
                Ok(BuiltMatrix {
                    travel: TravelMatrix { distances, durations },
                    approximate: true,
                })
            }
        }
    }

    /// Directions for one tour. No approximation here: callers that can live
    /// with a straight-line polyline build it themselves.
    pub async fn directions(
        &self,
        waypoints: &[Coordinates],
        depart_minute: u32,
    ) -> CoreResult<RouteDirections> {
        if self.breaker.is_open() {
            return Err(CoreError::provider("routing", "circuit open"));
        }

        let call = self.provider.directions(waypoints, depart_minute);
        match tokio::time::timeout(self.directions_timeout, call).await {
            Ok(Ok(directions)) => {
                self.breaker.record_success();
                Ok(directions)
            }
            Ok(Err(err)) => {
                self.breaker.record_failure();
                Err(CoreError::provider("routing", err.to_string()))
            }
            Err(_) => {
                self.breaker.record_failure();
                Err(CoreError::provider("routing", "directions call timed out"))
            }
        }
    }

    async fn fetch_square(&self, points: &[Coordinates], depart_minute: u32) -> CoreResult<TravelMatrix> {
        if self.breaker.is_open() {
            return Err(CoreError::provider("routing", "circuit open"));
        }

        let call = self.provider.matrix(points, depart_minute);
        match tokio::time::timeout(self.matrix_timeout, call).await {
            Ok(Ok(travel)) => {
                self.breaker.record_success();
                Ok(travel)
            }
            Ok(Err(err)) => {
                self.breaker.record_failure();
                Err(CoreError::provider("routing", err.to_string()))
            }
            Err(_) => {
                self.breaker.record_failure();
                Err(CoreError::provider("routing", "matrix call timed out"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::routing::MockRoutingProvider;
    use anyhow::Result as AnyResult;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn points() -> Vec<Coordinates> {
        vec![
            Coordinates { lat: 25.048, lng: 121.532 },
            Coordinates { lat: 25.050, lng: 121.540 },
            Coordinates { lat: 25.045, lng: 121.530 },
        ]
    }

    fn service(provider: Arc<dyn RoutingProvider>, allow_approximation: bool) -> MatrixService {
        MatrixService::new(
            Arc::new(MatrixCache::new(1000, Duration::from_secs(3600))),
            provider,
            Duration::from_secs(10),
            Duration::from_secs(15),
            30.0,
            allow_approximation,
        )
    }

    /// Provider that counts calls and optionally always fails.
    struct CountingProvider {
        inner: MockRoutingProvider,
        calls: AtomicU32,
        fail: bool,
    }

    impl CountingProvider {
        fn new(fail: bool) -> Self {
            Self { inner: MockRoutingProvider::new(), calls: AtomicU32::new(0), fail }
        }
    }

    #[async_trait]
    impl RoutingProvider for CountingProvider {
        async fn matrix(&self, locations: &[Coordinates], depart_minute: u32) -> AnyResult<TravelMatrix> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("provider down");
            }
            self.inner.matrix(locations, depart_minute).await
        }

        async fn directions(&self, waypoints: &[Coordinates], depart_minute: u32) -> AnyResult<RouteDirections> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("provider down");
            }
            self.inner.directions(waypoints, depart_minute).await
        }

        fn name(&self) -> &'static str {
            "counting"
        }
    }

    #[tokio::test]
    async fn test_second_build_served_from_cache() {
        let provider = Arc::new(CountingProvider::new(false));
        let svc = service(provider.clone(), true);

        let first = svc.square_matrix(&points(), 540).await.unwrap();
        assert!(!first.approximate);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);

        let second = svc.square_matrix(&points(), 540).await.unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1, "no second provider call");
        assert_eq!(second.travel.distance(0, 1), first.travel.distance(0, 1));
    }

    #[tokio::test]
    async fn test_different_bucket_refetches() {
        let provider = Arc::new(CountingProvider::new(false));
        let svc = service(provider.clone(), true);

        svc.square_matrix(&points(), 540).await.unwrap();
        svc.square_matrix(&points(), 600).await.unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_provider_down_approximates() {
        let svc = service(Arc::new(CountingProvider::new(true)), true);
        let built = svc.square_matrix(&points(), 540).await.unwrap();
        assert!(built.approximate);
        assert!(built.travel.distance(0, 1) > 0);
    }

    #[tokio::test]
    async fn test_provider_down_no_approximation_errors() {
        let svc = service(Arc::new(CountingProvider::new(true)), false);
        let err = svc.square_matrix(&points(), 540).await.unwrap_err();
        assert_eq!(err.code(), "PROVIDER_UNAVAILABLE");
    }

    #[tokio::test]
    async fn test_empty_points() {
        let svc = service(Arc::new(MockRoutingProvider::new()), true);
        let built = svc.square_matrix(&[], 540).await.unwrap();
        assert!(built.travel.distances.is_empty());
        assert!(!built.approximate);
    }

    #[tokio::test]
    async fn test_directions_pass_through() {
        let svc = service(Arc::new(MockRoutingProvider::new()), true);
        let dirs = svc.directions(&points(), 540).await.unwrap();
        assert!(dirs.distance_m > 0);
        assert!(!dirs.polyline.is_empty());
    }

    #[tokio::test]
    async fn test_directions_provider_down_surfaces() {
        let svc = service(Arc::new(CountingProvider::new(true)), true);
        let err = svc.directions(&points(), 540).await.unwrap_err();
        assert_eq!(err.code(), "PROVIDER_UNAVAILABLE");
    }
}
