//! VRP (Vehicle Routing Problem) solver
//!
//! Capacity- and time-window-constrained routing under a wall-clock budget:
//! cheapest-insertion construction followed by guided local search. The
//! search is seeded and deterministic for a given input and budget.

pub mod problem;
pub mod search;
pub mod solution;

pub use problem::{OrderInput, SolverStop, SolverVehicle, VehicleInput, VrpProblem};
pub use search::{SearchOutcome, SearchParams};
pub use solution::{PlannedDelivery, VehiclePlan, VrpSolution};

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::{CoreError, CoreResult};
use crate::services::matrix::MatrixService;
use crate::types::Objective;

/// Solver configuration
#[derive(Debug, Clone)]
pub struct SolverConfig {
    /// Default wall-clock budget in milliseconds
    pub default_budget_ms: u64,
    /// Hard ceiling on any requested budget
    pub budget_ceiling_ms: u64,
    /// Give up improving after this long without a better incumbent
    pub patience_ms: u64,
    /// Search seed; fixed so identical inputs reproduce identical output
    pub seed: u64,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            default_budget_ms: 30_000,
            budget_ceiling_ms: 120_000,
            patience_ms: 5_000,
            seed: 0x6a5_11e,
        }
    }
}

impl SolverConfig {
    /// Fast configuration for tests and interactive calls.
    pub fn fast() -> Self {
        Self {
            default_budget_ms: 2_000,
            patience_ms: 300,
            ..Default::default()
        }
    }
}

/// VRP solver: builds the travel matrix through the matrix service, runs the
/// constrained search on a blocking thread, and shapes the output.
pub struct VrpSolver {
    matrix: Arc<MatrixService>,
    config: SolverConfig,
}

impl VrpSolver {
    pub fn new(matrix: Arc<MatrixService>, config: SolverConfig) -> Self {
        Self { matrix, config }
    }

    /// Solve one operating day.
    ///
    /// Cancellation is observed at search checkpoints; a cancelled solve
    /// returns `CoreError::Cancelled` and produces nothing. A provider
    /// outage with approximation disabled surfaces as
    /// `CoreError::ProviderUnavailable` (no matrix, nothing to solve on).
    pub async fn solve(
        &self,
        problem: VrpProblem,
        objective: Objective,
        budget_ms: Option<u64>,
        cancel: CancellationToken,
    ) -> CoreResult<VrpSolution> {
        let started = Instant::now();
        let vehicle_ids: Vec<_> = problem.vehicles.iter().map(|v| v.id).collect();

        if problem.stops.is_empty() {
            let mut solution = VrpSolution::empty(&vehicle_ids, "none");
            solution.solve_time_ms = started.elapsed().as_millis() as u64;
            return Ok(solution);
        }

        // Matrix departure bucket: the earliest shift start of the fleet.
        let depart_minute = problem
            .vehicles
            .iter()
            .map(|v| v.shift.start_minute)
            .min()
            .unwrap_or(0);

        let built = self.matrix.square_matrix(&problem.points, depart_minute).await?;

        let budget = budget_ms
            .unwrap_or(self.config.default_budget_ms)
            .min(self.config.budget_ceiling_ms);
        let params = SearchParams {
            objective,
            budget: Duration::from_millis(budget),
            patience: Duration::from_millis(self.config.patience_ms),
            seed: self.config.seed,
        };

        info!(
            "solving day: {} stops, {} vehicles, budget {} ms, objective {:?}",
            problem.stops.len(),
            problem.vehicles.len(),
            budget,
            objective
        );

        // CPU-bound search runs on one blocking thread per job.
        let search_cancel = cancel.clone();
        let travel = built.travel;
        let (problem, outcome) = tokio::task::spawn_blocking(move || {
            let outcome = search::search(&problem, &travel, &params, &search_cancel);
            (problem, outcome)
        })
        .await
        .map_err(CoreError::internal)?;
        let outcome = outcome?;

        if outcome.cancelled {
            return Err(CoreError::Cancelled);
        }

        let mut solution = Self::shape(&problem, outcome);
        solution.approximate = built.approximate;
        if solution.approximate {
            // Approximate costs make this a fallback answer by definition.
            solution.fallback = true;
        }
        solution.solve_time_ms = started.elapsed().as_millis() as u64;

        info!(
            "solved: {} deliveries, {} unassigned, fallback={}, improved={}, {} ms",
            solution.plans.iter().map(|p| p.deliveries.len()).sum::<usize>(),
            solution.unassigned.len(),
            solution.fallback,
            solution.improved,
            solution.solve_time_ms
        );

        Ok(solution)
    }

    /// Solve the caller-facing wire format directly, without touching the
    /// store: the request carries its own vehicles and orders. Used by the
    /// request surface for what-if runs; `OptimizeDay` jobs persist through
    /// the assembler instead.
    pub async fn solve_request(
        &self,
        depot: crate::types::Coordinates,
        request: &crate::types::OptimizationRequest,
        cancel: CancellationToken,
    ) -> CoreResult<crate::types::OptimizationResponse> {
        let orders = request
            .orders
            .iter()
            .map(|o| OrderInput {
                id: o.id,
                customer_id: o.customer_id,
                location: crate::types::Coordinates { lat: o.location[0], lng: o.location[1] },
                demand: o.demand,
                window: o.window,
                service_minutes: o.service_minutes,
                priority: o.priority,
            })
            .collect();
        let vehicles = request
            .vehicles
            .iter()
            .map(|v| VehicleInput {
                id: v.id,
                capacity: v.capacity,
                shift: v.shift,
                start: Some(crate::types::Coordinates { lat: v.start[0], lng: v.start[1] }),
            })
            .collect();

        let problem = VrpProblem::build(depot, orders, vehicles, &[])?;
        let solution = self
            .solve(problem, request.objective, request.budget_ms, cancel)
            .await?;

        Ok(crate::types::OptimizationResponse {
            job_id: uuid::Uuid::nil(),
            fallback: solution.fallback,
            routes: solution
                .plans
                .iter()
                .map(|plan| crate::types::PlannedRouteSpec {
                    driver_id: plan.vehicle_id,
                    stops: plan
                        .deliveries
                        .iter()
                        .enumerate()
                        .map(|(i, d)| crate::types::PlannedStopSpec {
                            order_id: d.order_id,
                            seq: (i as u32) + 1,
                            arrival_minute: d.arrival_minute,
                            service_minutes: d.service_minutes,
                        })
                        .collect(),
                    distance_m: plan.distance_m,
                    duration_s: plan.duration_s,
                    polyline: String::new(),
                })
                .collect(),
            unassigned: solution
                .unassigned
                .iter()
                .map(|(order_id, reason)| crate::types::UnassignedSpec {
                    order_id: *order_id,
                    reason: *reason,
                })
                .collect(),
        })
    }

    fn shape(problem: &VrpProblem, outcome: SearchOutcome) -> VrpSolution {
        let method = if outcome.fallback {
            "insertion-fallback"
        } else if outcome.improved {
            "guided-local-search"
        } else {
            "cheapest-insertion"
        };

        let plans = problem
            .vehicles
            .iter()
            .enumerate()
            .map(|(v, vehicle)| {
                let schedule = &outcome.schedules[v];
                let mut deliveries = Vec::new();
                for (i, &k) in outcome.routes[v].iter().enumerate() {
                    let stop = &problem.stops[k];
                    // A welded stop expands to one delivery per order at the
                    // same arrival minute.
                    for (order_id, service) in
                        stop.order_ids.iter().zip(&stop.order_service_minutes)
                    {
                        deliveries.push(PlannedDelivery {
                            order_id: *order_id,
                            arrival_minute: schedule.arrivals[i],
                            service_minutes: *service,
                        });
                    }
                }
                VehiclePlan {
                    vehicle_id: vehicle.id,
                    deliveries,
                    distance_m: schedule.distance_m,
                    duration_s: schedule.duration_s,
                }
            })
            .collect();

        let unassigned = outcome
            .unassigned
            .iter()
            .flat_map(|(k, reason)| {
                problem.stops[*k].order_ids.iter().map(move |id| (*id, *reason))
            })
            .collect();

        VrpSolution {
            plans,
            unassigned,
            fallback: outcome.fallback,
            improved: outcome.improved,
            approximate: false,
            solve_time_ms: 0,
            method: method.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::matrix_cache::MatrixCache;
    use crate::services::routing::MockRoutingProvider;
    use crate::types::{Coordinates, CylinderSize, OrderPriority, SizeCount, TimeWindow};
    use uuid::Uuid;

    fn solver() -> VrpSolver {
        let cache = Arc::new(MatrixCache::new(10_000, Duration::from_secs(3600)));
        let matrix = Arc::new(MatrixService::new(
            cache,
            Arc::new(MockRoutingProvider::new()),
            Duration::from_secs(10),
            Duration::from_secs(15),
            30.0,
            true,
        ));
        VrpSolver::new(matrix, SolverConfig::fast())
    }

    fn depot() -> Coordinates {
        Coordinates { lat: 25.048, lng: 121.532 }
    }

    fn vehicle(kg20: u32) -> VehicleInput {
        VehicleInput {
            id: Uuid::new_v4(),
            capacity: SizeCount::of(CylinderSize::Kg20, kg20),
            shift: TimeWindow::new(480, 1080),
            start: None,
        }
    }

    fn order_at(lat: f64, lng: f64, kg20: u32) -> OrderInput {
        OrderInput {
            id: Uuid::new_v4(),
            customer_id: Uuid::new_v4(),
            location: Coordinates { lat, lng },
            demand: SizeCount::of(CylinderSize::Kg20, kg20),
            window: TimeWindow::new(540, 1020),
            service_minutes: 10,
            priority: OrderPriority::Normal,
        }
    }

    #[tokio::test]
    async fn test_single_vehicle_three_stops() {
        let orders = vec![
            order_at(25.050, 121.540, 2),
            order_at(25.045, 121.530, 1),
            order_at(25.055, 121.545, 3),
        ];
        let ids: Vec<Uuid> = orders.iter().map(|o| o.id).collect();
        let problem = VrpProblem::build(depot(), orders, vec![vehicle(20)], &[]).unwrap();

        let solution = solver()
            .solve(problem, Objective::Balanced, Some(2_000), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(solution.plans.len(), 1);
        assert_eq!(solution.plans[0].deliveries.len(), 3);
        assert!(solution.unassigned.is_empty());
        assert!(solution.covers_exactly(&ids));
        for d in &solution.plans[0].deliveries {
            assert!((540..=1020).contains(&d.arrival_minute));
        }
    }

    #[tokio::test]
    async fn test_empty_stops_empty_plans() {
        let problem = VrpProblem::build(depot(), vec![], vec![vehicle(20), vehicle(10)], &[]).unwrap();
        let solution = solver()
            .solve(problem, Objective::Balanced, None, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(solution.plans.len(), 2);
        assert!(solution.plans.iter().all(|p| p.deliveries.is_empty()));
        assert!(solution.unassigned.is_empty());
        assert!(!solution.fallback);
    }

    #[tokio::test]
    async fn test_welded_orders_ride_together() {
        let customer = Uuid::new_v4();
        let mut a = order_at(25.050, 121.540, 2);
        a.customer_id = customer;
        let mut b = order_at(25.050, 121.540, 3);
        b.customer_id = customer;
        let (id_a, id_b) = (a.id, b.id);

        let problem = VrpProblem::build(depot(), vec![a, b], vec![vehicle(20)], &[customer]).unwrap();
        let solution = solver()
            .solve(problem, Objective::Balanced, Some(1_000), CancellationToken::new())
            .await
            .unwrap();

        let deliveries = &solution.plans[0].deliveries;
        assert_eq!(deliveries.len(), 2);
        assert_eq!(deliveries[0].arrival_minute, deliveries[1].arrival_minute);
        let ids: Vec<Uuid> = deliveries.iter().map(|d| d.order_id).collect();
        assert!(ids.contains(&id_a) && ids.contains(&id_b));
    }

    #[tokio::test]
    async fn test_determinism_across_solves() {
        let orders = vec![
            order_at(25.050, 121.540, 2),
            order_at(25.045, 121.530, 1),
            order_at(25.055, 121.545, 3),
            order_at(25.041, 121.521, 2),
        ];
        let p1 = VrpProblem::build(depot(), orders.clone(), vec![vehicle(20)], &[]).unwrap();
        let p2 = VrpProblem::build(depot(), orders, vec![vehicle(20)], &[]).unwrap();

        let s = solver();
        let a = s.solve(p1, Objective::Balanced, Some(500), CancellationToken::new()).await.unwrap();
        let b = s.solve(p2, Objective::Balanced, Some(500), CancellationToken::new()).await.unwrap();

        let seq_a: Vec<Uuid> = a.plans[0].deliveries.iter().map(|d| d.order_id).collect();
        let seq_b: Vec<Uuid> = b.plans[0].deliveries.iter().map(|d| d.order_id).collect();
        assert_eq!(seq_a, seq_b);
    }

    #[tokio::test]
    async fn test_budget_ceiling_applied() {
        let s = solver();
        // A request far above the ceiling must still terminate promptly; the
        // fast config caps patience so this completes in well under a second.
        let problem = VrpProblem::build(depot(), vec![order_at(25.05, 121.54, 1)], vec![vehicle(10)], &[])
            .unwrap();
        let started = Instant::now();
        let solution = s
            .solve(problem, Objective::Balanced, Some(10_000_000), CancellationToken::new())
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(100));
        assert_eq!(solution.plans[0].deliveries.len(), 1);
    }

    #[tokio::test]
    async fn test_solve_request_wire_round_trip() {
        let json = r#"{
            "date": "2026-03-02",
            "vehicles": [{
                "id": "00000000-0000-0000-0000-000000000001",
                "capacity": {"20kg": 20},
                "shift": ["08:00", "18:00"],
                "start": [25.048, 121.532]
            }],
            "orders": [{
                "id": "00000000-0000-0000-0000-000000000002",
                "customerId": "00000000-0000-0000-0000-000000000003",
                "location": [25.050, 121.540],
                "demand": {"20kg": 2},
                "window": ["09:00", "17:00"],
                "serviceMinutes": 10
            }],
            "objective": "balanced",
            "budgetMs": 1000
        }"#;
        let request: crate::types::OptimizationRequest = serde_json::from_str(json).unwrap();

        let response = solver()
            .solve_request(depot(), &request, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(response.routes.len(), 1);
        assert_eq!(response.routes[0].stops.len(), 1);
        assert_eq!(response.routes[0].stops[0].seq, 1);
        assert!(response.unassigned.is_empty());
        assert!(!response.fallback);
    }

    #[tokio::test]
    async fn test_cancelled_solve_returns_cancelled() {
        let orders: Vec<OrderInput> =
            (0..6).map(|i| order_at(25.04 + 0.003 * i as f64, 121.52, 1)).collect();
        let problem = VrpProblem::build(depot(), orders, vec![vehicle(20)], &[]).unwrap();

        let token = CancellationToken::new();
        token.cancel();
        let err = solver()
            .solve(problem, Objective::Balanced, Some(60_000), token)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CANCELLED");
    }
}
