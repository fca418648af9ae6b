//! Constrained search: cheapest insertion + guided local search
//!
//! The search is deterministic for a given input and seed: neighborhoods are
//! scanned in a seeded but reproducible order, ties never replace an
//! incumbent, and penalization breaks ties by arc index.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{CoreError, CoreResult};
use crate::services::routing::TravelMatrix;
use crate::types::{Objective, OrderPriority, UnassignedReason};

use super::problem::VrpProblem;
use super::solution::{assignment_cost, evaluate_route, travel_minutes, Schedule};

/// Guided-local-search penalty weight relative to the mean arc cost.
const PENALTY_ALPHA: f64 = 0.3;

/// Penalization rounds without a true improvement before the search is
/// considered converged. A structural bound, not a wall-clock one, so small
/// instances terminate identically run to run.
const CONVERGENCE_ROUNDS: u32 = 40;

#[derive(Debug, Clone)]
pub struct SearchParams {
    pub objective: Objective,
    pub budget: Duration,
    /// Stop improving after this long without a better incumbent.
    pub patience: Duration,
    pub seed: u64,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            objective: Objective::Balanced,
            budget: Duration::from_secs(30),
            patience: Duration::from_secs(5),
            seed: 0x6a5_11e,
        }
    }
}

/// Raw search result over stop indices.
#[derive(Debug, Clone)]
pub struct SearchOutcome {
    /// Stop-index sequence per vehicle, aligned with `problem.vehicles`.
    pub routes: Vec<Vec<usize>>,
    pub schedules: Vec<Schedule>,
    pub unassigned: Vec<(usize, UnassignedReason)>,
    pub improved: bool,
    /// Construction could not finish inside the budget.
    pub fallback: bool,
    /// The caller's cancel token fired mid-search.
    pub cancelled: bool,
}

pub fn search(
    problem: &VrpProblem,
    matrix: &TravelMatrix,
    params: &SearchParams,
    cancel: &CancellationToken,
) -> CoreResult<SearchOutcome> {
    let started = Instant::now();
    let n_vehicles = problem.vehicles.len();

    let mut routes: Vec<Vec<usize>> = vec![vec![]; n_vehicles];
    let mut unassigned: Vec<(usize, UnassignedReason)> = Vec::new();

    // Pre-screen stops no vehicle could ever serve in isolation.
    let tm = |from: usize, to: usize| travel_minutes(matrix, from, to);
    let mut insertable: Vec<usize> = Vec::new();
    for k in 0..problem.stops.len() {
        match problem.screen_stop(k, tm) {
            Some(reason) => unassigned.push((k, reason)),
            None => insertable.push(k),
        }
    }

    // Cheapest insertion, urgent stops first.
    let mut fallback = false;
    for priority in [OrderPriority::Urgent, OrderPriority::Normal] {
        let mut pending: Vec<usize> = insertable
            .iter()
            .copied()
            .filter(|&k| problem.stops[k].priority == priority)
            .collect();

        while !pending.is_empty() {
            if cancel.is_cancelled() {
                let schedules = best_schedules(problem, matrix, &routes)?;
                for k in pending {
                    unassigned.push((k, UnassignedReason::BudgetExhausted));
                }
                return Ok(SearchOutcome {
                    routes,
                    schedules,
                    unassigned,
                    improved: false,
                    fallback: true,
                    cancelled: true,
                });
            }
            if started.elapsed() >= params.budget {
                // Out of budget mid-construction: best partial, heuristic only.
                fallback = true;
                for k in pending {
                    unassigned.push((k, UnassignedReason::BudgetExhausted));
                }
                break;
            }

            let mut best: Option<(f64, usize, usize, usize)> = None; // (delta, vehicle, pos, stop)
            for &k in &pending {
                for v in 0..n_vehicles {
                    let current_cost = route_cost(problem, matrix, params.objective, v, &routes[v]);
                    for pos in 0..=routes[v].len() {
                        let mut candidate = routes[v].clone();
                        candidate.insert(pos, k);
                        if let Some(schedule) =
                            evaluate_route(problem, matrix, &problem.vehicles[v], &candidate)
                        {
                            let delta =
                                assignment_cost(params.objective, &[schedule]) - current_cost;
                            let better = match &best {
                                None => true,
                                Some((best_delta, bv, bp, bk)) => {
                                    delta < *best_delta - f64::EPSILON
                                        || (delta < *best_delta + f64::EPSILON
                                            && (v, pos, k) < (*bv, *bp, *bk))
                                }
                            };
                            if better {
                                best = Some((delta, v, pos, k));
                            }
                        }
                    }
                }
            }

            match best {
                Some((_, v, pos, k)) => {
                    routes[v].insert(pos, k);
                    pending.retain(|&x| x != k);
                }
                None => {
                    // Nothing in this class fits anywhere anymore.
                    for k in pending.drain(..) {
                        unassigned.push((k, classify_uninsertable(problem, &routes, k)));
                    }
                }
            }
        }
        if fallback {
            // Drain the remaining class too.
            let placed: std::collections::HashSet<usize> =
                routes.iter().flatten().copied().collect();
            let listed: std::collections::HashSet<usize> =
                unassigned.iter().map(|(k, _)| *k).collect();
            for &k in &insertable {
                if !placed.contains(&k) && !listed.contains(&k) {
                    unassigned.push((k, UnassignedReason::BudgetExhausted));
                }
            }
            break;
        }
    }

    let construction_cost = total_cost(problem, matrix, params.objective, &routes);

    // Guided local search within the remaining budget.
    let mut improved = false;
    if !fallback {
        let outcome = improve(problem, matrix, params, cancel, &mut routes, started);
        improved = total_cost(problem, matrix, params.objective, &routes)
            < construction_cost - f64::EPSILON;
        if outcome == ImproveOutcome::Cancelled {
            let schedules = best_schedules(problem, matrix, &routes)?;
            return Ok(SearchOutcome {
                routes,
                schedules,
                unassigned,
                improved,
                fallback: false,
                cancelled: true,
            });
        }
    }

    let schedules = best_schedules(problem, matrix, &routes)?;
    debug!(
        "search done: {} routed, {} unassigned, improved={}, {:?} elapsed",
        routes.iter().map(|r| r.len()).sum::<usize>(),
        unassigned.len(),
        improved,
        started.elapsed()
    );

    Ok(SearchOutcome { routes, schedules, unassigned, improved, fallback, cancelled: false })
}

/// Re-evaluate the final sequences. Every applied move already passed
/// `evaluate_route`, so an infeasible result here is a search bug; it
/// surfaces as an internal error rather than a corrupt schedule.
fn best_schedules(
    problem: &VrpProblem,
    matrix: &TravelMatrix,
    routes: &[Vec<usize>],
) -> CoreResult<Vec<Schedule>> {
    routes
        .iter()
        .enumerate()
        .map(|(v, route)| {
            evaluate_route(problem, matrix, &problem.vehicles[v], route).ok_or_else(|| {
                CoreError::internal(format!(
                    "vehicle {} ended with an infeasible sequence {:?}",
                    problem.vehicles[v].id, route
                ))
            })
        })
        .collect()
}

fn route_cost(
    problem: &VrpProblem,
    matrix: &TravelMatrix,
    objective: Objective,
    vehicle: usize,
    route: &[usize],
) -> f64 {
    match evaluate_route(problem, matrix, &problem.vehicles[vehicle], route) {
        Some(schedule) => assignment_cost(objective, &[schedule]),
        None => f64::INFINITY,
    }
}

fn total_cost(problem: &VrpProblem, matrix: &TravelMatrix, objective: Objective, routes: &[Vec<usize>]) -> f64 {
    routes
        .iter()
        .enumerate()
        .map(|(v, r)| route_cost(problem, matrix, objective, v, r))
        .sum()
}

/// Why an insertable stop still ended up unrouted.
fn classify_uninsertable(problem: &VrpProblem, routes: &[Vec<usize>], k: usize) -> UnassignedReason {
    let demand = &problem.stops[k].demand;
    let any_capacity = routes.iter().enumerate().any(|(v, route)| {
        let mut load = demand.clone();
        for &s in route {
            load.add(&problem.stops[s].demand);
        }
        load.fits_within(&problem.vehicles[v].capacity)
    });
    if any_capacity {
        UnassignedReason::ShiftInfeasible
    } else {
        UnassignedReason::CapacityInfeasible
    }
}

#[derive(Debug, PartialEq, Eq)]
enum ImproveOutcome {
    Converged,
    BudgetExhausted,
    Cancelled,
}

/// Guided local search: repeat first-improvement passes over relocate, swap,
/// and 2-opt on an augmented objective; at each local optimum, penalize the
/// highest-utility arcs of the incumbent.
fn improve(
    problem: &VrpProblem,
    matrix: &TravelMatrix,
    params: &SearchParams,
    cancel: &CancellationToken,
    routes: &mut Vec<Vec<usize>>,
    started: Instant,
) -> ImproveOutcome {
    let n_vehicles = routes.len();
    let routed: usize = routes.iter().map(|r| r.len()).sum();
    if routed < 2 || n_vehicles == 0 {
        return ImproveOutcome::Converged;
    }

    let mut rng = StdRng::seed_from_u64(params.seed);
    let mut penalties: HashMap<(usize, usize), u32> = HashMap::new();
    let base_cost = total_cost(problem, matrix, params.objective, routes);
    let lambda = PENALTY_ALPHA * base_cost / (routed as f64 + n_vehicles as f64);

    let mut best_routes = routes.clone();
    let mut best_cost = base_cost;
    let mut last_improvement = Instant::now();
    let mut stale_rounds = 0u32;

    loop {
        // Checkpoint: budget, patience, cancellation.
        if cancel.is_cancelled() {
            *routes = best_routes;
            return ImproveOutcome::Cancelled;
        }
        if started.elapsed() >= params.budget {
            *routes = best_routes;
            return ImproveOutcome::BudgetExhausted;
        }
        if stale_rounds >= CONVERGENCE_ROUNDS || last_improvement.elapsed() >= params.patience {
            *routes = best_routes;
            return ImproveOutcome::Converged;
        }

        let moved = local_search_pass(problem, matrix, params, &penalties, lambda, routes, &mut rng);

        let cost = total_cost(problem, matrix, params.objective, routes);
        if cost < best_cost - f64::EPSILON {
            best_cost = cost;
            best_routes = routes.clone();
            last_improvement = Instant::now();
            stale_rounds = 0;
        }

        if !moved {
            stale_rounds += 1;
            // Local optimum on the augmented objective: penalize the most
            // expensive low-penalty arcs of the incumbent.
            let arcs = used_arcs(problem, routes);
            if arcs.is_empty() {
                *routes = best_routes;
                return ImproveOutcome::Converged;
            }
            let mut best_utility = f64::NEG_INFINITY;
            let mut victims: Vec<(usize, usize)> = Vec::new();
            for &(from, to) in &arcs {
                let p = *penalties.get(&(from, to)).unwrap_or(&0);
                let utility = matrix.distance(from, to) as f64 / (1.0 + p as f64);
                if utility > best_utility + f64::EPSILON {
                    best_utility = utility;
                    victims = vec![(from, to)];
                } else if (utility - best_utility).abs() <= f64::EPSILON {
                    victims.push((from, to));
                }
            }
            for arc in victims {
                *penalties.entry(arc).or_insert(0) += 1;
            }
        }
    }
}

/// Arcs used by the current routes, in matrix point indices.
fn used_arcs(problem: &VrpProblem, routes: &[Vec<usize>]) -> Vec<(usize, usize)> {
    let mut arcs = Vec::new();
    for (v, route) in routes.iter().enumerate() {
        if route.is_empty() {
            continue;
        }
        let mut from = problem.vehicles[v].start_index;
        for &k in route {
            let to = problem.stop_point(k);
            arcs.push((from, to));
            from = to;
        }
        arcs.push((from, 0));
    }
    arcs
}

fn augmented_route_cost(
    problem: &VrpProblem,
    matrix: &TravelMatrix,
    params: &SearchParams,
    penalties: &HashMap<(usize, usize), u32>,
    lambda: f64,
    vehicle: usize,
    route: &[usize],
) -> f64 {
    let base = route_cost(problem, matrix, params.objective, vehicle, route);
    if !base.is_finite() {
        return base;
    }
    let mut penalty = 0u32;
    let mut from = problem.vehicles[vehicle].start_index;
    for &k in route {
        let to = problem.stop_point(k);
        penalty += *penalties.get(&(from, to)).unwrap_or(&0);
        from = to;
    }
    if !route.is_empty() {
        penalty += *penalties.get(&(from, 0)).unwrap_or(&0);
    }
    base + lambda * penalty as f64
}

/// One first-improvement pass over relocate, swap, and intra-route 2-opt.
/// Returns whether any move was applied.
fn local_search_pass(
    problem: &VrpProblem,
    matrix: &TravelMatrix,
    params: &SearchParams,
    penalties: &HashMap<(usize, usize), u32>,
    lambda: f64,
    routes: &mut Vec<Vec<usize>>,
    rng: &mut StdRng,
) -> bool {
    let n = routes.len();
    let cost =
        |routes: &Vec<Vec<usize>>, v: usize| augmented_route_cost(problem, matrix, params, penalties, lambda, v, &routes[v]);

    let mut vehicle_order: Vec<usize> = (0..n).collect();
    vehicle_order.shuffle(rng);

    // Relocate: move one stop to any position on any vehicle.
    for &v1 in &vehicle_order {
        for i in 0..routes[v1].len() {
            for v2 in 0..n {
                let positions = if v1 == v2 { routes[v2].len() } else { routes[v2].len() + 1 };
                for j in 0..positions {
                    if v1 == v2 && (j == i || j == i + 1) {
                        continue;
                    }
                    let before = cost(routes, v1) + if v1 == v2 { 0.0 } else { cost(routes, v2) };
                    let mut candidate = routes.clone();
                    let stop = candidate[v1].remove(i);
                    let insert_at = if v1 == v2 && j > i { j - 1 } else { j };
                    candidate[v2].insert(insert_at, stop);
                    let after =
                        cost(&candidate, v1) + if v1 == v2 { 0.0 } else { cost(&candidate, v2) };
                    if after < before - f64::EPSILON {
                        *routes = candidate;
                        return true;
                    }
                }
            }
        }
    }

    // Swap between two routes.
    for v1 in 0..n {
        for v2 in (v1 + 1)..n {
            for i in 0..routes[v1].len() {
                for j in 0..routes[v2].len() {
                    let before = cost(routes, v1) + cost(routes, v2);
                    let mut candidate = routes.clone();
                    let a = candidate[v1][i];
                    candidate[v1][i] = candidate[v2][j];
                    candidate[v2][j] = a;
                    let after = cost(&candidate, v1) + cost(&candidate, v2);
                    if after < before - f64::EPSILON {
                        *routes = candidate;
                        return true;
                    }
                }
            }
        }
    }

    // Intra-route 2-opt: reverse a segment.
    for v in 0..n {
        let len = routes[v].len();
        for i in 0..len.saturating_sub(1) {
            for j in (i + 2)..=len.saturating_sub(1) {
                let before = cost(routes, v);
                let mut candidate = routes.clone();
                candidate[v][i..=j].reverse();
                let after = cost(&candidate, v);
                if after < before - f64::EPSILON {
                    *routes = candidate;
                    return true;
                }
            }
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solver::problem::{OrderInput, VehicleInput};
    use crate::types::{Coordinates, CylinderSize, SizeCount, TimeWindow};
    use uuid::Uuid;

    fn depot() -> Coordinates {
        Coordinates { lat: 25.048, lng: 121.532 }
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

    fn vehicle(kg20_cap: u32) -> VehicleInput {
        VehicleInput {
            id: Uuid::new_v4(),
            capacity: SizeCount::of(CylinderSize::Kg20, kg20_cap),
            shift: TimeWindow::new(480, 1080),
            start: None,
        }
    }

    fn matrix_for(problem: &VrpProblem) -> TravelMatrix {
        // ~3 km grid distances at 30 km/h
        let n = problem.points.len();
        let mut distances = vec![vec![0u64; n]; n];
        let mut durations = vec![vec![0u64; n]; n];
        for i in 0..n {
            for j in 0..n {
                if i != j {
                    let d = crate::services::geo::approx_road_distance_m(
                        &problem.points[i],
                        &problem.points[j],
                    );
                    distances[i][j] = d;
                    durations[i][j] = (d as f64 / (30.0 * 1000.0) * 3600.0) as u64;
                }
            }
        }
        TravelMatrix { distances, durations }
    }

    fn params(budget_ms: u64) -> SearchParams {
        SearchParams {
            budget: Duration::from_millis(budget_ms),
            patience: Duration::from_millis(200),
            ..Default::default()
        }
    }

    #[test]
    fn test_three_stops_all_routed() {
        let problem = VrpProblem::build(
            depot(),
            vec![
                order_at(25.050, 121.540, 2),
                order_at(25.045, 121.530, 1),
                order_at(25.055, 121.545, 3),
            ],
            vec![vehicle(20)],
            &[],
        )
        .unwrap();
        let matrix = matrix_for(&problem);
        let outcome = search(&problem, &matrix, &params(2000), &CancellationToken::new()).unwrap();

        assert_eq!(outcome.routes[0].len(), 3);
        assert!(outcome.unassigned.is_empty());
        assert!(!outcome.fallback);
        for arrival in &outcome.schedules[0].arrivals {
            assert!((540..=1020).contains(arrival), "arrival {} outside window", arrival);
        }
    }

    #[test]
    fn test_determinism_same_input_same_routes() {
        let problem = VrpProblem::build(
            depot(),
            vec![
                order_at(25.050, 121.540, 2),
                order_at(25.045, 121.530, 1),
                order_at(25.055, 121.545, 3),
                order_at(25.040, 121.520, 2),
                order_at(25.060, 121.550, 1),
            ],
            vec![vehicle(20), vehicle(20)],
            &[],
        )
        .unwrap();
        let matrix = matrix_for(&problem);

        let a = search(&problem, &matrix, &params(500), &CancellationToken::new()).unwrap();
        let b = search(&problem, &matrix, &params(500), &CancellationToken::new()).unwrap();
        assert_eq!(a.routes, b.routes);
    }

    #[test]
    fn test_capacity_overflow_unassigns_extras() {
        // 12 orders of 2 against two vehicles of 10: at most 10 stops ride.
        let orders: Vec<OrderInput> = (0..12)
            .map(|i| order_at(25.040 + 0.002 * i as f64, 121.520 + 0.002 * i as f64, 2))
            .collect();
        let ids: Vec<Uuid> = orders.iter().map(|o| o.id).collect();
        let problem = VrpProblem::build(depot(), orders, vec![vehicle(10), vehicle(10)], &[]).unwrap();
        let matrix = matrix_for(&problem);
        let outcome = search(&problem, &matrix, &params(2000), &CancellationToken::new()).unwrap();

        let routed: usize = outcome.routes.iter().map(|r| r.len()).sum();
        assert_eq!(routed, 10);
        assert_eq!(outcome.unassigned.len(), 2);
        for (k, reason) in &outcome.unassigned {
            assert!(ids.contains(&problem.stops[*k].order_ids[0]));
            assert_eq!(*reason, UnassignedReason::CapacityInfeasible);
        }
        for (v, route) in outcome.routes.iter().enumerate() {
            let mut load = SizeCount::default();
            for &k in route {
                load.add(&problem.stops[k].demand);
            }
            assert!(load.fits_within(&problem.vehicles[v].capacity));
        }
    }

    #[test]
    fn test_window_infeasible_screened() {
        let mut v = vehicle(10);
        v.shift = TimeWindow::new(480, 600); // 08:00-10:00
        let mut o = order_at(25.050, 121.540, 1);
        o.window = TimeWindow::new(840, 960); // 14:00-16:00
        let problem = VrpProblem::build(depot(), vec![o], vec![v], &[]).unwrap();
        let matrix = matrix_for(&problem);
        let outcome = search(&problem, &matrix, &params(500), &CancellationToken::new()).unwrap();

        assert!(outcome.routes[0].is_empty());
        assert_eq!(outcome.unassigned.len(), 1);
        assert_eq!(outcome.unassigned[0].1, UnassignedReason::WindowInfeasible);
    }

    #[test]
    fn test_no_vehicles() {
        let problem = VrpProblem::build(depot(), vec![order_at(25.05, 121.54, 1)], vec![], &[]).unwrap();
        let matrix = matrix_for(&problem);
        let outcome = search(&problem, &matrix, &params(500), &CancellationToken::new()).unwrap();

        assert!(outcome.routes.is_empty());
        assert_eq!(outcome.unassigned[0].1, UnassignedReason::NoVehicle);
    }

    #[test]
    fn test_no_stops() {
        let problem = VrpProblem::build(depot(), vec![], vec![vehicle(10)], &[]).unwrap();
        let matrix = matrix_for(&problem);
        let outcome = search(&problem, &matrix, &params(500), &CancellationToken::new()).unwrap();

        assert_eq!(outcome.routes, vec![Vec::<usize>::new()]);
        assert!(outcome.unassigned.is_empty());
        assert!(!outcome.fallback);
    }

    #[test]
    fn test_pre_cancelled_token_returns_partial() {
        let problem = VrpProblem::build(
            depot(),
            vec![order_at(25.05, 121.54, 1), order_at(25.06, 121.55, 1)],
            vec![vehicle(10)],
            &[],
        )
        .unwrap();
        let matrix = matrix_for(&problem);
        let token = CancellationToken::new();
        token.cancel();
        let outcome = search(&problem, &matrix, &params(500), &token).unwrap();

        assert!(outcome.cancelled);
    }

    #[test]
    fn test_urgent_orders_still_routed_under_pressure() {
        // One vehicle of 4: two urgent orders of 2 must ride, normals spill.
        let mut orders = vec![
            order_at(25.050, 121.540, 2),
            order_at(25.052, 121.542, 2),
            order_at(25.054, 121.544, 2),
        ];
        orders[2].priority = OrderPriority::Urgent;
        let urgent_id = orders[2].id;
        let problem = VrpProblem::build(depot(), orders, vec![vehicle(4)], &[]).unwrap();
        let matrix = matrix_for(&problem);
        let outcome = search(&problem, &matrix, &params(1000), &CancellationToken::new()).unwrap();

        let routed_orders: Vec<Uuid> = outcome.routes[0]
            .iter()
            .flat_map(|&k| problem.stops[k].order_ids.clone())
            .collect();
        assert!(routed_orders.contains(&urgent_id), "urgent order must be routed first");
    }

    #[test]
    fn test_improvement_reduces_or_keeps_cost() {
        let orders: Vec<OrderInput> = (0..7)
            .map(|i| order_at(25.040 + 0.003 * i as f64, 121.560 - 0.004 * i as f64, 1))
            .collect();
        let problem = VrpProblem::build(depot(), orders, vec![vehicle(20)], &[]).unwrap();
        let matrix = matrix_for(&problem);
        let outcome = search(&problem, &matrix, &params(1500), &CancellationToken::new()).unwrap();

        assert_eq!(outcome.routes[0].len(), 7);
        // The incumbent is never worse than construction.
        assert!(outcome.schedules[0].distance_m > 0);
    }
}
