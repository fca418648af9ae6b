//! Route schedules and solver output types

use uuid::Uuid;

use crate::services::routing::TravelMatrix;
use crate::types::{Objective, UnassignedReason};

use super::problem::{SolverVehicle, VrpProblem, MAX_WAIT_MINUTES};

/// Travel time between two matrix points in whole minutes, rounded up so
/// schedules never promise earlier arrivals than the provider does.
pub fn travel_minutes(matrix: &TravelMatrix, from: usize, to: usize) -> u32 {
    ((matrix.duration(from, to) + 59) / 60) as u32
}

/// A feasible schedule for one vehicle's stop sequence.
#[derive(Debug, Clone)]
pub struct Schedule {
    /// Arrival minute per stop, aligned with the input sequence.
    pub arrivals: Vec<u32>,
    pub distance_m: u64,
    pub duration_s: u64,
    /// Minute the vehicle is back at the depot.
    pub end_minute: u32,
}

/// Simulate one vehicle over `route` (stop indices). Returns `None` when the
/// sequence violates capacity, a service window, the waiting cap, or the
/// shift bound.
pub fn evaluate_route(
    problem: &VrpProblem,
    matrix: &TravelMatrix,
    vehicle: &SolverVehicle,
    route: &[usize],
) -> Option<Schedule> {
    if route.is_empty() {
        return Some(Schedule {
            arrivals: vec![],
            distance_m: 0,
            duration_s: 0,
            end_minute: vehicle.shift.start_minute,
        });
    }

    let mut load = crate::types::SizeCount::default();
    for &k in route {
        load.add(&problem.stops[k].demand);
    }
    if !load.fits_within(&vehicle.capacity) {
        return None;
    }

    let mut arrivals = Vec::with_capacity(route.len());
    let mut distance_m = 0u64;
    let mut duration_s = 0u64;
    let mut minute = vehicle.shift.start_minute;
    let mut from = vehicle.start_index;

    for &k in route {
        let to = problem.stop_point(k);
        let stop = &problem.stops[k];

        distance_m += matrix.distance(from, to);
        duration_s += matrix.duration(from, to);
        let arrival = minute + travel_minutes(matrix, from, to);

        if arrival > stop.window.end_minute {
            return None;
        }
        let service_start = arrival.max(stop.window.start_minute);
        let wait = service_start - arrival;
        if wait > MAX_WAIT_MINUTES {
            return None;
        }
        duration_s += u64::from(wait) * 60;
        duration_s += u64::from(stop.service_minutes) * 60;

        arrivals.push(arrival);
        minute = service_start + stop.service_minutes;
        from = to;
    }

    // Return to depot
    distance_m += matrix.distance(from, 0);
    duration_s += matrix.duration(from, 0);
    let end_minute = minute + travel_minutes(matrix, from, 0);
    if end_minute > vehicle.shift.end_minute {
        return None;
    }

    Some(Schedule { arrivals, distance_m, duration_s, end_minute })
}

/// Objective value of a full assignment.
pub fn assignment_cost(objective: Objective, schedules: &[Schedule]) -> f64 {
    let (wd, wt) = objective.weights();
    schedules
        .iter()
        .map(|s| wd * s.distance_m as f64 + wt * s.duration_s as f64)
        .sum()
}

/// One planned delivery in the output; welded stops expand to one entry per
/// order sharing the arrival minute.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedDelivery {
    pub order_id: Uuid,
    pub arrival_minute: u32,
    pub service_minutes: u32,
}

/// One vehicle's planned tour.
#[derive(Debug, Clone)]
pub struct VehiclePlan {
    pub vehicle_id: Uuid,
    pub deliveries: Vec<PlannedDelivery>,
    pub distance_m: u64,
    pub duration_s: u64,
}

/// Complete solver output.
#[derive(Debug, Clone)]
pub struct VrpSolution {
    /// One plan per input vehicle, in input order (possibly empty tours).
    pub plans: Vec<VehiclePlan>,
    pub unassigned: Vec<(Uuid, UnassignedReason)>,
    /// True when the result is a best-partial / heuristic-only answer.
    pub fallback: bool,
    /// True when the improvement phase beat the construction solution.
    pub improved: bool,
    /// True when any travel cost came from haversine approximation.
    pub approximate: bool,
    pub solve_time_ms: u64,
    pub method: String,
}

impl VrpSolution {
    /// Empty plans for every vehicle, nothing unassigned.
    pub fn empty(vehicle_ids: &[Uuid], method: &str) -> Self {
        Self {
            plans: vehicle_ids
                .iter()
                .map(|&vehicle_id| VehiclePlan {
                    vehicle_id,
                    deliveries: vec![],
                    distance_m: 0,
                    duration_s: 0,
                })
                .collect(),
            unassigned: vec![],
            fallback: false,
            improved: false,
            approximate: false,
            solve_time_ms: 0,
            method: method.to_string(),
        }
    }

    /// Every order exactly once across plans and unassigned.
    pub fn covers_exactly(&self, order_ids: &[Uuid]) -> bool {
        let mut seen = std::collections::HashSet::new();
        for plan in &self.plans {
            for d in &plan.deliveries {
                if !seen.insert(d.order_id) {
                    return false;
                }
            }
        }
        for (id, _) in &self.unassigned {
            if !seen.insert(*id) {
                return false;
            }
        }
        seen.len() == order_ids.len() && order_ids.iter().all(|id| seen.contains(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solver::problem::{OrderInput, VehicleInput};
    use crate::types::{Coordinates, CylinderSize, OrderPriority, SizeCount, TimeWindow};

    fn minutes_matrix(n: usize, minutes: u64) -> TravelMatrix {
        let mut distances = vec![vec![0u64; n]; n];
        let mut durations = vec![vec![0u64; n]; n];
        for i in 0..n {
            for j in 0..n {
                if i != j {
                    distances[i][j] = minutes * 500;
                    durations[i][j] = minutes * 60;
                }
            }
        }
        TravelMatrix { distances, durations }
    }

    fn problem_with(windows: Vec<TimeWindow>, shift: TimeWindow, capacity: u32) -> VrpProblem {
        let orders = windows
            .into_iter()
            .enumerate()
            .map(|(i, window)| OrderInput {
                id: Uuid::new_v4(),
                customer_id: Uuid::new_v4(),
                location: Coordinates { lat: 25.0 + i as f64 * 0.01, lng: 121.5 },
                demand: SizeCount::of(CylinderSize::Kg20, 2),
                window,
                service_minutes: 10,
                priority: OrderPriority::Normal,
            })
            .collect();
        VrpProblem::build(
            Coordinates { lat: 25.048, lng: 121.532 },
            orders,
            vec![VehicleInput {
                id: Uuid::new_v4(),
                capacity: SizeCount::of(CylinderSize::Kg20, capacity),
                shift,
                start: None,
            }],
            &[],
        )
        .unwrap()
    }

    #[test]
    fn test_empty_route_schedule() {
        let problem = problem_with(vec![], TimeWindow::new(480, 1080), 10);
        let matrix = minutes_matrix(1, 10);
        let s = evaluate_route(&problem, &matrix, &problem.vehicles[0], &[]).unwrap();
        assert_eq!(s.distance_m, 0);
        assert_eq!(s.end_minute, 480);
    }

    #[test]
    fn test_schedule_accumulates_travel_and_service() {
        let problem = problem_with(
            vec![TimeWindow::new(0, 1440), TimeWindow::new(0, 1440)],
            TimeWindow::new(480, 1080),
            10,
        );
        let matrix = minutes_matrix(3, 10);
        let s = evaluate_route(&problem, &matrix, &problem.vehicles[0], &[0, 1]).unwrap();

        assert_eq!(s.arrivals, vec![490, 510]);
        assert_eq!(s.end_minute, 530);
        // 3 legs of travel + 2 services
        assert_eq!(s.duration_s, 3 * 600 + 2 * 600);
    }

    #[test]
    fn test_schedule_waits_within_cap() {
        let problem = problem_with(vec![TimeWindow::new(505, 1440)], TimeWindow::new(480, 1080), 10);
        let matrix = minutes_matrix(2, 10);
        let s = evaluate_route(&problem, &matrix, &problem.vehicles[0], &[0]).unwrap();
        assert_eq!(s.arrivals, vec![490]);
        // waited 15 min: counted into duration
        assert_eq!(s.duration_s, 2 * 600 + 15 * 60 + 600);
    }

    #[test]
    fn test_schedule_rejects_excessive_wait() {
        // Arrival 490, window opens 530: 40 min wait > cap
        let problem = problem_with(vec![TimeWindow::new(530, 1440)], TimeWindow::new(480, 1080), 10);
        let matrix = minutes_matrix(2, 10);
        assert!(evaluate_route(&problem, &matrix, &problem.vehicles[0], &[0]).is_none());
    }

    #[test]
    fn test_schedule_rejects_late_arrival() {
        let problem = problem_with(vec![TimeWindow::new(0, 485)], TimeWindow::new(480, 1080), 10);
        let matrix = minutes_matrix(2, 10);
        assert!(evaluate_route(&problem, &matrix, &problem.vehicles[0], &[0]).is_none());
    }

    #[test]
    fn test_schedule_rejects_shift_overrun() {
        // Shift too short to return
        let problem = problem_with(vec![TimeWindow::new(0, 1440)], TimeWindow::new(480, 505), 10);
        let matrix = minutes_matrix(2, 10);
        assert!(evaluate_route(&problem, &matrix, &problem.vehicles[0], &[0]).is_none());
    }

    #[test]
    fn test_schedule_rejects_capacity_overrun() {
        let problem = problem_with(
            vec![TimeWindow::new(0, 1440), TimeWindow::new(0, 1440)],
            TimeWindow::new(480, 1080),
            3,
        );
        let matrix = minutes_matrix(3, 10);
        // Two stops of 2 cylinders against capacity 3
        assert!(evaluate_route(&problem, &matrix, &problem.vehicles[0], &[0, 1]).is_none());
    }

    #[test]
    fn test_travel_minutes_rounds_up() {
        let matrix = TravelMatrix {
            distances: vec![vec![0, 100], vec![100, 0]],
            durations: vec![vec![0, 61], vec![61, 0]],
        };
        assert_eq!(travel_minutes(&matrix, 0, 1), 2);
    }

    #[test]
    fn test_covers_exactly() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let mut solution = VrpSolution::empty(&[Uuid::new_v4()], "test");
        solution.plans[0].deliveries.push(PlannedDelivery {
            order_id: a,
            arrival_minute: 540,
            service_minutes: 10,
        });
        solution.unassigned.push((b, UnassignedReason::CapacityInfeasible));

        assert!(solution.covers_exactly(&[a, b]));
        assert!(!solution.covers_exactly(&[a]));
        assert!(!solution.covers_exactly(&[a, b, Uuid::new_v4()]));
    }
}
