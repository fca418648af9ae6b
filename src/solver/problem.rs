//! VRP problem model
//!
//! Builds the solver's data model from depot, stops, and vehicles: the point
//! list for the travel matrix (0 = depot, then stops, then distinct vehicle
//! start locations), welding of atomic same-customer orders, and the
//! per-stop feasibility pre-screen.

use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::types::{Coordinates, OrderPriority, SizeCount, TimeWindow, UnassignedReason};

/// Maximum waiting time at a node before an early arrival is infeasible.
pub const MAX_WAIT_MINUTES: u32 = 30;

/// One solver stop. May represent several welded orders of an atomic
/// customer: demand summed, windows unioned, service durations summed.
#[derive(Debug, Clone)]
pub struct SolverStop {
    /// All orders served at this stop, in input order.
    pub order_ids: Vec<Uuid>,
    /// Per-order service minutes, aligned with `order_ids`.
    pub order_service_minutes: Vec<u32>,
    pub customer_id: Uuid,
    pub location: Coordinates,
    pub demand: SizeCount,
    pub window: TimeWindow,
    pub service_minutes: u32,
    pub priority: OrderPriority,
}

#[derive(Debug, Clone)]
pub struct SolverVehicle {
    pub id: Uuid,
    pub capacity: SizeCount,
    pub shift: TimeWindow,
    pub start: Coordinates,
    /// Index of the vehicle's start in the point list (0 when at the depot).
    pub start_index: usize,
}

/// The assembled problem instance.
#[derive(Debug, Clone)]
pub struct VrpProblem {
    pub depot: Coordinates,
    pub stops: Vec<SolverStop>,
    pub vehicles: Vec<SolverVehicle>,
    /// `[depot] ++ stops ++ distinct vehicle starts`; matrix is built over
    /// this list. Stop `k` is point `k + 1`.
    pub points: Vec<Coordinates>,
}

impl VrpProblem {
    /// Build the instance. Orders of customers in `atomic_customers` are
    /// welded into one combined stop; everyone else gets one stop per order.
    pub fn build(
        depot: Coordinates,
        orders: Vec<OrderInput>,
        vehicles: Vec<VehicleInput>,
        atomic_customers: &[Uuid],
    ) -> CoreResult<Self> {
        let mut stops: Vec<SolverStop> = Vec::with_capacity(orders.len());

        for order in orders {
            if order.demand.is_empty() {
                return Err(CoreError::validation(
                    format!("orders[{}].demand", order.id),
                    "at least one line item with count >= 1 required",
                ));
            }

            let atomic = atomic_customers.contains(&order.customer_id);
            let existing = if atomic {
                stops.iter_mut().find(|s| s.customer_id == order.customer_id)
            } else {
                None
            };

            match existing {
                Some(stop) => {
                    stop.order_ids.push(order.id);
                    stop.order_service_minutes.push(order.service_minutes);
                    stop.demand.add(&order.demand);
                    stop.window = stop.window.union(&order.window);
                    stop.service_minutes += order.service_minutes;
                }
                None => stops.push(SolverStop {
                    order_ids: vec![order.id],
                    order_service_minutes: vec![order.service_minutes],
                    customer_id: order.customer_id,
                    location: order.location,
                    demand: order.demand,
                    window: order.window,
                    service_minutes: order.service_minutes,
                    priority: order.priority,
                }),
            }
        }

        let mut points = Vec::with_capacity(1 + stops.len() + vehicles.len());
        points.push(depot);
        points.extend(stops.iter().map(|s| s.location));

        let solver_vehicles = vehicles
            .into_iter()
            .map(|v| {
                let start = v.start.unwrap_or(depot);
                let start_index = if start.rounded() == depot.rounded() {
                    0
                } else {
                    points.push(start);
                    points.len() - 1
                };
                SolverVehicle {
                    id: v.id,
                    capacity: v.capacity,
                    shift: v.shift,
                    start,
                    start_index,
                }
            })
            .collect();

        Ok(Self { depot, stops, vehicles: solver_vehicles, points })
    }

    /// Matrix index of stop `k`.
    pub fn stop_point(&self, k: usize) -> usize {
        k + 1
    }

    /// Pre-screen a stop against the whole fleet. Returns the reason it can
    /// never be served, or `None` when at least one vehicle could take it in
    /// isolation. `travel_minutes(from_point, to_point)` comes from the
    /// built matrix.
    pub fn screen_stop<F>(&self, k: usize, travel_minutes: F) -> Option<UnassignedReason>
    where
        F: Fn(usize, usize) -> u32,
    {
        if self.vehicles.is_empty() {
            return Some(UnassignedReason::NoVehicle);
        }

        let stop = &self.stops[k];
        let point = self.stop_point(k);

        if !self.vehicles.iter().any(|v| stop.demand.fits_within(&v.capacity)) {
            return Some(UnassignedReason::CapacityInfeasible);
        }

        let mut window_possible = false;
        let mut shift_possible = false;

        for vehicle in &self.vehicles {
            let to_stop = travel_minutes(vehicle.start_index, point);
            let back = travel_minutes(point, 0);
            if !stop.demand.fits_within(&vehicle.capacity) {
                continue;
            }

            let earliest_arrival = vehicle.shift.start_minute.saturating_add(to_stop);
            // Latest the vehicle could arrive and still finish the visit and
            // return before shift end.
            let latest_arrival = vehicle
                .shift
                .end_minute
                .saturating_sub(stop.service_minutes)
                .saturating_sub(back);

            if earliest_arrival > stop.window.end_minute || stop.window.start_minute > latest_arrival {
                continue;
            }
            window_possible = true;

            // Window reachable; can the full visit fit the shift?
            let arrival = earliest_arrival.max(stop.window.start_minute);
            if arrival - earliest_arrival <= MAX_WAIT_MINUTES
                && arrival + stop.service_minutes + back <= vehicle.shift.end_minute
            {
                shift_possible = true;
                break;
            }
        }

        if !window_possible {
            return Some(UnassignedReason::WindowInfeasible);
        }
        if !shift_possible {
            return Some(UnassignedReason::ShiftInfeasible);
        }
        None
    }
}

/// Order as handed to the problem builder.
#[derive(Debug, Clone)]
pub struct OrderInput {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub location: Coordinates,
    pub demand: SizeCount,
    pub window: TimeWindow,
    pub service_minutes: u32,
    pub priority: OrderPriority,
}

/// Vehicle as handed to the problem builder.
#[derive(Debug, Clone)]
pub struct VehicleInput {
    pub id: Uuid,
    pub capacity: SizeCount,
    pub shift: TimeWindow,
    pub start: Option<Coordinates>,
}
