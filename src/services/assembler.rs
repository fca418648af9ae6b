//! Route assembler
//!
//! Turns solver output into persisted `Route`/`RouteStop` records: fetches
//! directions per vehicle, verifies every order is still assignable, and
//! commits all routes plus the order assignments in one transaction. Either
//! every route commits or none do.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::services::matrix::MatrixService;
use crate::services::routing::polyline;
use crate::services::state::{event_row, order_event, route_event, StateMachine};
use crate::solver::VrpSolution;
use crate::store::{TxWrite, Versioned};
use crate::types::{
    Coordinates, EventKind, OrderStatus, Room, Route, RouteStatus, RouteStop, StopOutcome,
};

pub struct RouteAssembler {
    state: Arc<StateMachine>,
    matrix: Arc<MatrixService>,
    allow_approximation: bool,
}

/// One persisted route with its driver, for response shaping.
#[derive(Debug, Clone)]
pub struct AssembledRoute {
    pub route_id: Uuid,
    pub driver_id: Uuid,
    pub distance_m: u64,
    pub duration_s: u64,
    pub polyline: String,
}

impl RouteAssembler {
    pub fn new(state: Arc<StateMachine>, matrix: Arc<MatrixService>, allow_approximation: bool) -> Self {
        Self { state, matrix, allow_approximation }
    }

    /// Assemble and persist one operating date's solver output.
    ///
    /// `locations` maps order id to its delivery point; `depot` starts and
    /// ends every tour. Orders that are no longer `draft`/`confirmed` abort
    /// the whole assembly with `Conflict` naming the offenders.
    pub async fn assemble(
        &self,
        date: NaiveDate,
        depot: Coordinates,
        locations: &HashMap<Uuid, Coordinates>,
        solution: &VrpSolution,
        job_id: Uuid,
    ) -> CoreResult<Vec<AssembledRoute>> {
        let store = self.state.store().clone();

        // Verify every routed order is still assignable, up front. The
        // version captured here guards the commit against late movers.
        let mut orders = HashMap::new();
        let mut conflicts = Vec::new();
        for plan in &solution.plans {
            for delivery in &plan.deliveries {
                let Some(order) = store.get_order(delivery.order_id).await? else {
                    conflicts.push(delivery.order_id);
                    continue;
                };
                if !matches!(order.status, OrderStatus::Draft | OrderStatus::Confirmed) {
                    conflicts.push(order.id);
                    continue;
                }
                orders.insert(order.id, order);
            }
        }
        if !conflicts.is_empty() {
            return Err(CoreError::conflict("orders no longer assignable", conflicts));
        }

        let mut write = TxWrite::default();
        let mut events = Vec::new();
        let mut assembled = Vec::new();

        for plan in &solution.plans {
            if plan.deliveries.is_empty() {
                continue;
            }

            let mut waypoints = vec![depot];
            for delivery in &plan.deliveries {
                if let Some(point) = locations.get(&delivery.order_id) {
                    // Welded orders share a point; skip the duplicate.
                    if waypoints.last() != Some(point) {
                        waypoints.push(*point);
                    }
                }
            }
            waypoints.push(depot);

            let depart = plan.deliveries.first().map_or(480, |d| d.arrival_minute);
            let (directions, approximate) = match self.matrix.directions(&waypoints, depart).await {
                Ok(directions) => (directions, false),
                Err(err) if self.allow_approximation => {
                    warn!("directions unavailable, using straight-line polyline: {}", err);
                    (
                        crate::services::routing::RouteDirections {
                            distance_m: plan.distance_m,
                            duration_s: plan.duration_s,
                            polyline: polyline::encode(&waypoints, 6),
                        },
                        true,
                    )
                }
                Err(err) => return Err(err),
            };

            let now = Utc::now();
            let route = Route {
                id: Uuid::new_v4(),
                date,
                driver_id: plan.vehicle_id,
                status: RouteStatus::Optimized,
                total_distance_m: directions.distance_m as i64,
                total_duration_s: directions.duration_s as i64,
                method: solution.method.clone(),
                polyline: directions.polyline.clone(),
                approximate: solution.approximate || approximate,
                job_id: Some(job_id),
                version: 0,
                created_at: now,
                updated_at: now,
            };

            let stops: Vec<RouteStop> = plan
                .deliveries
                .iter()
                .enumerate()
                .map(|(i, d)| RouteStop {
                    route_id: route.id,
                    position: (i as i32) + 1,
                    order_id: d.order_id,
                    planned_arrival_minute: d.arrival_minute as i32,
                    planned_service_minutes: d.service_minutes as i32,
                    actual_arrival: None,
                    actual_departure: None,
                    outcome: StopOutcome::Pending,
                })
                .collect();

            for delivery in &plan.deliveries {
                let order = orders.get_mut(&delivery.order_id).expect("verified above");
                let expected = order.version;
                order.status = OrderStatus::Assigned;
                order.assigned_route = Some(route.id);
                let draft = order_event(EventKind::OrderAssigned, order);
                write.events.push(event_row(&draft, order.id));
                let mut rooms = StateMachine::order_rooms(order);
                rooms.push(Room::Driver(route.driver_id));
                events.push((rooms, draft));
                write.orders.push(Versioned::new(order.clone(), expected));
            }

            let draft = route_event(EventKind::RouteCreated, &route);
            write.events.push(event_row(&draft, route.id));
            events.push((StateMachine::route_rooms(&route), draft));

            assembled.push(AssembledRoute {
                route_id: route.id,
                driver_id: route.driver_id,
                distance_m: directions.distance_m,
                duration_s: directions.duration_s,
                polyline: directions.polyline,
            });
            write.new_routes.push((route, stops));
        }

        if write.new_routes.is_empty() {
            return Ok(vec![]);
        }

        // All-or-nothing: a version that moved since the pre-check fails the
        // batch and surfaces as a conflict on that order.
        match self.state.commit_and_publish(write, events).await {
            Ok(()) => {}
            Err(CoreError::VersionConflict { entity: "order", id }) => {
                return Err(CoreError::conflict("orders no longer assignable", vec![id]));
            }
            Err(other) => return Err(other),
        }

        info!("assembled {} routes for {}", assembled.len(), date);
        Ok(assembled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusConfig, EventBus};
    use crate::services::matrix_cache::MatrixCache;
    use crate::services::routing::MockRoutingProvider;
    use crate::solver::{PlannedDelivery, VehiclePlan};
    use crate::store::{MemoryStore, Store};
    use crate::types::{ClientRole, CylinderSize, Order, OrderPriority, ServerMessage, SizeCount};
    use std::time::Duration;

    fn fixture() -> (RouteAssembler, Arc<MemoryStore>, EventBus) {
        let store = Arc::new(MemoryStore::new());
        let bus = EventBus::new(BusConfig::default());
        let state = Arc::new(StateMachine::new(store.clone() as Arc<dyn Store>, bus.clone()));
        let matrix = Arc::new(MatrixService::new(
            Arc::new(MatrixCache::new(1000, Duration::from_secs(3600))),
            Arc::new(MockRoutingProvider::new()),
            Duration::from_secs(10),
            Duration::from_secs(15),
            30.0,
            true,
        ));
        (RouteAssembler::new(state, matrix, true), store, bus)
    }

    fn depot() -> Coordinates {
        Coordinates { lat: 25.048, lng: 121.532 }
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 2).unwrap()
    }

    fn confirmed_order(store: &MemoryStore) -> Order {
        let mut order = Order::new(
            Uuid::new_v4(),
            date(),
            SizeCount::of(CylinderSize::Kg20, 2),
            OrderPriority::Normal,
        );
        order.status = OrderStatus::Confirmed;
        store.seed_order(order.clone());
        order
    }

    fn solution_for(orders: &[&Order], vehicle_id: Uuid) -> (VrpSolution, HashMap<Uuid, Coordinates>) {
        let mut locations = HashMap::new();
        let deliveries = orders
            .iter()
            .enumerate()
            .map(|(i, o)| {
                locations.insert(o.id, Coordinates { lat: 25.05 + 0.005 * i as f64, lng: 121.54 });
                PlannedDelivery {
                    order_id: o.id,
                    arrival_minute: 540 + 30 * i as u32,
                    service_minutes: 10,
                }
            })
            .collect();
        let solution = VrpSolution {
            plans: vec![VehiclePlan { vehicle_id, deliveries, distance_m: 4200, duration_s: 1800 }],
            unassigned: vec![],
            fallback: false,
            improved: true,
            approximate: false,
            solve_time_ms: 12,
            method: "guided-local-search".to_string(),
        };
        (solution, locations)
    }

    #[tokio::test]
    async fn test_assembly_persists_routes_and_assigns_orders() {
        let (assembler, store, _) = fixture();
        let a = confirmed_order(&store);
        let b = confirmed_order(&store);
        let vehicle = Uuid::new_v4();
        let (solution, locations) = solution_for(&[&a, &b], vehicle);

        let routes = assembler
            .assemble(date(), depot(), &locations, &solution, Uuid::new_v4())
            .await
            .unwrap();
        assert_eq!(routes.len(), 1);

        let route = store.get_route(routes[0].route_id).await.unwrap().unwrap();
        assert_eq!(route.status, RouteStatus::Optimized);
        assert!(!route.polyline.is_empty());

        let stops = store.get_route_stops(route.id).await.unwrap();
        assert_eq!(stops.len(), 2);
        assert_eq!(stops[0].position, 1);
        assert_eq!(stops[1].position, 2);

        // Order-route consistency both ways.
        for stop in &stops {
            let order = store.get_order(stop.order_id).await.unwrap().unwrap();
            assert_eq!(order.status, OrderStatus::Assigned);
            assert_eq!(order.assigned_route, Some(route.id));
        }
    }

    #[tokio::test]
    async fn test_conflict_aborts_whole_assembly() {
        let (assembler, store, _) = fixture();
        let good = confirmed_order(&store);
        let mut taken = confirmed_order(&store);
        taken.status = OrderStatus::Assigned;
        taken.assigned_route = Some(Uuid::new_v4());
        store.seed_order(taken.clone());

        let vehicle = Uuid::new_v4();
        let (solution, locations) = solution_for(&[&good, &taken], vehicle);

        let err = assembler
            .assemble(date(), depot(), &locations, &solution, Uuid::new_v4())
            .await
            .unwrap_err();
        match err {
            CoreError::Conflict { ids, .. } => assert_eq!(ids, vec![taken.id]),
            other => panic!("expected conflict, got {:?}", other),
        }

        // Nothing committed: the good order is untouched and no route exists.
        let untouched = store.get_order(good.id).await.unwrap().unwrap();
        assert_eq!(untouched.status, OrderStatus::Confirmed);
        assert!(store.list_routes(date()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_plans_persist_nothing() {
        let (assembler, store, _) = fixture();
        let vehicle = Uuid::new_v4();
        let solution = VrpSolution::empty(&[vehicle], "none");

        let routes = assembler
            .assemble(date(), depot(), &HashMap::new(), &solution, Uuid::new_v4())
            .await
            .unwrap();
        assert!(routes.is_empty());
        assert!(store.list_routes(date()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_assembly_emits_assigned_and_created_events() {
        let (assembler, store, bus) = fixture();
        let mut conn = bus.connect(ClientRole::Admin, &Default::default()).unwrap();
        let order = confirmed_order(&store);
        let (solution, locations) = solution_for(&[&order], Uuid::new_v4());

        assembler
            .assemble(date(), depot(), &locations, &solution, Uuid::new_v4())
            .await
            .unwrap();

        conn.backlog.clear();
        let mut kinds = Vec::new();
        while let Ok(msg) = conn.rx.try_recv() {
            if let ServerMessage::Event(e) = msg {
                if e.room == Room::Admin {
                    kinds.push(e.kind);
                }
            }
        }
        assert_eq!(kinds, vec![EventKind::OrderAssigned, EventKind::RouteCreated]);
    }
}
