//! Order/route state machine
//!
//! The single mutation path for orders and routes. Every accepted transition
//! is validated against the machine, committed together with its event-log
//! rows in one store batch, and published onto the bus in commit order. A
//! broker-side mutex serializes commit+publish so subscribers observe
//! per-entity events in the order they committed.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use crate::bus::EventBus;
use crate::error::{CoreError, CoreResult};
use crate::store::{EventLogRow, Store, TxWrite, Versioned};
use crate::types::{
    DriverPosition, EventDraft, EventKind, Order, OrderStatus, Room, Route, RouteStatus,
    RouteStop, StopOutcome,
};

pub struct StateMachine {
    store: Arc<dyn Store>,
    bus: EventBus,
    /// Serializes commit+publish so bus order matches commit order.
    publish_lock: Mutex<()>,
}

impl StateMachine {
    pub fn new(store: Arc<dyn Store>, bus: EventBus) -> Self {
        Self { store, bus, publish_lock: Mutex::new(()) }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Rooms an order event fans into.
    pub fn order_rooms(order: &Order) -> Vec<Room> {
        vec![Room::Admin, Room::Orders, Room::Customer(order.customer_id)]
    }

    /// Rooms a route event fans into.
    pub fn route_rooms(route: &Route) -> Vec<Room> {
        vec![Room::Admin, Room::Routes, Room::Driver(route.driver_id)]
    }

    /// Commit a write batch and publish its events, atomically with respect
    /// to other state-machine callers.
    pub async fn commit_and_publish(
        &self,
        write: TxWrite,
        events: Vec<(Vec<Room>, EventDraft)>,
    ) -> CoreResult<()> {
        let _guard = self.publish_lock.lock().await;
        self.store.commit(write).await?;
        for (rooms, draft) in events {
            self.bus.publish(&rooms, draft);
        }
        Ok(())
    }

    // ----------------------------------------------------------------------
    // Orders
    // ----------------------------------------------------------------------

    /// Create an order (office staff or the draft generator).
    pub async fn create_order(&self, order: Order) -> CoreResult<Order> {
        order.validate()?;
        let draft = order_event(EventKind::OrderCreated, &order);
        let write = TxWrite {
            new_orders: vec![order.clone()],
            events: vec![event_row(&draft, order.id)],
            ..Default::default()
        };
        self.commit_and_publish(write, vec![(Self::order_rooms(&order), draft)]).await?;
        Ok(order)
    }

    /// Transition one order. `assigned` cannot be entered here; assignment
    /// happens through route assembly so the route reference exists.
    pub async fn transition_order(&self, order_id: Uuid, to: OrderStatus) -> CoreResult<Order> {
        let order = self
            .store
            .get_order(order_id)
            .await?
            .ok_or_else(|| CoreError::conflict("order not found", vec![order_id]))?;

        if !order.status.can_transition_to(to) {
            return Err(CoreError::conflict(
                format!("order cannot move {:?} -> {:?}", order.status, to),
                vec![order_id],
            ));
        }
        if to == OrderStatus::Assigned {
            // Entering `assigned` requires a live route; see the assembler.
            let route_ok = match order.assigned_route {
                Some(route_id) => self
                    .store
                    .get_route(route_id)
                    .await?
                    .map_or(false, |r| r.status.holds_assignments()),
                None => false,
            };
            if !route_ok {
                return Err(CoreError::conflict(
                    "assigned requires a route in optimized/dispatched/in_progress",
                    vec![order_id],
                ));
            }
        }

        let expected_version = order.version;
        let mut updated = order;
        updated.status = to;
        if matches!(to, OrderStatus::Confirmed | OrderStatus::Cancelled) {
            updated.assigned_route = None;
        }

        let draft = order_event(EventKind::OrderUpdated, &updated);
        let write = TxWrite {
            orders: vec![Versioned::new(updated.clone(), expected_version)],
            events: vec![event_row(&draft, updated.id)],
            ..Default::default()
        };
        self.commit_and_publish(write, vec![(Self::order_rooms(&updated), draft)]).await?;

        updated.version = expected_version + 1;
        info!("order {} -> {:?}", updated.id, to);
        Ok(updated)
    }

    // ----------------------------------------------------------------------
    // Routes
    // ----------------------------------------------------------------------

    pub async fn transition_route(&self, route_id: Uuid, to: RouteStatus) -> CoreResult<Route> {
        let route = self
            .store
            .get_route(route_id)
            .await?
            .ok_or_else(|| CoreError::conflict("route not found", vec![route_id]))?;

        if !route.status.can_transition_to(to) {
            return Err(CoreError::conflict(
                format!("route cannot move {:?} -> {:?}", route.status, to),
                vec![route_id],
            ));
        }

        let stops = self.store.get_route_stops(route_id).await?;
        match to {
            RouteStatus::InProgress => {
                if stops.iter().all(|s| s.outcome == StopOutcome::Pending) {
                    return Err(CoreError::conflict(
                        "in_progress requires at least one visited stop",
                        vec![route_id],
                    ));
                }
            }
            RouteStatus::Completed => {
                if !stops.iter().all(|s| s.outcome.is_terminal()) {
                    return Err(CoreError::conflict(
                        "completed requires every stop in a terminal outcome",
                        vec![route_id],
                    ));
                }
            }
            _ => {}
        }

        let expected_version = route.version;
        let mut updated = route;
        updated.status = to;

        let mut write = TxWrite {
            routes: vec![Versioned::new(updated.clone(), expected_version)],
            ..Default::default()
        };
        let route_draft = route_event(EventKind::RouteUpdated, &updated);
        write.events.push(event_row(&route_draft, updated.id));
        let mut events = vec![(Self::route_rooms(&updated), route_draft)];

        // Cancelling a route releases its orders back to confirmed.
        if to == RouteStatus::Cancelled {
            for stop in &stops {
                let Some(order) = self.store.get_order(stop.order_id).await? else { continue };
                if order.status != OrderStatus::Assigned || order.assigned_route != Some(route_id) {
                    continue;
                }
                let expected = order.version;
                let mut released = order;
                released.status = OrderStatus::Confirmed;
                released.assigned_route = None;
                let draft = order_event(EventKind::OrderUpdated, &released);
                write.events.push(event_row(&draft, released.id));
                events.push((Self::order_rooms(&released), draft));
                write.orders.push(Versioned::new(released, expected));
            }
        }

        self.commit_and_publish(write, events).await?;
        updated.version = expected_version + 1;
        info!("route {} -> {:?}", updated.id, to);
        Ok(updated)
    }

    /// Record a stop outcome from a driver client and emit `route.progress`.
    pub async fn record_stop_outcome(
        &self,
        route_id: Uuid,
        position: i32,
        outcome: StopOutcome,
    ) -> CoreResult<RouteStop> {
        let route = self
            .store
            .get_route(route_id)
            .await?
            .ok_or_else(|| CoreError::conflict("route not found", vec![route_id]))?;
        let stops = self.store.get_route_stops(route_id).await?;
        let stop = stops
            .iter()
            .find(|s| s.position == position)
            .ok_or_else(|| CoreError::validation("position", "no such stop"))?;

        let mut updated = stop.clone();
        let now = Utc::now();
        match outcome {
            StopOutcome::Arrived => updated.actual_arrival = Some(now),
            StopOutcome::Delivered | StopOutcome::Skipped | StopOutcome::Failed => {
                if updated.actual_arrival.is_none() {
                    updated.actual_arrival = Some(now);
                }
                updated.actual_departure = Some(now);
            }
            StopOutcome::Pending => {
                return Err(CoreError::validation("outcome", "cannot reset a stop to pending"))
            }
        }
        updated.outcome = outcome;

        let draft = EventDraft::new(
            EventKind::RouteProgress,
            serde_json::json!({
                "routeId": route_id,
                "position": position,
                "outcome": outcome,
            }),
        );
        let write = TxWrite {
            route_stops: vec![updated.clone()],
            events: vec![event_row(&draft, route_id)],
            ..Default::default()
        };
        self.commit_and_publish(write, vec![(Self::route_rooms(&route), draft)]).await?;
        Ok(updated)
    }

    // ----------------------------------------------------------------------
    // Presence
    // ----------------------------------------------------------------------

    /// Record a driver position sample: presence ring plus a
    /// `driver.location` event. Not persisted.
    pub fn record_position(&self, position: DriverPosition) {
        let rooms = vec![Room::Admin, Room::Driver(position.driver_id)];
        let draft = EventDraft::new(
            EventKind::DriverLocation,
            serde_json::to_value(&position).unwrap_or_default(),
        );
        self.bus.presence().record(position);
        self.bus.publish(&rooms, draft);
    }
}

pub(crate) fn order_event(kind: EventKind, order: &Order) -> EventDraft {
    EventDraft::new(kind, serde_json::to_value(order).unwrap_or_default())
}

pub(crate) fn route_event(kind: EventKind, route: &Route) -> EventDraft {
    EventDraft::new(kind, serde_json::to_value(route).unwrap_or_default())
}

pub(crate) fn event_row(draft: &EventDraft, entity_id: Uuid) -> EventLogRow {
    EventLogRow {
        event_id: draft.event_id,
        kind: draft.kind,
        entity_id,
        payload: draft.payload.clone(),
        occurred_at: draft.occurred_at,
    }
}
