//! OptimizeDay job: orders + drivers → solved, assembled routes

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::services::assembler::RouteAssembler;
use crate::services::state::StateMachine;
use crate::solver::{OrderInput, VehicleInput, VrpProblem, VrpSolver};
use crate::types::{
    Coordinates, Driver, OptimizationResponse, Order, OrderStatus, PlannedRouteSpec,
    PlannedStopSpec, UnassignedSpec,
};

use super::registry::{JobContext, JobHandler};

pub struct OptimizeDayHandler {
    state: Arc<StateMachine>,
    solver: Arc<VrpSolver>,
    assembler: Arc<RouteAssembler>,
    depot: Coordinates,
}

impl OptimizeDayHandler {
    pub fn new(
        state: Arc<StateMachine>,
        solver: Arc<VrpSolver>,
        assembler: Arc<RouteAssembler>,
        depot: Coordinates,
    ) -> Self {
        Self { state, solver, assembler, depot }
    }

    async fn load_drivers(&self, driver_ids: &[Uuid]) -> CoreResult<Vec<Driver>> {
        let store = self.state.store();
        if driver_ids.is_empty() {
            return store.list_active_drivers().await;
        }
        let mut drivers = Vec::with_capacity(driver_ids.len());
        for id in driver_ids {
            match store.get_driver(*id).await? {
                Some(driver) => drivers.push(driver),
                None => {
                    return Err(CoreError::validation("driverIds", format!("unknown driver {}", id)))
                }
            }
        }
        Ok(drivers)
    }

    /// Resolve order rows into solver inputs via their customers. Orders
    /// whose customer is missing are reported, not silently dropped.
    async fn load_order_inputs(
        &self,
        orders: &[Order],
    ) -> CoreResult<(Vec<OrderInput>, HashMap<Uuid, Coordinates>, Vec<Uuid>)> {
        let store = self.state.store();
        let mut inputs = Vec::with_capacity(orders.len());
        let mut locations = HashMap::new();
        let mut skipped = Vec::new();

        for order in orders {
            let Some(customer) = store.get_customer(order.customer_id).await? else {
                warn!("order {} has no customer record; skipping", order.id);
                skipped.push(order.id);
                continue;
            };
            locations.insert(order.id, customer.location);
            inputs.push(OrderInput {
                id: order.id,
                customer_id: order.customer_id,
                location: customer.location,
                demand: order.items,
                window: customer.window,
                service_minutes: customer.service_minutes.max(0) as u32,
                priority: order.priority,
            });
        }
        Ok((inputs, locations, skipped))
    }
}

#[async_trait]
impl JobHandler for OptimizeDayHandler {
    async fn run(&self, input: crate::types::JobInput, ctx: &JobContext) -> CoreResult<serde_json::Value> {
        let crate::types::JobInput::OptimizeDay {
            date,
            driver_ids,
            include_drafts,
            objective,
            budget_ms,
            atomic_customers,
        } = input
        else {
            return Err(CoreError::validation("input", "expected optimize_day input"));
        };

        ctx.report(0.05, "loading orders and drivers").await?;
        let statuses: &[OrderStatus] = if include_drafts {
            &[OrderStatus::Draft, OrderStatus::Confirmed]
        } else {
            &[OrderStatus::Confirmed]
        };
        let orders = self.state.store().list_orders(date, statuses).await?;
        let drivers = self.load_drivers(&driver_ids).await?;
        info!("optimizing {}: {} orders, {} drivers", date, orders.len(), drivers.len());

        ctx.checkpoint()?;
        let (order_inputs, locations, _skipped) = self.load_order_inputs(&orders).await?;

        let vehicles: Vec<VehicleInput> = drivers
            .iter()
            .map(|d| VehicleInput {
                id: d.id,
                capacity: d.capacity,
                shift: d.shift,
                start: d.start_location,
            })
            .collect();
        let problem = VrpProblem::build(self.depot, order_inputs, vehicles, &atomic_customers)?;

        ctx.report(0.2, "solving").await?;
        let solution = self
            .solver
            .solve(problem, objective, budget_ms, ctx.cancel_token())
            .await?;

        ctx.checkpoint()?;
        ctx.report(0.8, "assembling routes").await?;
        let assembled = self
            .assembler
            .assemble(date, self.depot, &locations, &solution, ctx.job_id)
            .await?;
        let by_driver: HashMap<Uuid, &crate::services::assembler::AssembledRoute> =
            assembled.iter().map(|r| (r.driver_id, r)).collect();

        ctx.report(0.95, "shaping response").await?;
        let routes = solution
            .plans
            .iter()
            .map(|plan| {
                let assembled = by_driver.get(&plan.vehicle_id);
                PlannedRouteSpec {
                    driver_id: plan.vehicle_id,
                    stops: plan
                        .deliveries
                        .iter()
                        .enumerate()
                        .map(|(i, d)| PlannedStopSpec {
                            order_id: d.order_id,
                            seq: (i as u32) + 1,
                            arrival_minute: d.arrival_minute,
                            service_minutes: d.service_minutes,
                        })
                        .collect(),
                    distance_m: assembled.map_or(plan.distance_m, |a| a.distance_m),
                    duration_s: assembled.map_or(plan.duration_s, |a| a.duration_s),
                    polyline: assembled.map_or(String::new(), |a| a.polyline.clone()),
                }
            })
            .collect();

        let response = OptimizationResponse {
            job_id: ctx.job_id,
            fallback: solution.fallback,
            routes,
            unassigned: solution
                .unassigned
                .iter()
                .map(|(order_id, reason)| UnassignedSpec { order_id: *order_id, reason: *reason })
                .collect(),
        };

        serde_json::to_value(&response).map_err(CoreError::internal)
    }
}
