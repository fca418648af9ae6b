//! Optimization request/response wire formats

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{SizeCount, TimeWindow};

/// What the objective weighs: distance vs. time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Objective {
    #[default]
    Balanced,
    MinimizeTime,
    MinimizeFuel,
}

impl Objective {
    /// `(distance_weight, time_weight)` applied to meters and seconds.
    pub fn weights(&self) -> (f64, f64) {
        match self {
            Objective::Balanced => (1.0, 1.0),
            Objective::MinimizeTime => (0.2, 2.0),
            Objective::MinimizeFuel => (2.0, 0.2),
        }
    }
}

/// Why a stop ended up unassigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnassignedReason {
    /// No vehicle can reach the stop inside its service window.
    WindowInfeasible,
    /// Demand exceeds the largest per-size vehicle capacity, or no vehicle
    /// has residual capacity left.
    CapacityInfeasible,
    /// The stop cannot fit inside any vehicle's shift.
    ShiftInfeasible,
    /// No vehicles were provided.
    NoVehicle,
    /// The budget ran out before the stop could be placed.
    BudgetExhausted,
}

/// Vehicle as submitted in an optimization request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VehicleSpec {
    pub id: Uuid,
    pub capacity: SizeCount,
    pub shift: TimeWindow,
    /// `[lat, lon]`
    pub start: [f64; 2],
}

/// Order as submitted in an optimization request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderSpec {
    pub id: Uuid,
    pub customer_id: Uuid,
    /// `[lat, lon]`
    pub location: [f64; 2],
    pub demand: SizeCount,
    pub window: TimeWindow,
    pub service_minutes: u32,
    #[serde(default)]
    pub priority: super::OrderPriority,
}

/// The optimization input format exposed to callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizationRequest {
    pub date: NaiveDate,
    pub vehicles: Vec<VehicleSpec>,
    pub orders: Vec<OrderSpec>,
    #[serde(default)]
    pub objective: Objective,
    #[serde(default)]
    pub budget_ms: Option<u64>,
}

/// One planned stop in the response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedStopSpec {
    pub order_id: Uuid,
    /// 1-based position in the vehicle's tour.
    pub seq: u32,
    pub arrival_minute: u32,
    pub service_minutes: u32,
}

/// One vehicle's tour in the response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedRouteSpec {
    pub driver_id: Uuid,
    pub stops: Vec<PlannedStopSpec>,
    pub distance_m: u64,
    pub duration_s: u64,
    pub polyline: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnassignedSpec {
    pub order_id: Uuid,
    pub reason: UnassignedReason,
}

/// The optimization output format exposed to callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizationResponse {
    pub job_id: Uuid,
    pub fallback: bool,
    pub routes: Vec<PlannedRouteSpec>,
    pub unassigned: Vec<UnassignedSpec>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CylinderSize;

    #[test]
    fn test_request_parses_spec_shape() {
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
                "serviceMinutes": 10,
                "priority": "urgent"
            }],
            "objective": "balanced",
            "budgetMs": 10000
        }"#;

        let req: OptimizationRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.vehicles.len(), 1);
        assert_eq!(req.vehicles[0].capacity.get(CylinderSize::Kg20), 20);
        assert_eq!(req.orders[0].window, TimeWindow::new(540, 1020));
        assert_eq!(req.budget_ms, Some(10_000));
        assert_eq!(req.objective, Objective::Balanced);
    }

    #[test]
    fn test_request_defaults() {
        let json = r#"{"date": "2026-03-02", "vehicles": [], "orders": []}"#;
        let req: OptimizationRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.objective, Objective::Balanced);
        assert!(req.budget_ms.is_none());
    }

    #[test]
    fn test_objective_weights_ordering() {
        let (d_bal, t_bal) = Objective::Balanced.weights();
        let (d_time, t_time) = Objective::MinimizeTime.weights();
        let (d_fuel, t_fuel) = Objective::MinimizeFuel.weights();
        assert!(t_time / d_time > t_bal / d_bal);
        assert!(d_fuel / t_fuel > d_bal / t_bal);
    }

    #[test]
    fn test_unassigned_reason_wire_form() {
        assert_eq!(
            serde_json::to_string(&UnassignedReason::WindowInfeasible).unwrap(),
            "\"window_infeasible\""
        );
    }

    #[test]
    fn test_response_round_trip() {
        let resp = OptimizationResponse {
            job_id: Uuid::nil(),
            fallback: false,
            routes: vec![PlannedRouteSpec {
                driver_id: Uuid::nil(),
                stops: vec![PlannedStopSpec {
                    order_id: Uuid::nil(),
                    seq: 1,
                    arrival_minute: 545,
                    service_minutes: 10,
                }],
                distance_m: 1200,
                duration_s: 480,
                polyline: "_p~iF~ps|U".to_string(),
            }],
            unassigned: vec![],
        };
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("\"fallback\":false"));
        assert!(json.contains("arrivalMinute"));
        let back: OptimizationResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(back.routes[0].stops[0].seq, 1);
    }
}
