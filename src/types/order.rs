//! Order entity and its lifecycle

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use super::SizeCount;

/// Order status lifecycle:
/// `draft → confirmed → assigned → en_route → delivered`,
/// any non-terminal `→ cancelled`, `en_route → failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum OrderStatus {
    Draft,
    Confirmed,
    Assigned,
    EnRoute,
    Delivered,
    Cancelled,
    Failed,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Delivered | OrderStatus::Cancelled | OrderStatus::Failed)
    }

    /// Raw transition table. Invariants that need surrounding state
    /// (route status, stop outcomes) are enforced by the state machine.
    pub fn can_transition_to(&self, to: OrderStatus) -> bool {
        use OrderStatus::*;
        match (*self, to) {
            (Draft, Confirmed) => true,
            (Confirmed, Assigned) => true,
            (Assigned, EnRoute) => true,
            (EnRoute, Delivered) => true,
            (EnRoute, Failed) => true,
            // Unassignment when a route is cancelled
            (Assigned, Confirmed) => true,
            (from, Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum OrderPriority {
    #[default]
    Normal,
    Urgent,
}

/// Where an order came from. Office-created orders have no source tag;
/// prediction drafts carry the batch that produced them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderSource {
    pub prediction_batch_id: Uuid,
}

/// A customer order for one operating day.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub date: NaiveDate,
    /// Line items: count per cylinder size. At least one count ≥ 1.
    #[sqlx(json)]
    pub items: SizeCount,
    pub priority: OrderPriority,
    pub status: OrderStatus,
    /// Non-null exactly while `status == Assigned` or later route-bound states.
    pub assigned_route: Option<Uuid>,
    #[sqlx(json(nullable))]
    pub source: Option<OrderSource>,
    /// Optimistic concurrency counter, bumped on every accepted transition.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn new(customer_id: Uuid, date: NaiveDate, items: SizeCount, priority: OrderPriority) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            customer_id,
            date,
            items,
            priority,
            status: OrderStatus::Draft,
            assigned_route: None,
            source: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Validate creation invariants.
    pub fn validate(&self) -> CoreResult<()> {
        if self.items.is_empty() {
            return Err(CoreError::validation(
                "items",
                "at least one line item with count >= 1 required",
            ));
        }
        Ok(())
    }

    /// Eligible for route optimization: confirmed or still a draft
    /// (drafts are filtered out by the optimize job unless included).
    pub fn is_assignable(&self) -> bool {
        matches!(self.status, OrderStatus::Draft | OrderStatus::Confirmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CylinderSize;

    fn order() -> Order {
        Order::new(
            Uuid::new_v4(),
            NaiveDate::from_ymd_opt(2026, 3, 2).unwrap(),
            SizeCount::of(CylinderSize::Kg20, 2),
            OrderPriority::Normal,
        )
    }

    #[test]
    fn test_new_order_is_draft_version_zero() {
        let o = order();
        assert_eq!(o.status, OrderStatus::Draft);
        assert_eq!(o.version, 0);
        assert!(o.assigned_route.is_none());
    }

    #[test]
    fn test_empty_items_rejected() {
        let mut o = order();
        o.items = SizeCount::default();
        assert!(o.validate().is_err());
    }

    #[test]
    fn test_happy_path_transitions() {
        use OrderStatus::*;
        assert!(Draft.can_transition_to(Confirmed));
        assert!(Confirmed.can_transition_to(Assigned));
        assert!(Assigned.can_transition_to(EnRoute));
        assert!(EnRoute.can_transition_to(Delivered));
    }

    #[test]
    fn test_failed_only_from_en_route() {
        use OrderStatus::*;
        assert!(EnRoute.can_transition_to(Failed));
        assert!(!Confirmed.can_transition_to(Failed));
        assert!(!Assigned.can_transition_to(Failed));
    }

    #[test]
    fn test_cancel_from_any_non_terminal() {
        use OrderStatus::*;
        for from in [Draft, Confirmed, Assigned, EnRoute] {
            assert!(from.can_transition_to(Cancelled), "{:?} should cancel", from);
        }
        for from in [Delivered, Cancelled, Failed] {
            assert!(!from.can_transition_to(Cancelled), "{:?} is terminal", from);
        }
    }

    #[test]
    fn test_no_skipping_states() {
        use OrderStatus::*;
        assert!(!Draft.can_transition_to(Assigned));
        assert!(!Confirmed.can_transition_to(EnRoute));
        assert!(!Draft.can_transition_to(Delivered));
    }

    #[test]
    fn test_unassign_back_to_confirmed() {
        assert!(OrderStatus::Assigned.can_transition_to(OrderStatus::Confirmed));
        assert!(!OrderStatus::EnRoute.can_transition_to(OrderStatus::Confirmed));
    }

    #[test]
    fn test_status_wire_form_is_snake_case() {
        let json = serde_json::to_string(&OrderStatus::EnRoute).unwrap();
        assert_eq!(json, "\"en_route\"");
    }
}
