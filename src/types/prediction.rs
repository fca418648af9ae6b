//! Demand prediction types

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// One customer/date prediction from the external predictor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prediction {
    pub customer_id: Uuid,
    pub date: NaiveDate,
    /// Predicted cylinder count for the customer's usual size.
    pub quantity: u32,
    /// `[0.0, 1.0]`
    pub confidence: f64,
}

/// Groups the predictions of one predictor run.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct PredictionBatch {
    pub id: Uuid,
    pub date: NaiveDate,
    pub customer_count: i32,
    pub draft_count: i32,
    pub created_at: DateTime<Utc>,
}

impl PredictionBatch {
    pub fn new(date: NaiveDate) -> Self {
        Self {
            id: Uuid::new_v4(),
            date,
            customer_count: 0,
            draft_count: 0,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prediction_wire_form() {
        let json = r#"{"customerId":"00000000-0000-0000-0000-000000000001","date":"2026-03-02","quantity":2,"confidence":0.87}"#;
        let p: Prediction = serde_json::from_str(json).unwrap();
        assert_eq!(p.quantity, 2);
        assert!((p.confidence - 0.87).abs() < f64::EPSILON);
    }
}
