//! Predictive draft generator
//!
//! Turns predictor output into `draft` orders for a target operating date.
//! Customers with an open non-terminal order for that date are suppressed.
//! Drafts carry the source batch id and require explicit confirmation
//! before they become eligible for optimization.

use std::sync::Arc;

use tracing::{debug, info};
use uuid::Uuid;

use crate::error::CoreResult;
use crate::services::state::StateMachine;
use crate::store::TxWrite;
use crate::types::{
    CylinderSize, EventDraft, EventKind, Order, OrderPriority, OrderSource, Prediction,
    PredictionBatch, Room, SizeCount,
};

pub struct DraftGenerator {
    state: Arc<StateMachine>,
    /// Predictions below this confidence are dropped.
    min_confidence: f64,
}

impl DraftGenerator {
    pub fn new(state: Arc<StateMachine>, min_confidence: f64) -> Self {
        Self { state, min_confidence }
    }

    /// Generate draft orders from one predictor run. Returns the ids of the
    /// created drafts; the batch row records counts for review.
    pub async fn generate(
        &self,
        predictions: &[Prediction],
        batch: &mut PredictionBatch,
    ) -> CoreResult<Vec<Uuid>> {
        batch.customer_count = predictions.len() as i32;
        let mut created = Vec::new();

        for prediction in predictions {
            if prediction.confidence < self.min_confidence {
                debug!(
                    "skipping {}: confidence {:.2} below {:.2}",
                    prediction.customer_id, prediction.confidence, self.min_confidence
                );
                continue;
            }
            if prediction.quantity == 0 {
                continue;
            }

            // Suppress when the customer already has an open order that day.
            let open = self
                .state
                .store()
                .list_customer_orders(prediction.customer_id, prediction.date)
                .await?
                .into_iter()
                .any(|o| !o.status.is_terminal());
            if open {
                debug!("skipping {}: open order exists", prediction.customer_id);
                continue;
            }

            // Predicted quantities are household-size cylinders.
            let mut order = Order::new(
                prediction.customer_id,
                prediction.date,
                SizeCount::of(CylinderSize::Kg20, prediction.quantity),
                OrderPriority::Normal,
            );
            order.source = Some(OrderSource { prediction_batch_id: batch.id });

            let order = self.state.create_order(order).await?;
            created.push(order.id);
        }

        batch.draft_count = created.len() as i32;

        // Persist the batch and tell the predictions room drafts are ready.
        let notify = EventDraft::new(
            EventKind::Notification,
            serde_json::json!({
                "batchId": batch.id,
                "date": batch.date,
                "draftCount": batch.draft_count,
            }),
        );
        let write = TxWrite {
            prediction_batches: vec![batch.clone()],
            ..Default::default()
        };
        self.state
            .commit_and_publish(write, vec![(vec![Room::Admin, Room::Predictions], notify)])
            .await?;

        info!(
            "prediction batch {}: {} drafts from {} predictions",
            batch.id, batch.draft_count, batch.customer_count
        );
        Ok(created)
    }
}
