//! BatchPredict job: predictor batches → prediction batch + draft orders

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::error::{CoreError, CoreResult};
use crate::services::breaker::CircuitBreaker;
use crate::services::drafts::DraftGenerator;
use crate::services::predictor::Predictor;
use crate::services::state::StateMachine;
use crate::types::{JobInput, Prediction, PredictionBatch};

use super::registry::{JobContext, JobHandler};

/// Customers per predictor call.
const BATCH_SIZE: usize = 100;

pub struct BatchPredictHandler {
    state: Arc<StateMachine>,
    predictor: Arc<dyn Predictor>,
    drafts: Arc<DraftGenerator>,
    breaker: CircuitBreaker,
}

impl BatchPredictHandler {
    pub fn new(
        state: Arc<StateMachine>,
        predictor: Arc<dyn Predictor>,
        drafts: Arc<DraftGenerator>,
    ) -> Self {
        Self { state, predictor, drafts, breaker: CircuitBreaker::with_defaults() }
    }
}

#[async_trait]
impl JobHandler for BatchPredictHandler {
    async fn run(&self, input: JobInput, ctx: &JobContext) -> CoreResult<serde_json::Value> {
        let JobInput::BatchPredict { date, customer_ids } = input else {
            return Err(CoreError::validation("input", "expected batch_predict input"));
        };

        ctx.report(0.05, "loading customers").await?;
        let customers = self.state.store().list_customers(&customer_ids).await?;
        if customers.is_empty() {
            return Err(CoreError::validation("customerIds", "no customers to predict"));
        }
        info!("predicting {} for {} customers", date, customers.len());

        let mut predictions: Vec<Prediction> = Vec::with_capacity(customers.len());
        let chunks: Vec<_> = customers.chunks(BATCH_SIZE).collect();
        let total = chunks.len();

        for (i, chunk) in chunks.into_iter().enumerate() {
            // Cancellation is observed at every external call boundary.
            ctx.checkpoint()?;
            if self.breaker.is_open() {
                return Err(CoreError::provider("predictor", "circuit open"));
            }
            match self.predictor.predict(chunk, date).await {
                Ok(batch) => {
                    self.breaker.record_success();
                    predictions.extend(batch);
                }
                Err(err) => {
                    self.breaker.record_failure();
                    return Err(CoreError::provider("predictor", err.to_string()));
                }
            }
            ctx.report(0.1 + 0.6 * (i + 1) as f64 / total as f64, "predicting").await?;
        }

        ctx.checkpoint()?;
        ctx.report(0.8, "generating drafts").await?;
        let mut batch = PredictionBatch::new(date);
        let created = self.drafts.generate(&predictions, &mut batch).await?;

        Ok(serde_json::json!({
            "batchId": batch.id,
            "customerCount": batch.customer_count,
            "draftCount": batch.draft_count,
            "orderIds": created,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusConfig, EventBus};
    use crate::services::predictor::MockPredictor;
    use crate::store::{MemoryStore, Store};
    use crate::types::{Coordinates, Customer, JobKind, OrderStatus, TimeWindow};
    use chrono::NaiveDate;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    fn fixture() -> (BatchPredictHandler, Arc<MemoryStore>, EventBus) {
        let store = Arc::new(MemoryStore::new());
        let bus = EventBus::new(BusConfig::default());
        let state = Arc::new(StateMachine::new(store.clone() as Arc<dyn Store>, bus.clone()));
        let drafts = Arc::new(DraftGenerator::new(state.clone(), 0.0));
        (
            BatchPredictHandler::new(state, Arc::new(MockPredictor::new()), drafts),
            store,
            bus,
        )
    }

    fn context(store: Arc<MemoryStore>, bus: EventBus) -> JobContext {
        JobContext::new(Uuid::new_v4(), JobKind::BatchPredict, CancellationToken::new(), store, bus)
    }

    fn seed_customers(store: &MemoryStore, n: usize) -> Vec<Uuid> {
        (0..n)
            .map(|i| {
                let customer = Customer {
                    id: Uuid::new_v4(),
                    name: format!("Customer {}", i),
                    location: Coordinates { lat: 25.0 + 0.01 * i as f64, lng: 121.5 },
                    window: TimeWindow::new(540, 1020),
                    service_minutes: 10,
                    cadence_days: Some(14),
                };
                store.seed_customer(customer.clone());
                customer.id
            })
            .collect()
    }

    #[tokio::test]
    async fn test_predict_creates_drafts() {
        let (handler, store, bus) = fixture();
        seed_customers(&store, 5);
        let date = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();

        let ctx = context(store.clone(), bus);
        let result = handler
            .run(JobInput::BatchPredict { date, customer_ids: vec![] }, &ctx)
            .await
            .unwrap();

        assert_eq!(result["customerCount"], 5);
        let draft_count = result["draftCount"].as_i64().unwrap();
        assert!(draft_count > 0);

        let drafts = store.list_orders(date, &[OrderStatus::Draft]).await.unwrap();
        assert_eq!(drafts.len() as i64, draft_count);
        for draft in drafts {
            assert!(draft.source.is_some());
        }
    }

    #[tokio::test]
    async fn test_no_customers_is_validation_error() {
        let (handler, store, bus) = fixture();
        let date = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
        let ctx = context(store.clone(), bus);

        let err = handler
            .run(JobInput::BatchPredict { date, customer_ids: vec![] }, &ctx)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION");
    }

    #[tokio::test]
    async fn test_cancel_observed_between_batches() {
        let (handler, store, bus) = fixture();
        seed_customers(&store, 3);
        let date = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();

        let ctx = context(store.clone(), bus);
        ctx.cancel_token().cancel();
        let err = handler
            .run(JobInput::BatchPredict { date, customer_ids: vec![] }, &ctx)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CANCELLED");
    }
}
