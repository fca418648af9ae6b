//! Demand predictor abstraction
//!
//! External service that scores per-customer demand for a target date.
//! HTTP implementation for production, deterministic mock for tests and
//! offline development.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::types::{Customer, Prediction};

/// Predictor trait - abstraction for demand prediction backends
#[async_trait]
pub trait Predictor: Send + Sync {
    /// Predict demand for the given customers on `target_date`. The caller
    /// controls batch size; implementations may shard internally.
    async fn predict(&self, customers: &[Customer], target_date: NaiveDate) -> Result<Vec<Prediction>>;

    fn name(&self) -> &'static str;
}

// ==========================================================================
// HTTP predictor
// ==========================================================================

#[derive(Debug, Clone)]
pub struct PredictorConfig {
    pub base_url: String,
    pub timeout_seconds: u64,
}

impl PredictorConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self { base_url: base_url.into(), timeout_seconds: 20 }
    }
}

pub struct HttpPredictor {
    client: Client,
    config: PredictorConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PredictRequest<'a> {
    customer_ids: Vec<Uuid>,
    target_date: &'a NaiveDate,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PredictResponse {
    predictions: Vec<Prediction>,
}

impl HttpPredictor {
    pub fn new(config: PredictorConfig) -> Self {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_seconds))
            .build()
            .expect("Failed to create HTTP client");
        Self { client, config }
    }

    pub async fn health_check(&self) -> Result<()> {
        let url = format!("{}/health", self.config.base_url);
        let response = self.client.get(&url).send().await?;
        if response.status().is_success() {
            Ok(())
        } else {
            anyhow::bail!("predictor returned status {}", response.status())
        }
    }
}

#[async_trait]
impl Predictor for HttpPredictor {
    async fn predict(&self, customers: &[Customer], target_date: NaiveDate) -> Result<Vec<Prediction>> {
        if customers.is_empty() {
            return Ok(vec![]);
        }

        let request = PredictRequest {
            customer_ids: customers.iter().map(|c| c.id).collect(),
            target_date: &target_date,
        };
        let url = format!("{}/predict", self.config.base_url);

        debug!("requesting predictions for {} customers", customers.len());

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .context("Failed to send predict request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("predictor returned error {}: {}", status, body);
        }

        let parsed: PredictResponse = response
            .json()
            .await
            .context("Failed to parse predictor response")?;
        Ok(parsed.predictions)
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

// ==========================================================================
// Mock predictor
// ==========================================================================

/// Deterministic mock: quantity and confidence derive from a hash of the
/// customer id and date, so repeated calls agree.
pub struct MockPredictor;

impl MockPredictor {
    pub fn new() -> Self {
        Self
    }

    fn hash(customer_id: Uuid, date: NaiveDate) -> u64 {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};
        let mut hasher = DefaultHasher::new();
        customer_id.hash(&mut hasher);
        date.hash(&mut hasher);
        hasher.finish()
    }
}

impl Default for MockPredictor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Predictor for MockPredictor {
    async fn predict(&self, customers: &[Customer], target_date: NaiveDate) -> Result<Vec<Prediction>> {
        Ok(customers
            .iter()
            .map(|c| {
                let h = Self::hash(c.id, target_date);
                Prediction {
                    customer_id: c.id,
                    date: target_date,
                    quantity: 1 + (h % 3) as u32,
                    confidence: 0.5 + ((h >> 8) % 50) as f64 / 100.0,
                }
            })
            .collect())
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

/// Create a predictor with automatic detection and fallback, mirroring the
/// routing provider factory.
pub async fn create_predictor_with_fallback(predictor_url: Option<String>) -> Box<dyn Predictor> {
    if let Some(url) = predictor_url {
        let predictor = HttpPredictor::new(PredictorConfig::new(&url));
        match predictor.health_check().await {
            Ok(()) => {
                info!("predictor available at {}", url);
                return Box::new(predictor);
            }
            Err(e) => {
                warn!("predictor not available at {}: {}. Falling back to mock.", url, e);
            }
        }
    }
    info!("using mock predictor (not configured or unavailable)");
    Box::new(MockPredictor::new())
}
