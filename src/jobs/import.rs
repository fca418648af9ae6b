//! BulkImport job: CSV blob → customer upserts and draft orders
//!
//! Each row carries a customer and, optionally, an order for a date. Rows
//! are validated independently; bad rows are collected as issues and the
//! rest of the file still imports.

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::services::state::StateMachine;
use crate::types::{
    Coordinates, Customer, CylinderSize, JobInput, Order, OrderPriority, SizeCount, TimeWindow,
};

use super::registry::{JobContext, JobHandler};

/// One CSV row. Customer fields are required; order fields are optional.
#[derive(Debug, Deserialize)]
struct ImportRow {
    /// Stable id for re-imports; a fresh id is minted when absent.
    customer_id: Option<Uuid>,
    name: String,
    lat: f64,
    lng: f64,
    /// `hh:mm`
    window_start: String,
    window_end: String,
    #[serde(default)]
    service_minutes: Option<i32>,
    #[serde(default)]
    cadence_days: Option<i32>,
    /// When present, a draft order is created for this date.
    #[serde(default)]
    order_date: Option<chrono::NaiveDate>,
    #[serde(default)]
    qty_4kg: Option<u32>,
    #[serde(default)]
    qty_10kg: Option<u32>,
    #[serde(default)]
    qty_16kg: Option<u32>,
    #[serde(default)]
    qty_20kg: Option<u32>,
    #[serde(default)]
    qty_50kg: Option<u32>,
    #[serde(default)]
    priority: Option<OrderPriority>,
}

/// A rejected row with the reason.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportIssue {
    pub row: usize,
    pub message: String,
}

pub struct BulkImportHandler {
    state: Arc<StateMachine>,
}

impl BulkImportHandler {
    pub fn new(state: Arc<StateMachine>) -> Self {
        Self { state }
    }

    fn parse_row(row: &ImportRow) -> Result<(Customer, Option<(chrono::NaiveDate, SizeCount, OrderPriority)>), String> {
        if row.name.trim().is_empty() {
            return Err("name is required".to_string());
        }
        if !(-90.0..=90.0).contains(&row.lat) || !(-180.0..=180.0).contains(&row.lng) {
            return Err(format!("coordinates out of range: ({}, {})", row.lat, row.lng));
        }
        let start = TimeWindow::parse_minute(&row.window_start)
            .ok_or_else(|| format!("bad window_start '{}'", row.window_start))?;
        let end = TimeWindow::parse_minute(&row.window_end)
            .ok_or_else(|| format!("bad window_end '{}'", row.window_end))?;
        if end < start {
            return Err("window end precedes start".to_string());
        }

        let customer = Customer {
            id: row.customer_id.unwrap_or_else(Uuid::new_v4),
            name: row.name.trim().to_string(),
            location: Coordinates { lat: row.lat, lng: row.lng },
            window: TimeWindow::new(start, end),
            service_minutes: row.service_minutes.unwrap_or(10).max(1),
            cadence_days: row.cadence_days,
        };

        let order = match row.order_date {
            Some(date) => {
                let mut items = SizeCount::default();
                items.set(CylinderSize::Kg4, row.qty_4kg.unwrap_or(0));
                items.set(CylinderSize::Kg10, row.qty_10kg.unwrap_or(0));
                items.set(CylinderSize::Kg16, row.qty_16kg.unwrap_or(0));
                items.set(CylinderSize::Kg20, row.qty_20kg.unwrap_or(0));
                items.set(CylinderSize::Kg50, row.qty_50kg.unwrap_or(0));
                if items.is_empty() {
                    return Err("order_date given but every quantity is zero".to_string());
                }
                Some((date, items, row.priority.unwrap_or_default()))
            }
            None => None,
        };

        Ok((customer, order))
    }
}

#[async_trait]
impl JobHandler for BulkImportHandler {
    async fn run(&self, input: JobInput, ctx: &JobContext) -> CoreResult<serde_json::Value> {
        let JobInput::BulkImport { source } = input else {
            return Err(CoreError::validation("input", "expected bulk_import input"));
        };

        let decoded = base64::engine::general_purpose::STANDARD
            .decode(source.as_bytes())
            .map_err(|e| CoreError::validation("source", format!("not valid base64: {}", e)))?;

        let mut reader = csv::Reader::from_reader(decoded.as_slice());
        let rows: Vec<Result<ImportRow, csv::Error>> = reader.deserialize().collect();
        let total = rows.len().max(1);
        info!("bulk import: {} rows", rows.len());

        let mut issues: Vec<ImportIssue> = Vec::new();
        let mut customers_upserted = 0usize;
        let mut orders_created = 0usize;

        for (i, parsed) in rows.into_iter().enumerate() {
            let line = i + 2; // 1-based, after the header
            ctx.checkpoint()?;

            let row = match parsed {
                Ok(row) => row,
                Err(err) => {
                    issues.push(ImportIssue { row: line, message: err.to_string() });
                    continue;
                }
            };
            let (customer, order_spec) = match Self::parse_row(&row) {
                Ok(parts) => parts,
                Err(message) => {
                    issues.push(ImportIssue { row: line, message });
                    continue;
                }
            };

            let customer_id = customer.id;
            self.state.store().upsert_customer(customer).await?;
            customers_upserted += 1;

            if let Some((date, items, priority)) = order_spec {
                let order = Order::new(customer_id, date, items, priority);
                match self.state.create_order(order).await {
                    Ok(_) => orders_created += 1,
                    Err(err) => issues.push(ImportIssue { row: line, message: err.to_string() }),
                }
            }

            if (i + 1) % 50 == 0 {
                ctx.report((i + 1) as f64 / total as f64, "importing").await?;
            }
        }

        info!(
            "bulk import done: {} customers, {} orders, {} issues",
            customers_upserted,
            orders_created,
            issues.len()
        );
        Ok(serde_json::json!({
            "customersUpserted": customers_upserted,
            "ordersCreated": orders_created,
            "issues": issues,
        }))
    }
}
