//! Background job records
//!
//! Jobs are owned by the orchestrator; everything else observes them through
//! the job table and `job.*` events.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum JobKind {
    OptimizeDay,
    BatchPredict,
    BulkImport,
}

/// Monotonically forward except `queued → cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled)
    }

    pub fn can_transition_to(&self, to: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (*self, to),
            (Queued, Running) | (Queued, Cancelled) | (Running, Succeeded) | (Running, Failed) | (Running, Cancelled)
        )
    }
}

/// Typed input for each job kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobInput {
    #[serde(rename_all = "camelCase")]
    OptimizeDay {
        date: NaiveDate,
        /// Empty means every active driver.
        #[serde(default)]
        driver_ids: Vec<Uuid>,
        /// Include draft orders in addition to confirmed ones.
        #[serde(default)]
        include_drafts: bool,
        #[serde(default)]
        objective: crate::types::Objective,
        #[serde(default)]
        budget_ms: Option<u64>,
        /// Customer ids whose same-day orders must ride on one vehicle.
        #[serde(default)]
        atomic_customers: Vec<Uuid>,
    },
    #[serde(rename_all = "camelCase")]
    BatchPredict {
        date: NaiveDate,
        /// Empty means every customer with a location.
        #[serde(default)]
        customer_ids: Vec<Uuid>,
    },
    #[serde(rename_all = "camelCase")]
    BulkImport {
        /// Base64-encoded CSV blob.
        source: String,
    },
}

impl JobInput {
    pub fn kind(&self) -> JobKind {
        match self {
            JobInput::OptimizeDay { .. } => JobKind::OptimizeDay,
            JobInput::BatchPredict { .. } => JobKind::BatchPredict,
            JobInput::BulkImport { .. } => JobKind::BulkImport,
        }
    }

    /// Target key for per-key FIFO ordering (one OptimizeDay per date runs
    /// at a time; later submissions for the same date queue behind it).
    pub fn target_key(&self) -> String {
        match self {
            JobInput::OptimizeDay { date, .. } => format!("optimize:{}", date),
            JobInput::BatchPredict { date, .. } => format!("predict:{}", date),
            JobInput::BulkImport { .. } => "import".to_string(),
        }
    }
}

/// A persisted job row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: Uuid,
    pub kind: JobKind,
    pub submitter: Uuid,
    pub status: JobStatus,
    #[sqlx(json)]
    pub input: JobInput,
    /// Serialized per-key ordering key, denormalized from the input.
    pub target_key: String,
    /// `[0.0, 1.0]`, only increases while running.
    pub progress: f64,
    pub error_message: Option<String>,
    /// Kind-specific result: route ids, prediction batch id, import counts.
    pub result: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Last progress report; drives orphan detection after a crash.
    pub last_progress_at: Option<DateTime<Utc>>,
    pub version: i64,
}

impl Job {
    pub fn new(submitter: Uuid, input: JobInput) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: input.kind(),
            submitter,
            status: JobStatus::Queued,
            target_key: input.target_key(),
            input,
            progress: 0.0,
            error_message: None,
            result: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            last_progress_at: None,
            version: 0,
        }
    }
}

/// Filter for `list(filter)`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobFilter {
    #[serde(default)]
    pub kind: Option<JobKind>,
    #[serde(default)]
    pub status: Option<JobStatus>,
    #[serde(default)]
    pub limit: Option<i64>,
}
