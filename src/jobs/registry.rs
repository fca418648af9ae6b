//! Job kind registry
//!
//! Maps each job kind to its handler. Handlers receive a context carrying
//! the cancel token and a progress reporter; they observe cancellation at
//! every checkpoint and at each external call boundary.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::bus::EventBus;
use crate::error::{CoreError, CoreResult};
use crate::store::{Store, Versioned};
use crate::types::{EventDraft, EventKind, JobInput, JobKind, Room};

/// Rooms job events fan into for a given kind.
pub fn job_rooms(kind: JobKind) -> Vec<Room> {
    match kind {
        JobKind::BatchPredict => vec![Room::Admin, Room::Routes, Room::Predictions],
        _ => vec![Room::Admin, Room::Routes],
    }
}

/// Handler context: cancellation plus throttled progress reporting.
pub struct JobContext {
    pub job_id: Uuid,
    pub kind: JobKind,
    cancel: CancellationToken,
    store: Arc<dyn Store>,
    bus: EventBus,
    /// Throttle state: events go out at most once per interval.
    last_emit: Mutex<Option<Instant>>,
    emit_interval: Duration,
}

impl JobContext {
    pub fn new(
        job_id: Uuid,
        kind: JobKind,
        cancel: CancellationToken,
        store: Arc<dyn Store>,
        bus: EventBus,
    ) -> Self {
        Self {
            job_id,
            kind,
            cancel,
            store,
            bus,
            last_emit: Mutex::new(None),
            emit_interval: Duration::from_secs(1),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Checkpoint: bail out with `Cancelled` when the token fired.
    pub fn checkpoint(&self) -> CoreResult<()> {
        if self.is_cancelled() {
            Err(CoreError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Report progress. The job row is updated on every call (it drives
    /// orphan detection); `job.progress` events are throttled to at most one
    /// per second per job.
    pub async fn report(&self, progress: f64, note: &str) -> CoreResult<()> {
        let progress = progress.clamp(0.0, 1.0);

        if let Some(job) = self.store.get_job(self.job_id).await? {
            // Progress only increases while running.
            let mut updated = job.clone();
            updated.progress = job.progress.max(progress);
            updated.last_progress_at = Some(Utc::now());
            match self.store.update_job(Versioned::new(updated, job.version)).await {
                Ok(_) => {}
                Err(CoreError::VersionConflict { .. }) => {
                    // A cancel watchdog moved the row; the handler will see
                    // the token at its next checkpoint.
                    debug!("job {} progress lost a version race", self.job_id);
                }
                Err(other) => return Err(other),
            }
        }

        let emit = {
            let mut last = self.last_emit.lock();
            let due = last.map_or(true, |at| at.elapsed() >= self.emit_interval);
            if due {
                *last = Some(Instant::now());
            }
            due
        };
        if emit {
            self.bus.publish(
                &job_rooms(self.kind),
                EventDraft::new(
                    EventKind::JobProgress,
                    serde_json::json!({
                        "jobId": self.job_id,
                        "kind": self.kind,
                        "progress": progress,
                        "note": note,
                    }),
                ),
            );
        }
        Ok(())
    }
}

/// A job kind's implementation. Returns the result handle persisted on the
/// job row.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, input: JobInput, ctx: &JobContext) -> CoreResult<serde_json::Value>;
}

/// kind → handler.
#[derive(Default)]
pub struct JobRegistry {
    handlers: HashMap<JobKind, Arc<dyn JobHandler>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, kind: JobKind, handler: Arc<dyn JobHandler>) -> Self {
        self.handlers.insert(kind, handler);
        self
    }

    pub fn get(&self, kind: JobKind) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(&kind).cloned()
    }
}
