//! Async job orchestrator
//!
//! Runs long-lived work (day optimization, batch prediction, bulk import)
//! on a fixed worker pool. Jobs persist through the store, report throttled
//! progress onto the bus, cancel cooperatively with a deadline, and are
//! orphaned on recovery when a crash left them running.

pub mod import;
pub mod optimize;
pub mod predict;
pub mod registry;

pub use registry::{job_rooms, JobContext, JobHandler, JobRegistry};

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::bus::EventBus;
use crate::error::{CoreError, CoreResult};
use crate::store::{Store, Versioned};
use crate::types::{EventDraft, EventKind, Job, JobFilter, JobInput, JobKind, JobStatus};

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Worker pool size.
    pub workers: usize,
    /// Max concurrent OptimizeDay jobs.
    pub max_optimize_jobs: usize,
    /// A running job with no progress for this long is orphaned on start.
    pub stale_after: Duration,
    /// Cooperative cancel deadline before the job is failed and abandoned.
    pub cancel_deadline: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_optimize_jobs: 4,
            stale_after: Duration::from_secs(15 * 60),
            cancel_deadline: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
struct QueueEntry {
    job_id: Uuid,
    kind: JobKind,
    target_key: String,
}

struct RunningJob {
    kind: JobKind,
    target_key: String,
    token: CancellationToken,
}

pub struct Orchestrator {
    store: Arc<dyn Store>,
    bus: EventBus,
    registry: Arc<JobRegistry>,
    config: OrchestratorConfig,
    queue: Mutex<VecDeque<QueueEntry>>,
    running: Mutex<HashMap<Uuid, RunningJob>>,
    wake: Notify,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        bus: EventBus,
        registry: Arc<JobRegistry>,
        config: OrchestratorConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            bus,
            registry,
            config,
            queue: Mutex::new(VecDeque::new()),
            running: Mutex::new(HashMap::new()),
            wake: Notify::new(),
        })
    }

    /// Recover persisted state and spawn the worker pool.
    pub async fn start(self: &Arc<Self>) -> CoreResult<Vec<tokio::task::JoinHandle<()>>> {
        self.recover().await?;
        let mut handles = Vec::with_capacity(self.config.workers);
        for worker in 0..self.config.workers {
            let orchestrator = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                orchestrator.worker_loop(worker).await;
            }));
        }
        Ok(handles)
    }

    /// Orphan stale running jobs and requeue persisted queued ones.
    async fn recover(&self) -> CoreResult<()> {
        let stale_before = Utc::now()
            - chrono::Duration::from_std(self.config.stale_after).unwrap_or(chrono::Duration::zero());
        for job in self.store.stale_running_jobs(stale_before).await? {
            warn!("orphaning stale job {}", job.id);
            let version = job.version;
            let mut orphaned = job;
            orphaned.status = JobStatus::Failed;
            orphaned.error_message = Some("orphaned".to_string());
            orphaned.finished_at = Some(Utc::now());
            if let Ok(stored) = self.store.update_job(Versioned::new(orphaned, version)).await {
                self.publish_completed(&stored);
            }
        }

        let queued = self
            .store
            .list_jobs(&JobFilter { status: Some(JobStatus::Queued), ..Default::default() })
            .await?;
        let mut queue = self.queue.lock();
        // list_jobs returns newest first; requeue oldest first.
        for job in queued.into_iter().rev() {
            info!("requeueing persisted job {}", job.id);
            queue.push_back(QueueEntry {
                job_id: job.id,
                kind: job.kind,
                target_key: job.target_key.clone(),
            });
        }
        Ok(())
    }

    // ----------------------------------------------------------------------
    // Submission surface
    // ----------------------------------------------------------------------

    /// Persist and enqueue a job; returns its id immediately.
    pub async fn submit(&self, submitter: Uuid, input: JobInput) -> CoreResult<Uuid> {
        let job = Job::new(submitter, input);
        let entry = QueueEntry {
            job_id: job.id,
            kind: job.kind,
            target_key: job.target_key.clone(),
        };
        self.store.insert_job(job.clone()).await?;
        self.queue.lock().push_back(entry);
        self.wake.notify_waiters();
        info!("job {} submitted ({:?}, key {})", job.id, job.kind, job.target_key);
        Ok(job.id)
    }

    pub async fn get(&self, job_id: Uuid) -> CoreResult<Option<Job>> {
        self.store.get_job(job_id).await
    }

    pub async fn list(&self, filter: &JobFilter) -> CoreResult<Vec<Job>> {
        self.store.list_jobs(filter).await
    }

    /// Request cancellation. Queued jobs cancel immediately; running jobs
    /// are signalled and watched against the cancel deadline. Returns false
    /// when the job is already terminal or unknown.
    pub async fn cancel(self: &Arc<Self>, job_id: Uuid) -> CoreResult<bool> {
        let Some(job) = self.store.get_job(job_id).await? else {
            return Ok(false);
        };
        match job.status {
            JobStatus::Queued => {
                self.queue.lock().retain(|e| e.job_id != job_id);
                let version = job.version;
                let mut cancelled = job;
                cancelled.status = JobStatus::Cancelled;
                cancelled.finished_at = Some(Utc::now());
                match self.store.update_job(Versioned::new(cancelled, version)).await {
                    Ok(stored) => {
                        self.publish_completed(&stored);
                        Ok(true)
                    }
                    // Lost the race against a worker dequeue; signal instead.
                    Err(CoreError::VersionConflict { .. }) => self.signal_running(job_id),
                    Err(other) => Err(other),
                }
            }
            JobStatus::Running => self.signal_running(job_id),
            _ => Ok(false),
        }
    }

    fn signal_running(self: &Arc<Self>, job_id: Uuid) -> CoreResult<bool> {
        let signalled = {
            let running = self.running.lock();
            match running.get(&job_id) {
                Some(run) => {
                    run.token.cancel();
                    true
                }
                None => false,
            }
        };
        if !signalled {
            return Ok(false);
        }

        // Watchdog: a job that ignores the signal past the deadline is
        // recorded as failed and abandoned; its late results are discarded
        // by the version check.
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(orchestrator.config.cancel_deadline).await;
            let Ok(Some(job)) = orchestrator.store.get_job(job_id).await else { return };
            if job.status != JobStatus::Running {
                return;
            }
            warn!("job {} missed the cancel deadline", job_id);
            let version = job.version;
            let mut failed = job;
            failed.status = JobStatus::Failed;
            failed.error_message = Some("cancel_timeout".to_string());
            failed.finished_at = Some(Utc::now());
            if let Ok(stored) = orchestrator.store.update_job(Versioned::new(failed, version)).await {
                orchestrator.publish_completed(&stored);
            }
        });
        Ok(true)
    }

    // ----------------------------------------------------------------------
    // Workers
    // ----------------------------------------------------------------------

    async fn worker_loop(self: &Arc<Self>, worker: usize) {
        loop {
            let entry = loop {
                if let Some(entry) = self.pop_eligible() {
                    break entry;
                }
                // Re-check periodically: notify can race a push.
                let _ = tokio::time::timeout(Duration::from_millis(500), self.wake.notified()).await;
            };

            if let Err(err) = self.run_job(&entry).await {
                error!("worker {}: job {} infrastructure error: {}", worker, entry.job_id, err);
            }
            self.running.lock().remove(&entry.job_id);
            self.wake.notify_waiters();
        }
    }

    /// Pop the first queue entry whose target key is idle and whose kind is
    /// under its concurrency cap. Scanning front-to-back preserves FIFO per
    /// target key.
    fn pop_eligible(&self) -> Option<QueueEntry> {
        let mut queue = self.queue.lock();
        let mut running = self.running.lock();

        let position = queue.iter().position(|entry| {
            let key_busy = running.values().any(|r| r.target_key == entry.target_key);
            if key_busy {
                return false;
            }
            let kind_count = running.values().filter(|r| r.kind == entry.kind).count();
            kind_count < self.kind_cap(entry.kind)
        })?;

        let entry = queue.remove(position)?;
        running.insert(
            entry.job_id,
            RunningJob {
                kind: entry.kind,
                target_key: entry.target_key.clone(),
                token: CancellationToken::new(),
            },
        );
        Some(entry)
    }

    fn kind_cap(&self, kind: JobKind) -> usize {
        match kind {
            JobKind::OptimizeDay => self.config.max_optimize_jobs,
            _ => self.config.workers,
        }
    }

    async fn run_job(self: &Arc<Self>, entry: &QueueEntry) -> CoreResult<()> {
        let Some(job) = self.store.get_job(entry.job_id).await? else {
            return Ok(());
        };
        if job.status != JobStatus::Queued {
            // Cancelled while queued, or a duplicate requeue.
            return Ok(());
        }

        let token = self
            .running
            .lock()
            .get(&entry.job_id)
            .map(|r| r.token.clone())
            .unwrap_or_default();

        let version = job.version;
        let mut started = job.clone();
        started.status = JobStatus::Running;
        started.started_at = Some(Utc::now());
        started.last_progress_at = Some(Utc::now());
        let started = match self.store.update_job(Versioned::new(started, version)).await {
            Ok(stored) => stored,
            Err(CoreError::VersionConflict { .. }) => return Ok(()),
            Err(other) => return Err(other),
        };

        let ctx = JobContext::new(
            started.id,
            started.kind,
            token,
            self.store.clone(),
            self.bus.clone(),
        );
        ctx.report(0.0, "started").await?;

        let Some(handler) = self.registry.get(started.kind) else {
            self.finish(started.id, Err(CoreError::internal("no handler for kind"))).await;
            return Ok(());
        };

        info!("job {} running ({:?})", started.id, started.kind);
        let result = handler.run(started.input.clone(), &ctx).await;
        self.finish(started.id, result).await;
        Ok(())
    }

    /// Record the outcome and publish `job.completed`. A version conflict
    /// here means a cancel watchdog already closed the row; the late result
    /// is discarded.
    async fn finish(&self, job_id: Uuid, result: CoreResult<serde_json::Value>) {
        let Ok(Some(job)) = self.store.get_job(job_id).await else { return };
        if job.status != JobStatus::Running {
            warn!("job {} already closed ({:?}); discarding result", job_id, job.status);
            return;
        }

        let version = job.version;
        let mut finished = job;
        finished.finished_at = Some(Utc::now());
        match result {
            Ok(handle) => {
                finished.status = JobStatus::Succeeded;
                finished.progress = 1.0;
                finished.result = Some(handle);
            }
            Err(CoreError::Cancelled) => {
                finished.status = JobStatus::Cancelled;
                finished.error_message = Some("cancelled".to_string());
            }
            Err(err) => {
                finished.status = JobStatus::Failed;
                finished.error_message = Some(format!("{}: {}", err.code(), err));
            }
        }

        match self.store.update_job(Versioned::new(finished, version)).await {
            Ok(stored) => {
                info!("job {} finished: {:?}", job_id, stored.status);
                self.publish_completed(&stored);
            }
            Err(CoreError::VersionConflict { .. }) => {
                warn!("job {} result discarded after version race", job_id);
            }
            Err(err) => error!("job {} finish write failed: {}", job_id, err),
        }
    }

    fn publish_completed(&self, job: &Job) {
        self.bus.publish(
            &job_rooms(job.kind),
            EventDraft::new(
                EventKind::JobCompleted,
                serde_json::json!({
                    "jobId": job.id,
                    "kind": job.kind,
                    "status": job.status,
                    "error": job.error_message,
                    "result": job.result,
                }),
            ),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusConfig;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use chrono::NaiveDate;

    /// Handler that sleeps in cancellable checkpoints.
    struct SlowHandler {
        step: Duration,
        steps: u32,
    }

    #[async_trait]
    impl JobHandler for SlowHandler {
        async fn run(&self, _input: JobInput, ctx: &JobContext) -> CoreResult<serde_json::Value> {
            for i in 0..self.steps {
                ctx.checkpoint()?;
                ctx.report(i as f64 / self.steps as f64, "working").await?;
                tokio::time::sleep(self.step).await;
            }
            Ok(serde_json::json!({"done": true}))
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl JobHandler for FailingHandler {
        async fn run(&self, _input: JobInput, _ctx: &JobContext) -> CoreResult<serde_json::Value> {
            Err(CoreError::validation("input", "bad input"))
        }
    }

    fn optimize_input(day: u32) -> JobInput {
        JobInput::OptimizeDay {
            date: NaiveDate::from_ymd_opt(2026, 3, day).unwrap(),
            driver_ids: vec![],
            include_drafts: false,
            objective: Default::default(),
            budget_ms: None,
            atomic_customers: vec![],
        }
    }

    fn fixture(registry: JobRegistry, config: OrchestratorConfig) -> (Arc<Orchestrator>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let bus = EventBus::new(BusConfig::default());
        let orchestrator = Orchestrator::new(
            store.clone() as Arc<dyn Store>,
            bus,
            Arc::new(registry),
            config,
        );
        (orchestrator, store)
    }

    async fn wait_for_status(
        store: &MemoryStore,
        job_id: Uuid,
        status: JobStatus,
        timeout: Duration,
    ) -> Job {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let job = store.get_job(job_id).await.unwrap().unwrap();
            if job.status == status {
                return job;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {:?}, job is {:?}",
                status,
                job.status
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_submit_run_succeed() {
        let registry = JobRegistry::new().register(
            JobKind::OptimizeDay,
            Arc::new(SlowHandler { step: Duration::from_millis(5), steps: 3 }),
        );
        let (orchestrator, store) = fixture(registry, OrchestratorConfig::default());
        let _handles = orchestrator.start().await.unwrap();

        let job_id = orchestrator.submit(Uuid::nil(), optimize_input(2)).await.unwrap();
        let job = wait_for_status(&store, job_id, JobStatus::Succeeded, Duration::from_secs(5)).await;

        assert_eq!(job.result.unwrap()["done"], true);
        assert!((job.progress - 1.0).abs() < f64::EPSILON);
        assert!(job.started_at.is_some() && job.finished_at.is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_failure_recorded() {
        let registry = JobRegistry::new().register(JobKind::BulkImport, Arc::new(FailingHandler));
        let (orchestrator, store) = fixture(registry, OrchestratorConfig::default());
        let _handles = orchestrator.start().await.unwrap();

        let job_id = orchestrator
            .submit(Uuid::nil(), JobInput::BulkImport { source: "aGVsbG8=".into() })
            .await
            .unwrap();
        let job = wait_for_status(&store, job_id, JobStatus::Failed, Duration::from_secs(5)).await;
        assert!(job.error_message.unwrap().contains("VALIDATION"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_cancel_running_job() {
        let registry = JobRegistry::new().register(
            JobKind::OptimizeDay,
            Arc::new(SlowHandler { step: Duration::from_millis(50), steps: 200 }),
        );
        let (orchestrator, store) = fixture(registry, OrchestratorConfig::default());
        let _handles = orchestrator.start().await.unwrap();

        let job_id = orchestrator.submit(Uuid::nil(), optimize_input(2)).await.unwrap();
        wait_for_status(&store, job_id, JobStatus::Running, Duration::from_secs(5)).await;

        assert!(orchestrator.cancel(job_id).await.unwrap());
        let job = wait_for_status(&store, job_id, JobStatus::Cancelled, Duration::from_secs(5)).await;
        assert_eq!(job.status, JobStatus::Cancelled);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_cancel_queued_job_without_workers() {
        // No workers started: the job stays queued.
        let registry = JobRegistry::new();
        let (orchestrator, store) = fixture(registry, OrchestratorConfig::default());

        let job_id = orchestrator.submit(Uuid::nil(), optimize_input(2)).await.unwrap();
        assert!(orchestrator.cancel(job_id).await.unwrap());

        let job = store.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        // Terminal: cancelling again reports false.
        assert!(!orchestrator.cancel(job_id).await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_same_date_optimizes_serialize() {
        let registry = JobRegistry::new().register(
            JobKind::OptimizeDay,
            Arc::new(SlowHandler { step: Duration::from_millis(30), steps: 4 }),
        );
        let (orchestrator, store) = fixture(registry, OrchestratorConfig::default());
        let _handles = orchestrator.start().await.unwrap();

        let first = orchestrator.submit(Uuid::nil(), optimize_input(2)).await.unwrap();
        let second = orchestrator.submit(Uuid::nil(), optimize_input(2)).await.unwrap();

        // While the first runs, the second must not start.
        wait_for_status(&store, first, JobStatus::Running, Duration::from_secs(5)).await;
        let blocked = store.get_job(second).await.unwrap().unwrap();
        assert_eq!(blocked.status, JobStatus::Queued, "same target key must serialize");

        wait_for_status(&store, first, JobStatus::Succeeded, Duration::from_secs(5)).await;
        wait_for_status(&store, second, JobStatus::Succeeded, Duration::from_secs(5)).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_different_dates_run_concurrently() {
        let registry = JobRegistry::new().register(
            JobKind::OptimizeDay,
            Arc::new(SlowHandler { step: Duration::from_millis(40), steps: 10 }),
        );
        let (orchestrator, store) = fixture(registry, OrchestratorConfig::default());
        let _handles = orchestrator.start().await.unwrap();

        let first = orchestrator.submit(Uuid::nil(), optimize_input(2)).await.unwrap();
        let second = orchestrator.submit(Uuid::nil(), optimize_input(3)).await.unwrap();

        wait_for_status(&store, first, JobStatus::Running, Duration::from_secs(5)).await;
        wait_for_status(&store, second, JobStatus::Running, Duration::from_secs(5)).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_orphan_recovery_on_start() {
        let registry = JobRegistry::new();
        let (orchestrator, store) = fixture(
            registry,
            OrchestratorConfig { stale_after: Duration::from_millis(0), ..Default::default() },
        );

        // A job left running by a dead process.
        let mut job = Job::new(Uuid::nil(), optimize_input(2));
        job.status = JobStatus::Running;
        job.started_at = Some(Utc::now() - chrono::Duration::minutes(30));
        job.last_progress_at = Some(Utc::now() - chrono::Duration::minutes(30));
        store.insert_job(job.clone()).await.unwrap();

        let _handles = orchestrator.start().await.unwrap();

        let recovered = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(recovered.status, JobStatus::Failed);
        assert_eq!(recovered.error_message.as_deref(), Some("orphaned"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_queued_jobs_requeued_on_start() {
        let registry = JobRegistry::new().register(
            JobKind::OptimizeDay,
            Arc::new(SlowHandler { step: Duration::from_millis(5), steps: 2 }),
        );
        let (orchestrator, store) = fixture(registry, OrchestratorConfig::default());

        // Persisted before this process started.
        let job = Job::new(Uuid::nil(), optimize_input(2));
        store.insert_job(job.clone()).await.unwrap();

        let _handles = orchestrator.start().await.unwrap();
        wait_for_status(&store, job.id, JobStatus::Succeeded, Duration::from_secs(5)).await;
    }
}
