//! Job orchestration.
//!
//! The `Orchestrator` owns every job's state. It:
//! - Validates and admits new jobs
//! - Hands stage attempts to workers (`claim`) and applies their outcomes
//! - Schedules delayed retries and advances jobs through the pipeline
//! - Cancels jobs and answers status queries without blocking on workers
//! - Rebuilds its queues from the database after a restart
//!
//! Every state change follows the same order: mutate a copy of the job,
//! persist it, then swap it in and publish the new view. A failed write
//! leaves the in-memory job untouched.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{OrchestratorError, StageError};
use crate::executor::StageRequest;
use crate::metrics::MetricsCollector;
use crate::scheduler::job::{BrandInput, Job, JobStatus, JobView, StageStatus, WorkItem};
use crate::scheduler::queue::JobQueue;
use crate::storage::{ArtifactStore, Database, FsArtifactStore, JobFilter};

use super::config::OrchestratorConfig;
use super::stage::StageKind;
use super::state_machine::{StageOutcome, StateMachine, Transition};

/// Broadcast whenever a job's state changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub current_stage: Option<StageKind>,
    pub progress: f64,
    pub updated_at: DateTime<Utc>,
}

impl From<&JobView> for JobEvent {
    fn from(view: &JobView) -> Self {
        Self {
            job_id: view.job_id,
            status: view.status,
            current_stage: view.current_stage,
            progress: view.progress,
            updated_at: view.updated_at,
        }
    }
}

/// What `recover` found in the database.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryReport {
    /// Jobs loaded into memory.
    pub loaded: usize,
    /// Non-terminal jobs whose pending stage was put back on the queue.
    pub requeued: usize,
    /// Attempts that were running when the process stopped.
    pub interrupted: usize,
    /// Jobs that were already terminal.
    pub terminal: usize,
}

/// Counters of orchestrator activity since startup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorStats {
    pub submitted: u64,
    pub succeeded: u64,
    pub partial_success: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub retries_scheduled: u64,
    /// Worker reports dropped because the job had moved on.
    pub outcomes_discarded: u64,
}

#[derive(Default)]
struct SharedStats {
    submitted: AtomicU64,
    succeeded: AtomicU64,
    partial_success: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    retries_scheduled: AtomicU64,
    outcomes_discarded: AtomicU64,
}

impl SharedStats {
    fn record_terminal(&self, status: JobStatus) {
        let counter = match status {
            JobStatus::Succeeded => &self.succeeded,
            JobStatus::PartialSuccess => &self.partial_success,
            JobStatus::Failed => &self.failed,
            JobStatus::Cancelled => &self.cancelled,
            JobStatus::Queued | JobStatus::Running => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> OrchestratorStats {
        OrchestratorStats {
            submitted: self.submitted.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            partial_success: self.partial_success.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            retries_scheduled: self.retries_scheduled.load(Ordering::Relaxed),
            outcomes_discarded: self.outcomes_discarded.load(Ordering::Relaxed),
        }
    }
}

type JobHandle = Arc<Mutex<Job>>;

/// Owns job state and drives jobs through the pipeline.
pub struct Orchestrator {
    config: OrchestratorConfig,
    database: Arc<Database>,
    store: Arc<dyn ArtifactStore>,
    queue: Arc<JobQueue>,
    /// Authoritative job state; one lock per job serializes its transitions.
    jobs: RwLock<HashMap<Uuid, JobHandle>>,
    /// Last committed view of each job, read by status queries.
    views: RwLock<HashMap<Uuid, JobView>>,
    events: broadcast::Sender<JobEvent>,
    stats: SharedStats,
    metrics: MetricsCollector,
}

impl Orchestrator {
    /// Creates an orchestrator over an existing database and artifact store.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(
        config: OrchestratorConfig,
        database: Arc<Database>,
        store: Arc<dyn ArtifactStore>,
    ) -> Result<Self, OrchestratorError> {
        config.validate()?;
        let (events, _) = broadcast::channel(config.event_buffer);

        Ok(Self {
            config,
            database,
            store,
            queue: Arc::new(JobQueue::new()),
            jobs: RwLock::new(HashMap::new()),
            views: RwLock::new(HashMap::new()),
            events,
            stats: SharedStats::default(),
            metrics: MetricsCollector::new(),
        })
    }

    /// Connects to the configured database, applies migrations and opens a
    /// filesystem artifact store under `artifact_path`.
    pub async fn connect(config: OrchestratorConfig) -> Result<Self, OrchestratorError> {
        config.validate()?;
        let database = Arc::new(Database::connect(&config.database_url).await?);
        database.run_migrations().await?;
        let store = Arc::new(FsArtifactStore::new(
            config.artifact_path.clone(),
            Arc::clone(&database),
        ));
        Self::new(config, database, store)
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.database
    }

    pub fn store(&self) -> &Arc<dyn ArtifactStore> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    pub fn stats(&self) -> OrchestratorStats {
        self.stats.snapshot()
    }

    /// Validates `input`, persists a new queued job and enqueues its first stage.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` without creating anything if validation fails.
    pub async fn submit(&self, input: BrandInput) -> Result<Uuid, OrchestratorError> {
        let input = input.normalized();
        input.validate()?;

        let job = Job::new(input);
        let job_id = job.id;
        let business_name = job.input.business_name.clone();
        self.database.save_job(&job).await?;
        self.install(job);
        self.queue
            .enqueue(WorkItem::new(job_id, StageKind::first()))?;
        self.stats.submitted.fetch_add(1, Ordering::Relaxed);

        info!(job_id = %job_id, business_name = %business_name, "Job submitted");
        Ok(job_id)
    }

    /// Starts the next attempt of a queued stage.
    ///
    /// Returns `Ok(None)` when the item is stale: the job was cancelled,
    /// finished, or has moved past `item.stage`.
    pub async fn claim(&self, item: &WorkItem) -> Result<Option<StageRequest>, OrchestratorError> {
        let Some(handle) = self.handle(item.job_id) else {
            warn!(job_id = %item.job_id, stage = %item.stage, "Work item for unknown job");
            return Ok(None);
        };
        let mut job = handle.lock().await;

        let mut next = job.clone();
        let attempt =
            match StateMachine::begin_attempt(&mut next, item.stage, &self.config.retry, Utc::now())
            {
                Ok(attempt) => attempt,
                Err(reason) => {
                    debug!(
                        job_id = %item.job_id,
                        stage = %item.stage,
                        reason = %reason,
                        "Dropping stale work item"
                    );
                    return Ok(None);
                }
            };

        let request = StageRequest {
            job_id: item.job_id,
            stage: item.stage,
            attempt,
            input: next.input.clone(),
            inputs: next.artifacts_from(item.stage.descriptor().input_stages()),
        };
        self.commit(&mut job, next).await?;

        info!(
            job_id = %item.job_id,
            stage = %item.stage,
            attempt = attempt,
            "Stage attempt started"
        );
        Ok(Some(request))
    }

    /// Applies a worker's report for the running attempt of `stage`.
    ///
    /// Outcomes for jobs that were cancelled or have moved on are discarded
    /// and any artifacts they produced are deleted.
    pub async fn report_outcome(
        &self,
        job_id: Uuid,
        stage: StageKind,
        outcome: StageOutcome,
    ) -> Result<Transition, OrchestratorError> {
        let handle = self
            .handle(job_id)
            .ok_or(OrchestratorError::NotFound(job_id))?;
        let mut job = handle.lock().await;
        let now = Utc::now();

        let mut next = job.clone();
        let transition = match StateMachine::apply_outcome(
            &mut next,
            stage,
            outcome.clone(),
            &self.config.retry,
            now,
        ) {
            Ok(transition) => transition,
            Err(reason) => {
                self.discard_outputs(job_id, &outcome).await;
                let mut next = job.clone();
                if next.is_terminal() && StateMachine::discard_running(&mut next, stage, now) {
                    self.commit(&mut job, next).await?;
                }
                self.stats.outcomes_discarded.fetch_add(1, Ordering::Relaxed);
                info!(
                    job_id = %job_id,
                    stage = %stage,
                    reason = %reason,
                    "Discarded stage outcome"
                );
                return Ok(Transition::Discarded);
            }
        };

        self.commit(&mut job, next).await?;
        self.follow(job_id, stage, &transition)?;
        Ok(transition)
    }

    /// Cancels a job that has not reached a terminal state.
    ///
    /// A queued stage is skipped; an attempt already running finishes in its
    /// worker and its report is discarded.
    pub async fn cancel(&self, job_id: Uuid) -> Result<JobView, OrchestratorError> {
        let handle = self
            .handle(job_id)
            .ok_or(OrchestratorError::NotFound(job_id))?;
        let mut job = handle.lock().await;

        let mut next = job.clone();
        if StateMachine::cancel(&mut next, Utc::now()).is_err() {
            return Err(OrchestratorError::AlreadyTerminal {
                job_id,
                status: job.status,
            });
        }
        let view = next.view();
        self.commit(&mut job, next).await?;
        self.record_terminal(JobStatus::Cancelled);

        info!(job_id = %job_id, "Job cancelled");
        Ok(view)
    }

    /// Returns the last committed snapshot of a job. Never waits on workers.
    pub fn get_status(&self, job_id: Uuid) -> Result<JobView, OrchestratorError> {
        self.views
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&job_id)
            .cloned()
            .ok_or(OrchestratorError::NotFound(job_id))
    }

    /// Snapshots of every known job, oldest first.
    pub fn list_jobs(&self) -> Vec<JobView> {
        let mut views: Vec<JobView> = self
            .views
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        views.sort_by_key(|v| v.created_at);
        views
    }

    /// Number of known jobs that are not terminal.
    pub fn active_jobs(&self) -> usize {
        self.views
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|v| !v.status.is_terminal())
            .count()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// Waits until a job is terminal and returns its final view.
    ///
    /// # Errors
    ///
    /// Returns `WaitTimeout` if the job is still running after `timeout`.
    pub async fn wait_for_terminal(
        &self,
        job_id: Uuid,
        timeout: Duration,
    ) -> Result<JobView, OrchestratorError> {
        // Subscribe before the first read so no change is missed in between.
        let mut events = self.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let view = self.get_status(job_id)?;
            if view.status.is_terminal() {
                return Ok(view);
            }

            match tokio::time::timeout_at(deadline, events.recv()).await {
                Err(_) => return Err(OrchestratorError::WaitTimeout(job_id)),
                Ok(Ok(_)) | Ok(Err(broadcast::error::RecvError::Lagged(_))) => {}
                Ok(Err(broadcast::error::RecvError::Closed)) => {
                    return Err(OrchestratorError::WaitTimeout(job_id))
                }
            }
        }
    }

    /// Loads persisted jobs and re-enqueues unfinished work.
    ///
    /// A pending stage goes back on its queue. An attempt that was running
    /// when the process stopped is treated as a transient failure, so it is
    /// retried if attempts remain.
    pub async fn recover(&self) -> Result<RecoveryReport, OrchestratorError> {
        let jobs = self.database.list_jobs(&JobFilter::new()).await?;
        let mut report = RecoveryReport::default();
        let now = Utc::now();

        for job in jobs {
            let job_id = job.id;
            if self.handle(job_id).is_some() {
                continue;
            }
            report.loaded += 1;
            let handle = self.install(job);
            let mut job = handle.lock().await;

            if job.is_terminal() {
                report.terminal += 1;
                let dangling = job
                    .stage_history
                    .iter()
                    .find(|r| r.status == StageStatus::Running)
                    .map(|r| r.stage_kind);
                if let Some(stage) = dangling {
                    let mut next = job.clone();
                    StateMachine::discard_running(&mut next, stage, now);
                    self.commit(&mut job, next).await?;
                }
                continue;
            }

            let Some(stage) = job.current_stage else {
                warn!(job_id = %job_id, "Unfinished job has no current stage");
                continue;
            };

            match job.stage_status(stage) {
                Some(StageStatus::Pending) => {
                    self.queue.enqueue(WorkItem::new(job_id, stage))?;
                    report.requeued += 1;
                }
                Some(StageStatus::Running) => {
                    let mut next = job.clone();
                    let outcome =
                        StageOutcome::Failed(StageError::transient("interrupted by restart"));
                    match StateMachine::apply_outcome(
                        &mut next,
                        stage,
                        outcome,
                        &self.config.retry,
                        now,
                    ) {
                        Ok(transition) => {
                            self.commit(&mut job, next).await?;
                            self.follow(job_id, stage, &transition)?;
                            report.interrupted += 1;
                        }
                        Err(reason) => {
                            warn!(job_id = %job_id, stage = %stage, reason = %reason, "Could not resolve interrupted attempt");
                        }
                    }
                }
                status => {
                    warn!(job_id = %job_id, stage = %stage, status = ?status, "Unexpected current stage state");
                }
            }
        }

        info!(
            loaded = report.loaded,
            requeued = report.requeued,
            interrupted = report.interrupted,
            terminal = report.terminal,
            "Recovered jobs from database"
        );
        Ok(report)
    }

    fn handle(&self, job_id: Uuid) -> Option<JobHandle> {
        self.jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&job_id)
            .cloned()
    }

    fn install(&self, job: Job) -> JobHandle {
        let view = job.view();
        let handle = Arc::new(Mutex::new(job));
        self.jobs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(view.job_id, Arc::clone(&handle));
        self.publish(view);
        handle
    }

    /// Persists `next`, then makes it the current state of the job.
    async fn commit(&self, current: &mut Job, next: Job) -> Result<(), OrchestratorError> {
        self.database.save_job(&next).await?;
        let view = next.view();
        *current = next;
        self.publish(view);
        Ok(())
    }

    fn publish(&self, view: JobView) {
        let event = JobEvent::from(&view);
        self.views
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(view.job_id, view);
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Acts on a committed transition.
    fn follow(
        &self,
        job_id: Uuid,
        stage: StageKind,
        transition: &Transition,
    ) -> Result<(), OrchestratorError> {
        match transition {
            Transition::Advance { next, skipped } => {
                for skipped_stage in skipped {
                    info!(job_id = %job_id, stage = %skipped_stage, "Stage skipped");
                }
                info!(job_id = %job_id, stage = %stage, next = %next, "Stage resolved");
                self.queue.enqueue(WorkItem::new(job_id, *next))?;
            }
            Transition::Retry {
                stage,
                attempt,
                delay,
                error,
            } => {
                warn!(
                    job_id = %job_id,
                    stage = %stage,
                    next_attempt = *attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Stage attempt failed, retry scheduled"
                );
                self.stats.retries_scheduled.fetch_add(1, Ordering::Relaxed);
                self.schedule_retry(WorkItem::new(job_id, *stage), *delay);
            }
            Transition::Complete { status, skipped } => {
                for skipped_stage in skipped {
                    info!(job_id = %job_id, stage = %skipped_stage, "Stage skipped");
                }
                self.record_terminal(*status);
                info!(job_id = %job_id, status = %status, "Job finished");
            }
            Transition::Discarded => {}
        }
        Ok(())
    }

    fn schedule_retry(&self, item: WorkItem, delay: Duration) {
        let queue = Arc::clone(&self.queue);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // A cancelled job's item is dropped by `claim`.
            if let Err(e) = queue.enqueue(item) {
                error!(job_id = %item.job_id, stage = %item.stage, error = %e, "Failed to enqueue retry");
            }
        });
    }

    /// Deletes the artifacts of a successful outcome that will not be recorded.
    pub(crate) async fn discard_outputs(&self, job_id: Uuid, outcome: &StageOutcome) {
        let StageOutcome::Succeeded(artifacts) = outcome else {
            return;
        };
        for artifact in artifacts {
            if let Err(e) = self.store.delete(&artifact.reference).await {
                warn!(
                    job_id = %job_id,
                    artifact = %artifact.reference,
                    error = %e,
                    "Failed to delete discarded artifact"
                );
            }
        }
    }

    fn record_terminal(&self, status: JobStatus) {
        self.stats.record_terminal(status);
        self.metrics.record_job_terminal(status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorClass;
    use crate::storage::MemoryArtifactStore;

    fn input() -> BrandInput {
        BrandInput::new("Acme Coffee", "food", "modern", "warm").with_trait("friendly")
    }

    fn config() -> OrchestratorConfig {
        OrchestratorConfig::new()
            .with_max_retries(2)
            .with_retry_delays(Duration::from_millis(1), Duration::from_millis(5))
    }

    async fn orchestrator() -> (Orchestrator, Arc<MemoryArtifactStore>) {
        let database = Arc::new(Database::in_memory().await.expect("database"));
        let store = Arc::new(MemoryArtifactStore::new());
        let orchestrator =
            Orchestrator::new(config(), database, store.clone()).expect("orchestrator");
        (orchestrator, store)
    }

    async fn next_item(orchestrator: &Orchestrator, stage: StageKind) -> WorkItem {
        let item = orchestrator
            .queue()
            .dequeue(stage.resource_class(), Duration::from_millis(200))
            .await
            .expect("dequeue")
            .expect("work item");
        assert_eq!(item.stage, stage);
        item
    }

    async fn produce(
        store: &MemoryArtifactStore,
        request: &StageRequest,
    ) -> StageOutcome {
        let artifact = store
            .put(request.job_id, request.stage, "out.bin", b"data")
            .await
            .expect("put");
        StageOutcome::Succeeded(vec![artifact])
    }

    #[tokio::test]
    async fn test_submit_persists_and_enqueues() {
        let (orchestrator, _) = orchestrator().await;
        let job_id = orchestrator.submit(input()).await.expect("submit");

        let view = orchestrator.get_status(job_id).expect("status");
        assert_eq!(view.status, JobStatus::Queued);
        assert_eq!(view.current_stage, Some(StageKind::Synthesize));
        assert_eq!(orchestrator.queue().len(StageKind::Synthesize.resource_class()), 1);

        let stored = orchestrator
            .database()
            .load_job(job_id)
            .await
            .expect("load")
            .expect("job");
        assert_eq!(stored.status, JobStatus::Queued);
        assert_eq!(orchestrator.stats().submitted, 1);
    }

    #[tokio::test]
    async fn test_submit_rejects_invalid_input() {
        let (orchestrator, _) = orchestrator().await;
        let bad = BrandInput::new("  ", "food", "modern", "warm").with_trait("friendly");

        let result = orchestrator.submit(bad).await;
        assert!(matches!(result, Err(OrchestratorError::InvalidInput(_))));
        assert!(orchestrator.list_jobs().is_empty());
        assert!(orchestrator.queue().is_empty());
        let stored = orchestrator
            .database()
            .list_jobs(&JobFilter::new())
            .await
            .expect("list");
        assert!(stored.is_empty());
    }

    #[tokio::test]
    async fn test_success_advances_to_next_stage() {
        let (orchestrator, store) = orchestrator().await;
        let job_id = orchestrator.submit(input()).await.expect("submit");

        let item = next_item(&orchestrator, StageKind::Synthesize).await;
        let request = orchestrator.claim(&item).await.expect("claim").expect("request");
        assert_eq!(request.attempt, 1);
        assert_eq!(
            orchestrator.get_status(job_id).expect("status").status,
            JobStatus::Running
        );

        let outcome = produce(&store, &request).await;
        let transition = orchestrator
            .report_outcome(job_id, StageKind::Synthesize, outcome)
            .await
            .expect("report");
        assert_eq!(
            transition,
            Transition::Advance {
                next: StageKind::Refine,
                skipped: Vec::new()
            }
        );
        next_item(&orchestrator, StageKind::Refine).await;
    }

    #[tokio::test]
    async fn test_claim_passes_upstream_artifacts() {
        let (orchestrator, store) = orchestrator().await;
        let job_id = orchestrator.submit(input()).await.expect("submit");

        let item = next_item(&orchestrator, StageKind::Synthesize).await;
        let request = orchestrator.claim(&item).await.expect("claim").expect("request");
        let outcome = produce(&store, &request).await;
        orchestrator
            .report_outcome(job_id, StageKind::Synthesize, outcome)
            .await
            .expect("report");

        let item = next_item(&orchestrator, StageKind::Refine).await;
        let request = orchestrator.claim(&item).await.expect("claim").expect("request");
        assert_eq!(request.inputs.len(), 1);
        assert_eq!(request.inputs[0].kind, StageKind::Synthesize);
    }

    #[tokio::test]
    async fn test_transient_failure_schedules_retry() {
        let (orchestrator, _) = orchestrator().await;
        let job_id = orchestrator.submit(input()).await.expect("submit");

        let item = next_item(&orchestrator, StageKind::Synthesize).await;
        orchestrator.claim(&item).await.expect("claim").expect("request");
        let transition = orchestrator
            .report_outcome(
                job_id,
                StageKind::Synthesize,
                StageOutcome::Failed(StageError::transient("busy")),
            )
            .await
            .expect("report");
        assert!(matches!(transition, Transition::Retry { attempt: 2, .. }));

        let item = next_item(&orchestrator, StageKind::Synthesize).await;
        let request = orchestrator.claim(&item).await.expect("claim").expect("request");
        assert_eq!(request.attempt, 2);
        assert_eq!(orchestrator.stats().retries_scheduled, 1);
    }

    #[tokio::test]
    async fn test_required_permanent_failure_fails_job() {
        let (orchestrator, _) = orchestrator().await;
        let job_id = orchestrator.submit(input()).await.expect("submit");

        let item = next_item(&orchestrator, StageKind::Synthesize).await;
        orchestrator.claim(&item).await.expect("claim").expect("request");
        orchestrator
            .report_outcome(
                job_id,
                StageKind::Synthesize,
                StageOutcome::Failed(StageError::permanent("bad prompt")),
            )
            .await
            .expect("report");

        let view = orchestrator
            .wait_for_terminal(job_id, Duration::from_millis(100))
            .await
            .expect("terminal");
        assert_eq!(view.status, JobStatus::Failed);
        assert!(view.error_message.expect("error").contains("bad prompt"));
        assert!(orchestrator.queue().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_queued_job() {
        let (orchestrator, _) = orchestrator().await;
        let job_id = orchestrator.submit(input()).await.expect("submit");

        let view = orchestrator.cancel(job_id).await.expect("cancel");
        assert_eq!(view.status, JobStatus::Cancelled);

        // The queued item is now stale.
        let item = next_item(&orchestrator, StageKind::Synthesize).await;
        assert!(orchestrator.claim(&item).await.expect("claim").is_none());

        let again = orchestrator.cancel(job_id).await;
        assert!(matches!(
            again,
            Err(OrchestratorError::AlreadyTerminal {
                status: JobStatus::Cancelled,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_outcome_after_cancel_is_discarded() {
        let (orchestrator, store) = orchestrator().await;
        let job_id = orchestrator.submit(input()).await.expect("submit");

        let item = next_item(&orchestrator, StageKind::Synthesize).await;
        let request = orchestrator.claim(&item).await.expect("claim").expect("request");
        orchestrator.cancel(job_id).await.expect("cancel");

        let outcome = produce(&store, &request).await;
        let transition = orchestrator
            .report_outcome(job_id, StageKind::Synthesize, outcome)
            .await
            .expect("report");
        assert_eq!(transition, Transition::Discarded);
        assert!(store.is_empty().await);

        let view = orchestrator.get_status(job_id).expect("status");
        assert_eq!(view.status, JobStatus::Cancelled);
        assert_eq!(view.stages[0].status, StageStatus::Skipped);
        assert!(view.completed_stages.is_empty());
        assert_eq!(orchestrator.stats().outcomes_discarded, 1);
    }

    #[tokio::test]
    async fn test_unknown_job() {
        let (orchestrator, _) = orchestrator().await;
        let missing = Uuid::new_v4();

        assert!(matches!(
            orchestrator.get_status(missing),
            Err(OrchestratorError::NotFound(id)) if id == missing
        ));
        assert!(matches!(
            orchestrator.cancel(missing).await,
            Err(OrchestratorError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_wait_for_terminal_times_out() {
        let (orchestrator, _) = orchestrator().await;
        let job_id = orchestrator.submit(input()).await.expect("submit");

        let result = orchestrator
            .wait_for_terminal(job_id, Duration::from_millis(20))
            .await;
        assert!(matches!(result, Err(OrchestratorError::WaitTimeout(id)) if id == job_id));
    }

    #[tokio::test]
    async fn test_events_are_published() {
        let (orchestrator, _) = orchestrator().await;
        let mut events = orchestrator.subscribe();
        let job_id = orchestrator.submit(input()).await.expect("submit");

        let event = events.recv().await.expect("event");
        assert_eq!(event.job_id, job_id);
        assert_eq!(event.status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn test_recover_requeues_and_resolves_interrupted_attempts() {
        let database = Arc::new(Database::in_memory().await.expect("database"));
        let store: Arc<dyn ArtifactStore> = Arc::new(MemoryArtifactStore::new());

        let first = Orchestrator::new(config(), Arc::clone(&database), Arc::clone(&store))
            .expect("orchestrator");
        let queued = first.submit(input()).await.expect("submit");
        let running = first.submit(input()).await.expect("submit");
        let item = WorkItem::new(running, StageKind::Synthesize);
        first.claim(&item).await.expect("claim").expect("request");
        drop(first);

        let second = Orchestrator::new(config(), database, store).expect("orchestrator");
        let report = second.recover().await.expect("recover");
        assert_eq!(report.loaded, 2);
        assert_eq!(report.requeued, 1);
        assert_eq!(report.interrupted, 1);

        assert_eq!(
            second.get_status(queued).expect("status").status,
            JobStatus::Queued
        );
        let view = second.get_status(running).expect("status");
        assert_eq!(view.stages[0].status, StageStatus::Pending);
        assert_eq!(view.stages[0].attempt_count, 1);
        assert_eq!(
            view.stages[0].error.as_ref().map(|e| e.class),
            Some(ErrorClass::Transient)
        );

        // Both jobs end up back on the accelerator lane.
        let lane = StageKind::Synthesize.resource_class();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(second.queue().len(lane), 2);
    }
}
