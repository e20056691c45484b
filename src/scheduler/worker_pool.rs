//! Worker pool that executes stage attempts.
//!
//! Each resource class has its own lane of the job queue, its own workers and
//! a [`ResourcePool`] of execution slots. A worker holds a slot for the whole
//! executor call, so the number of concurrent executions of a class never
//! exceeds its capacity regardless of how many workers it has.
//!
//! # Features
//!
//! - Per-class slot limits enforced with semaphores
//! - Per-stage execution deadlines
//! - Graceful shutdown with broadcast channel
//! - Pool and slot statistics

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{broadcast, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::StageError;
use crate::executor::{ExecutorRegistry, StagePayload, StageRequest};
use crate::metrics::MetricsCollector;
use crate::pipeline::config::OrchestratorConfig;
use crate::pipeline::stage::{ResourceClass, StageKind};
use crate::pipeline::state_machine::StageOutcome;
use crate::pipeline::Orchestrator;

use super::job::WorkItem;

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Some stages have no executor registered.
    #[error("No executor registered for stages: {0:?}")]
    MissingExecutors(Vec<StageKind>),

    /// A resource pool's semaphore was closed.
    #[error("Resource pool for {0} is closed")]
    ResourceClosed(ResourceClass),

    /// Pool is already running.
    #[error("Pool is already running")]
    AlreadyRunning,

    /// Pool is not running.
    #[error("Pool is not running")]
    NotRunning,

    /// Shutdown timed out.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Worker tasks serving the accelerator lane.
    pub accelerator_workers: usize,
    /// Worker tasks serving the CPU lane.
    pub cpu_workers: usize,
    /// How long an idle worker waits on its lane before checking for shutdown.
    pub poll_interval: Duration,
    /// Timeout for graceful shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self::from(&OrchestratorConfig::default())
    }
}

impl From<&OrchestratorConfig> for WorkerPoolConfig {
    /// One worker per execution slot.
    fn from(config: &OrchestratorConfig) -> Self {
        Self {
            accelerator_workers: config.accelerator_slots,
            cpu_workers: config.cpu_slots,
            poll_interval: config.poll_interval,
            shutdown_timeout: config.shutdown_timeout,
        }
    }
}

impl WorkerPoolConfig {
    pub fn with_workers(mut self, class: ResourceClass, workers: usize) -> Self {
        match class {
            ResourceClass::Accelerator => self.accelerator_workers = workers,
            ResourceClass::Cpu => self.cpu_workers = workers,
        }
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn workers(&self, class: ResourceClass) -> usize {
        match class {
            ResourceClass::Accelerator => self.accelerator_workers,
            ResourceClass::Cpu => self.cpu_workers,
        }
    }

    pub fn total_workers(&self) -> usize {
        self.accelerator_workers + self.cpu_workers
    }
}

/// Bounded set of execution slots for one resource class.
pub struct ResourcePool {
    class: ResourceClass,
    capacity: usize,
    semaphore: Arc<Semaphore>,
    in_use: AtomicUsize,
    peak_in_use: AtomicUsize,
    metrics: MetricsCollector,
}

impl ResourcePool {
    pub fn new(class: ResourceClass, capacity: usize) -> Self {
        Self {
            class,
            capacity,
            semaphore: Arc::new(Semaphore::new(capacity)),
            in_use: AtomicUsize::new(0),
            peak_in_use: AtomicUsize::new(0),
            metrics: MetricsCollector::new(),
        }
    }

    /// Waits for a free slot. The slot is returned when the guard drops.
    pub async fn acquire(self: &Arc<Self>) -> Result<SlotGuard, PoolError> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| PoolError::ResourceClosed(self.class))?;

        let in_use = self.in_use.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_use.fetch_max(in_use, Ordering::SeqCst);
        self.metrics.set_slots_in_use(self.class, in_use);

        Ok(SlotGuard {
            pool: Arc::clone(self),
            _permit: permit,
        })
    }

    pub fn class(&self) -> ResourceClass {
        self.class
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::SeqCst)
    }

    /// Highest number of slots held at once since the pool was created.
    pub fn peak_in_use(&self) -> usize {
        self.peak_in_use.load(Ordering::SeqCst)
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn stats(&self) -> SlotStats {
        SlotStats {
            capacity: self.capacity,
            in_use: self.in_use(),
            peak_in_use: self.peak_in_use(),
        }
    }
}

/// A held execution slot.
pub struct SlotGuard {
    pool: Arc<ResourcePool>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        // Runs before the permit field is dropped, so `in_use` never exceeds capacity.
        let in_use = self.pool.in_use.fetch_sub(1, Ordering::SeqCst) - 1;
        self.pool.metrics.set_slots_in_use(self.pool.class, in_use);
    }
}

/// Slot usage of one resource class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotStats {
    pub capacity: usize,
    pub in_use: usize,
    pub peak_in_use: usize,
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Total number of workers in the pool.
    pub num_workers: usize,
    /// Number of workers currently executing a stage.
    pub active_workers: usize,
    pub attempts_succeeded: u64,
    /// Failed attempts, including timeouts.
    pub attempts_failed: u64,
    pub attempts_timed_out: u64,
    /// Average executor wall time per attempt.
    pub average_attempt_duration: Duration,
    pub accelerator: SlotStats,
    pub cpu: SlotStats,
}

impl PoolStats {
    /// Returns the total number of attempts executed.
    pub fn total_processed(&self) -> u64 {
        self.attempts_succeeded + self.attempts_failed
    }

    /// Returns the success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.attempts_succeeded as f64 / total as f64) * 100.0
    }

    pub fn slots(&self, class: ResourceClass) -> SlotStats {
        match class {
            ResourceClass::Accelerator => self.accelerator,
            ResourceClass::Cpu => self.cpu,
        }
    }
}

#[derive(Default)]
struct SharedPoolStats {
    attempts_succeeded: AtomicU64,
    attempts_failed: AtomicU64,
    attempts_timed_out: AtomicU64,
    total_duration_ms: AtomicU64,
    active_workers: AtomicU64,
}

impl SharedPoolStats {
    fn record(&self, outcome: &StageOutcome, duration: Duration) {
        match outcome {
            StageOutcome::Succeeded(_) => {
                self.attempts_succeeded.fetch_add(1, Ordering::SeqCst);
            }
            StageOutcome::Failed(error) => {
                self.attempts_failed.fetch_add(1, Ordering::SeqCst);
                if error.class == crate::error::ErrorClass::Timeout {
                    self.attempts_timed_out.fetch_add(1, Ordering::SeqCst);
                }
            }
        }
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn increment_active(&self) {
        self.active_workers.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement_active(&self) {
        self.active_workers.fetch_sub(1, Ordering::SeqCst);
    }

    fn to_pool_stats(&self, num_workers: usize) -> PoolStats {
        let succeeded = self.attempts_succeeded.load(Ordering::SeqCst);
        let failed = self.attempts_failed.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);

        let total = succeeded + failed;
        let average_attempt_duration = if total > 0 {
            Duration::from_millis(total_duration_ms / total)
        } else {
            Duration::ZERO
        };

        PoolStats {
            num_workers,
            active_workers: self.active_workers.load(Ordering::SeqCst) as usize,
            attempts_succeeded: succeeded,
            attempts_failed: failed,
            attempts_timed_out: self.attempts_timed_out.load(Ordering::SeqCst),
            average_attempt_duration,
            ..PoolStats::default()
        }
    }
}

/// Worker pool that executes queued stages through registered executors.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    orchestrator: Arc<Orchestrator>,
    executors: Arc<ExecutorRegistry>,
    resources: [Arc<ResourcePool>; 2],
    shutdown_tx: broadcast::Sender<()>,
    worker_handles: Vec<JoinHandle<()>>,
    stats: Arc<SharedPoolStats>,
    is_running: AtomicBool,
}

impl WorkerPool {
    /// Creates a worker pool sized from the orchestrator's configuration.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::MissingExecutors` if any stage has no executor.
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        executors: ExecutorRegistry,
    ) -> Result<Self, PoolError> {
        let config = WorkerPoolConfig::from(orchestrator.config());
        Self::with_config(config, orchestrator, executors)
    }

    pub fn with_config(
        config: WorkerPoolConfig,
        orchestrator: Arc<Orchestrator>,
        executors: ExecutorRegistry,
    ) -> Result<Self, PoolError> {
        let missing = executors.missing();
        if !missing.is_empty() {
            return Err(PoolError::MissingExecutors(missing));
        }

        let resources = ResourceClass::ALL.map(|class| {
            Arc::new(ResourcePool::new(
                class,
                orchestrator.config().capacity(class),
            ))
        });
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            config,
            orchestrator,
            executors: Arc::new(executors),
            resources,
            shutdown_tx,
            worker_handles: Vec::new(),
            stats: Arc::new(SharedPoolStats::default()),
            is_running: AtomicBool::new(false),
        })
    }

    /// Starts all workers. They begin polling their lanes immediately.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::AlreadyRunning` if the pool is already running.
    pub fn start(&mut self) -> Result<(), PoolError> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::AlreadyRunning);
        }

        for class in ResourceClass::ALL {
            for i in 0..self.config.workers(class) {
                let worker = Worker {
                    id: format!("{}-worker-{}", class, i),
                    class,
                    orchestrator: Arc::clone(&self.orchestrator),
                    executors: Arc::clone(&self.executors),
                    resources: Arc::clone(&self.resources[class.index()]),
                    shutdown_rx: self.shutdown_tx.subscribe(),
                    poll_interval: self.config.poll_interval,
                    stats: Arc::clone(&self.stats),
                };
                self.worker_handles.push(tokio::spawn(worker.run()));
            }
        }

        self.is_running.store(true, Ordering::SeqCst);
        info!(
            accelerator_workers = self.config.accelerator_workers,
            cpu_workers = self.config.cpu_workers,
            "Worker pool started"
        );
        Ok(())
    }

    /// Stops workers after their current attempt.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::ShutdownTimeout` if workers don't stop within
    /// the configured timeout. Attempts still running are resolved by
    /// [`Orchestrator::recover`] on the next start.
    pub async fn shutdown(&mut self) -> Result<(), PoolError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::NotRunning);
        }

        info!("Initiating worker pool shutdown");
        // Workers may have already stopped.
        let _ = self.shutdown_tx.send(());

        let handles: Vec<_> = self.worker_handles.drain(..).collect();
        let shutdown_future = async {
            for result in futures::future::join_all(handles).await {
                if let Err(e) = result {
                    error!(error = %e, "Worker task panicked during shutdown");
                }
            }
        };

        let result = tokio::time::timeout(self.config.shutdown_timeout, shutdown_future).await;
        self.is_running.store(false, Ordering::SeqCst);
        match result {
            Ok(()) => {
                info!("Worker pool shutdown complete");
                Ok(())
            }
            Err(_) => Err(PoolError::ShutdownTimeout(self.config.shutdown_timeout)),
        }
    }

    /// Returns current pool statistics.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            accelerator: self.resource(ResourceClass::Accelerator).stats(),
            cpu: self.resource(ResourceClass::Cpu).stats(),
            ..self.stats.to_pool_stats(self.config.total_workers())
        }
    }

    pub fn resource(&self, class: ResourceClass) -> &Arc<ResourcePool> {
        &self.resources[class.index()]
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    pub fn num_workers(&self) -> usize {
        self.config.total_workers()
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }
}

/// A single worker serving one resource class.
struct Worker {
    id: String,
    class: ResourceClass,
    orchestrator: Arc<Orchestrator>,
    executors: Arc<ExecutorRegistry>,
    resources: Arc<ResourcePool>,
    shutdown_rx: broadcast::Receiver<()>,
    poll_interval: Duration,
    stats: Arc<SharedPoolStats>,
}

impl Worker {
    async fn run(mut self) {
        info!(worker_id = %self.id, "Worker started");

        loop {
            match self.shutdown_rx.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => {
                    info!(worker_id = %self.id, "Worker received shutdown signal");
                    break;
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Empty) => {}
            }

            let queue = Arc::clone(self.orchestrator.queue());
            match queue.dequeue(self.class, self.poll_interval).await {
                Ok(Some(item)) => self.process(item).await,
                Ok(None) => {}
                Err(e) => {
                    error!(worker_id = %self.id, error = %e, "Failed to dequeue work item");
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }

        info!(worker_id = %self.id, "Worker stopped");
    }

    async fn process(&self, item: WorkItem) {
        let slot = match self.resources.acquire().await {
            Ok(slot) => slot,
            Err(e) => {
                error!(worker_id = %self.id, item = %item, error = %e, "Failed to acquire slot");
                self.requeue_later(item);
                return;
            }
        };

        let request = match self.orchestrator.claim(&item).await {
            Ok(Some(request)) => request,
            Ok(None) => return,
            Err(e) => {
                error!(worker_id = %self.id, item = %item, error = %e, "Failed to start stage attempt");
                drop(slot);
                self.requeue_later(item);
                return;
            }
        };

        debug!(
            worker_id = %self.id,
            job_id = %request.job_id,
            stage = %request.stage,
            attempt = request.attempt,
            "Executing stage"
        );

        self.stats.increment_active();
        let start_time = Instant::now();
        let outcome = self.execute(&request).await;
        let duration = start_time.elapsed();
        drop(slot);
        self.stats.decrement_active();

        self.stats.record(&outcome, duration);
        let label = match &outcome {
            StageOutcome::Succeeded(_) => "succeeded",
            StageOutcome::Failed(error) => error.class.as_str(),
        };
        self.orchestrator
            .metrics()
            .record_stage_attempt(request.stage, label, duration);

        self.report(&request, outcome).await;
    }

    /// Hands the outcome to the orchestrator, retrying storage failures with
    /// the retry policy's backoff.
    ///
    /// If the outcome still cannot be recorded, its artifacts are deleted and
    /// the attempt is reported as a transient failure instead, so the stage is
    /// retried rather than left running. If even that cannot be recorded, the
    /// attempt stays RUNNING and is resolved by `recover` on the next start.
    async fn report(&self, request: &StageRequest, outcome: StageOutcome) {
        let policy = &self.orchestrator.config().retry;
        let max_attempts = policy.max_attempts(request.stage);
        let mut outcome = outcome;
        let mut replaced = false;
        let mut attempt = 1;

        loop {
            let error = match self
                .orchestrator
                .report_outcome(request.job_id, request.stage, outcome.clone())
                .await
            {
                Ok(transition) => {
                    debug!(
                        worker_id = %self.id,
                        job_id = %request.job_id,
                        stage = %request.stage,
                        transition = ?transition,
                        "Reported stage outcome"
                    );
                    return;
                }
                Err(e) => e,
            };

            if !error.is_retryable() {
                error!(
                    worker_id = %self.id,
                    job_id = %request.job_id,
                    stage = %request.stage,
                    error = %error,
                    "Failed to report stage outcome"
                );
                return;
            }

            if attempt < max_attempts {
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    worker_id = %self.id,
                    job_id = %request.job_id,
                    stage = %request.stage,
                    attempt = attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Failed to report stage outcome, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
                continue;
            }

            if replaced {
                error!(
                    worker_id = %self.id,
                    job_id = %request.job_id,
                    stage = %request.stage,
                    error = %error,
                    "Could not record stage attempt, leaving it for recovery"
                );
                return;
            }

            error!(
                worker_id = %self.id,
                job_id = %request.job_id,
                stage = %request.stage,
                error = %error,
                "Could not record stage outcome, reporting the attempt as failed"
            );
            self.orchestrator
                .discard_outputs(request.job_id, &outcome)
                .await;
            outcome = StageOutcome::Failed(StageError::transient(format!(
                "outcome could not be recorded: {}",
                error
            )));
            replaced = true;
            attempt = 1;
        }
    }

    /// Runs the executor under the stage deadline and stores what it produced.
    async fn execute(&self, request: &StageRequest) -> StageOutcome {
        let Some(executor) = self.executors.get(request.stage) else {
            return StageOutcome::Failed(StageError::permanent(format!(
                "no executor registered for {}",
                request.stage
            )));
        };
        let deadline = self.orchestrator.config().timeout_for(request.stage);
        let store = self.orchestrator.store();

        match tokio::time::timeout(deadline, executor.execute(request, store.as_ref())).await {
            Ok(Ok(payloads)) => self.store_payloads(request, payloads).await,
            Ok(Err(e)) => StageOutcome::Failed(e.into()),
            Err(_) => {
                warn!(
                    worker_id = %self.id,
                    job_id = %request.job_id,
                    stage = %request.stage,
                    deadline_ms = deadline.as_millis() as u64,
                    "Stage attempt timed out"
                );
                StageOutcome::Failed(StageError::timeout(deadline))
            }
        }
    }

    /// Writes payloads to the artifact store. A failed write removes the
    /// artifacts already written for this attempt.
    async fn store_payloads(&self, request: &StageRequest, payloads: Vec<StagePayload>) -> StageOutcome {
        let store = self.orchestrator.store();
        let mut artifacts = Vec::with_capacity(payloads.len());

        for payload in payloads {
            match store
                .put(request.job_id, request.stage, &payload.name, &payload.bytes)
                .await
            {
                Ok(artifact) => artifacts.push(artifact),
                Err(e) => {
                    for artifact in &artifacts {
                        if let Err(cleanup) = store.delete(&artifact.reference).await {
                            warn!(artifact = %artifact.reference, error = %cleanup, "Failed to remove partial artifact");
                        }
                    }
                    return StageOutcome::Failed(StageError::transient(format!(
                        "failed to store {}: {}",
                        payload.name, e
                    )));
                }
            }
        }

        StageOutcome::Succeeded(artifacts)
    }

    fn requeue_later(&self, item: WorkItem) {
        let queue = Arc::clone(self.orchestrator.queue());
        let delay = self.poll_interval;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = queue.enqueue(item) {
                error!(item = %item, error = %e, "Failed to requeue work item");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorClass;
    use crate::executor::simulated::SimulatedExecutor;
    use crate::scheduler::job::{BrandInput, JobStatus, JobView, StageStatus};
    use crate::storage::{Database, MemoryArtifactStore};

    #[test]
    fn test_worker_pool_config_from_orchestrator_config() {
        let orchestrator_config = OrchestratorConfig::new()
            .with_accelerator_slots(2)
            .with_cpu_slots(6)
            .with_poll_interval(Duration::from_millis(10));
        let config = WorkerPoolConfig::from(&orchestrator_config)
            .with_workers(ResourceClass::Accelerator, 3);

        assert_eq!(config.workers(ResourceClass::Accelerator), 3);
        assert_eq!(config.workers(ResourceClass::Cpu), 6);
        assert_eq!(config.total_workers(), 9);
        assert_eq!(config.poll_interval, Duration::from_millis(10));
    }

    #[test]
    fn test_pool_stats_calculations() {
        let stats = PoolStats {
            num_workers: 4,
            attempts_succeeded: 80,
            attempts_failed: 20,
            ..PoolStats::default()
        };

        assert_eq!(stats.total_processed(), 100);
        assert!((stats.success_rate() - 80.0).abs() < f64::EPSILON);
        assert!((PoolStats::default().success_rate() - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_shared_pool_stats() {
        let stats = SharedPoolStats::default();

        stats.record(&StageOutcome::Succeeded(Vec::new()), Duration::from_millis(10));
        stats.record(
            &StageOutcome::Failed(StageError::timeout(Duration::from_millis(5))),
            Duration::from_millis(20),
        );
        stats.record(
            &StageOutcome::Failed(StageError::transient("busy")),
            Duration::from_millis(30),
        );

        let pool_stats = stats.to_pool_stats(2);
        assert_eq!(pool_stats.attempts_succeeded, 1);
        assert_eq!(pool_stats.attempts_failed, 2);
        assert_eq!(pool_stats.attempts_timed_out, 1);
        assert_eq!(pool_stats.average_attempt_duration, Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_slot_guard_tracks_usage() {
        let pool = Arc::new(ResourcePool::new(ResourceClass::Cpu, 2));

        let first = pool.acquire().await.expect("slot");
        let second = pool.acquire().await.expect("slot");
        assert_eq!(pool.in_use(), 2);
        assert_eq!(pool.available(), 0);

        let third = tokio::time::timeout(Duration::from_millis(20), pool.acquire()).await;
        assert!(third.is_err(), "third slot must wait");

        drop(first);
        assert_eq!(pool.in_use(), 1);
        drop(second);
        assert_eq!(pool.in_use(), 0);
        assert_eq!(pool.peak_in_use(), 2);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_pool_error_display() {
        let err = PoolError::AlreadyRunning;
        assert!(err.to_string().contains("already running"));

        let err = PoolError::ShutdownTimeout(Duration::from_secs(60));
        assert!(err.to_string().contains("60"));

        let err = PoolError::MissingExecutors(vec![StageKind::Export]);
        assert!(err.to_string().contains("Export"));
    }

    async fn orchestrator() -> Arc<Orchestrator> {
        let database = Arc::new(Database::in_memory().await.expect("database"));
        let config = OrchestratorConfig::new()
            .with_poll_interval(Duration::from_millis(10))
            .with_retry_delays(Duration::from_millis(1), Duration::from_millis(5));
        Arc::new(
            Orchestrator::new(config, database, Arc::new(MemoryArtifactStore::new()))
                .expect("orchestrator"),
        )
    }

    #[tokio::test]
    async fn test_pool_requires_every_executor() {
        let orchestrator = orchestrator().await;
        let executors = ExecutorRegistry::new()
            .with(StageKind::Synthesize, Arc::new(SimulatedExecutor::new()));

        let result = WorkerPool::new(orchestrator, executors);
        assert!(matches!(result, Err(PoolError::MissingExecutors(missing)) if missing.len() == 6));
    }

    #[tokio::test]
    async fn test_pool_runs_job_to_completion() {
        let orchestrator = orchestrator().await;
        let executors = ExecutorRegistry::uniform(Arc::new(SimulatedExecutor::new()));
        let mut pool = WorkerPool::new(Arc::clone(&orchestrator), executors).expect("pool");
        pool.start().expect("start");
        assert!(matches!(pool.start(), Err(PoolError::AlreadyRunning)));

        let input = BrandInput::new("Acme Coffee", "food", "modern", "warm").with_trait("friendly");
        let job_id = orchestrator.submit(input).await.expect("submit");
        let view = orchestrator
            .wait_for_terminal(job_id, Duration::from_secs(10))
            .await
            .expect("terminal");

        assert_eq!(view.status, JobStatus::Succeeded);
        assert_eq!(view.completed_stages.len(), StageKind::ALL.len());

        let stats = pool.stats();
        assert_eq!(stats.attempts_succeeded, StageKind::ALL.len() as u64);
        assert!(stats.accelerator.peak_in_use <= stats.accelerator.capacity);

        pool.shutdown().await.expect("shutdown");
        assert!(!pool.is_running());
    }

    const REJECT_JOB_WRITES: [&str; 2] = [
        "CREATE TRIGGER reject_job_insert BEFORE INSERT ON jobs BEGIN SELECT RAISE(ABORT, 'database unavailable'); END",
        "CREATE TRIGGER reject_job_update BEFORE UPDATE ON jobs BEGIN SELECT RAISE(ABORT, 'database unavailable'); END",
    ];
    const ACCEPT_JOB_WRITES: [&str; 2] = [
        "DROP TRIGGER reject_job_insert",
        "DROP TRIGGER reject_job_update",
    ];

    async fn execute_all(database: &Database, statements: [&str; 2]) {
        for statement in statements {
            sqlx::query(statement)
                .execute(database.pool())
                .await
                .expect("statement");
        }
    }

    /// Runs one job whose Synthesize outcome arrives while job writes are
    /// rejected for `outage`.
    async fn run_through_outage(
        outage: Duration,
    ) -> (Arc<Database>, Arc<MemoryArtifactStore>, JobView) {
        let database = Arc::new(Database::in_memory().await.expect("database"));
        let store = Arc::new(MemoryArtifactStore::new());
        let config = OrchestratorConfig::new()
            .with_poll_interval(Duration::from_millis(10))
            .with_max_retries(2)
            .with_retry_delays(Duration::from_millis(200), Duration::from_millis(200));
        let orchestrator = Arc::new(
            Orchestrator::new(config, Arc::clone(&database), store.clone()).expect("orchestrator"),
        );
        let executor = SimulatedExecutor::new()
            .with_stage_latency(StageKind::Synthesize, Duration::from_millis(200));
        let mut pool = WorkerPool::new(
            Arc::clone(&orchestrator),
            ExecutorRegistry::uniform(Arc::new(executor)),
        )
        .expect("pool");
        pool.start().expect("start");

        let mut events = orchestrator.subscribe();
        let input = BrandInput::new("Acme Coffee", "food", "modern", "warm").with_trait("friendly");
        let job_id = orchestrator.submit(input).await.expect("submit");
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = events.recv().await.expect("event");
                if event.job_id == job_id && event.status == JobStatus::Running {
                    break;
                }
            }
        })
        .await
        .expect("synthesize started");

        execute_all(&database, REJECT_JOB_WRITES).await;
        tokio::time::sleep(outage).await;
        execute_all(&database, ACCEPT_JOB_WRITES).await;

        let view = orchestrator
            .wait_for_terminal(job_id, Duration::from_secs(10))
            .await
            .expect("terminal");
        pool.shutdown().await.expect("shutdown");
        (database, store, view)
    }

    #[tokio::test]
    async fn test_outcome_recorded_once_database_recovers() {
        // The outcome arrives at ~200ms and is retried at ~400ms.
        let (_, store, view) = run_through_outage(Duration::from_millis(300)).await;

        assert_eq!(view.status, JobStatus::Succeeded);
        assert_eq!(view.stages[0].stage, StageKind::Synthesize);
        assert_eq!(view.stages[0].attempt_count, 1);

        let recorded: usize = view.completed_stages.iter().map(|c| c.artifacts.len()).sum();
        assert_eq!(store.len().await, recorded);
    }

    #[tokio::test]
    async fn test_unrecordable_outcome_becomes_transient_failure() {
        // All three reports of the outcome fail (~200, 400, 600ms); the
        // replacement failure is recorded at ~800ms.
        let (database, store, view) = run_through_outage(Duration::from_millis(700)).await;

        assert_eq!(view.status, JobStatus::Succeeded);
        assert_eq!(view.stages[0].attempt_count, 2);

        let rows = database
            .stage_attempts(view.job_id, StageKind::Synthesize)
            .await
            .expect("rows");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].status, StageStatus::Failed);
        let error = rows[0].error.as_ref().expect("error");
        assert_eq!(error.class, ErrorClass::Transient);
        assert!(error.message.contains("could not be recorded"));
        assert_eq!(rows[1].status, StageStatus::Succeeded);

        // Outputs of the lost attempt were deleted.
        let recorded: usize = view.completed_stages.iter().map(|c| c.artifacts.len()).sum();
        assert_eq!(store.len().await, recorded);
    }
}
