//! Restart recovery against an on-disk database and artifact directory.

use std::sync::Arc;
use std::time::Duration;

use brand_forge::error::ErrorClass;
use brand_forge::executor::{ExecutorRegistry, SimulatedExecutor};
use brand_forge::pipeline::{Orchestrator, OrchestratorConfig, StageKind};
use brand_forge::scheduler::{BrandInput, JobStatus, StageStatus, WorkItem, WorkerPool};
use brand_forge::storage::{Database, FsArtifactStore};
use tempfile::TempDir;

fn config(dir: &TempDir) -> OrchestratorConfig {
    OrchestratorConfig::new()
        .with_database_url(format!(
            "sqlite://{}",
            dir.path().join("brand_forge.db").display()
        ))
        .with_artifact_path(dir.path().join("artifacts"))
        .with_retry_delays(Duration::from_millis(5), Duration::from_millis(20))
        .with_poll_interval(Duration::from_millis(10))
}

fn brand_input(name: &str) -> BrandInput {
    BrandInput::new(name, "technology", "minimal", "cool").with_trait("innovative")
}

#[tokio::test]
async fn test_recover_resumes_queued_and_interrupted_jobs() {
    let dir = TempDir::new().expect("tempdir");

    // First process: two jobs submitted, one attempt in flight when it stops.
    let (queued, interrupted) = {
        let orchestrator = Orchestrator::connect(config(&dir)).await.expect("connect");
        let queued = orchestrator
            .submit(brand_input("Queued Labs"))
            .await
            .expect("submit");
        let interrupted = orchestrator
            .submit(brand_input("Interrupted Inc"))
            .await
            .expect("submit");
        orchestrator
            .claim(&WorkItem::new(interrupted, StageKind::Synthesize))
            .await
            .expect("claim")
            .expect("request");
        (queued, interrupted)
    };

    // Second process.
    let orchestrator = Arc::new(Orchestrator::connect(config(&dir)).await.expect("connect"));
    let report = orchestrator.recover().await.expect("recover");
    assert_eq!(report.loaded, 2);
    assert_eq!(report.requeued, 1);
    assert_eq!(report.interrupted, 1);

    let view = orchestrator.get_status(interrupted).expect("status");
    assert_eq!(view.stages[0].status, StageStatus::Pending);
    assert_eq!(
        view.stages[0].error.as_ref().map(|e| e.class),
        Some(ErrorClass::Transient)
    );

    let executors = ExecutorRegistry::uniform(Arc::new(SimulatedExecutor::new()));
    let mut pool = WorkerPool::new(Arc::clone(&orchestrator), executors).expect("pool");
    pool.start().expect("start");

    for job_id in [queued, interrupted] {
        let view = orchestrator
            .wait_for_terminal(job_id, Duration::from_secs(20))
            .await
            .expect("terminal");
        assert_eq!(view.status, JobStatus::Succeeded);
    }
    pool.shutdown().await.expect("shutdown");

    let rows = orchestrator
        .database()
        .stage_attempts(interrupted, StageKind::Synthesize)
        .await
        .expect("rows");
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].status, StageStatus::Failed);
    assert_eq!(rows[1].status, StageStatus::Succeeded);
    assert_eq!(rows[1].attempt_count, 2);
}

#[tokio::test]
async fn test_recover_keeps_terminal_jobs_readable() {
    let dir = TempDir::new().expect("tempdir");

    let cancelled = {
        let orchestrator = Orchestrator::connect(config(&dir)).await.expect("connect");
        let job_id = orchestrator
            .submit(brand_input("Closed Shop"))
            .await
            .expect("submit");
        orchestrator.cancel(job_id).await.expect("cancel");
        job_id
    };

    let orchestrator = Orchestrator::connect(config(&dir)).await.expect("connect");
    let report = orchestrator.recover().await.expect("recover");
    assert_eq!(report.loaded, 1);
    assert_eq!(report.terminal, 1);
    assert_eq!(report.requeued, 0);
    assert!(orchestrator.queue().is_empty());

    let view = orchestrator.get_status(cancelled).expect("status");
    assert_eq!(view.status, JobStatus::Cancelled);
    assert_eq!(view.business_name, "Closed Shop");

    // A second recover does not load anything twice.
    let again = orchestrator.recover().await.expect("recover");
    assert_eq!(again.loaded, 0);
}

#[tokio::test]
async fn test_artifacts_are_stored_on_disk() {
    let dir = TempDir::new().expect("tempdir");
    let database = Arc::new(
        Database::connect(&config(&dir).database_url)
            .await
            .expect("connect"),
    );
    database.run_migrations().await.expect("migrate");
    let store = Arc::new(FsArtifactStore::new(
        dir.path().join("artifacts"),
        Arc::clone(&database),
    ));
    let orchestrator = Arc::new(
        Orchestrator::new(config(&dir), Arc::clone(&database), store.clone())
            .expect("orchestrator"),
    );

    let executors = ExecutorRegistry::uniform(Arc::new(SimulatedExecutor::new()));
    let mut pool = WorkerPool::new(Arc::clone(&orchestrator), executors).expect("pool");
    pool.start().expect("start");

    let job_id = orchestrator
        .submit(brand_input("Disk Works"))
        .await
        .expect("submit");
    let view = orchestrator
        .wait_for_terminal(job_id, Duration::from_secs(20))
        .await
        .expect("terminal");
    pool.shutdown().await.expect("shutdown");

    assert_eq!(view.status, JobStatus::Succeeded);
    let stored = store.list_for_job(job_id).await.expect("list");
    let produced: usize = view.completed_stages.iter().map(|c| c.artifacts.len()).sum();
    assert_eq!(stored.len(), produced);
    assert!(store.total_storage_size().await.expect("size") > 0);
}
