//! SQLite database client for persistent job state.
//!
//! Every job transition is written in a single transaction covering the job
//! row and all of its stage records, so a reader of the database never sees a
//! job whose status disagrees with its stage history.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use uuid::Uuid;

use crate::pipeline::stage::StageKind;
use crate::scheduler::job::{Job, JobStatus, StageRecord, StageStatus};

use super::migrations::MigrationRunner;

/// Errors that can occur during database operations.
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Query failed: {0}")]
    QueryFailed(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored value could not be decoded into its domain type.
    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Migration error: {0}")]
    Migration(#[from] super::migrations::MigrationError),
}

/// SQLite database client.
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Connects to the database, creating the file if it does not exist.
    ///
    /// # Arguments
    ///
    /// * `database_url` - SQLite connection string (e.g., "sqlite://brand_forge.db")
    pub async fn connect(database_url: &str) -> Result<Self, DatabaseError> {
        let in_memory = database_url.contains(":memory:");

        let mut options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| DatabaseError::ConnectionFailed(e.to_string()))?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(30));
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        // Every connection to `sqlite::memory:` opens its own database, so an
        // in-memory pool is a single connection that is never recycled.
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(8)
        };

        let pool = pool_options
            .min_connections(1)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await
            .map_err(|e| DatabaseError::ConnectionFailed(e.to_string()))?;

        Ok(Self { pool })
    }

    /// Opens a migrated in-memory database.
    pub async fn in_memory() -> Result<Self, DatabaseError> {
        let db = Self::connect("sqlite::memory:").await?;
        db.run_migrations().await?;
        Ok(db)
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn run_migrations(&self) -> Result<(), DatabaseError> {
        let runner = MigrationRunner::new(self.pool.clone());
        runner.run_migrations().await?;
        Ok(())
    }

    // =========================================================================
    // Job Operations
    // =========================================================================

    /// Saves a job and its stage records.
    ///
    /// This operation is transactional - either all data is saved or none.
    pub async fn save_job(&self, job: &Job) -> Result<(), DatabaseError> {
        let mut tx = self.pool.begin().await?;

        let input_json = serde_json::to_string(&job.input)?;
        let summary_json = job
            .result_summary
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, business_name, input, status, current_stage,
                result_summary, created_at, updated_at, terminal_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT (id) DO UPDATE SET
                status = excluded.status,
                current_stage = excluded.current_stage,
                result_summary = excluded.result_summary,
                updated_at = excluded.updated_at,
                terminal_at = excluded.terminal_at
            "#,
        )
        .bind(job.id.to_string())
        .bind(&job.input.business_name)
        .bind(&input_json)
        .bind(job.status.as_str())
        .bind(job.current_stage.map(StageKind::as_str))
        .bind(summary_json)
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.terminal_at)
        .execute(&mut *tx)
        .await?;

        for record in &job.stage_history {
            let job_id = job.id.to_string();
            let stage = record.stage_kind.as_str();
            let attempt = i64::from(record.attempt_count);

            if record.attempt_count > 0 {
                // The not-yet-started placeholder is superseded by a real attempt.
                sqlx::query(
                    "DELETE FROM stage_records WHERE job_id = ?1 AND stage_kind = ?2 AND attempt_count = 0",
                )
                .bind(&job_id)
                .bind(stage)
                .execute(&mut *tx)
                .await?;

                // Earlier attempts left waiting for a retry are now known to have failed.
                sqlx::query(
                    r#"
                    UPDATE stage_records SET status = 'FAILED'
                    WHERE job_id = ?1 AND stage_kind = ?2 AND attempt_count < ?3 AND status = 'PENDING'
                    "#,
                )
                .bind(&job_id)
                .bind(stage)
                .bind(attempt)
                .execute(&mut *tx)
                .await?;
            }

            let error_json = record.error.as_ref().map(serde_json::to_string).transpose()?;
            let artifacts_json = serde_json::to_string(&record.output_artifacts)?;

            sqlx::query(
                r#"
                INSERT INTO stage_records (
                    job_id, stage_kind, attempt_count, status,
                    started_at, finished_at, error, output_artifacts
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                ON CONFLICT (job_id, stage_kind, attempt_count) DO UPDATE SET
                    status = excluded.status,
                    started_at = excluded.started_at,
                    finished_at = excluded.finished_at,
                    error = excluded.error,
                    output_artifacts = excluded.output_artifacts
                "#,
            )
            .bind(&job_id)
            .bind(stage)
            .bind(attempt)
            .bind(record.status.as_str())
            .bind(record.started_at)
            .bind(record.finished_at)
            .bind(error_json)
            .bind(&artifacts_json)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Retrieves a job with its latest stage records.
    ///
    /// Returns `None` if the job doesn't exist.
    pub async fn load_job(&self, id: Uuid) -> Result<Option<Job>, DatabaseError> {
        let row = sqlx::query(
            r#"
            SELECT id, input, status, current_stage, result_summary,
                   created_at, updated_at, terminal_at
            FROM jobs
            WHERE id = ?1
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let mut job = job_from_row(&row)?;
                job.stage_history = self.latest_stage_records(id).await?;
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }

    /// Lists jobs matching the filter, newest first.
    pub async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, DatabaseError> {
        let mut sql = String::from(
            r#"
            SELECT id, input, status, current_stage, result_summary,
                   created_at, updated_at, terminal_at
            FROM jobs
            "#,
        );

        if !filter.statuses.is_empty() {
            let placeholders: Vec<String> = (1..=filter.statuses.len())
                .map(|i| format!("?{}", i))
                .collect();
            sql.push_str(&format!(" WHERE status IN ({})", placeholders.join(", ")));
        }
        sql.push_str(" ORDER BY created_at DESC");
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        let mut query = sqlx::query(&sql);
        for status in &filter.statuses {
            query = query.bind(status.as_str());
        }
        let rows = query.fetch_all(&self.pool).await?;

        let mut jobs = Vec::with_capacity(rows.len());
        for row in rows {
            let mut job = job_from_row(&row)?;
            job.stage_history = self.latest_stage_records(job.id).await?;
            jobs.push(job);
        }
        Ok(jobs)
    }

    /// Every persisted attempt row of one stage of a job, oldest first.
    pub async fn stage_attempts(
        &self,
        job_id: Uuid,
        stage: StageKind,
    ) -> Result<Vec<StageRecord>, DatabaseError> {
        let rows = sqlx::query(
            r#"
            SELECT stage_kind, attempt_count, status, started_at, finished_at, error, output_artifacts
            FROM stage_records
            WHERE job_id = ?1 AND stage_kind = ?2
            ORDER BY attempt_count
            "#,
        )
        .bind(job_id.to_string())
        .bind(stage.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(stage_record_from_row).collect()
    }

    /// The latest attempt of every stage of a job, in pipeline order.
    async fn latest_stage_records(&self, job_id: Uuid) -> Result<Vec<StageRecord>, DatabaseError> {
        let rows = sqlx::query(
            r#"
            SELECT stage_kind, attempt_count, status, started_at, finished_at, error, output_artifacts
            FROM stage_records
            WHERE job_id = ?1
            ORDER BY attempt_count
            "#,
        )
        .bind(job_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        let mut latest: BTreeMap<StageKind, StageRecord> = BTreeMap::new();
        for row in &rows {
            let record = stage_record_from_row(row)?;
            latest.insert(record.stage_kind, record);
        }
        Ok(latest.into_values().collect())
    }
}

fn decode_err(column: &str, message: impl std::fmt::Display) -> DatabaseError {
    DatabaseError::Decode(format!("{}: {}", column, message))
}

fn job_from_row(row: &SqliteRow) -> Result<Job, DatabaseError> {
    let id: String = row.try_get("id")?;
    let input: String = row.try_get("input")?;
    let status: String = row.try_get("status")?;
    let current_stage: Option<String> = row.try_get("current_stage")?;
    let result_summary: Option<String> = row.try_get("result_summary")?;

    Ok(Job {
        id: Uuid::parse_str(&id).map_err(|e| decode_err("id", e))?,
        input: serde_json::from_str(&input)?,
        status: JobStatus::from_str(&status).map_err(|e| decode_err("status", e))?,
        current_stage: current_stage
            .map(|s| StageKind::from_str(&s))
            .transpose()
            .map_err(|e| decode_err("current_stage", e))?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
        terminal_at: row.try_get::<Option<DateTime<Utc>>, _>("terminal_at")?,
        stage_history: Vec::new(),
        result_summary: result_summary
            .map(|s| serde_json::from_str(&s))
            .transpose()?,
    })
}

fn stage_record_from_row(row: &SqliteRow) -> Result<StageRecord, DatabaseError> {
    let stage_kind: String = row.try_get("stage_kind")?;
    let attempt_count: i64 = row.try_get("attempt_count")?;
    let status: String = row.try_get("status")?;
    let error: Option<String> = row.try_get("error")?;
    let output_artifacts: String = row.try_get("output_artifacts")?;

    Ok(StageRecord {
        stage_kind: StageKind::from_str(&stage_kind).map_err(|e| decode_err("stage_kind", e))?,
        attempt_count: u32::try_from(attempt_count).map_err(|e| decode_err("attempt_count", e))?,
        status: StageStatus::from_str(&status).map_err(|e| decode_err("status", e))?,
        started_at: row.try_get::<Option<DateTime<Utc>>, _>("started_at")?,
        finished_at: row.try_get::<Option<DateTime<Utc>>, _>("finished_at")?,
        error: error.map(|s| serde_json::from_str(&s)).transpose()?,
        output_artifacts: serde_json::from_str(&output_artifacts)?,
    })
}

/// Filter for querying jobs.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub statuses: Vec<JobStatus>,
    pub limit: Option<i64>,
}

impl JobFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.statuses.push(status);
        self
    }

    /// Restricts the filter to jobs that have not reached a terminal state.
    pub fn unfinished(self) -> Self {
        self.with_status(JobStatus::Queued)
            .with_status(JobStatus::Running)
    }

    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StageError;
    use crate::scheduler::job::BrandInput;

    fn sample_job() -> Job {
        Job::new(BrandInput::new("Acme", "food", "modern", "warm").with_trait("bold"))
    }

    #[tokio::test]
    async fn test_save_and_load_job() {
        let db = Database::in_memory().await.expect("db");
        let job = sample_job();
        db.save_job(&job).await.expect("save");

        let loaded = db.load_job(job.id).await.expect("load").expect("present");
        assert_eq!(loaded.id, job.id);
        assert_eq!(loaded.status, JobStatus::Queued);
        assert_eq!(loaded.current_stage, Some(StageKind::Synthesize));
        assert_eq!(loaded.input, job.input);
        assert_eq!(loaded.stage_history.len(), 1);
        assert_eq!(loaded.stage_history[0].attempt_count, 0);
    }

    #[tokio::test]
    async fn test_missing_job_is_none() {
        let db = Database::in_memory().await.expect("db");
        assert!(db.load_job(Uuid::new_v4()).await.expect("load").is_none());
    }

    #[tokio::test]
    async fn test_attempt_rows_are_kept_per_attempt() {
        let db = Database::in_memory().await.expect("db");
        let mut job = sample_job();
        db.save_job(&job).await.expect("save queued");

        // First attempt starts and fails with a retry pending.
        job.status = JobStatus::Running;
        job.stage_history[0].attempt_count = 1;
        job.stage_history[0].status = StageStatus::Running;
        db.save_job(&job).await.expect("save running");
        job.stage_history[0].status = StageStatus::Pending;
        job.stage_history[0].error = Some(StageError::transient("flaky"));
        db.save_job(&job).await.expect("save retry");

        // Second attempt starts.
        job.stage_history[0].attempt_count = 2;
        job.stage_history[0].status = StageStatus::Running;
        db.save_job(&job).await.expect("save second attempt");

        let attempts = db
            .stage_attempts(job.id, StageKind::Synthesize)
            .await
            .expect("attempts");
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].attempt_count, 1);
        assert_eq!(attempts[0].status, StageStatus::Failed);
        assert_eq!(attempts[1].status, StageStatus::Running);

        let loaded = db.load_job(job.id).await.expect("load").expect("present");
        assert_eq!(loaded.stage_history.len(), 1);
        assert_eq!(loaded.stage_history[0].attempt_count, 2);
    }

    #[tokio::test]
    async fn test_list_unfinished_jobs() {
        let db = Database::in_memory().await.expect("db");
        let queued = sample_job();
        let mut done = sample_job();
        done.status = JobStatus::Succeeded;
        done.current_stage = None;
        db.save_job(&queued).await.expect("save");
        db.save_job(&done).await.expect("save");

        let all = db.list_jobs(&JobFilter::new()).await.expect("list");
        assert_eq!(all.len(), 2);

        let unfinished = db
            .list_jobs(&JobFilter::new().unfinished())
            .await
            .expect("list");
        assert_eq!(unfinished.len(), 1);
        assert_eq!(unfinished[0].id, queued.id);

        let limited = db
            .list_jobs(&JobFilter::new().with_limit(1))
            .await
            .expect("list");
        assert_eq!(limited.len(), 1);
    }
}
