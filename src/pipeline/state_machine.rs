//! Pure job state transitions.
//!
//! [`StateMachine`] mutates a [`Job`] in place and returns the
//! [`Transition`] the caller has to act on (enqueue the next stage, schedule
//! a retry, or publish the terminal state). It performs no I/O; the
//! orchestrator persists the mutated job before acting on the transition.

use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::error::StageError;
use crate::pipeline::retry::RetryPolicy;
use crate::pipeline::stage::StageKind;
use crate::scheduler::job::{Job, JobStatus, ResultSummary, StageRecord, StageStatus};
use crate::storage::Artifact;

/// Result of one executor attempt, as reported by a worker.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    Succeeded(Vec<Artifact>),
    Failed(StageError),
}

/// What the orchestrator must do after a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Enqueue `next`. `skipped` lists optional stages passed over on the way.
    Advance {
        next: StageKind,
        skipped: Vec<StageKind>,
    },
    /// Re-enqueue `stage` after `delay`; `attempt` is the upcoming attempt number.
    Retry {
        stage: StageKind,
        attempt: u32,
        delay: Duration,
        error: StageError,
    },
    /// The job reached a terminal status.
    Complete {
        status: JobStatus,
        skipped: Vec<StageKind>,
    },
    /// The outcome was stale or arrived for a cancelled job and was dropped.
    Discarded,
}

/// Reasons a transition is refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("job is already {0}")]
    Terminal(JobStatus),

    #[error("stage {actual} is not the current stage ({expected:?})")]
    NotCurrent {
        expected: Option<StageKind>,
        actual: StageKind,
    },

    #[error("stage {stage} is {status}, expected {expected}")]
    UnexpectedStatus {
        stage: StageKind,
        status: StageStatus,
        expected: StageStatus,
    },

    #[error("stage {stage} has used all {max_attempts} attempts")]
    AttemptsExhausted { stage: StageKind, max_attempts: u32 },
}

/// Drives a `Job` through the pipeline.
pub struct StateMachine;

impl StateMachine {
    /// Marks the pending record of `stage` as running and returns the attempt number.
    pub fn begin_attempt(
        job: &mut Job,
        stage: StageKind,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<u32, TransitionError> {
        if job.is_terminal() {
            return Err(TransitionError::Terminal(job.status));
        }
        if job.current_stage != Some(stage) {
            return Err(TransitionError::NotCurrent {
                expected: job.current_stage,
                actual: stage,
            });
        }
        let max_attempts = policy.max_attempts(stage);
        let record = Self::record_in(job, stage, StageStatus::Pending)?;
        if record.attempt_count >= max_attempts {
            return Err(TransitionError::AttemptsExhausted {
                stage,
                max_attempts,
            });
        }

        record.attempt_count += 1;
        record.status = StageStatus::Running;
        record.started_at = Some(now);
        record.finished_at = None;
        let attempt = record.attempt_count;

        job.status = JobStatus::Running;
        job.updated_at = now;
        Ok(attempt)
    }

    /// Applies the outcome of the running attempt of `stage`.
    ///
    /// - Success records the outputs and advances past any stage whose hard
    ///   dependencies did not succeed.
    /// - A retryable failure with attempts left puts the record back to
    ///   pending and asks for a delayed retry.
    /// - Any other failure fails the record; a required stage fails the job,
    ///   an optional one lets the pipeline continue.
    pub fn apply_outcome(
        job: &mut Job,
        stage: StageKind,
        outcome: StageOutcome,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<Transition, TransitionError> {
        if job.is_terminal() {
            return Err(TransitionError::Terminal(job.status));
        }
        if job.current_stage != Some(stage) {
            return Err(TransitionError::NotCurrent {
                expected: job.current_stage,
                actual: stage,
            });
        }
        let record = Self::record_in(job, stage, StageStatus::Running)?;

        let transition = match outcome {
            StageOutcome::Succeeded(artifacts) => {
                record.status = StageStatus::Succeeded;
                record.finished_at = Some(now);
                record.error = None;
                record.output_artifacts = artifacts;
                Self::advance_from(job, stage, now)
            }
            StageOutcome::Failed(error) => {
                record.error = Some(error.clone());
                if policy.should_retry(stage, record.attempt_count, &error) {
                    record.status = StageStatus::Pending;
                    let delay = policy.delay_for_attempt(record.attempt_count);
                    Transition::Retry {
                        stage,
                        attempt: record.attempt_count + 1,
                        delay,
                        error,
                    }
                } else {
                    record.status = StageStatus::Failed;
                    record.finished_at = Some(now);
                    if stage.is_required() {
                        Self::finish(job, JobStatus::Failed, Some(error), now);
                        Transition::Complete {
                            status: JobStatus::Failed,
                            skipped: Vec::new(),
                        }
                    } else {
                        Self::advance_from(job, stage, now)
                    }
                }
            }
        };

        job.updated_at = now;
        Ok(transition)
    }

    /// Cancels a non-terminal job. A pending record is skipped; a running one
    /// is left for its worker's report to resolve.
    pub fn cancel(job: &mut Job, now: DateTime<Utc>) -> Result<(), TransitionError> {
        if job.is_terminal() {
            return Err(TransitionError::Terminal(job.status));
        }
        if let Some(record) = job
            .current_stage
            .and_then(|stage| job.record_mut(stage))
            .filter(|r| r.status == StageStatus::Pending)
        {
            record.status = StageStatus::Skipped;
            record.finished_at = Some(now);
        }
        Self::finish(job, JobStatus::Cancelled, None, now);
        Ok(())
    }

    /// Resolves the running record of a stage whose result is no longer wanted.
    /// Returns whether a record was changed.
    pub fn discard_running(job: &mut Job, stage: StageKind, now: DateTime<Utc>) -> bool {
        match job
            .record_mut(stage)
            .filter(|r| r.status == StageStatus::Running)
        {
            Some(record) => {
                record.status = StageStatus::Skipped;
                record.finished_at = Some(now);
                job.updated_at = now;
                true
            }
            None => false,
        }
    }

    fn record_in(
        job: &mut Job,
        stage: StageKind,
        expected: StageStatus,
    ) -> Result<&mut StageRecord, TransitionError> {
        let record = job
            .record_mut(stage)
            .ok_or(TransitionError::NotCurrent {
                expected: None,
                actual: stage,
            })?;
        if record.status != expected {
            return Err(TransitionError::UnexpectedStatus {
                stage,
                status: record.status,
                expected,
            });
        }
        Ok(record)
    }

    /// Moves to the first later stage whose hard dependencies all succeeded,
    /// skipping the ones in between, or completes the job.
    fn advance_from(job: &mut Job, after: StageKind, now: DateTime<Utc>) -> Transition {
        let mut skipped = Vec::new();
        let mut cursor = after.next();

        while let Some(stage) = cursor {
            let descriptor = stage.descriptor();
            let runnable = descriptor
                .requires
                .iter()
                .all(|dep| job.stage_status(*dep) == Some(StageStatus::Succeeded));

            if runnable {
                job.stage_history.push(StageRecord::pending(stage));
                job.current_stage = Some(stage);
                return Transition::Advance {
                    next: stage,
                    skipped,
                };
            }

            job.stage_history.push(StageRecord::skipped(stage, now));
            skipped.push(stage);

            if descriptor.required {
                let error = StageError::permanent(format!(
                    "required stage {} could not run because a dependency did not succeed",
                    stage
                ));
                Self::finish(job, JobStatus::Failed, Some(error), now);
                return Transition::Complete {
                    status: JobStatus::Failed,
                    skipped,
                };
            }
            cursor = stage.next();
        }

        let status = if job
            .stage_history
            .iter()
            .all(|r| r.status == StageStatus::Succeeded)
        {
            JobStatus::Succeeded
        } else {
            JobStatus::PartialSuccess
        };
        Self::finish(job, status, None, now);
        Transition::Complete { status, skipped }
    }

    fn finish(job: &mut Job, status: JobStatus, error: Option<StageError>, now: DateTime<Utc>) {
        job.status = status;
        job.current_stage = None;
        job.terminal_at = Some(now);
        job.updated_at = now;
        job.result_summary = Some(ResultSummary {
            status,
            completed_stages: job.stages_with_status(StageStatus::Succeeded),
            failed_stages: job.stages_with_status(StageStatus::Failed),
            skipped_stages: job.stages_with_status(StageStatus::Skipped),
            artifacts: job.all_artifacts(),
            error,
            processing_time_ms: (now - job.created_at).num_milliseconds(),
        });
    }
}
