//! Job definitions for the scheduler.
//!
//! This module defines the core types tracked by the orchestrator:
//!
//! - `BrandInput`: The user's brand description, validated at submission
//! - `Job`: One brand generation request and its stage history
//! - `StageRecord`: The latest attempt state of one stage of one job
//! - `WorkItem`: A (job, stage) pair waiting in a resource queue
//! - `JobView`: Read-only snapshot handed to status readers

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{StageError, ValidationError};
use crate::pipeline::stage::{ResourceClass, StageKind};
use crate::storage::artifacts::Artifact;

/// Default number of logo concepts to synthesize.
const DEFAULT_NUM_LOGOS: u32 = 3;
/// Default number of variations per concept.
const DEFAULT_NUM_VARIATIONS: u32 = 1;

const MAX_BUSINESS_NAME_CHARS: usize = 100;
const MAX_PERSONALITY_TRAITS: usize = 6;
const MAX_TARGET_AUDIENCE_CHARS: usize = 200;
const MIN_PROMPT_CHARS: usize = 10;
const MAX_PROMPT_CHARS: usize = 2000;
const MIN_PROMPT_WORDS: usize = 3;
const MIN_NEGATIVE_PROMPT_CHARS: usize = 5;
const MAX_NEGATIVE_PROMPT_CHARS: usize = 1000;
const MAX_NOTES_CHARS: usize = 500;
const MAX_NUM_LOGOS: u32 = 5;
const MAX_NUM_VARIATIONS: u32 = 3;

/// Brand description submitted by the user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrandInput {
    /// Name of the business; trimmed, 1 to 100 characters.
    pub business_name: String,
    /// Industry sector (e.g., "technology", "food").
    pub industry: String,
    /// Visual style (e.g., "modern", "minimal", "vintage").
    pub style: String,
    /// Color preference (e.g., "warm", "cool", "neutral", "vibrant").
    pub color_scheme: String,
    /// Brand personality traits, 1 to 6 entries.
    pub personality_traits: Vec<String>,
    #[serde(default)]
    pub target_audience: Option<String>,
    /// Free-form generation prompt.
    #[serde(default)]
    pub prompt: Option<String>,
    /// Things the generated logos must avoid.
    #[serde(default)]
    pub negative_prompt: Option<String>,
    #[serde(default)]
    pub additional_notes: Option<String>,
    /// Number of logo concepts, 1 to 5.
    #[serde(default = "default_num_logos")]
    pub num_logos: u32,
    /// Variations per concept, 1 to 3.
    #[serde(default = "default_num_variations")]
    pub num_variations: u32,
}

fn default_num_logos() -> u32 {
    DEFAULT_NUM_LOGOS
}

fn default_num_variations() -> u32 {
    DEFAULT_NUM_VARIATIONS
}

impl BrandInput {
    /// Creates a brand input with no personality traits and default counts.
    pub fn new(
        business_name: impl Into<String>,
        industry: impl Into<String>,
        style: impl Into<String>,
        color_scheme: impl Into<String>,
    ) -> Self {
        Self {
            business_name: business_name.into(),
            industry: industry.into(),
            style: style.into(),
            color_scheme: color_scheme.into(),
            personality_traits: Vec::new(),
            target_audience: None,
            prompt: None,
            negative_prompt: None,
            additional_notes: None,
            num_logos: DEFAULT_NUM_LOGOS,
            num_variations: DEFAULT_NUM_VARIATIONS,
        }
    }

    pub fn with_trait(mut self, personality_trait: impl Into<String>) -> Self {
        self.personality_traits.push(personality_trait.into());
        self
    }

    pub fn with_traits<I, S>(mut self, traits: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.personality_traits
            .extend(traits.into_iter().map(Into::into));
        self
    }

    pub fn with_target_audience(mut self, audience: impl Into<String>) -> Self {
        self.target_audience = Some(audience.into());
        self
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    pub fn with_negative_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.negative_prompt = Some(prompt.into());
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.additional_notes = Some(notes.into());
        self
    }

    pub fn with_num_logos(mut self, count: u32) -> Self {
        self.num_logos = count;
        self
    }

    pub fn with_num_variations(mut self, count: u32) -> Self {
        self.num_variations = count;
        self
    }

    /// Trims surrounding whitespace from every text field.
    pub fn normalized(mut self) -> Self {
        fn trim(value: &mut String) {
            let trimmed = value.trim();
            if trimmed.len() != value.len() {
                *value = trimmed.to_string();
            }
        }
        fn trim_opt(value: &mut Option<String>) {
            if let Some(inner) = value.as_mut() {
                trim(inner);
            }
            if value.as_deref() == Some("") {
                *value = None;
            }
        }

        trim(&mut self.business_name);
        trim(&mut self.industry);
        trim(&mut self.style);
        trim(&mut self.color_scheme);
        self.personality_traits.iter_mut().for_each(trim);
        trim_opt(&mut self.target_audience);
        trim_opt(&mut self.prompt);
        trim_opt(&mut self.negative_prompt);
        trim_opt(&mut self.additional_notes);
        self
    }

    /// Checks field presence, lengths and counts.
    pub fn validate(&self) -> Result<(), ValidationError> {
        require_text("business_name", &self.business_name, MAX_BUSINESS_NAME_CHARS)?;
        require_text("industry", &self.industry, MAX_BUSINESS_NAME_CHARS)?;
        require_text("style", &self.style, MAX_BUSINESS_NAME_CHARS)?;
        require_text("color_scheme", &self.color_scheme, MAX_BUSINESS_NAME_CHARS)?;

        let trait_count = self.personality_traits.len();
        if !(1..=MAX_PERSONALITY_TRAITS).contains(&trait_count) {
            return Err(ValidationError::OutOfRange {
                field: "personality_traits",
                min: 1,
                max: MAX_PERSONALITY_TRAITS,
                actual: trait_count,
            });
        }
        for personality_trait in &self.personality_traits {
            require_text("personality_traits", personality_trait, MAX_BUSINESS_NAME_CHARS)?;
        }

        optional_text("target_audience", &self.target_audience, 0, MAX_TARGET_AUDIENCE_CHARS)?;
        optional_text("prompt", &self.prompt, MIN_PROMPT_CHARS, MAX_PROMPT_CHARS)?;
        if let Some(prompt) = &self.prompt {
            if prompt.split_whitespace().count() < MIN_PROMPT_WORDS {
                return Err(ValidationError::TooFewWords {
                    field: "prompt",
                    min: MIN_PROMPT_WORDS,
                });
            }
        }
        optional_text(
            "negative_prompt",
            &self.negative_prompt,
            MIN_NEGATIVE_PROMPT_CHARS,
            MAX_NEGATIVE_PROMPT_CHARS,
        )?;
        optional_text("additional_notes", &self.additional_notes, 0, MAX_NOTES_CHARS)?;

        check_count("num_logos", self.num_logos, MAX_NUM_LOGOS)?;
        check_count("num_variations", self.num_variations, MAX_NUM_VARIATIONS)?;
        Ok(())
    }
}

fn require_text(field: &'static str, value: &str, max: usize) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::Empty { field });
    }
    if value.chars().count() > max {
        return Err(ValidationError::TooLong { field, max });
    }
    Ok(())
}

fn optional_text(
    field: &'static str,
    value: &Option<String>,
    min: usize,
    max: usize,
) -> Result<(), ValidationError> {
    let Some(text) = value else {
        return Ok(());
    };
    let chars = text.chars().count();
    if chars < min {
        return Err(ValidationError::TooShort { field, min });
    }
    if chars > max {
        return Err(ValidationError::TooLong { field, max });
    }
    Ok(())
}

fn check_count(field: &'static str, value: u32, max: u32) -> Result<(), ValidationError> {
    if value == 0 || value > max {
        return Err(ValidationError::OutOfRange {
            field,
            min: 1,
            max: max as usize,
            actual: value as usize,
        });
    }
    Ok(())
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Accepted, no stage has started yet.
    Queued,
    /// At least one stage attempt has started.
    Running,
    /// Every stage succeeded.
    Succeeded,
    /// All required stages succeeded, some optional stage failed or was skipped.
    PartialSuccess,
    /// A required stage failed or could not run.
    Failed,
    /// Cancelled by the caller.
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::PartialSuccess | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "QUEUED",
            JobStatus::Running => "RUNNING",
            JobStatus::Succeeded => "SUCCEEDED",
            JobStatus::PartialSuccess => "PARTIAL_SUCCESS",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QUEUED" => Ok(JobStatus::Queued),
            "RUNNING" => Ok(JobStatus::Running),
            "SUCCEEDED" => Ok(JobStatus::Succeeded),
            "PARTIAL_SUCCESS" => Ok(JobStatus::PartialSuccess),
            "FAILED" => Ok(JobStatus::Failed),
            "CANCELLED" => Ok(JobStatus::Cancelled),
            other => Err(format!("unknown job status '{}'", other)),
        }
    }
}

/// State of the latest attempt of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl StageStatus {
    /// Whether the stage will never run again for this job.
    pub fn is_resolved(self) -> bool {
        matches!(
            self,
            StageStatus::Succeeded | StageStatus::Failed | StageStatus::Skipped
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StageStatus::Pending => "PENDING",
            StageStatus::Running => "RUNNING",
            StageStatus::Succeeded => "SUCCEEDED",
            StageStatus::Failed => "FAILED",
            StageStatus::Skipped => "SKIPPED",
        }
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(StageStatus::Pending),
            "RUNNING" => Ok(StageStatus::Running),
            "SUCCEEDED" => Ok(StageStatus::Succeeded),
            "FAILED" => Ok(StageStatus::Failed),
            "SKIPPED" => Ok(StageStatus::Skipped),
            other => Err(format!("unknown stage status '{}'", other)),
        }
    }
}

/// Latest attempt state of one stage of one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage_kind: StageKind,
    /// Attempts started so far; 0 while the first attempt is still queued.
    pub attempt_count: u32,
    pub status: StageStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Classified error of the most recent failed attempt.
    pub error: Option<StageError>,
    pub output_artifacts: Vec<Artifact>,
}

impl StageRecord {
    /// A record for a stage that has been enqueued but not started.
    pub fn pending(stage_kind: StageKind) -> Self {
        Self {
            stage_kind,
            attempt_count: 0,
            status: StageStatus::Pending,
            started_at: None,
            finished_at: None,
            error: None,
            output_artifacts: Vec::new(),
        }
    }

    /// A record for a stage that will never run for this job.
    pub fn skipped(stage_kind: StageKind, now: DateTime<Utc>) -> Self {
        Self {
            status: StageStatus::Skipped,
            finished_at: Some(now),
            ..Self::pending(stage_kind)
        }
    }
}

/// Outcome summary attached to a job once it is terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultSummary {
    pub status: JobStatus,
    pub completed_stages: Vec<StageKind>,
    pub failed_stages: Vec<StageKind>,
    pub skipped_stages: Vec<StageKind>,
    /// Outputs of every succeeded stage, in pipeline order.
    pub artifacts: Vec<Artifact>,
    /// The error that failed the job, for `FAILED` jobs.
    pub error: Option<StageError>,
    pub processing_time_ms: i64,
}

/// One brand generation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub input: BrandInput,
    pub status: JobStatus,
    /// Stage currently queued or running; `None` once terminal.
    pub current_stage: Option<StageKind>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub terminal_at: Option<DateTime<Utc>>,
    /// One record per stage reached so far, in pipeline order.
    pub stage_history: Vec<StageRecord>,
    pub result_summary: Option<ResultSummary>,
}

impl Job {
    /// Creates a queued job whose first stage is pending.
    pub fn new(input: BrandInput) -> Self {
        let now = Utc::now();
        let first = StageKind::first();
        Self {
            id: Uuid::new_v4(),
            input,
            status: JobStatus::Queued,
            current_stage: Some(first),
            created_at: now,
            updated_at: now,
            terminal_at: None,
            stage_history: vec![StageRecord::pending(first)],
            result_summary: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn record(&self, stage: StageKind) -> Option<&StageRecord> {
        self.stage_history.iter().find(|r| r.stage_kind == stage)
    }

    pub fn record_mut(&mut self, stage: StageKind) -> Option<&mut StageRecord> {
        self.stage_history.iter_mut().find(|r| r.stage_kind == stage)
    }

    pub fn stage_status(&self, stage: StageKind) -> Option<StageStatus> {
        self.record(stage).map(|r| r.status)
    }

    pub fn stages_with_status(&self, status: StageStatus) -> Vec<StageKind> {
        self.stage_history
            .iter()
            .filter(|r| r.status == status)
            .map(|r| r.stage_kind)
            .collect()
    }

    /// Artifacts produced by the given stages, skipping stages that did not succeed.
    pub fn artifacts_from(&self, stages: impl IntoIterator<Item = StageKind>) -> Vec<Artifact> {
        stages
            .into_iter()
            .filter_map(|stage| self.record(stage))
            .filter(|r| r.status == StageStatus::Succeeded)
            .flat_map(|r| r.output_artifacts.iter().cloned())
            .collect()
    }

    /// Every artifact attributed to this job.
    pub fn all_artifacts(&self) -> Vec<Artifact> {
        self.artifacts_from(self.stage_history.iter().map(|r| r.stage_kind))
    }

    /// Fraction of the pipeline that has been resolved, in `[0, 1]`.
    pub fn progress(&self) -> f64 {
        if matches!(self.status, JobStatus::Succeeded | JobStatus::PartialSuccess) {
            return 1.0;
        }
        let resolved = self
            .stage_history
            .iter()
            .filter(|r| r.status.is_resolved())
            .count();
        resolved as f64 / StageKind::ALL.len() as f64
    }

    /// Builds the read-only snapshot handed to status readers.
    pub fn view(&self) -> JobView {
        let completed_stages = self
            .stage_history
            .iter()
            .filter(|r| r.status == StageStatus::Succeeded)
            .map(|r| CompletedStage {
                stage: r.stage_kind,
                attempts: r.attempt_count,
                artifacts: r.output_artifacts.clone(),
            })
            .collect();

        let stages = self
            .stage_history
            .iter()
            .map(|r| StageSnapshot {
                stage: r.stage_kind,
                status: r.status,
                attempt_count: r.attempt_count,
                error: r.error.clone(),
            })
            .collect();

        let current_step = match (self.status, self.current_stage) {
            (JobStatus::Queued, _) => "Queued".to_string(),
            (_, Some(stage)) => stage.label().to_string(),
            (JobStatus::Succeeded, None) => "Completed".to_string(),
            (JobStatus::PartialSuccess, None) => "Completed with warnings".to_string(),
            (JobStatus::Failed, None) => "Failed".to_string(),
            (JobStatus::Cancelled, None) => "Cancelled".to_string(),
            (JobStatus::Running, None) => "Running".to_string(),
        };

        let error_message = self
            .result_summary
            .as_ref()
            .and_then(|s| s.error.as_ref())
            .map(ToString::to_string);

        JobView {
            job_id: self.id,
            business_name: self.input.business_name.clone(),
            status: self.status,
            current_stage: self.current_stage,
            current_step,
            progress: self.progress(),
            completed_stages,
            stages,
            error_message,
            created_at: self.created_at,
            updated_at: self.updated_at,
            terminal_at: self.terminal_at,
            processing_time_ms: self.result_summary.as_ref().map(|s| s.processing_time_ms),
        }
    }
}

/// A succeeded stage and its outputs, as seen by status readers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedStage {
    pub stage: StageKind,
    pub attempts: u32,
    pub artifacts: Vec<Artifact>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSnapshot {
    pub stage: StageKind,
    pub status: StageStatus,
    pub attempt_count: u32,
    pub error: Option<StageError>,
}

/// Consistent point-in-time snapshot of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobView {
    pub job_id: Uuid,
    pub business_name: String,
    pub status: JobStatus,
    pub current_stage: Option<StageKind>,
    pub current_step: String,
    pub progress: f64,
    pub completed_stages: Vec<CompletedStage>,
    pub stages: Vec<StageSnapshot>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub terminal_at: Option<DateTime<Utc>>,
    pub processing_time_ms: Option<i64>,
}

/// A stage of a job waiting for a worker of its resource class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkItem {
    pub job_id: Uuid,
    pub stage: StageKind,
}

impl WorkItem {
    pub fn new(job_id: Uuid, stage: StageKind) -> Self {
        Self { job_id, stage }
    }

    pub fn resource_class(&self) -> ResourceClass {
        self.stage.resource_class()
    }
}

impl fmt::Display for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.job_id, self.stage)
    }
}
