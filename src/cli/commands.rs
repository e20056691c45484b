//! CLI command definitions for brand-forge.
//!
//! `run` and `resume` drive jobs through the pipeline with the simulated
//! executors; `status` and `list` read persisted jobs.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::Parser;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::executor::simulated::SimulatedExecutor;
use crate::executor::ExecutorRegistry;
use crate::metrics::{export_metrics, init_metrics};
use crate::pipeline::{Orchestrator, OrchestratorConfig, StageKind};
use crate::scheduler::job::{BrandInput, Job, JobStatus, JobView};
use crate::scheduler::WorkerPool;
use crate::storage::{Database, JobFilter};

/// Default simulated latency per stage.
const DEFAULT_LATENCY_MS: u64 = 50;

/// Brand asset generation pipeline.
#[derive(Parser)]
#[command(name = "brand-forge")]
#[command(about = "Run brand generation jobs through the staged asset pipeline")]
#[command(version)]
#[command(
    long_about = "brand-forge drives brand generation jobs through logo synthesis, refinement, upscaling, palette extraction, resizing, export and brand kit compilation.\n\nExample usage:\n  brand-forge run \"Acme Coffee\" food modern warm --trait friendly --trait bold"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// SQLite database URL.
    #[arg(long, env = "DATABASE_URL", global = true)]
    pub database_url: Option<String>,

    /// Directory for stored artifacts.
    #[arg(long, global = true)]
    pub artifact_path: Option<PathBuf>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Submit brand jobs and run them to completion.
    Run(RunArgs),

    /// Recover unfinished jobs from the database and run them to completion.
    Resume(ResumeArgs),

    /// Print the persisted state of a job.
    Status(StatusArgs),

    /// List persisted jobs.
    #[command(alias = "ls")]
    List(ListArgs),
}

/// Arguments for the `run` command.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Business name.
    pub business_name: String,

    /// Industry of the business.
    pub industry: String,

    /// Visual style (modern, classic, playful, ...).
    pub style: String,

    /// Color scheme (warm, cool, neutral, vibrant, ...).
    pub color_scheme: String,

    /// Brand personality trait; repeat for several.
    #[arg(short = 't', long = "trait", default_value = "professional")]
    pub traits: Vec<String>,

    /// Target audience.
    #[arg(long)]
    pub audience: Option<String>,

    /// Custom generation prompt.
    #[arg(long)]
    pub prompt: Option<String>,

    /// Logo concepts to generate.
    #[arg(long, default_value = "3")]
    pub logos: u32,

    /// Variations per logo concept.
    #[arg(long, default_value = "1")]
    pub variations: u32,

    /// Number of identical jobs to submit.
    #[arg(short = 'n', long, default_value = "1")]
    pub jobs: usize,

    /// Simulated executor latency per stage in milliseconds.
    #[arg(long, default_value_t = DEFAULT_LATENCY_MS)]
    pub latency_ms: u64,

    /// Scripted failure as STAGE:N (first N attempts fail transiently) or
    /// STAGE:permanent. Repeatable.
    #[arg(long = "fail")]
    pub failures: Vec<String>,

    /// Concurrent accelerator executions.
    #[arg(long)]
    pub accelerator_slots: Option<usize>,

    /// Concurrent CPU executions.
    #[arg(long)]
    pub cpu_slots: Option<usize>,

    /// Give up waiting for a job after this many seconds.
    #[arg(long, default_value = "600")]
    pub wait_secs: u64,

    /// Print Prometheus metrics after the run.
    #[arg(long)]
    pub metrics: bool,
}

/// Arguments for the `resume` command.
#[derive(Parser, Debug)]
pub struct ResumeArgs {
    /// Simulated executor latency per stage in milliseconds.
    #[arg(long, default_value_t = DEFAULT_LATENCY_MS)]
    pub latency_ms: u64,

    /// Give up waiting for a job after this many seconds.
    #[arg(long, default_value = "600")]
    pub wait_secs: u64,
}

/// Arguments for the `status` command.
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Job identifier.
    pub job_id: Uuid,
}

/// Arguments for the `list` command.
#[derive(Parser, Debug)]
pub struct ListArgs {
    /// Only jobs that are queued or running.
    #[arg(long)]
    pub unfinished: bool,

    /// Maximum number of jobs to list.
    #[arg(long, default_value = "50")]
    pub limit: i64,
}

/// A scripted executor failure parsed from `--fail`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptedFailure {
    Transient(StageKind, u32),
    Permanent(StageKind),
}

impl FromStr for ScriptedFailure {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (stage, mode) = s
            .split_once(':')
            .ok_or_else(|| anyhow::anyhow!("expected STAGE:N or STAGE:permanent, got '{}'", s))?;
        let stage = StageKind::from_str(stage)?;
        if mode.eq_ignore_ascii_case("permanent") {
            return Ok(Self::Permanent(stage));
        }
        let attempts = mode
            .parse::<u32>()
            .map_err(|e| anyhow::anyhow!("invalid failure count '{}': {}", mode, e))?;
        Ok(Self::Transient(stage, attempts))
    }
}

/// One row of `list` output.
#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub job_id: Uuid,
    pub business_name: String,
    pub status: JobStatus,
    pub current_step: String,
    pub progress: f64,
    pub created_at: DateTime<Utc>,
}

impl From<&Job> for JobSummary {
    fn from(job: &Job) -> Self {
        let view = job.view();
        Self {
            job_id: view.job_id,
            business_name: view.business_name,
            status: view.status,
            current_step: view.current_step,
            progress: view.progress,
            created_at: view.created_at,
        }
    }
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config = build_config(cli.database_url, cli.artifact_path)?;
    match cli.command {
        Commands::Run(args) => run_jobs_command(config, args).await,
        Commands::Resume(args) => run_resume_command(config, args).await,
        Commands::Status(args) => run_status_command(config, args).await,
        Commands::List(args) => run_list_command(config, args).await,
    }
}

fn build_config(
    database_url: Option<String>,
    artifact_path: Option<PathBuf>,
) -> anyhow::Result<OrchestratorConfig> {
    let mut config = OrchestratorConfig::from_env()?;
    if let Some(url) = database_url {
        config = config.with_database_url(url);
    }
    if let Some(path) = artifact_path {
        config = config.with_artifact_path(path);
    }
    Ok(config)
}

fn build_executor(latency_ms: u64, failures: &[ScriptedFailure]) -> SimulatedExecutor {
    failures.iter().fold(
        SimulatedExecutor::new()
            .with_latency(Duration::from_millis(latency_ms))
            .with_jitter(Duration::from_millis(latency_ms / 2)),
        |executor, failure| match *failure {
            ScriptedFailure::Transient(stage, attempts) => {
                executor.with_transient_failures(stage, attempts)
            }
            ScriptedFailure::Permanent(stage) => executor.with_permanent_failure(stage),
        },
    )
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let json_output = serde_json::to_string_pretty(value)
        .map_err(|e| anyhow::anyhow!("Failed to serialize JSON output: {}", e))?;
    println!("{}", json_output);
    Ok(())
}

async fn run_jobs_command(config: OrchestratorConfig, args: RunArgs) -> anyhow::Result<()> {
    if args.jobs == 0 {
        anyhow::bail!("--jobs must be at least 1");
    }
    if args.metrics {
        init_metrics()?;
    }

    let failures = args
        .failures
        .iter()
        .map(|s| s.parse::<ScriptedFailure>())
        .collect::<anyhow::Result<Vec<_>>>()?;

    let mut config = config;
    if let Some(slots) = args.accelerator_slots {
        config = config.with_accelerator_slots(slots);
    }
    if let Some(slots) = args.cpu_slots {
        config = config.with_cpu_slots(slots);
    }

    let mut input = BrandInput::new(
        args.business_name,
        args.industry,
        args.style,
        args.color_scheme,
    )
    .with_traits(args.traits)
    .with_num_logos(args.logos)
    .with_num_variations(args.variations);
    if let Some(audience) = args.audience {
        input = input.with_target_audience(audience);
    }
    if let Some(prompt) = args.prompt {
        input = input.with_prompt(prompt);
    }

    let orchestrator = Arc::new(Orchestrator::connect(config).await?);
    let executor = Arc::new(build_executor(args.latency_ms, &failures));
    let mut pool = WorkerPool::new(Arc::clone(&orchestrator), ExecutorRegistry::uniform(executor))?;
    pool.start()?;

    let mut job_ids = Vec::with_capacity(args.jobs);
    for _ in 0..args.jobs {
        job_ids.push(orchestrator.submit(input.clone()).await?);
    }
    info!(jobs = job_ids.len(), "Submitted brand jobs");

    let views = wait_all(&orchestrator, &job_ids, Duration::from_secs(args.wait_secs)).await;
    let stats = pool.stats();
    pool.shutdown().await?;

    info!(
        attempts_succeeded = stats.attempts_succeeded,
        attempts_failed = stats.attempts_failed,
        attempts_timed_out = stats.attempts_timed_out,
        accelerator_peak = stats.accelerator.peak_in_use,
        cpu_peak = stats.cpu.peak_in_use,
        "Run finished"
    );

    print_json(&views)?;
    if args.metrics {
        print!("{}", export_metrics());
    }
    Ok(())
}

async fn run_resume_command(config: OrchestratorConfig, args: ResumeArgs) -> anyhow::Result<()> {
    let orchestrator = Arc::new(Orchestrator::connect(config).await?);
    let report = orchestrator.recover().await?;
    info!(
        loaded = report.loaded,
        requeued = report.requeued,
        interrupted = report.interrupted,
        "Recovered persisted jobs"
    );

    let unfinished: Vec<Uuid> = orchestrator
        .list_jobs()
        .into_iter()
        .filter(|view| !view.status.is_terminal())
        .map(|view| view.job_id)
        .collect();
    if unfinished.is_empty() {
        info!("No unfinished jobs to resume");
        return print_json(&Vec::<JobView>::new());
    }

    let executor = Arc::new(build_executor(args.latency_ms, &[]));
    let mut pool = WorkerPool::new(Arc::clone(&orchestrator), ExecutorRegistry::uniform(executor))?;
    pool.start()?;
    let views = wait_all(&orchestrator, &unfinished, Duration::from_secs(args.wait_secs)).await;
    pool.shutdown().await?;

    print_json(&views)
}

async fn run_status_command(config: OrchestratorConfig, args: StatusArgs) -> anyhow::Result<()> {
    let database = open_database(&config).await?;
    let job = database
        .load_job(args.job_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("Job {} not found", args.job_id))?;
    print_json(&job.view())
}

async fn run_list_command(config: OrchestratorConfig, args: ListArgs) -> anyhow::Result<()> {
    let database = open_database(&config).await?;
    let mut filter = JobFilter::new().with_limit(args.limit);
    if args.unfinished {
        filter = filter.unfinished();
    }
    let jobs = database.list_jobs(&filter).await?;
    let summaries: Vec<JobSummary> = jobs.iter().map(JobSummary::from).collect();
    print_json(&summaries)
}

async fn open_database(config: &OrchestratorConfig) -> anyhow::Result<Database> {
    let database = Database::connect(&config.database_url).await?;
    database.run_migrations().await?;
    Ok(database)
}

/// Waits for every job in turn and returns the views that reached a terminal state.
async fn wait_all(orchestrator: &Orchestrator, job_ids: &[Uuid], timeout: Duration) -> Vec<JobView> {
    let mut views = Vec::with_capacity(job_ids.len());
    for job_id in job_ids {
        match orchestrator.wait_for_terminal(*job_id, timeout).await {
            Ok(view) => views.push(view),
            Err(e) => warn!(job_id = %job_id, error = %e, "Job did not finish"),
        }
    }
    views
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parses() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_command_defaults() {
        let args = vec!["brand-forge", "run", "Acme Coffee", "food", "modern", "warm"];
        let cli = Cli::try_parse_from(args).expect("should parse");

        assert_eq!(cli.log_level, "info");
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.business_name, "Acme Coffee");
                assert_eq!(args.traits, vec!["professional".to_string()]);
                assert_eq!(args.logos, 3);
                assert_eq!(args.variations, 1);
                assert_eq!(args.jobs, 1);
                assert_eq!(args.latency_ms, DEFAULT_LATENCY_MS);
                assert!(args.failures.is_empty());
                assert!(!args.metrics);
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_run_command_with_options() {
        let args = vec![
            "brand-forge",
            "run",
            "Acme Coffee",
            "food",
            "modern",
            "warm",
            "-t",
            "friendly",
            "--trait",
            "bold",
            "-n",
            "4",
            "--fail",
            "refine:2",
            "--fail",
            "upscale:permanent",
            "--accelerator-slots",
            "2",
            "--log-level",
            "debug",
        ];
        let cli = Cli::try_parse_from(args).expect("should parse");

        assert_eq!(cli.log_level, "debug");
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.traits, vec!["friendly".to_string(), "bold".to_string()]);
                assert_eq!(args.jobs, 4);
                assert_eq!(args.failures.len(), 2);
                assert_eq!(args.accelerator_slots, Some(2));
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_status_requires_uuid() {
        let id = Uuid::new_v4();
        let id_arg = id.to_string();
        let cli = Cli::try_parse_from(["brand-forge", "status", id_arg.as_str()])
            .expect("should parse");
        match cli.command {
            Commands::Status(args) => assert_eq!(args.job_id, id),
            _ => panic!("Expected Status command"),
        }

        assert!(Cli::try_parse_from(["brand-forge", "status", "not-a-uuid"]).is_err());
    }

    #[test]
    fn test_list_alias() {
        let cli = Cli::try_parse_from(["brand-forge", "ls", "--unfinished"]).expect("should parse");
        match cli.command {
            Commands::List(args) => {
                assert!(args.unfinished);
                assert_eq!(args.limit, 50);
            }
            _ => panic!("Expected List command"),
        }
    }

    #[test]
    fn test_scripted_failure_parsing() {
        assert_eq!(
            "refine:2".parse::<ScriptedFailure>().expect("parse"),
            ScriptedFailure::Transient(StageKind::Refine, 2)
        );
        assert_eq!(
            "extract-palette:permanent".parse::<ScriptedFailure>().expect("parse"),
            ScriptedFailure::Permanent(StageKind::ExtractPalette)
        );
        assert!("refine".parse::<ScriptedFailure>().is_err());
        assert!("nope:1".parse::<ScriptedFailure>().is_err());
        assert!("refine:many".parse::<ScriptedFailure>().is_err());
    }
}
