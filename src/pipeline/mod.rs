//! The brand pipeline and its orchestration.
//!
//! # Architecture
//!
//! - **Stage**: the fixed stage graph (order, resource class, required flag,
//!   hard and preferred dependencies)
//! - **StateMachine**: pure transitions of a job record
//! - **RetryPolicy**: attempt ceilings and backoff
//! - **Orchestrator**: owns job state, persists every transition, feeds the
//!   work queue and answers status queries
//! - **Config**: configuration for all of the above
//!
//! # Job Flow
//!
//! 1. **Submit**: input is validated, the job is stored `QUEUED` and its first
//!    stage is enqueued
//! 2. **Claim**: a worker with a free slot starts the next attempt
//! 3. **Report**: the attempt's outcome advances the job, schedules a retry,
//!    or finishes it
//! 4. **Terminal**: `SUCCEEDED`, `PARTIAL_SUCCESS`, `FAILED` or `CANCELLED`
//!
//! # Example
//!
//! ```rust,ignore
//! use brand_forge::pipeline::{Orchestrator, OrchestratorConfig};
//! use brand_forge::scheduler::job::BrandInput;
//! use std::time::Duration;
//!
//! let config = OrchestratorConfig::from_env()?.with_cpu_slots(8);
//! let orchestrator = Orchestrator::connect(config).await?;
//! orchestrator.recover().await?;
//!
//! let input = BrandInput::new("Acme Coffee", "food", "modern", "warm").with_trait("friendly");
//! let job_id = orchestrator.submit(input).await?;
//! let view = orchestrator.get_status(job_id)?;
//! println!("{} is {} ({:.0}%)", view.business_name, view.status, view.progress * 100.0);
//! ```

pub mod config;
pub mod orchestrator;
pub mod retry;
pub mod stage;
pub mod state_machine;

// Re-export main types for convenience
pub use config::{ConfigError, OrchestratorConfig};
pub use orchestrator::{JobEvent, Orchestrator, OrchestratorStats, RecoveryReport};
pub use retry::RetryPolicy;
pub use stage::{pipeline, ResourceClass, StageDescriptor, StageKind, PIPELINE};
pub use state_machine::{StageOutcome, StateMachine, Transition, TransitionError};
