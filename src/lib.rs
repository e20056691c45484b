//! brand_forge: staged brand asset generation pipeline.
//!
//! This library drives brand generation jobs through a fixed pipeline of
//! stages, limits concurrent work per compute resource, retries transient
//! failures and keeps every job's state durable across restarts.

pub mod cli;
pub mod error;
pub mod executor;
pub mod metrics;
pub mod pipeline;
pub mod scheduler;
pub mod storage;

// Re-export commonly used types
pub use error::{ErrorClass, OrchestratorError, StageError, ValidationError};
pub use executor::{ExecutorError, ExecutorRegistry, StageExecutor};
pub use pipeline::{Orchestrator, OrchestratorConfig, StageKind};
pub use scheduler::{BrandInput, JobStatus, JobView, WorkerPool};
