//! Job model, work queue and worker pool.
//!
//! - **Job**: the brand request, its stage records and the views handed to readers
//! - **JobQueue**: in-process FIFO lanes, one per resource class
//! - **WorkerPool**: workers that hold an execution slot while a stage runs
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────┐
//!                      │ Orchestrator │
//!                      └──────┬───────┘
//!                             │ enqueue (after commit)
//!              ┌──────────────┴──────────────┐
//!              ▼                             ▼
//!     ┌─────────────────┐           ┌─────────────────┐
//!     │ accelerator lane│           │    cpu lane     │
//!     └────────┬────────┘           └────────┬────────┘
//!              │                             │
//!         ┌────▼────┐                   ┌────▼────┐
//!         │ slots: 1│                   │ slots: 4│
//!         └────┬────┘                   └────┬────┘
//!              ▼                             ▼
//!          executors  ── claim / report ──▶ Orchestrator
//! ```
//!
//! # Reliability Features
//!
//! - **Durable first**: items are enqueued only after the transition is stored
//! - **Idempotent items**: stale or duplicate items are dropped at claim time
//! - **Crash recovery**: `Orchestrator::recover` rebuilds the lanes from the database
//! - **Graceful shutdown**: workers finish their current attempt before stopping

pub mod job;
pub mod queue;
pub mod worker_pool;

// Re-export main types for convenience
pub use job::{BrandInput, Job, JobStatus, JobView, StageRecord, StageStatus, WorkItem};
pub use queue::{JobQueue, QueueError, QueueStats};
pub use worker_pool::{
    PoolError, PoolStats, ResourcePool, SlotGuard, SlotStats, WorkerPool, WorkerPoolConfig,
};
