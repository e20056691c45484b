//! Metrics module for Prometheus-based monitoring.
//!
//! # Example
//!
//! ```ignore
//! use brand_forge::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//!
//! let collector = MetricsCollector::new();
//! collector.record_job_terminal(JobStatus::Succeeded);
//!
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    JOBS_TOTAL, QUEUE_DEPTH, REGISTRY, SLOTS_IN_USE, STAGE_ATTEMPTS_TOTAL, STAGE_DURATION,
};
