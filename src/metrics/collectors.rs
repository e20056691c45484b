//! Recording helpers for orchestration metrics.
//!
//! `MetricsCollector` wraps the raw Prometheus metrics with consistent
//! labels. Every method is a no-op until `init_metrics()` has run.

use std::time::Duration;

use super::prometheus::{
    JOBS_TOTAL, QUEUE_DEPTH, SLOTS_IN_USE, STAGE_ATTEMPTS_TOTAL, STAGE_DURATION,
};
use crate::pipeline::stage::{ResourceClass, StageKind};
use crate::scheduler::job::JobStatus;

#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record a job reaching a terminal state.
    pub fn record_job_terminal(&self, status: JobStatus) {
        if let Some(jobs_total) = JOBS_TOTAL.get() {
            jobs_total.with_label_values(&[status.as_str()]).inc();
        }

        tracing::trace!(status = %status, "Recorded job metric");
    }

    /// Record one stage attempt.
    ///
    /// # Arguments
    ///
    /// * `stage` - Stage that ran
    /// * `outcome` - "succeeded" or the error class of the failure
    /// * `duration` - Wall time of the executor call
    pub fn record_stage_attempt(&self, stage: StageKind, outcome: &str, duration: Duration) {
        if let Some(attempts) = STAGE_ATTEMPTS_TOTAL.get() {
            attempts
                .with_label_values(&[stage.as_str(), outcome])
                .inc();
        }

        if let Some(stage_duration) = STAGE_DURATION.get() {
            stage_duration
                .with_label_values(&[stage.as_str()])
                .observe(duration.as_secs_f64());
        }

        tracing::trace!(
            stage = %stage,
            outcome = outcome,
            duration_ms = duration.as_millis() as u64,
            "Recorded stage attempt metric"
        );
    }

    pub fn set_queue_depth(&self, class: ResourceClass, depth: usize) {
        if let Some(queue_depth) = QUEUE_DEPTH.get() {
            queue_depth
                .with_label_values(&[class.as_str()])
                .set(depth as f64);
        }
    }

    pub fn set_slots_in_use(&self, class: ResourceClass, in_use: usize) {
        if let Some(slots) = SLOTS_IN_USE.get() {
            slots.with_label_values(&[class.as_str()]).set(in_use as f64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{export_metrics, init_metrics};

    #[test]
    fn test_recording_shows_up_in_export() {
        let _ = init_metrics();
        let collector = MetricsCollector::new();

        collector.record_job_terminal(JobStatus::PartialSuccess);
        collector.record_stage_attempt(StageKind::Upscale, "transient", Duration::from_millis(20));
        collector.set_queue_depth(ResourceClass::Cpu, 3);
        collector.set_slots_in_use(ResourceClass::Accelerator, 1);

        let text = export_metrics();
        assert!(text.contains("brand_forge_jobs_total"));
        assert!(text.contains("PARTIAL_SUCCESS"));
        assert!(text.contains("brand_forge_stage_attempts_total"));
        assert!(text.contains("brand_forge_slots_in_use"));
    }
}
