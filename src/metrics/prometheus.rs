//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by brand-forge and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::sync::{Mutex, OnceLock, PoisonError};

/// Global Prometheus registry for all brand-forge metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Jobs that reached a terminal state, labeled by status.
pub static JOBS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Stage attempts, labeled by stage and outcome (succeeded, transient, permanent, timeout).
pub static STAGE_ATTEMPTS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Stage attempt duration in seconds, labeled by stage.
pub static STAGE_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Work items waiting, labeled by resource class.
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Execution slots in use, labeled by resource class.
pub static SLOTS_IN_USE: OnceLock<GaugeVec> = OnceLock::new();

/// Serializes `init_metrics` so every static belongs to the same registry.
static INIT_LOCK: Mutex<()> = Mutex::new(());

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Later calls leave the first registry in place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let _guard = INIT_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
    if REGISTRY.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    let jobs_total = CounterVec::new(
        Opts::new("brand_forge_jobs_total", "Jobs that reached a terminal state"),
        &["status"],
    )?;

    let stage_attempts_total = CounterVec::new(
        Opts::new("brand_forge_stage_attempts_total", "Stage attempts by outcome"),
        &["stage", "outcome"],
    )?;

    let stage_duration = HistogramVec::new(
        HistogramOpts::new(
            "brand_forge_stage_duration_seconds",
            "Stage attempt duration in seconds",
        )
        .buckets(vec![0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0]),
        &["stage"],
    )?;

    let queue_depth = GaugeVec::new(
        Opts::new("brand_forge_queue_depth", "Work items waiting per resource class"),
        &["resource_class"],
    )?;

    let slots_in_use = GaugeVec::new(
        Opts::new("brand_forge_slots_in_use", "Execution slots in use per resource class"),
        &["resource_class"],
    )?;

    registry.register(Box::new(jobs_total.clone()))?;
    registry.register(Box::new(stage_attempts_total.clone()))?;
    registry.register(Box::new(stage_duration.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(slots_in_use.clone()))?;

    let _ = REGISTRY.set(registry);
    let _ = JOBS_TOTAL.set(jobs_total);
    let _ = STAGE_ATTEMPTS_TOTAL.set(stage_attempts_total);
    let _ = STAGE_DURATION.set(stage_duration);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = SLOTS_IN_USE.set(slots_in_use);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns an explanatory comment line if the registry has not been
/// initialized or encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics() {
        let result = init_metrics();
        assert!(result.is_ok() || REGISTRY.get().is_some());
    }

    #[test]
    fn test_metrics_after_init() {
        let _ = init_metrics();

        let metrics = export_metrics();
        assert!(!metrics.is_empty());
        assert!(!metrics.starts_with("# Error"));
    }
}
