//! Orchestrator configuration.
//!
//! This module provides configuration options for the brand pipeline,
//! including resource capacities, retry policy, stage deadlines, worker
//! polling and storage locations.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::pipeline::retry::RetryPolicy;
use crate::pipeline::stage::{ResourceClass, StageKind};

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration for the orchestrator and its worker pool.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    // Capacity settings
    /// Concurrent executions allowed on the accelerator class.
    pub accelerator_slots: usize,
    /// Concurrent executions allowed on the CPU class.
    pub cpu_slots: usize,

    // Retry settings
    pub retry: RetryPolicy,

    // Execution settings
    /// Deadline for one stage attempt.
    pub stage_timeout: Duration,
    /// Per-stage deadline overrides.
    pub stage_timeouts: HashMap<StageKind, Duration>,
    /// How long an idle worker waits on its queue before checking for shutdown.
    pub poll_interval: Duration,
    /// How long shutdown waits for in-flight attempts.
    pub shutdown_timeout: Duration,
    /// Capacity of the job event broadcast channel.
    pub event_buffer: usize,

    // Storage settings
    /// SQLite connection URL.
    pub database_url: String,
    /// Directory for stored artifacts.
    pub artifact_path: PathBuf,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            accelerator_slots: 1,
            cpu_slots: 4,

            retry: RetryPolicy::default(),

            stage_timeout: Duration::from_secs(300),
            stage_timeouts: HashMap::new(),
            poll_interval: Duration::from_millis(250),
            shutdown_timeout: Duration::from_secs(60),
            event_buffer: 1024,

            database_url: "sqlite://brand_forge.db".to_string(),
            artifact_path: PathBuf::from("./artifacts"),
        }
    }
}

impl OrchestratorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `BRAND_FORGE_ACCELERATOR_SLOTS`: Accelerator capacity (default: 1)
    /// - `BRAND_FORGE_CPU_SLOTS`: CPU capacity (default: 4)
    /// - `BRAND_FORGE_MAX_RETRIES`: Retries after the first attempt (default: 2)
    /// - `BRAND_FORGE_RETRY_BASE_MS`: First retry delay (default: 500)
    /// - `BRAND_FORGE_RETRY_MAX_MS`: Retry delay cap (default: 30000)
    /// - `BRAND_FORGE_STAGE_TIMEOUT_SECS`: Stage attempt deadline (default: 300)
    /// - `BRAND_FORGE_POLL_INTERVAL_MS`: Worker poll interval (default: 250)
    /// - `BRAND_FORGE_SHUTDOWN_TIMEOUT_SECS`: Shutdown grace period (default: 60)
    /// - `DATABASE_URL`: SQLite connection URL (default: sqlite://brand_forge.db)
    /// - `BRAND_FORGE_ARTIFACT_PATH`: Artifact directory (default: ./artifacts)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        // Capacity settings
        if let Some(val) = lookup("BRAND_FORGE_ACCELERATOR_SLOTS") {
            config.accelerator_slots = parse_env_value(&val, "BRAND_FORGE_ACCELERATOR_SLOTS")?;
        }

        if let Some(val) = lookup("BRAND_FORGE_CPU_SLOTS") {
            config.cpu_slots = parse_env_value(&val, "BRAND_FORGE_CPU_SLOTS")?;
        }

        // Retry settings
        if let Some(val) = lookup("BRAND_FORGE_MAX_RETRIES") {
            config.retry.max_retries = parse_env_value(&val, "BRAND_FORGE_MAX_RETRIES")?;
        }

        if let Some(val) = lookup("BRAND_FORGE_RETRY_BASE_MS") {
            let ms: u64 = parse_env_value(&val, "BRAND_FORGE_RETRY_BASE_MS")?;
            config.retry.base_delay = Duration::from_millis(ms);
        }

        if let Some(val) = lookup("BRAND_FORGE_RETRY_MAX_MS") {
            let ms: u64 = parse_env_value(&val, "BRAND_FORGE_RETRY_MAX_MS")?;
            config.retry.max_delay = Duration::from_millis(ms);
        }

        // Execution settings
        if let Some(val) = lookup("BRAND_FORGE_STAGE_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "BRAND_FORGE_STAGE_TIMEOUT_SECS")?;
            config.stage_timeout = Duration::from_secs(secs);
        }

        if let Some(val) = lookup("BRAND_FORGE_POLL_INTERVAL_MS") {
            let ms: u64 = parse_env_value(&val, "BRAND_FORGE_POLL_INTERVAL_MS")?;
            config.poll_interval = Duration::from_millis(ms);
        }

        if let Some(val) = lookup("BRAND_FORGE_SHUTDOWN_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "BRAND_FORGE_SHUTDOWN_TIMEOUT_SECS")?;
            config.shutdown_timeout = Duration::from_secs(secs);
        }

        // Storage settings
        if let Some(val) = lookup("DATABASE_URL") {
            config.database_url = val;
        }

        if let Some(val) = lookup("BRAND_FORGE_ARTIFACT_PATH") {
            config.artifact_path = PathBuf::from(val);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.accelerator_slots == 0 {
            return Err(ConfigError::ValidationFailed(
                "accelerator_slots must be greater than 0".to_string(),
            ));
        }

        if self.cpu_slots == 0 {
            return Err(ConfigError::ValidationFailed(
                "cpu_slots must be greater than 0".to_string(),
            ));
        }

        if self.stage_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "stage_timeout must be greater than 0".to_string(),
            ));
        }

        if let Some((stage, _)) = self.stage_timeouts.iter().find(|(_, t)| t.is_zero()) {
            return Err(ConfigError::ValidationFailed(format!(
                "stage timeout for {} must be greater than 0",
                stage
            )));
        }

        if self.retry.base_delay > self.retry.max_delay {
            return Err(ConfigError::ValidationFailed(
                "retry base delay cannot exceed the maximum delay".to_string(),
            ));
        }

        if self.poll_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "poll_interval must be greater than 0".to_string(),
            ));
        }

        if self.event_buffer == 0 {
            return Err(ConfigError::ValidationFailed(
                "event_buffer must be greater than 0".to_string(),
            ));
        }

        if self.database_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "database_url cannot be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Capacity of a resource class.
    pub fn capacity(&self, class: ResourceClass) -> usize {
        match class {
            ResourceClass::Accelerator => self.accelerator_slots,
            ResourceClass::Cpu => self.cpu_slots,
        }
    }

    /// Deadline for one attempt of `stage`.
    pub fn timeout_for(&self, stage: StageKind) -> Duration {
        self.stage_timeouts
            .get(&stage)
            .copied()
            .unwrap_or(self.stage_timeout)
    }

    // Builder methods

    pub fn with_accelerator_slots(mut self, slots: usize) -> Self {
        self.accelerator_slots = slots;
        self
    }

    pub fn with_cpu_slots(mut self, slots: usize) -> Self {
        self.cpu_slots = slots;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.retry.max_retries = retries;
        self
    }

    pub fn with_stage_retries(mut self, stage: StageKind, retries: u32) -> Self {
        self.retry.stage_retries.insert(stage, retries);
        self
    }

    pub fn with_retry_delays(mut self, base: Duration, max: Duration) -> Self {
        self.retry.base_delay = base;
        self.retry.max_delay = max;
        self
    }

    pub fn with_stage_timeout(mut self, timeout: Duration) -> Self {
        self.stage_timeout = timeout;
        self
    }

    pub fn with_stage_timeout_for(mut self, stage: StageKind, timeout: Duration) -> Self {
        self.stage_timeouts.insert(stage, timeout);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_event_buffer(mut self, capacity: usize) -> Self {
        self.event_buffer = capacity;
        self
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = url.into();
        self
    }

    pub fn with_artifact_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.artifact_path = path.into();
        self
    }
}

/// Parse an environment variable value into the desired type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.accelerator_slots, 1);
        assert_eq!(config.cpu_slots, 4);
        assert_eq!(config.retry.max_retries, 2);
        assert_eq!(config.stage_timeout, Duration::from_secs(300));
        assert_eq!(config.database_url, "sqlite://brand_forge.db");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = OrchestratorConfig::from_lookup(lookup_from(&[
            ("BRAND_FORGE_ACCELERATOR_SLOTS", "2"),
            ("BRAND_FORGE_MAX_RETRIES", "5"),
            ("BRAND_FORGE_RETRY_BASE_MS", "10"),
            ("BRAND_FORGE_STAGE_TIMEOUT_SECS", "30"),
            ("DATABASE_URL", "sqlite::memory:"),
        ]))
        .expect("valid config");

        assert_eq!(config.accelerator_slots, 2);
        assert_eq!(config.cpu_slots, 4);
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.base_delay, Duration::from_millis(10));
        assert_eq!(config.stage_timeout, Duration::from_secs(30));
        assert_eq!(config.database_url, "sqlite::memory:");
    }

    #[test]
    fn test_from_lookup_invalid_value() {
        let err = OrchestratorConfig::from_lookup(lookup_from(&[("BRAND_FORGE_CPU_SLOTS", "many")]))
            .expect_err("should reject");
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "BRAND_FORGE_CPU_SLOTS"));
    }

    #[test]
    fn test_validation_rejects_zero_capacity() {
        let config = OrchestratorConfig::new().with_accelerator_slots(0);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationFailed(_))
        ));
        let config = OrchestratorConfig::new().with_cpu_slots(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_bad_delays_and_deadlines() {
        let config = OrchestratorConfig::new()
            .with_retry_delays(Duration::from_secs(10), Duration::from_secs(1));
        assert!(config.validate().is_err());

        let config = OrchestratorConfig::new().with_stage_timeout(Duration::ZERO);
        assert!(config.validate().is_err());

        let config =
            OrchestratorConfig::new().with_stage_timeout_for(StageKind::Upscale, Duration::ZERO);
        assert!(config.validate().is_err());

        let config = OrchestratorConfig::new().with_database_url("");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_per_stage_overrides() {
        let config = OrchestratorConfig::new()
            .with_stage_timeout(Duration::from_secs(60))
            .with_stage_timeout_for(StageKind::Synthesize, Duration::from_secs(600))
            .with_stage_retries(StageKind::Upscale, 0);

        assert_eq!(config.timeout_for(StageKind::Synthesize), Duration::from_secs(600));
        assert_eq!(config.timeout_for(StageKind::Resize), Duration::from_secs(60));
        assert_eq!(config.retry.max_attempts(StageKind::Upscale), 1);
        assert_eq!(config.capacity(ResourceClass::Accelerator), 1);
        assert_eq!(config.capacity(ResourceClass::Cpu), 4);
    }
}
