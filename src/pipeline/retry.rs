//! Retry policy: per-stage attempt ceilings and capped exponential backoff.

use std::collections::HashMap;
use std::time::Duration;

use crate::error::StageError;
use crate::pipeline::stage::StageKind;

/// Default number of retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 2;
/// Default delay before the first retry.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(500);
/// Default upper bound on any retry delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Decides whether a failed stage attempt is retried and after how long.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt, for stages without an override.
    pub max_retries: u32,
    /// Per-stage retry ceilings.
    pub stage_retries: HashMap<StageKind, u32>,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            stage_retries: HashMap::new(),
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_stage_retries(mut self, stage: StageKind, retries: u32) -> Self {
        self.stage_retries.insert(stage, retries);
        self
    }

    pub fn with_delays(mut self, base: Duration, max: Duration) -> Self {
        self.base_delay = base;
        self.max_delay = max;
        self
    }

    /// Retry ceiling for a stage.
    pub fn retries_for(&self, stage: StageKind) -> u32 {
        self.stage_retries
            .get(&stage)
            .copied()
            .unwrap_or(self.max_retries)
    }

    /// Total attempts a stage may make: the first one plus its retries.
    pub fn max_attempts(&self, stage: StageKind) -> u32 {
        self.retries_for(stage).saturating_add(1)
    }

    /// Whether a stage that has made `attempts_made` attempts and just failed
    /// with `error` gets another one.
    pub fn should_retry(&self, stage: StageKind, attempts_made: u32, error: &StageError) -> bool {
        error.is_retryable() && attempts_made < self.max_attempts(stage)
    }

    /// Delay before the retry that follows attempt number `attempt` (1-based):
    /// `base * 2^(attempt-1)`, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}
