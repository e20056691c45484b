//! Stage executors.
//!
//! An executor performs the actual work of one pipeline stage: image
//! synthesis, refinement, palette extraction and so on. Executors are
//! external collaborators; the orchestrator only relies on the contract
//! below:
//!
//! - `execute` returns the stage's output payloads or a classified error
//! - executors never mutate previously stored artifacts
//! - calling `execute` twice for the same job and stage is safe
//!
//! Workers write the returned payloads to the artifact store; executors only
//! read from it.

pub mod simulated;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::error::StageError;
use crate::pipeline::stage::StageKind;
use crate::scheduler::job::BrandInput;
use crate::storage::{Artifact, ArtifactStore};

pub use simulated::SimulatedExecutor;

/// Errors an executor may report.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutorError {
    /// Infrastructure failure; the attempt may be retried.
    #[error("transient failure: {0}")]
    Transient(String),

    /// The input cannot be processed by this stage.
    #[error("permanent failure: {0}")]
    Permanent(String),
}

impl From<ExecutorError> for StageError {
    fn from(err: ExecutorError) -> Self {
        match err {
            ExecutorError::Transient(message) => StageError::transient(message),
            ExecutorError::Permanent(message) => StageError::permanent(message),
        }
    }
}

/// Everything an executor needs to run one attempt of a stage.
#[derive(Debug, Clone)]
pub struct StageRequest {
    pub job_id: Uuid,
    pub stage: StageKind,
    /// 1-based attempt number.
    pub attempt: u32,
    pub input: BrandInput,
    /// Outputs of the succeeded stages this stage depends on.
    pub inputs: Vec<Artifact>,
}

impl StageRequest {
    /// Input artifacts produced by a given stage.
    pub fn inputs_from(&self, stage: StageKind) -> impl Iterator<Item = &Artifact> + '_ {
        self.inputs.iter().filter(move |a| a.kind == stage)
    }
}

/// One output of a stage attempt, before it is stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagePayload {
    pub name: String,
    pub bytes: Vec<u8>,
}

impl StagePayload {
    pub fn new(name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            bytes: bytes.into(),
        }
    }
}

/// Performs the work of a pipeline stage.
#[async_trait]
pub trait StageExecutor: Send + Sync {
    /// Runs one attempt of `request.stage`.
    async fn execute(
        &self,
        request: &StageRequest,
        store: &dyn ArtifactStore,
    ) -> Result<Vec<StagePayload>, ExecutorError>;
}

/// Maps each stage kind to its executor.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<StageKind, Arc<dyn StageExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses one executor for every stage.
    pub fn uniform(executor: Arc<dyn StageExecutor>) -> Self {
        let mut registry = Self::new();
        for stage in StageKind::ALL {
            registry.register(stage, executor.clone());
        }
        registry
    }

    pub fn register(&mut self, stage: StageKind, executor: Arc<dyn StageExecutor>) -> &mut Self {
        self.executors.insert(stage, executor);
        self
    }

    pub fn with(mut self, stage: StageKind, executor: Arc<dyn StageExecutor>) -> Self {
        self.register(stage, executor);
        self
    }

    pub fn get(&self, stage: StageKind) -> Option<Arc<dyn StageExecutor>> {
        self.executors.get(&stage).cloned()
    }

    /// Stages with no registered executor.
    pub fn missing(&self) -> Vec<StageKind> {
        StageKind::ALL
            .into_iter()
            .filter(|stage| !self.executors.contains_key(stage))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorClass;

    #[test]
    fn test_executor_error_classification() {
        let err: StageError = ExecutorError::Transient("rate limited".into()).into();
        assert_eq!(err.class, ErrorClass::Transient);
        let err: StageError = ExecutorError::Permanent("nsfw prompt".into()).into();
        assert_eq!(err.class, ErrorClass::Permanent);
        assert_eq!(err.message, "nsfw prompt");
    }

    #[test]
    fn test_registry_lookup() {
        let executor: Arc<dyn StageExecutor> = Arc::new(SimulatedExecutor::new());
        let registry = ExecutorRegistry::new().with(StageKind::Synthesize, executor.clone());
        assert!(registry.get(StageKind::Synthesize).is_some());
        assert!(registry.get(StageKind::Refine).is_none());
        assert_eq!(registry.missing().len(), 6);

        let full = ExecutorRegistry::uniform(executor);
        assert!(full.missing().is_empty());
    }
}
