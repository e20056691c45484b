//! Simulated stage executor.
//!
//! Produces small placeholder outputs for every stage without any model or
//! image tooling, with configurable latency and scripted failures. Used by
//! the CLI demo runs and by tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use super::{ExecutorError, StagePayload, StageExecutor, StageRequest};
use crate::pipeline::stage::StageKind;
use crate::storage::ArtifactStore;

/// Logo sizes, in pixels, produced by the resize stage.
pub const RESIZE_SIZES: [u32; 7] = [16, 32, 64, 128, 256, 512, 1024];

/// Formats produced by the export stage.
pub const EXPORT_FORMATS: [&str; 3] = ["png", "svg", "pdf"];

const PNG_MAGIC: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

/// Primary, secondary, accent and neutral colors for a color scheme.
pub fn palette_for_scheme(scheme: &str) -> [&'static str; 4] {
    match scheme.to_ascii_lowercase().as_str() {
        "warm" => ["#D2691E", "#CC5500", "#FFB000", "#8B4513"],
        "cool" => ["#4A90E2", "#357ABD", "#2E86C1", "#708090"],
        "neutral" => ["#6B6B6B", "#8B8B8B", "#A0A0A0", "#D3D3D3"],
        "vibrant" => ["#FF6B6B", "#4ECDC4", "#45B7D1", "#95A5A6"],
        _ => ["#333333", "#666666", "#999999", "#CCCCCC"],
    }
}

/// Executor that fabricates stage outputs.
#[derive(Debug, Default)]
pub struct SimulatedExecutor {
    latency: Duration,
    stage_latency: HashMap<StageKind, Duration>,
    jitter: Duration,
    /// Number of leading attempts that fail transiently, per stage.
    transient_failures: HashMap<StageKind, u32>,
    permanent_failures: HashSet<StageKind>,
    calls: AtomicU64,
}

impl SimulatedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Base latency of every attempt.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_stage_latency(mut self, stage: StageKind, latency: Duration) -> Self {
        self.stage_latency.insert(stage, latency);
        self
    }

    /// Adds up to `jitter` of extra latency, derived from the job and stage.
    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// The first `attempts` attempts of `stage` fail transiently, for every job.
    pub fn with_transient_failures(mut self, stage: StageKind, attempts: u32) -> Self {
        self.transient_failures.insert(stage, attempts);
        self
    }

    /// Every attempt of `stage` fails permanently.
    pub fn with_permanent_failure(mut self, stage: StageKind) -> Self {
        self.permanent_failures.insert(stage);
        self
    }

    /// Number of attempts executed so far.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    fn latency_for(&self, request: &StageRequest) -> Duration {
        let base = self
            .stage_latency
            .get(&request.stage)
            .copied()
            .unwrap_or(self.latency);
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return base;
        }
        let seed = request.job_id.as_u128() as u64 ^ (request.stage.index() as u64 * 0x9E37_79B9);
        base + Duration::from_millis(seed % (jitter_ms + 1))
    }

    fn synthesize(request: &StageRequest) -> Vec<StagePayload> {
        let input = &request.input;
        let mut payloads = Vec::new();
        for logo in 1..=input.num_logos {
            for variation in 1..=input.num_variations {
                let mut bytes = PNG_MAGIC.to_vec();
                bytes.extend_from_slice(
                    format!(
                        "{} | {} | {} | concept {} variation {}",
                        input.business_name, input.industry, input.style, logo, variation
                    )
                    .as_bytes(),
                );
                payloads.push(StagePayload::new(
                    format!("logo-{}-v{}.png", logo, variation),
                    bytes,
                ));
            }
        }
        payloads
    }

    /// One derived image per image input, tagged with the operation applied.
    fn derive_images(request: &StageRequest, from: StageKind, prefix: &str) -> Vec<StagePayload> {
        request
            .inputs_from(from)
            .map(|source| {
                let mut bytes = PNG_MAGIC.to_vec();
                bytes.extend_from_slice(format!("{} of {}", prefix, source.reference).as_bytes());
                StagePayload::new(format!("{}-{}", prefix, source.name), bytes)
            })
            .collect()
    }

    /// Best available image source: upscaled, then refined, then raw concepts.
    fn best_source(request: &StageRequest) -> StageKind {
        [StageKind::Upscale, StageKind::Refine]
            .into_iter()
            .find(|stage| request.inputs_from(*stage).next().is_some())
            .unwrap_or(StageKind::Synthesize)
    }

    fn extract_palette(request: &StageRequest) -> Result<Vec<StagePayload>, ExecutorError> {
        let [primary, secondary, accent, neutral] = palette_for_scheme(&request.input.color_scheme);
        let palette = json!({
            "scheme": request.input.color_scheme,
            "primary": primary,
            "secondary": secondary,
            "accent": accent,
            "neutral": neutral,
            "colors": [primary, secondary, accent, neutral],
            "source": Self::best_source(request),
        });
        Ok(vec![StagePayload::new("palette.json", to_json_bytes(&palette)?)])
    }

    fn resize(request: &StageRequest) -> Vec<StagePayload> {
        let source = Self::best_source(request);
        let primary = request.inputs_from(source).next();
        RESIZE_SIZES
            .iter()
            .map(|size| {
                let mut bytes = PNG_MAGIC.to_vec();
                let origin = primary.map(|a| a.reference.to_string()).unwrap_or_default();
                bytes.extend_from_slice(format!("{}x{} of {}", size, size, origin).as_bytes());
                StagePayload::new(format!("logo-{}.png", size), bytes)
            })
            .collect()
    }

    fn export(request: &StageRequest) -> Result<Vec<StagePayload>, ExecutorError> {
        let sizes: Vec<&str> = request
            .inputs_from(StageKind::Resize)
            .map(|a| a.name.as_str())
            .collect();
        EXPORT_FORMATS
            .iter()
            .map(|format| {
                let manifest = json!({
                    "business_name": request.input.business_name,
                    "format": format,
                    "variants": sizes,
                });
                Ok(StagePayload::new(
                    format!("brand-export.{}", format),
                    to_json_bytes(&manifest)?,
                ))
            })
            .collect()
    }

    async fn compile_kit(
        request: &StageRequest,
        store: &dyn ArtifactStore,
    ) -> Result<Vec<StagePayload>, ExecutorError> {
        let palette_ref = request
            .inputs_from(StageKind::ExtractPalette)
            .next()
            .ok_or_else(|| ExecutorError::Permanent("no palette available".to_string()))?;
        let palette_bytes = store
            .get(&palette_ref.reference)
            .await
            .map_err(|e| ExecutorError::Transient(format!("reading palette: {}", e)))?;
        let palette: serde_json::Value = serde_json::from_slice(&palette_bytes)
            .map_err(|e| ExecutorError::Permanent(format!("palette is not valid JSON: {}", e)))?;

        let assets: Vec<serde_json::Value> = request
            .inputs
            .iter()
            .map(|a| json!({ "stage": a.kind, "name": a.name, "ref": a.reference }))
            .collect();
        let kit = json!({
            "business_name": request.input.business_name,
            "industry": request.input.industry,
            "style": request.input.style,
            "personality_traits": request.input.personality_traits,
            "target_audience": request.input.target_audience,
            "palette": palette,
            "assets": assets,
        });
        Ok(vec![StagePayload::new("brand-kit.json", to_json_bytes(&kit)?)])
    }
}

fn to_json_bytes(value: &serde_json::Value) -> Result<Vec<u8>, ExecutorError> {
    serde_json::to_vec_pretty(value).map_err(|e| ExecutorError::Permanent(e.to_string()))
}

#[async_trait]
impl StageExecutor for SimulatedExecutor {
    async fn execute(
        &self,
        request: &StageRequest,
        store: &dyn ArtifactStore,
    ) -> Result<Vec<StagePayload>, ExecutorError> {
        self.calls.fetch_add(1, Ordering::Relaxed);

        let latency = self.latency_for(request);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        if self.permanent_failures.contains(&request.stage) {
            return Err(ExecutorError::Permanent(format!(
                "{} rejected the input",
                request.stage
            )));
        }
        let failing_attempts = self
            .transient_failures
            .get(&request.stage)
            .copied()
            .unwrap_or(0);
        if request.attempt <= failing_attempts {
            return Err(ExecutorError::Transient(format!(
                "{} attempt {} hit a simulated outage",
                request.stage, request.attempt
            )));
        }

        match request.stage {
            StageKind::Synthesize => Ok(Self::synthesize(request)),
            StageKind::Refine => Ok(Self::derive_images(request, StageKind::Synthesize, "refined")),
            StageKind::Upscale => {
                let source = if request.inputs_from(StageKind::Refine).next().is_some() {
                    StageKind::Refine
                } else {
                    StageKind::Synthesize
                };
                Ok(Self::derive_images(request, source, "upscaled"))
            }
            StageKind::ExtractPalette => Self::extract_palette(request),
            StageKind::Resize => Ok(Self::resize(request)),
            StageKind::Export => Self::export(request),
            StageKind::CompileKit => Self::compile_kit(request, store).await,
        }
    }
}
