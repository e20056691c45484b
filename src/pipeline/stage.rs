//! Stage kinds and the static pipeline descriptor table.
//!
//! The pipeline is fixed: seven stages in a total order. Each stage declares
//! its resource class, whether it is required for the job to succeed, and its
//! dependencies. `requires` are hard dependencies: if any of them did not
//! succeed the stage is skipped. `prefers` are soft dependencies whose
//! outputs are handed to the executor when available.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One step of the brand generation pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageKind {
    Synthesize,
    Refine,
    Upscale,
    ExtractPalette,
    Resize,
    Export,
    CompileKit,
}

impl StageKind {
    /// All stages in pipeline order.
    pub const ALL: [StageKind; 7] = [
        StageKind::Synthesize,
        StageKind::Refine,
        StageKind::Upscale,
        StageKind::ExtractPalette,
        StageKind::Resize,
        StageKind::Export,
        StageKind::CompileKit,
    ];

    pub fn first() -> StageKind {
        StageKind::Synthesize
    }

    /// Position of this stage in the pipeline.
    pub fn index(self) -> usize {
        self as usize
    }

    /// The stage that follows this one, if any.
    pub fn next(self) -> Option<StageKind> {
        Self::ALL.get(self.index() + 1).copied()
    }

    pub fn descriptor(self) -> &'static StageDescriptor {
        &PIPELINE[self.index()]
    }

    pub fn resource_class(self) -> ResourceClass {
        self.descriptor().resource_class
    }

    pub fn is_required(self) -> bool {
        self.descriptor().required
    }

    /// Human-readable progress label.
    pub fn label(self) -> &'static str {
        self.descriptor().label
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StageKind::Synthesize => "SYNTHESIZE",
            StageKind::Refine => "REFINE",
            StageKind::Upscale => "UPSCALE",
            StageKind::ExtractPalette => "EXTRACT_PALETTE",
            StageKind::Resize => "RESIZE",
            StageKind::Export => "EXPORT",
            StageKind::CompileKit => "COMPILE_KIT",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown stage '{0}'")]
pub struct UnknownStage(pub String);

impl FromStr for StageKind {
    type Err = UnknownStage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace('-', "_");
        Self::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| UnknownStage(s.to_string()))
    }
}

/// Compute resource a stage consumes while executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceClass {
    /// Scarce, expensive hardware (GPU-like).
    Accelerator,
    /// Ordinary compute.
    Cpu,
}

impl ResourceClass {
    pub const ALL: [ResourceClass; 2] = [ResourceClass::Accelerator, ResourceClass::Cpu];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ResourceClass::Accelerator => "accelerator",
            ResourceClass::Cpu => "cpu",
        }
    }
}

impl fmt::Display for ResourceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static description of a pipeline stage.
#[derive(Debug)]
pub struct StageDescriptor {
    pub kind: StageKind,
    pub resource_class: ResourceClass,
    /// A required stage that fails or is skipped fails the whole job.
    pub required: bool,
    pub requires: &'static [StageKind],
    pub prefers: &'static [StageKind],
    pub label: &'static str,
}

impl StageDescriptor {
    /// Every stage whose outputs this stage may consume, hard dependencies first.
    pub fn input_stages(&self) -> impl Iterator<Item = StageKind> + '_ {
        self.requires.iter().chain(self.prefers.iter()).copied()
    }
}

use StageKind::*;

/// Descriptor table indexed by `StageKind::index`.
pub static PIPELINE: [StageDescriptor; 7] = [
    StageDescriptor {
        kind: Synthesize,
        resource_class: ResourceClass::Accelerator,
        required: true,
        requires: &[],
        prefers: &[],
        label: "Generating logo concepts",
    },
    StageDescriptor {
        kind: Refine,
        resource_class: ResourceClass::Accelerator,
        required: false,
        requires: &[Synthesize],
        prefers: &[],
        label: "Refining logos",
    },
    StageDescriptor {
        kind: Upscale,
        resource_class: ResourceClass::Accelerator,
        required: false,
        requires: &[Synthesize],
        prefers: &[Refine],
        label: "Upscaling logos",
    },
    StageDescriptor {
        kind: ExtractPalette,
        resource_class: ResourceClass::Cpu,
        required: true,
        requires: &[Synthesize],
        prefers: &[Refine, Upscale],
        label: "Extracting color palette",
    },
    StageDescriptor {
        kind: Resize,
        resource_class: ResourceClass::Cpu,
        required: false,
        requires: &[Synthesize],
        prefers: &[Upscale, Refine],
        label: "Resizing logo variants",
    },
    StageDescriptor {
        kind: Export,
        resource_class: ResourceClass::Cpu,
        required: false,
        requires: &[Resize],
        prefers: &[],
        label: "Exporting formats",
    },
    StageDescriptor {
        kind: CompileKit,
        resource_class: ResourceClass::Cpu,
        required: false,
        requires: &[Synthesize, ExtractPalette],
        prefers: &[Refine, Upscale, Resize, Export],
        label: "Compiling brand kit",
    },
];

/// The descriptor table in pipeline order.
pub fn pipeline() -> &'static [StageDescriptor] {
    &PIPELINE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_matches_kind_order() {
        for (idx, desc) in PIPELINE.iter().enumerate() {
            assert_eq!(desc.kind.index(), idx);
            assert_eq!(StageKind::ALL[idx], desc.kind);
        }
    }

    #[test]
    fn test_next_walks_pipeline() {
        let mut order = vec![StageKind::first()];
        while let Some(next) = order.last().and_then(|s| s.next()) {
            order.push(next);
        }
        assert_eq!(order, StageKind::ALL.to_vec());
        assert_eq!(StageKind::CompileKit.next(), None);
    }

    #[test]
    fn test_required_stages() {
        let required: Vec<_> = StageKind::ALL
            .iter()
            .copied()
            .filter(|s| s.is_required())
            .collect();
        assert_eq!(required, vec![StageKind::Synthesize, StageKind::ExtractPalette]);
    }

    #[test]
    fn test_resource_classes() {
        assert_eq!(StageKind::Synthesize.resource_class(), ResourceClass::Accelerator);
        assert_eq!(StageKind::Refine.resource_class(), ResourceClass::Accelerator);
        assert_eq!(StageKind::Upscale.resource_class(), ResourceClass::Accelerator);
        for stage in [
            StageKind::ExtractPalette,
            StageKind::Resize,
            StageKind::Export,
            StageKind::CompileKit,
        ] {
            assert_eq!(stage.resource_class(), ResourceClass::Cpu);
        }
    }

    #[test]
    fn test_dependencies_point_backwards() {
        for desc in pipeline() {
            for dep in desc.input_stages() {
                assert!(
                    dep < desc.kind,
                    "{} depends on later stage {}",
                    desc.kind,
                    dep
                );
            }
        }
    }

    #[test]
    fn test_parse_stage_names() {
        assert_eq!("SYNTHESIZE".parse::<StageKind>(), Ok(StageKind::Synthesize));
        assert_eq!("extract-palette".parse::<StageKind>(), Ok(StageKind::ExtractPalette));
        assert_eq!(" compile_kit ".parse::<StageKind>(), Ok(StageKind::CompileKit));
        assert!("VECTORIZE".parse::<StageKind>().is_err());
    }

    #[test]
    fn test_stage_serde_name() {
        let json = serde_json::to_string(&StageKind::ExtractPalette).expect("serialize");
        assert_eq!(json, "\"EXTRACT_PALETTE\"");
    }
}
