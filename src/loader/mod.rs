//! Phased, lazy asset loading on top of an [`ArchiveReader`](crate::reader::ArchiveReader).
//!
//! - [`coordinator`]: per-kind load state machine with shared in-flight loads
//! - [`pipeline`]: manifest-first, primary-second, background-rest orchestration
//! - [`quality`]: SD/HD tier resolution from an explicit request or device heuristics

pub mod coordinator;
pub mod pipeline;
pub mod quality;

use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

pub use coordinator::{LoadCoordinator, LoadObserver, NoopObserver, ScenePlacement};
pub use pipeline::{BackgroundReport, LoadPipeline, PhaseOneOutput, PrimaryOutcome};
pub use quality::{DeviceProfile, GraphicsProbe, QualityTier};

use crate::{manifest::Role, reader::ContentSummary};

/// Renderable asset kinds, each with its own load state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetKind {
    Splat,
    Mesh,
    Pointcloud,
}

impl AssetKind {
    /// Order tried when the preferred kind cannot be shown.
    pub const FALLBACK_ORDER: [AssetKind; 3] = [AssetKind::Splat, AssetKind::Mesh, AssetKind::Pointcloud];

    pub const fn role(&self) -> Role {
        match self {
            AssetKind::Splat => Role::Scene,
            AssetKind::Mesh => Role::Mesh,
            AssetKind::Pointcloud => Role::Pointcloud,
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            AssetKind::Splat => "splat",
            AssetKind::Mesh => "mesh",
            AssetKind::Pointcloud => "pointcloud",
        }
    }

    pub(crate) const fn index(&self) -> usize {
        match self {
            AssetKind::Splat => 0,
            AssetKind::Mesh => 1,
            AssetKind::Pointcloud => 2,
        }
    }

    /// Kind shown first for a viewer display mode. Combined modes lead with the splat.
    pub fn from_display_mode(mode: &str) -> Option<AssetKind> {
        match mode.trim().to_ascii_lowercase().as_str() {
            "splat" | "both" | "split" => Some(AssetKind::Splat),
            "model" | "mesh" => Some(AssetKind::Mesh),
            "pointcloud" => Some(AssetKind::Pointcloud),
            _ => None,
        }
    }

    /// Whether the archive has a primary entry of this kind.
    pub fn present_in(&self, summary: &ContentSummary) -> bool {
        match self {
            AssetKind::Splat => summary.has_splat,
            AssetKind::Mesh => summary.has_mesh,
            AssetKind::Pointcloud => summary.has_pointcloud,
        }
    }
}

impl Display for AssetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadState {
    #[default]
    Unloaded,
    Loading,
    Loaded,
    Error,
}
