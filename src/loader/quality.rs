//! Quality-tier resolution: an explicit `sd`/`hd` request wins, anything else is scored from the
//! device profile.
//!
//! Five checks, one point each; unknown memory or processor counts count as capable, and a
//! missing or failing graphics probe counts as capable too. Three points or more is HD.

use std::{
    fmt::{self, Display},
    thread,
};

use serde::{Deserialize, Serialize};

use crate::{config::ArchiveConfig, reader::ContentSummary};

pub const MIN_MEMORY_GIB: f64 = 4.0;
pub const MIN_LOGICAL_PROCESSORS: u32 = 4;
pub const MIN_DESKTOP_WIDTH: u32 = 1024;
pub const MIN_MAX_TEXTURE_SIZE: u32 = 8192;
pub const HD_SCORE: u32 = 3;

const MOBILE_UA_PATTERNS: &[&str] = &[
    "android",
    "iphone",
    "ipad",
    "ipod",
    "mobi",
    "tablet",
    "kindle",
    "silk",
    "blackberry",
    "opera mini",
    "webos",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    Sd,
    Hd,
}

impl QualityTier {
    /// `Some` only for an explicit `sd` or `hd`, case-insensitive.
    pub fn parse_explicit(requested: &str) -> Option<Self> {
        match requested.trim().to_ascii_lowercase().as_str() {
            "sd" => Some(QualityTier::Sd),
            "hd" => Some(QualityTier::Hd),
            _ => None,
        }
    }

    /// Whether a proxy should be shown ahead of its full-resolution entry.
    pub fn prefers_proxy(&self) -> bool {
        *self == QualityTier::Sd
    }
}

impl Display for QualityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            QualityTier::Sd => "sd",
            QualityTier::Hd => "hd",
        })
    }
}

/// What the host knows about the device. `None` means the value could not be queried.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceProfile {
    pub memory_gib: Option<f64>,
    pub logical_processors: Option<u32>,
    pub screen_width: Option<u32>,
    pub user_agent: String,
}

impl DeviceProfile {
    /// Profile of the current process: processor count only, everything else unknown.
    pub fn current() -> Self {
        Self {
            logical_processors: thread::available_parallelism()
                .ok()
                .map(|n| n.get() as u32),
            ..Default::default()
        }
    }

    pub fn is_mobile(&self) -> bool {
        let ua = self.user_agent.to_ascii_lowercase();
        MOBILE_UA_PATTERNS.iter().any(|p| ua.contains(p))
    }
}

/// GPU capability query supplied by the renderer.
pub trait GraphicsProbe {
    fn max_texture_size(&self) -> Result<u32, String>;
}

/// Heuristic score in `0..=5`.
pub fn score(device: &DeviceProfile, probe: Option<&dyn GraphicsProbe>) -> u32 {
    let memory = device.memory_gib.is_none_or(|gib| gib >= MIN_MEMORY_GIB);
    let cores = device
        .logical_processors
        .is_none_or(|n| n >= MIN_LOGICAL_PROCESSORS);
    let wide = device.screen_width.is_some_and(|w| w >= MIN_DESKTOP_WIDTH);
    let texture = match probe.map(|p| p.max_texture_size()) {
        None => true,
        Some(Ok(size)) => size >= MIN_MAX_TEXTURE_SIZE,
        Some(Err(e)) => {
            tracing::debug!(error = %e, "graphics probe failed, assuming capable");
            true
        }
    };
    let desktop = !device.is_mobile();
    [memory, cores, wide, texture, desktop]
        .into_iter()
        .filter(|point| *point)
        .count() as u32
}

pub fn detect(device: &DeviceProfile, probe: Option<&dyn GraphicsProbe>) -> QualityTier {
    let points = score(device, probe);
    let tier = if points >= HD_SCORE {
        QualityTier::Hd
    } else {
        QualityTier::Sd
    };
    tracing::debug!(points, %tier, "quality tier detected");
    tier
}

/// Explicit `sd`/`hd` passes through; `auto` or anything unrecognized is detected.
pub fn resolve(
    requested: &str,
    device: &DeviceProfile,
    probe: Option<&dyn GraphicsProbe>,
) -> QualityTier {
    QualityTier::parse_explicit(requested).unwrap_or_else(|| detect(device, probe))
}

/// Tier for the `quality` setting of `config`.
pub fn from_config(
    config: &ArchiveConfig,
    device: &DeviceProfile,
    probe: Option<&dyn GraphicsProbe>,
) -> QualityTier {
    let tier = resolve(&config.quality, device, probe);
    tracing::debug!(requested = %config.quality, %tier, "quality tier from config");
    tier
}

pub fn has_any_proxy(summary: &ContentSummary) -> bool {
    summary.has_mesh_proxy || summary.has_scene_proxy
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedProbe(Result<u32, String>);

    impl GraphicsProbe for FixedProbe {
        fn max_texture_size(&self) -> Result<u32, String> {
            self.0.clone()
        }
    }

    fn phone() -> DeviceProfile {
        DeviceProfile {
            memory_gib: Some(2.0),
            logical_processors: Some(2),
            screen_width: Some(390),
            user_agent: "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X) Mobile".into(),
        }
    }

    fn workstation() -> DeviceProfile {
        DeviceProfile {
            memory_gib: Some(32.0),
            logical_processors: Some(16),
            screen_width: Some(2560),
            user_agent: "Mozilla/5.0 (X11; Linux x86_64)".into(),
        }
    }

    #[test]
    fn explicit_request_wins() {
        assert_eq!(resolve("hd", &phone(), None), QualityTier::Hd);
        assert_eq!(resolve(" SD ", &workstation(), None), QualityTier::Sd);
    }

    /// Unrecognized requests are treated like `auto`.
    #[test]
    fn unknown_request_detects() {
        assert_eq!(resolve("ultra", &workstation(), None), QualityTier::Hd);
        assert_eq!(resolve("auto", &phone(), Some(&FixedProbe(Ok(4096)))), QualityTier::Sd);
    }

    #[test]
    fn scoring() {
        assert_eq!(score(&workstation(), Some(&FixedProbe(Ok(16384)))), 5);
        assert_eq!(score(&phone(), Some(&FixedProbe(Ok(4096)))), 0);
        // A missing or failing probe still earns its point.
        assert_eq!(score(&phone(), None), 1);
        assert_eq!(score(&phone(), Some(&FixedProbe(Err("lost context".into())))), 1);
    }

    /// Unknown memory and cores count as capable; unknown width does not.
    #[test]
    fn unknown_values() {
        let unknown = DeviceProfile::default();
        assert_eq!(score(&unknown, None), 4);
        assert_eq!(detect(&unknown, None), QualityTier::Hd);

        let tablet = DeviceProfile {
            user_agent: "Mozilla/5.0 (iPad; CPU OS 16_0)".into(),
            screen_width: Some(820),
            ..Default::default()
        };
        assert_eq!(score(&tablet, Some(&FixedProbe(Ok(4096)))), 2);
        assert_eq!(detect(&tablet, Some(&FixedProbe(Ok(4096)))), QualityTier::Sd);
    }

    #[test]
    fn config_quality_is_honoured() {
        let gpu = FixedProbe(Ok(4096));
        let weak: Option<&dyn GraphicsProbe> = Some(&gpu);
        let auto = ArchiveConfig::from_json_str(r#"{"quality": "auto"}"#).unwrap();
        assert_eq!(from_config(&auto, &phone(), weak), QualityTier::Sd);
        assert_eq!(from_config(&auto, &workstation(), None), QualityTier::Hd);

        let forced = ArchiveConfig::from_json_str(r#"{"quality": "hd"}"#).unwrap();
        assert_eq!(from_config(&forced, &phone(), weak), QualityTier::Hd);
        // The default is auto.
        assert_eq!(from_config(&ArchiveConfig::default(), &phone(), weak), QualityTier::Sd);
    }

    #[test]
    fn proxy_presence() {
        assert!(!has_any_proxy(&ContentSummary::default()));
        assert!(has_any_proxy(&ContentSummary {
            has_scene_proxy: true,
            ..Default::default()
        }));
    }
}
