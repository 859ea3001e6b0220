//! Phased loading of one opened archive.
//!
//! 1. [`LoadPipeline::open`]: parse the manifest, reset load states, extract embedded images and
//!    list source files without extracting them.
//! 2. [`LoadPipeline::load_primary`]: load the kind for the current display mode, falling back
//!    through [`AssetKind::FALLBACK_ORDER`]. Exhausting it is a soft outcome.
//! 3. [`LoadPipeline::load_remaining`]: load every other present kind, then release the raw
//!    container buffer unless source files pin it.
//!
//! Phase 3 only starts once phase 2 has settled; [`LoadPipeline::load`] sequences the two and
//! hands phase 3 to a background task.

use std::sync::Arc;

use serde::Serialize;
use tokio::task::JoinHandle;

use super::{
    AssetKind, LoadState,
    coordinator::{LoadCoordinator, LoadObserver, ScenePlacement},
    quality::{self, DeviceProfile, GraphicsProbe, QualityTier},
};
use crate::{
    config::ArchiveConfig,
    errors::ArchiveError,
    manifest::{Annotation, Manifest},
    payload::Payload,
    reader::{ArchiveReader, ContentSummary, EntryRef, SourceFileInfo},
};

/// Everything phase 1 hands to metadata, annotation and listing consumers.
#[derive(Debug, Clone)]
pub struct PhaseOneOutput {
    pub manifest: Manifest,
    pub content: ContentSummary,
    pub annotations: Vec<Annotation>,
    pub images: Vec<(EntryRef, Payload)>,
    pub source_files: Vec<SourceFileInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PrimaryOutcome {
    Loaded(AssetKind),
    /// Nothing renderable could be loaded; the archive stays open for metadata.
    NoViewableAsset,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BackgroundReport {
    pub loaded: Vec<AssetKind>,
    pub failed: Vec<AssetKind>,
    pub buffer_released: bool,
}

#[derive(Clone)]
pub struct LoadPipeline {
    coordinator: LoadCoordinator,
}

impl LoadPipeline {
    /// Phase 1. Manifest errors abort the open; image extraction failures are only logged.
    pub async fn open(
        mut reader: ArchiveReader,
        placement: Arc<dyn ScenePlacement>,
        observer: Arc<dyn LoadObserver>,
        tier: QualityTier,
    ) -> Result<(Self, PhaseOneOutput), ArchiveError> {
        let manifest = reader.parse()?.clone();
        let content = reader.content_summary();
        let annotations = reader.annotations().to_vec();
        let source_files = reader.source_file_entries();

        let mut images = Vec::new();
        for image in reader.image_entries() {
            match reader.extract(&image.entry.file_name).await {
                Ok(payload) => images.push((image, payload)),
                Err(e) => {
                    tracing::warn!(file = %image.entry.file_name, error = %e, "embedded image unreadable")
                }
            }
        }

        let coordinator = LoadCoordinator::new(Arc::new(reader), placement, observer, tier);
        coordinator.reset();
        coordinator.observer().progress(1.0 / 3.0);
        tracing::info!(
            ?content,
            images = images.len(),
            sources = source_files.len(),
            %tier,
            "archive opened"
        );

        Ok((
            Self { coordinator },
            PhaseOneOutput {
                manifest,
                content,
                annotations,
                images,
                source_files,
            },
        ))
    }

    /// Phase 1 with the quality tier resolved from `config.quality` for `device`.
    pub async fn open_with_config(
        reader: ArchiveReader,
        config: &ArchiveConfig,
        device: &DeviceProfile,
        probe: Option<&dyn GraphicsProbe>,
        placement: Arc<dyn ScenePlacement>,
        observer: Arc<dyn LoadObserver>,
    ) -> Result<(Self, PhaseOneOutput), ArchiveError> {
        let tier = quality::from_config(config, device, probe);
        Self::open(reader, placement, observer, tier).await
    }

    pub fn coordinator(&self) -> &LoadCoordinator {
        &self.coordinator
    }

    /// Phase 2. Kinds the archive does not contain are skipped and stay `Unloaded`.
    pub async fn load_primary(&self, display_mode: &str) -> PrimaryOutcome {
        let content = self.coordinator.reader().content_summary();
        let preferred = AssetKind::from_display_mode(display_mode);
        let order = preferred.into_iter().chain(
            AssetKind::FALLBACK_ORDER
                .into_iter()
                .filter(|k| Some(*k) != preferred),
        );

        let mut outcome = PrimaryOutcome::NoViewableAsset;
        for kind in order {
            if !kind.present_in(&content) {
                tracing::debug!(%kind, display_mode, "kind absent, trying next");
                continue;
            }
            if self.coordinator.ensure_loaded(kind).await {
                outcome = PrimaryOutcome::Loaded(kind);
                break;
            }
            tracing::warn!(%kind, "primary load failed, falling back");
        }
        if outcome == PrimaryOutcome::NoViewableAsset {
            tracing::warn!("archive contains no viewable asset");
        }
        self.coordinator.observer().progress(2.0 / 3.0);
        outcome
    }

    /// Phase 3. Loads run concurrently; the buffer is released only after all of them and the
    /// background full-mesh extraction have finished.
    pub async fn load_remaining(&self) -> BackgroundReport {
        let content = self.coordinator.reader().content_summary();
        let pending: Vec<AssetKind> = AssetKind::FALLBACK_ORDER
            .into_iter()
            .filter(|k| k.present_in(&content) && self.coordinator.state(*k) == LoadState::Unloaded)
            .collect();

        let results =
            futures::future::join_all(pending.iter().map(|k| self.coordinator.ensure_loaded(*k)))
                .await;
        let mut report = BackgroundReport::default();
        for (kind, ok) in pending.into_iter().zip(results) {
            if ok {
                report.loaded.push(kind);
            } else {
                report.failed.push(kind);
            }
        }

        self.coordinator.wait_for_background().await;
        let reader = self.coordinator.reader();
        report.buffer_released = !reader.has_source_files() && reader.release_raw_buffer();
        self.coordinator.observer().progress(1.0);
        tracing::info!(?report, "background loading finished");
        report
    }

    /// Phase 2, then phase 3 on a spawned task.
    pub async fn load(&self, display_mode: &str) -> (PrimaryOutcome, JoinHandle<BackgroundReport>) {
        let outcome = self.load_primary(display_mode).await;
        let pipeline = self.clone();
        let background = tokio::spawn(async move { pipeline.load_remaining().await });
        (outcome, background)
    }
}
