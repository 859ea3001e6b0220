//! Integration tests for phased loading: proxy-first meshes, display-mode fallback, terminal
//! load errors, quality-tier selection and shared in-flight loads.

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
};

use chrono::Utc;
use serde_json::json;
use vitrine_archive::{
    ArchiveBuilder, ArchiveError, ArchiveReader, AssetKind, LoadCoordinator, LoadPipeline,
    LoadState, PackOptions, Payload, QualityTier, Transform,
    container::{ContainerFormat, ContainerWriter},
    loader::{
        DeviceProfile, GraphicsProbe, LoadObserver, NoopObserver, PrimaryOutcome, ScenePlacement,
        quality,
    },
};

fn init_logger() {
    let _ = tracing_subscriber::fmt::Subscriber::builder()
        .with_target(false)
        .without_time()
        .with_level(true)
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Scene graph stand-in recording what was placed or swapped, in order.
#[derive(Default)]
struct SceneLog {
    events: Mutex<Vec<(&'static str, AssetKind, String)>>,
}

impl SceneLog {
    fn events(&self) -> Vec<(&'static str, AssetKind, String)> {
        self.events.lock().unwrap().clone()
    }
}

impl ScenePlacement for SceneLog {
    fn place(&self, kind: AssetKind, payload: &Payload, _: &Transform) -> Result<(), ArchiveError> {
        self.events
            .lock()
            .unwrap()
            .push(("place", kind, payload.name().to_string()));
        Ok(())
    }

    fn swap(&self, kind: AssetKind, payload: &Payload, _: &Transform) -> Result<(), ArchiveError> {
        self.events
            .lock()
            .unwrap()
            .push(("swap", kind, payload.name().to_string()));
        Ok(())
    }
}

#[derive(Default)]
struct Indicators {
    started: AtomicUsize,
    finished: AtomicUsize,
}

impl LoadObserver for Indicators {
    fn loading_started(&self, _: AssetKind) {
        self.started.fetch_add(1, Ordering::SeqCst);
    }

    fn loading_finished(&self, _: AssetKind, _: bool) {
        self.finished.fetch_add(1, Ordering::SeqCst);
    }
}

struct WeakGpu;

impl GraphicsProbe for WeakGpu {
    fn max_texture_size(&self) -> Result<u32, String> {
        Ok(4096)
    }
}

fn low_end_phone() -> DeviceProfile {
    DeviceProfile {
        memory_gib: Some(2.0),
        logical_processors: Some(4),
        screen_width: Some(412),
        user_agent: "Mozilla/5.0 (Linux; Android 13; Pixel 6a) Mobile Safari".into(),
    }
}

async fn mesh_with_proxy() -> ArchiveReader {
    let mut b = ArchiveBuilder::default();
    b.set_project_info(json!({"title": "Statue"})).unwrap();
    b.add_mesh(Payload::new(vec![7u8; 100_000], "statue.glb"), "statue.glb", Default::default())
        .unwrap();
    b.add_mesh_proxy(Payload::new(vec![8u8; 1_000], "statue_lo.glb"), "statue_lo.glb", Default::default())
        .unwrap();
    let bytes = b.pack(&PackOptions::default(), |_| {}).await.unwrap();
    ArchiveReader::open(bytes).unwrap()
}

/// Scenario A: proxy first, full mesh in the background, swap without another extraction.
#[tokio::test]
async fn proxy_first_then_full_resolution() {
    init_logger();
    let scene = Arc::new(SceneLog::default());
    let (pipeline, output) = LoadPipeline::open(
        mesh_with_proxy().await,
        scene.clone(),
        Arc::new(NoopObserver),
        QualityTier::Sd,
    )
    .await
    .unwrap();
    assert!(output.content.has_mesh_proxy);

    let (outcome, background) = pipeline.load("model").await;
    assert_eq!(outcome, PrimaryOutcome::Loaded(AssetKind::Mesh));
    let coordinator = pipeline.coordinator();
    assert!(coordinator.is_viewing_proxy());
    assert_eq!(
        scene.events()[0],
        ("place", AssetKind::Mesh, "assets/mesh_0_proxy.glb".to_string())
    );

    let report = background.await.unwrap();
    assert!(report.buffer_released);
    let extractions = coordinator.reader().extraction_count();
    assert_eq!(extractions, 2);

    assert!(coordinator.load_full_resolution().await.unwrap());
    assert_eq!(coordinator.reader().extraction_count(), extractions);
    assert!(!coordinator.is_viewing_proxy());
    assert_eq!(
        scene.events()[1],
        ("swap", AssetKind::Mesh, "assets/mesh_0.glb".to_string())
    );
}

/// Scenario B: mesh requested but absent, point cloud loads instead.
#[tokio::test]
async fn falls_back_to_pointcloud() {
    init_logger();
    let mut b = ArchiveBuilder::default();
    b.set_project_info(json!({"title": "Cave"})).unwrap();
    b.add_pointcloud(Payload::new(vec![1u8; 512], "cave.laz"), "cave.laz", Default::default())
        .unwrap();
    let reader = ArchiveReader::open(b.pack(&PackOptions::default(), |_| {}).await.unwrap()).unwrap();

    let scene = Arc::new(SceneLog::default());
    let (pipeline, output) =
        LoadPipeline::open(reader, scene.clone(), Arc::new(NoopObserver), QualityTier::Hd)
            .await
            .unwrap();
    assert!(!output.content.has_mesh);

    let outcome = pipeline.load_primary("model").await;
    assert_eq!(outcome, PrimaryOutcome::Loaded(AssetKind::Pointcloud));
    let coordinator = pipeline.coordinator();
    assert!(!coordinator.reader().content_summary().has_mesh);
    assert_eq!(coordinator.state(AssetKind::Mesh), LoadState::Unloaded);
    assert_eq!(scene.events().len(), 1);
}

/// Scenario C: a manifest entry without bytes fails once and stays failed.
#[tokio::test]
async fn missing_entry_is_terminal() {
    init_logger();
    let manifest = json!({
        "container_version": "1.0",
        "project": {"title": "Broken"},
        "data_entries": {
            "mesh_0": {"file_name": "assets/missing.ply", "role": "mesh"}
        }
    });
    let mut writer = ContainerWriter::new(ContainerFormat::Deflate, 6, Utc::now().naive_utc());
    writer
        .add("manifest.json", manifest.to_string().as_bytes())
        .unwrap();
    let bytes = writer.finish().unwrap();

    let mut reader = ArchiveReader::open(bytes).unwrap();
    reader.parse().unwrap();
    assert!(!reader.validate().unwrap().valid);
    let err = reader.extract("assets/missing.ply").await.unwrap_err();
    assert!(matches!(err, ArchiveError::NotFound(_)));

    let indicators = Arc::new(Indicators::default());
    let coordinator = LoadCoordinator::new(
        Arc::new(reader),
        Arc::new(SceneLog::default()),
        indicators.clone(),
        QualityTier::Hd,
    );
    assert!(!coordinator.ensure_loaded(AssetKind::Mesh).await);
    assert_eq!(coordinator.state(AssetKind::Mesh), LoadState::Error);
    assert!(!coordinator.ensure_loaded(AssetKind::Mesh).await);
    assert_eq!(indicators.started.load(Ordering::SeqCst), 1);
    assert_eq!(indicators.finished.load(Ordering::SeqCst), 1);
    assert_eq!(coordinator.reader().extraction_count(), 0);
}

/// With every kind failing the archive stays open for metadata.
#[tokio::test]
async fn no_viewable_asset_is_soft() {
    let manifest = json!({
        "project": {"title": "Empty"},
        "container_version": "1.0",
        "data_entries": {
            "scene_0": {"file_name": "assets/scene_0.ply", "role": "scene"}
        }
    });
    let mut writer = ContainerWriter::new(ContainerFormat::Stored, 0, Utc::now().naive_utc());
    writer
        .add("manifest.json", manifest.to_string().as_bytes())
        .unwrap();
    let reader = ArchiveReader::open(writer.finish().unwrap()).unwrap();
    let (pipeline, output) = LoadPipeline::open(
        reader,
        Arc::new(SceneLog::default()),
        Arc::new(NoopObserver),
        QualityTier::Hd,
    )
    .await
    .unwrap();
    assert_eq!(pipeline.load_primary("splat").await, PrimaryOutcome::NoViewableAsset);
    assert_eq!(output.manifest.project.title, "Empty");
    assert_eq!(pipeline.coordinator().state(AssetKind::Splat), LoadState::Error);
}

/// Scenario D: explicit HD takes the full mesh, auto on a weak device takes the proxy.
#[tokio::test]
async fn quality_tier_selects_representation() {
    init_logger();
    let forced = quality::resolve("hd", &low_end_phone(), Some(&WeakGpu));
    assert_eq!(forced, QualityTier::Hd);
    let scene = Arc::new(SceneLog::default());
    let (pipeline, _) =
        LoadPipeline::open(mesh_with_proxy().await, scene.clone(), Arc::new(NoopObserver), forced)
            .await
            .unwrap();
    pipeline.load_primary("model").await;
    assert_eq!(scene.events()[0].2, "assets/mesh_0.glb");
    assert!(!pipeline.coordinator().is_viewing_proxy());

    let detected = quality::resolve("auto", &low_end_phone(), Some(&WeakGpu));
    assert_eq!(detected, QualityTier::Sd);
    let scene = Arc::new(SceneLog::default());
    let (pipeline, output) =
        LoadPipeline::open(mesh_with_proxy().await, scene.clone(), Arc::new(NoopObserver), detected)
            .await
            .unwrap();
    assert!(quality::has_any_proxy(&output.content));
    pipeline.load_primary("model").await;
    assert_eq!(scene.events()[0].2, "assets/mesh_0_proxy.glb");
    assert!(pipeline.coordinator().is_viewing_proxy());
}

/// Two concurrent loads of the same kind share one extraction and one outcome.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_ensure_loaded_extracts_once() {
    let mut b = ArchiveBuilder::default();
    b.set_project_info(json!({"title": "Ship"})).unwrap();
    b.add_mesh(Payload::new(vec![3u8; 1 << 20], "ship.glb"), "ship.glb", Default::default())
        .unwrap();
    let mut reader = ArchiveReader::open(b.pack(&PackOptions::default(), |_| {}).await.unwrap()).unwrap();
    reader.parse().unwrap();

    let scene = Arc::new(SceneLog::default());
    let coordinator = LoadCoordinator::new(
        Arc::new(reader),
        scene.clone(),
        Arc::new(NoopObserver),
        QualityTier::Hd,
    );
    let a = tokio::spawn({
        let c = coordinator.clone();
        async move { c.ensure_loaded(AssetKind::Mesh).await }
    });
    let b = tokio::spawn({
        let c = coordinator.clone();
        async move { c.ensure_loaded(AssetKind::Mesh).await }
    });
    let (a, b) = (a.await.unwrap(), b.await.unwrap());
    assert!(a && b);
    assert_eq!(coordinator.reader().extraction_count(), 1);
    assert_eq!(scene.events().len(), 1);
    assert_eq!(coordinator.state(AssetKind::Mesh), LoadState::Loaded);
}

/// Export while the background full mesh is pending waits for it.
#[tokio::test]
async fn export_waits_for_background_mesh() {
    let (pipeline, _) = LoadPipeline::open(
        mesh_with_proxy().await,
        Arc::new(SceneLog::default()),
        Arc::new(NoopObserver),
        QualityTier::Sd,
    )
    .await
    .unwrap();
    pipeline.load_primary("model").await;
    let coordinator = pipeline.coordinator();
    let (a, b) = tokio::join!(coordinator.full_mesh_for_export(), coordinator.full_mesh_for_export());
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a.id(), b.id());
    assert_eq!(a.size(), 100_000);
    assert_eq!(coordinator.reader().extraction_count(), 2);
}
