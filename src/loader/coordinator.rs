//! Per-archive load coordinator.
//!
//! Each [`AssetKind`] moves `Unloaded → Loading → Loaded | Error` only through
//! [`LoadCoordinator::ensure_loaded`]. The first caller starts a load as a shared future; callers
//! arriving while it runs attach to the same future, so one extraction serves them all and they
//! all see the same outcome. `Error` is terminal for the session.
//!
//! Session state sits behind one synchronous mutex that is never held across an await, so
//! observers only ever see whole transitions. [`LoadCoordinator::reset`] starts a new session
//! generation; a load still running from an older generation neither places its payload nor
//! writes its outcome into the new session, and reports `false` to its callers.
//!
//! Proxies: in the SD tier a kind whose primary entry has a proxy is placed from the proxy first.
//! For meshes the full entry is then extracted in the background, and
//! [`LoadCoordinator::load_full_resolution`] and [`LoadCoordinator::full_mesh_for_export`] both
//! attach to that extraction. A splat proxy stays in place until the session is reset.

use std::sync::{Arc, Mutex, MutexGuard};

use futures::{
    FutureExt,
    future::{BoxFuture, Shared},
};

use super::{AssetKind, LoadState, quality::QualityTier};
use crate::{
    errors::ArchiveError,
    manifest::{Role, Transform},
    payload::Payload,
    reader::ArchiveReader,
};

/// Scene graph side: receives extracted payloads with their placement.
pub trait ScenePlacement: Send + Sync {
    fn place(&self, kind: AssetKind, payload: &Payload, transform: &Transform) -> Result<(), ArchiveError>;

    /// Replace already placed geometry of `kind`, e.g. a proxy with its full-resolution entry.
    fn swap(&self, kind: AssetKind, payload: &Payload, transform: &Transform) -> Result<(), ArchiveError> {
        self.place(kind, payload, transform)
    }
}

/// UI side: loading indicators and progress. Every method defaults to doing nothing.
pub trait LoadObserver: Send + Sync {
    fn loading_started(&self, _kind: AssetKind) {}

    /// Called exactly once per load, whatever the outcome.
    fn loading_finished(&self, _kind: AssetKind, _ok: bool) {}

    fn progress(&self, _fraction: f32) {}
}

pub struct NoopObserver;

impl LoadObserver for NoopObserver {}

type SharedLoad = Shared<BoxFuture<'static, bool>>;
type SharedExtract = Shared<BoxFuture<'static, Option<Payload>>>;

#[derive(Default)]
struct KindSlot {
    state: LoadState,
    in_flight: Option<SharedLoad>,
    showing_proxy: bool,
}

/// Full-resolution mesh behind a displayed mesh proxy.
#[derive(Default)]
struct FullMesh {
    file: Option<String>,
    transform: Transform,
    background: Option<SharedExtract>,
}

#[derive(Default)]
struct Session {
    generation: u64,
    kinds: [KindSlot; 3],
    full_mesh: FullMesh,
}

struct Inner {
    reader: Arc<ArchiveReader>,
    placement: Arc<dyn ScenePlacement>,
    observer: Arc<dyn LoadObserver>,
    tier: Mutex<QualityTier>,
    session: Mutex<Session>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct LoadCoordinator {
    inner: Arc<Inner>,
}

impl LoadCoordinator {
    pub fn new(
        reader: Arc<ArchiveReader>,
        placement: Arc<dyn ScenePlacement>,
        observer: Arc<dyn LoadObserver>,
        tier: QualityTier,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                reader,
                placement,
                observer,
                tier: Mutex::new(tier),
                session: Mutex::new(Session::default()),
            }),
        }
    }

    pub fn reader(&self) -> &Arc<ArchiveReader> {
        &self.inner.reader
    }

    pub fn observer(&self) -> &Arc<dyn LoadObserver> {
        &self.inner.observer
    }

    pub fn state(&self, kind: AssetKind) -> LoadState {
        lock(&self.inner.session).kinds[kind.index()].state
    }

    pub fn states(&self) -> [(AssetKind, LoadState); 3] {
        let session = lock(&self.inner.session);
        AssetKind::FALLBACK_ORDER.map(|k| (k, session.kinds[k.index()].state))
    }

    pub fn quality_tier(&self) -> QualityTier {
        *lock(&self.inner.tier)
    }

    /// Affects loads started after the call.
    pub fn set_quality_tier(&self, tier: QualityTier) {
        *lock(&self.inner.tier) = tier;
    }

    /// Whether the placed geometry of `kind` is a proxy.
    pub fn showing_proxy(&self, kind: AssetKind) -> bool {
        lock(&self.inner.session).kinds[kind.index()].showing_proxy
    }

    pub fn is_viewing_proxy(&self) -> bool {
        self.showing_proxy(AssetKind::Mesh)
    }

    /// Every kind back to `Unloaded`, proxy bookkeeping cleared. Loads still in flight finish
    /// without touching the new session.
    pub fn reset(&self) {
        let mut session = lock(&self.inner.session);
        let generation = session.generation.wrapping_add(1);
        *session = Session {
            generation,
            ..Default::default()
        };
        tracing::debug!(generation, "load states reset");
    }

    /// Load `kind` if needed. Returns whether it is loaded; never returns an error.
    pub async fn ensure_loaded(&self, kind: AssetKind) -> bool {
        let (load, started) = {
            let mut session = lock(&self.inner.session);
            let generation = session.generation;
            let slot = &mut session.kinds[kind.index()];
            match slot.state {
                LoadState::Loaded => return true,
                LoadState::Error => return false,
                LoadState::Loading => (slot.in_flight.clone(), false),
                LoadState::Unloaded => {
                    let inner = Arc::clone(&self.inner);
                    let load = async move { inner.load(kind, generation).await }
                        .boxed()
                        .shared();
                    slot.state = LoadState::Loading;
                    slot.in_flight = Some(load.clone());
                    (Some(load), true)
                }
            }
        };
        if let (Some(load), true) = (&load, started) {
            tracing::debug!(%kind, "load started");
            // Runs to completion even if every caller stops waiting.
            tokio::spawn(load.clone());
        }
        match load {
            Some(load) => load.await,
            None => false,
        }
    }

    /// Swap the displayed mesh proxy for the full-resolution entry, reusing the background
    /// extraction. Returns `false` when no mesh proxy is being shown.
    pub async fn load_full_resolution(&self) -> Result<bool, ArchiveError> {
        let (transform, generation) = {
            let session = lock(&self.inner.session);
            if !session.kinds[AssetKind::Mesh.index()].showing_proxy {
                return Ok(false);
            }
            (session.full_mesh.transform, session.generation)
        };
        let payload = self.full_mesh_for_export().await?;
        self.inner
            .placement
            .swap(AssetKind::Mesh, &payload, &transform)?;
        let mut session = lock(&self.inner.session);
        if session.generation == generation {
            session.kinds[AssetKind::Mesh.index()].showing_proxy = false;
        }
        tracing::info!(file = payload.name(), "swapped mesh proxy for full resolution");
        Ok(true)
    }

    /// Full-resolution mesh payload. Waits for the background extraction when one is running
    /// rather than starting another; without one, extracts on demand.
    pub async fn full_mesh_for_export(&self) -> Result<Payload, ArchiveError> {
        let (background, file) = {
            let session = lock(&self.inner.session);
            (
                session.full_mesh.background.clone(),
                session.full_mesh.file.clone(),
            )
        };
        if let Some(background) = background {
            if let Some(payload) = background.await {
                return Ok(payload);
            }
        }
        let file = match file {
            Some(file) => file,
            None => self
                .inner
                .reader
                .primary_entry(Role::Mesh)
                .map(|e| e.entry.file_name)
                .ok_or_else(|| ArchiveError::NotFound("archive has no mesh entry".into()))?,
        };
        self.inner.reader.extract(&file).await
    }

    /// Wait for the background full-mesh extraction, if any. Returns whether it produced a payload.
    pub async fn wait_for_background(&self) -> Option<bool> {
        let background = lock(&self.inner.session).full_mesh.background.clone()?;
        Some(background.await.is_some())
    }
}

impl Inner {
    fn is_current(&self, generation: u64) -> bool {
        lock(&self.session).generation == generation
    }

    async fn load(self: Arc<Self>, kind: AssetKind, generation: u64) -> bool {
        self.observer.loading_started(kind);
        let placed = match self.extract_and_place(kind, generation).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(%kind, error = %e, "asset load failed");
                false
            }
        };
        let ok = {
            let mut session = lock(&self.session);
            if session.generation == generation {
                let slot = &mut session.kinds[kind.index()];
                slot.state = if placed { LoadState::Loaded } else { LoadState::Error };
                slot.in_flight = None;
                placed
            } else {
                tracing::debug!(%kind, generation, "load superseded by reset");
                false
            }
        };
        tracing::debug!(%kind, ok, "load settled");
        self.observer.loading_finished(kind, ok);
        ok
    }

    /// Places nothing when a reset happened during extraction.
    async fn extract_and_place(&self, kind: AssetKind, generation: u64) -> Result<(), ArchiveError> {
        let role = kind.role();
        let primary = self
            .reader
            .primary_entry(role)
            .ok_or_else(|| ArchiveError::NotFound(format!("archive has no {role} entry")))?;
        let transform = primary.entry.transform();
        let prefers_proxy = lock(&self.tier).prefers_proxy();

        let proxy = if prefers_proxy {
            self.reader.proxy_of(&primary.key)
        } else {
            None
        };
        let Some(proxy) = proxy else {
            let payload = self.reader.extract(&primary.entry.file_name).await?;
            if !self.is_current(generation) {
                return Ok(());
            }
            self.placement.place(kind, &payload, &transform)?;
            tracing::info!(%kind, key = %primary.key, size = payload.size(), "asset placed");
            return Ok(());
        };

        let payload = self.reader.extract(&proxy.entry.file_name).await?;
        if !self.is_current(generation) {
            return Ok(());
        }
        self.placement.place(kind, &payload, &transform)?;
        let background = (kind == AssetKind::Mesh)
            .then(|| self.spawn_full_extraction(primary.entry.file_name.clone()));

        let mut session = lock(&self.session);
        if session.generation == generation {
            session.kinds[kind.index()].showing_proxy = true;
            if let Some(background) = background {
                session.full_mesh = FullMesh {
                    file: Some(primary.entry.file_name),
                    transform,
                    background: Some(background),
                };
            }
        }
        tracing::info!(%kind, proxy = %proxy.key, primary = %primary.key, "proxy displayed");
        Ok(())
    }

    fn spawn_full_extraction(&self, file: String) -> SharedExtract {
        let reader = Arc::clone(&self.reader);
        let background = async move {
            match reader.extract(&file).await {
                Ok(payload) => Some(payload),
                Err(e) => {
                    tracing::warn!(file = %file, error = %e, "background full mesh extraction failed");
                    None
                }
            }
        }
        .boxed()
        .shared();
        tokio::spawn(background.clone());
        background
    }
}
