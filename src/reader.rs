//! Archive reader: opens container bytes, parses the manifest, indexes entries by role and
//! decompresses individual entries on demand.
//!
//! Containers are buffered fully in memory. Extracted payloads are cached per file name for the
//! life of the reader, so the raw buffer can be released once everything needed is extracted;
//! archives carrying source files keep it for later re-export.

use std::{
    collections::HashMap,
    path::Path,
    sync::{
        RwLock,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use serde::Serialize;

use crate::{
    config::ArchiveConfig,
    container::{ContainerIndex, extract_entry},
    errors::ArchiveError,
    hash::{ContentDigest, canonical_json_digest},
    manifest::{
        Annotation, DataEntry, GlobalAlignment, MANIFEST_NAME, Manifest, Role, Transform,
        ValidationReport, naming, validate,
    },
    payload::Payload,
    source::{ArchiveKey, HandleStore},
};

/// Which asset kinds an archive contains, derived from the manifest alone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ContentSummary {
    pub has_splat: bool,
    pub has_mesh: bool,
    pub has_pointcloud: bool,
    pub has_mesh_proxy: bool,
    pub has_scene_proxy: bool,
}

/// A manifest entry together with its key.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryRef {
    pub key: String,
    pub entry: DataEntry,
}

/// Listing metadata for a source file; no extraction needed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceFileInfo {
    pub key: String,
    pub file_name: String,
    pub original_name: String,
    pub category: Option<String>,
    pub size_bytes: Option<u64>,
}

/// Result of re-checking an archive's integrity block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IntegrityReport {
    /// False when the archive has no integrity block.
    pub checked: bool,
    pub manifest_ok: bool,
    pub mismatched: Vec<String>,
    pub unreadable: Vec<String>,
}

impl IntegrityReport {
    pub fn is_ok(&self) -> bool {
        self.checked && self.manifest_ok && self.mismatched.is_empty() && self.unreadable.is_empty()
    }
}

pub struct ArchiveReader {
    raw: RwLock<Option<Bytes>>,
    index: ContainerIndex,
    manifest: Option<Manifest>,
    roles: HashMap<Role, Vec<String>>,
    cache: DashMap<String, Payload>,
    extractions: AtomicUsize,
}

fn network(e: reqwest::Error) -> ArchiveError {
    ArchiveError::NetworkError(e.to_string())
}

impl ArchiveReader {
    /// Open in-memory container bytes and read the central directory.
    pub fn open(source: impl Into<Bytes>) -> Result<Self, ArchiveError> {
        let raw: Bytes = source.into();
        let index = ContainerIndex::parse(&raw)?;
        tracing::debug!(entries = index.len(), size = raw.len(), "container opened");
        Ok(Self {
            raw: RwLock::new(Some(raw)),
            index,
            manifest: None,
            roles: HashMap::new(),
            cache: DashMap::new(),
            extractions: AtomicUsize::new(0),
        })
    }

    /// Open bytes, refusing containers above `max_size`.
    pub fn open_with_limit(source: impl Into<Bytes>, max_size: u64) -> Result<Self, ArchiveError> {
        let raw: Bytes = source.into();
        if raw.len() as u64 > max_size {
            return Err(ArchiveError::InvalidArgument(format!(
                "container is {} bytes, limit is {max_size}",
                raw.len()
            )));
        }
        Self::open(raw)
    }

    /// Buffer a container from disk through a file handle, XOR-decoding with `key` if given.
    pub async fn open_path(
        path: impl AsRef<Path>,
        key: Option<ArchiveKey>,
        config: &ArchiveConfig,
        on_progress: impl FnMut(f32),
    ) -> Result<Self, ArchiveError> {
        let max = config.max_container_bytes()?;
        let store = HandleStore::new(key);
        let bytes = store.read_all(path, max, on_progress).await?;
        Self::open(bytes)
    }

    /// Fetch a container over HTTP(S) and open it.
    pub async fn open_from_location(
        url: &str,
        config: &ArchiveConfig,
        mut on_progress: impl FnMut(f32),
    ) -> Result<Self, ArchiveError> {
        let max = config.max_container_bytes()?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.fetch_timeout_secs))
            .build()
            .map_err(network)?;
        let mut response = client.get(url).send().await.map_err(network)?;
        if !response.status().is_success() {
            return Err(ArchiveError::NetworkError(format!(
                "GET {url} returned {}",
                response.status()
            )));
        }

        let total = response.content_length();
        if let Some(total) = total.filter(|t| *t > max) {
            return Err(ArchiveError::InvalidArgument(format!(
                "container is {total} bytes, limit is {max}"
            )));
        }
        let mut buf = BytesMut::with_capacity(total.unwrap_or(0) as usize);
        while let Some(chunk) = response.chunk().await.map_err(network)? {
            buf.extend_from_slice(&chunk);
            if buf.len() as u64 > max {
                return Err(ArchiveError::InvalidArgument(format!(
                    "container exceeds limit of {max} bytes"
                )));
            }
            if let Some(total) = total.filter(|t| *t > 0) {
                on_progress((buf.len() as f32 / total as f32).min(1.0));
            }
        }
        on_progress(1.0);
        tracing::info!(url, size = buf.len(), "container fetched");
        Self::open(buf.freeze())
    }

    /// Decode the manifest entry and build the role index.
    pub fn parse(&mut self) -> Result<&Manifest, ArchiveError> {
        let entry = self
            .index
            .get(MANIFEST_NAME)
            .ok_or_else(|| ArchiveError::MalformedContainer(format!("no `{MANIFEST_NAME}` entry")))?;
        let raw = self.raw_bytes(MANIFEST_NAME)?;
        let bytes = extract_entry(&raw, entry).map_err(|e| {
            ArchiveError::MalformedContainer(format!("manifest could not be decompressed: {e}"))
        })?;
        let manifest = Manifest::from_json_slice(&bytes)
            .map_err(|e| ArchiveError::MalformedContainer(format!("manifest is not valid: {e}")))?;
        if !manifest.is_supported_version() {
            return Err(ArchiveError::UnsupportedVersion(manifest.container_version));
        }

        let mut roles: HashMap<Role, Vec<String>> = HashMap::new();
        for (key, entry) in &manifest.data_entries {
            roles.entry(entry.role).or_default().push(key.clone());
        }
        for keys in roles.values_mut() {
            keys.sort_by(|a, b| natord::compare(a, b));
        }

        let report = validate(&manifest, &self.index);
        for issue in &report.errors {
            tracing::warn!(%issue, "manifest issue");
        }
        tracing::info!(
            title = %manifest.project.title,
            entries = manifest.data_entries.len(),
            "manifest parsed"
        );

        self.roles = roles;
        Ok(self.manifest.insert(manifest))
    }

    pub fn manifest(&self) -> Option<&Manifest> {
        self.manifest.as_ref()
    }

    fn raw_bytes(&self, for_name: &str) -> Result<Bytes, ArchiveError> {
        self.raw
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| ArchiveError::BufferReleased(for_name.to_string()))
    }

    fn entry_ref(&self, key: &str) -> Option<EntryRef> {
        let entry = self.manifest.as_ref()?.data_entries.get(key)?;
        Some(EntryRef {
            key: key.to_string(),
            entry: entry.clone(),
        })
    }

    fn keys(&self, role: Role) -> &[String] {
        self.roles.get(&role).map(Vec::as_slice).unwrap_or(&[])
    }

    fn proxies_of(&self, role: Role) -> impl Iterator<Item = &String> {
        let manifest = self.manifest.as_ref();
        self.keys(Role::Derived).iter().filter(move |key| {
            manifest
                .and_then(|m| {
                    let e = m.data_entries.get(*key)?;
                    let parent = m.data_entries.get(e.derived_from.as_ref()?)?;
                    Some(e.is_proxy() && parent.role == role)
                })
                .unwrap_or(false)
        })
    }

    pub fn content_summary(&self) -> ContentSummary {
        ContentSummary {
            has_splat: !self.keys(Role::Scene).is_empty(),
            has_mesh: !self.keys(Role::Mesh).is_empty(),
            has_pointcloud: !self.keys(Role::Pointcloud).is_empty(),
            has_mesh_proxy: self.proxies_of(Role::Mesh).next().is_some(),
            has_scene_proxy: self.proxies_of(Role::Scene).next().is_some(),
        }
    }

    /// Lowest-index entry of `role`.
    pub fn primary_entry(&self, role: Role) -> Option<EntryRef> {
        self.entry_ref(self.keys(role).first()?)
    }

    /// Proxy of the primary entry of `role`. Proxies of other entries of that role don't count.
    pub fn proxy_entry(&self, role: Role) -> Option<EntryRef> {
        self.proxy_of(self.keys(role).first()?)
    }

    /// Proxy whose `derived_from` is `primary_key`; the conventional `{key}_proxy` wins.
    pub fn proxy_of(&self, primary_key: &str) -> Option<EntryRef> {
        let derived_from_primary =
            |r: &EntryRef| r.entry.is_proxy() && r.entry.derived_from.as_deref() == Some(primary_key);
        self.entry_ref(&naming::proxy_key(primary_key))
            .filter(derived_from_primary)
            .or_else(|| {
                self.keys(Role::Derived)
                    .iter()
                    .filter_map(|k| self.entry_ref(k))
                    .find(derived_from_primary)
            })
    }

    pub fn entry_transform(&self, entry: &DataEntry) -> Transform {
        entry.transform()
    }

    pub fn global_alignment(&self) -> Option<&GlobalAlignment> {
        self.manifest.as_ref()?.alignment.as_ref()
    }

    pub fn annotations(&self) -> &[Annotation] {
        self.manifest
            .as_ref()
            .map(|m| m.annotations.as_slice())
            .unwrap_or(&[])
    }

    pub fn image_entries(&self) -> Vec<EntryRef> {
        self.keys(Role::Image)
            .iter()
            .filter_map(|k| self.entry_ref(k))
            .collect()
    }

    pub fn source_file_entries(&self) -> Vec<SourceFileInfo> {
        self.keys(Role::Source)
            .iter()
            .filter_map(|k| self.entry_ref(k))
            .map(|r| SourceFileInfo {
                original_name: r
                    .entry
                    .original_name
                    .clone()
                    .unwrap_or_else(|| r.entry.file_name.clone()),
                file_name: r.entry.file_name,
                category: r.entry.source_category,
                size_bytes: r.entry.size_bytes,
                key: r.key,
            })
            .collect()
    }

    /// Container entry names in container order.
    pub fn entry_names(&self) -> Vec<&str> {
        self.index.entries().iter().map(|e| e.name.as_str()).collect()
    }

    /// Validate the parsed manifest against the entries actually present.
    pub fn validate(&self) -> Option<ValidationReport> {
        Some(validate(self.manifest.as_ref()?, &self.index))
    }

    /// Decompress one entry; repeated requests are served from the cache.
    pub async fn extract(&self, file_name: &str) -> Result<Payload, ArchiveError> {
        if let Some(hit) = self.cache.get(file_name) {
            return Ok(hit.clone());
        }
        let entry = self
            .index
            .get(file_name)
            .ok_or_else(|| ArchiveError::NotFound(file_name.to_string()))?;
        let raw = self.raw_bytes(file_name)?;
        tokio::task::yield_now().await;

        let bytes = extract_entry(&raw, entry)?;
        self.extractions.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(file_name, size = bytes.len(), "entry extracted");

        let payload = self
            .cache
            .entry(file_name.to_string())
            .or_insert_with(|| Payload::new(bytes, file_name))
            .clone();
        Ok(payload)
    }

    pub fn is_extracted(&self, file_name: &str) -> bool {
        self.cache.contains_key(file_name)
    }

    /// Number of decompressions performed (cache hits excluded).
    pub fn extraction_count(&self) -> usize {
        self.extractions.load(Ordering::Relaxed)
    }

    pub fn has_source_files(&self) -> bool {
        !self.keys(Role::Source).is_empty()
    }

    pub fn has_raw_buffer(&self) -> bool {
        self.raw.read().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    /// Drop the compressed container bytes, keeping extracted payloads. Refused (returns false)
    /// while source files need the buffer for re-export.
    pub fn release_raw_buffer(&self) -> bool {
        if self.has_source_files() {
            tracing::debug!("raw buffer retained: archive carries source files");
            return false;
        }
        let released = self
            .raw
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(bytes) = &released {
            tracing::info!(size = bytes.len(), "raw container buffer released");
        }
        released.is_some()
    }

    /// Release every cached payload and the raw buffer.
    pub fn dispose(&self) {
        self.cache.clear();
        self.raw.write().unwrap_or_else(|e| e.into_inner()).take();
        tracing::debug!("reader disposed");
    }

    /// Recompute the manifest hash and every per-file hash recorded in the integrity block.
    pub async fn verify_integrity(&self) -> Result<IntegrityReport, ArchiveError> {
        let manifest = self
            .manifest
            .as_ref()
            .ok_or_else(|| ArchiveError::InvalidArgument("parse the manifest first".into()))?;
        let Some(integrity) = &manifest.integrity else {
            return Ok(IntegrityReport::default());
        };

        let mut unsigned = manifest.clone();
        unsigned.integrity = None;
        let manifest_ok = canonical_json_digest(&unsigned)?.to_hex() == integrity.manifest_hash;

        let mut report = IntegrityReport {
            checked: true,
            manifest_ok,
            ..Default::default()
        };
        for (file_name, expected) in integrity.per_file_hashes.iter().flatten() {
            match self.extract(file_name).await {
                Ok(payload) => {
                    if ContentDigest::compute(payload.bytes()).to_hex() != *expected {
                        report.mismatched.push(file_name.clone());
                    }
                }
                Err(e) => {
                    tracing::warn!(file_name, error = %e, "integrity check could not read entry");
                    report.unreadable.push(file_name.clone());
                }
            }
        }
        if !report.is_ok() {
            tracing::warn!(?report, "integrity verification failed");
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        builder::{ArchiveBuilder, AssetOptions, PackOptions},
        container::{ContainerFormat, ContainerWriter},
    };

    fn p(name: &str, body: &[u8]) -> Payload {
        Payload::new(body.to_vec(), name)
    }

    async fn sample(with_source: bool) -> Bytes {
        let mut b = ArchiveBuilder::default();
        b.set_project_info(json!({"title": "Chapel"})).unwrap();
        b.add_scene(p("s.ply", b"splat"), "s.ply", Default::default()).unwrap();
        b.add_mesh(
            p("m.glb", b"mesh-full"),
            "m.glb",
            AssetOptions {
                transform: Some(Transform {
                    position: [0.0, 1.0, 0.0],
                    rotation: [0.0; 3],
                    scale: 0.5,
                }),
                ..Default::default()
            },
        )
        .unwrap();
        b.add_mesh_proxy(p("m_lo.glb", b"mesh-lo"), "m_lo.glb", Default::default())
            .unwrap();
        b.add_image(p("fig.png", b"png"), "images/fig.png").unwrap();
        if with_source {
            b.add_source_file(p("raw.e57", b"raw"), "raw.e57", Default::default())
                .unwrap();
        }
        b.pack(&PackOptions::default(), |_| {}).await.unwrap()
    }

    #[tokio::test]
    async fn parse_and_index() {
        let mut r = ArchiveReader::open(sample(false).await).unwrap();
        assert_eq!(r.content_summary(), ContentSummary::default());
        r.parse().unwrap();

        let summary = r.content_summary();
        assert!(summary.has_splat && summary.has_mesh && summary.has_mesh_proxy);
        assert!(!summary.has_pointcloud && !summary.has_scene_proxy);

        let mesh = r.primary_entry(Role::Mesh).unwrap();
        assert_eq!(mesh.key, "mesh_0");
        assert_eq!(r.entry_transform(&mesh.entry).scale, 0.5);
        assert_eq!(r.proxy_entry(Role::Mesh).unwrap().key, "mesh_0_proxy");
        assert!(r.proxy_entry(Role::Scene).is_none());
        assert_eq!(r.image_entries().len(), 1);
        assert_eq!(r.entry_names()[0], MANIFEST_NAME);
        assert!(r.validate().unwrap().valid);
        assert!(!r.has_source_files());
    }

    /// Second extraction of the same path is served from cache.
    #[tokio::test]
    async fn extract_caches() {
        let mut r = ArchiveReader::open(sample(false).await).unwrap();
        r.parse().unwrap();
        let a = r.extract("assets/mesh_0.glb").await.unwrap();
        let b = r.extract("assets/mesh_0.glb").await.unwrap();
        assert_eq!(&a.bytes()[..], b"mesh-full");
        assert_eq!(a.id(), b.id());
        assert_eq!(r.extraction_count(), 1);
        let err = r.extract("assets/missing.ply").await.unwrap_err();
        assert!(matches!(err, ArchiveError::NotFound(_)));
    }

    #[tokio::test]
    async fn release_keeps_extracted_payloads() {
        let mut r = ArchiveReader::open(sample(false).await).unwrap();
        r.parse().unwrap();
        r.extract("assets/scene_0.ply").await.unwrap();
        assert!(r.release_raw_buffer());
        assert!(!r.has_raw_buffer());
        assert!(!r.release_raw_buffer());
        assert!(r.extract("assets/scene_0.ply").await.is_ok());
        let err = r.extract("assets/mesh_0.glb").await.unwrap_err();
        assert!(matches!(err, ArchiveError::BufferReleased(_)));

        r.dispose();
        assert!(!r.is_extracted("assets/scene_0.ply"));
    }

    /// Source files pin the raw buffer.
    #[tokio::test]
    async fn source_files_block_release() {
        let mut r = ArchiveReader::open(sample(true).await).unwrap();
        r.parse().unwrap();
        assert!(r.has_source_files());
        assert!(!r.release_raw_buffer());
        assert!(r.has_raw_buffer());
        let sources = r.source_file_entries();
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].original_name, "raw.e57");
        assert_eq!(sources[0].file_name, "sources/raw.e57");
    }

    #[tokio::test]
    async fn missing_or_bad_manifest_is_malformed() {
        let when = chrono::Utc::now().naive_utc();
        let mut w = ContainerWriter::new(ContainerFormat::Stored, 6, when);
        w.add("assets/scene_0.ply", b"x").unwrap();
        let mut r = ArchiveReader::open(w.finish().unwrap()).unwrap();
        assert!(matches!(r.parse(), Err(ArchiveError::MalformedContainer(_))));

        let mut w = ContainerWriter::new(ContainerFormat::Stored, 6, when);
        w.add(MANIFEST_NAME, b"{ not json").unwrap();
        let mut r = ArchiveReader::open(w.finish().unwrap()).unwrap();
        assert!(matches!(r.parse(), Err(ArchiveError::MalformedContainer(_))));

        let mut w = ContainerWriter::new(ContainerFormat::Stored, 6, when);
        w.add(MANIFEST_NAME, br#"{"container_version": "9.9"}"#).unwrap();
        let mut r = ArchiveReader::open(w.finish().unwrap()).unwrap();
        assert!(matches!(r.parse(), Err(ArchiveError::UnsupportedVersion(v)) if v == "9.9"));

        assert!(matches!(
            ArchiveReader::open(Bytes::from_static(b"garbage bytes here, not a container")),
            Err(ArchiveError::MalformedContainer(_))
        ));
    }

    #[test]
    fn size_limit_enforced() {
        let err = ArchiveReader::open_with_limit(vec![0u8; 64], 16).err().unwrap();
        assert!(matches!(err, ArchiveError::InvalidArgument(_)));
    }

    /// A proxy of a later mesh is not the proxy of the first one.
    #[tokio::test]
    async fn proxy_belongs_to_its_primary() {
        let mut b = ArchiveBuilder::default();
        b.set_project_info(json!({"title": "Pair"})).unwrap();
        b.add_mesh(p("a.glb", b"a"), "a.glb", Default::default()).unwrap();
        b.add_mesh(p("b.glb", b"b"), "b.glb", Default::default()).unwrap();
        b.add_mesh_proxy(p("b_lo.glb", b"lo"), "b_lo.glb", Default::default())
            .unwrap();
        let mut r = ArchiveReader::open(b.pack(&PackOptions::default(), |_| {}).await.unwrap()).unwrap();
        r.parse().unwrap();

        assert!(r.content_summary().has_mesh_proxy);
        assert!(r.proxy_entry(Role::Mesh).is_none());
        assert!(r.proxy_of("mesh_0").is_none());
        let proxy = r.proxy_of("mesh_1").unwrap();
        assert_eq!(proxy.key, "mesh_1_proxy");
        assert_eq!(proxy.entry.derived_from.as_deref(), Some("mesh_1"));
    }

    /// Role ordering is numeric, so mesh_10 sorts after mesh_2.
    #[tokio::test]
    async fn natural_key_order() {
        let mut b = ArchiveBuilder::default();
        b.set_project_info(json!({"title": "Many"})).unwrap();
        for i in 0..11 {
            let name = format!("m{i}.glb");
            b.add_mesh(p(&name, name.as_bytes()), &name, Default::default())
                .unwrap();
        }
        let bytes = b.pack(&PackOptions::default(), |_| {}).await.unwrap();
        let mut r = ArchiveReader::open(bytes).unwrap();
        r.parse().unwrap();
        assert_eq!(r.primary_entry(Role::Mesh).unwrap().key, "mesh_0");
        assert_eq!(r.keys(Role::Mesh).last().unwrap(), "mesh_10");
    }
}
