//! Archive builder: accumulates typed entries and metadata in memory, validates them with the
//! shared manifest validator, and packages manifest plus payloads into one container.
//!
//! Keys and paths follow [`crate::manifest::naming`]. Metadata setters shallow-merge into their
//! manifest section after translating caller field names through fixed tables, so
//! `{"accessionNumber": "1987.4"}` lands in `archival_record.accession_number`.

use std::{collections::HashMap, sync::Arc};

use bytes::Bytes;
use chrono::Utc;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};

use crate::{
    config::ArchiveConfig,
    container::{ContainerFormat, ContainerWriter},
    errors::ArchiveError,
    hash::{ContentDigest, DIGEST_ALGORITHM, HashCache, canonical_json_digest},
    manifest::{
        Annotation, DataEntry, GlobalAlignment, IntegrityBlock, Lod, MANIFEST_NAME, Manifest, Role,
        Transform, ValidationReport, VersionEntry,
        naming::{self, SourceNameAllocator},
        validate,
    },
    payload::{Payload, extension_of},
};

/// Caller field name → manifest field name, per section. Names not listed map to themselves.
type FieldTable = &'static [(&'static str, &'static str)];

const PROJECT_FIELDS: FieldTable = &[("projectId", "id"), ("projectTitle", "title")];

const PROVENANCE_FIELDS: FieldTable = &[
    ("captureDevice", "capture_device"),
    ("captureDate", "capture_date"),
    ("operatorName", "operator"),
    ("processingSoftware", "processing_software"),
    ("conventionHints", "convention_hints"),
];

const QUALITY_FIELDS: FieldTable = &[
    ("accuracyGrade", "accuracy_grade"),
    ("captureResolution", "capture_resolution"),
    ("alignmentError", "alignment_error"),
    ("scaleVerification", "scale_verification"),
];

const ARCHIVAL_FIELDS: FieldTable = &[
    ("accessionNumber", "accession_number"),
    ("collectionName", "collection_name"),
    ("rightsStatement", "rights_statement"),
    ("dateAccessioned", "date_accessioned"),
    ("physicalDescription", "physical_description"),
];

const RELATIONSHIP_FIELDS: FieldTable = &[
    ("partOf", "part_of"),
    ("derivedFrom", "derived_from"),
    ("relatedObjects", "related_objects"),
];

const PRESERVATION_FIELDS: FieldTable = &[
    ("formatRegistry", "format_registry"),
    ("significantProperties", "significant_properties"),
    ("renderingRequirements", "rendering_requirements"),
];

const VIEWER_FIELDS: FieldTable = &[
    ("backgroundColor", "background_color"),
    ("cameraPosition", "camera_position"),
    ("cameraTarget", "camera_target"),
    ("autoRotate", "auto_rotate"),
    ("displayMode", "display_mode"),
    ("singleSided", "single_sided"),
];

fn translate(table: FieldTable, key: &str) -> &str {
    table
        .iter()
        .find(|(from, _)| *from == key)
        .map(|(_, to)| *to)
        .unwrap_or(key)
}

/// Shallow-merge `fields` into `section`: listed keys overwrite, others stay as they were.
fn merge_section<T>(section: &mut T, fields: Value, table: FieldTable) -> Result<(), ArchiveError>
where
    T: Serialize + DeserializeOwned,
{
    let Value::Object(fields) = fields else {
        return Err(ArchiveError::InvalidArgument(
            "metadata fields must be a JSON object".into(),
        ));
    };
    let mut current = match serde_json::to_value(&*section)? {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    for (key, value) in fields {
        current.insert(translate(table, &key).to_string(), value);
    }
    *section = serde_json::from_value(Value::Object(current))?;
    Ok(())
}

/// Options for scene, mesh, point-cloud and proxy entries.
#[derive(Debug, Clone, Default)]
pub struct AssetOptions {
    pub transform: Option<Transform>,
    pub created_by: Option<String>,
    pub face_count: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct SourceFileOptions {
    pub category: Option<String>,
    pub created_by: Option<String>,
}

/// How `pack` writes the container.
#[derive(Debug, Clone)]
pub struct PackOptions {
    pub format: ContainerFormat,
    pub deflate_level: u32,
    pub include_hashes: bool,
}

impl Default for PackOptions {
    fn default() -> Self {
        Self::from(&ArchiveConfig::default())
    }
}

impl From<&ArchiveConfig> for PackOptions {
    fn from(config: &ArchiveConfig) -> Self {
        Self {
            format: config.format,
            deflate_level: config.deflate_level,
            include_hashes: config.include_hashes,
        }
    }
}

pub struct ArchiveBuilder {
    manifest: Manifest,
    files: HashMap<String, Payload>,
    order: Vec<String>,
    annotations: Vec<Annotation>,
    source_names: SourceNameAllocator,
    hash_cache: Arc<HashCache>,
}

impl Default for ArchiveBuilder {
    fn default() -> Self {
        Self::new(&ArchiveConfig::default())
    }
}

impl ArchiveBuilder {
    pub fn new(config: &ArchiveConfig) -> Self {
        Self::with_hash_cache(Arc::new(HashCache::new(config.hashing_available)))
    }

    /// Builder sharing an existing digest cache.
    pub fn with_hash_cache(hash_cache: Arc<HashCache>) -> Self {
        Self {
            manifest: Manifest::new(),
            files: HashMap::new(),
            order: Vec::new(),
            annotations: Vec::new(),
            source_names: SourceNameAllocator::new(),
            hash_cache,
        }
    }

    pub fn hash_cache(&self) -> &Arc<HashCache> {
        &self.hash_cache
    }

    fn register_file(&mut self, path: String, payload: Payload) -> Result<(), ArchiveError> {
        if path == MANIFEST_NAME || self.files.contains_key(&path) {
            return Err(ArchiveError::InvalidArgument(format!(
                "file `{path}` is already in the archive"
            )));
        }
        self.order.push(path.clone());
        self.files.insert(path, payload);
        Ok(())
    }

    fn unregister_file(&mut self, path: &str) {
        if self.files.remove(path).is_some() {
            self.order.retain(|p| p != path);
        }
    }

    fn role_count(&self, role: Role) -> usize {
        self.manifest.entries_with_role(role).count()
    }

    fn add_primary(
        &mut self,
        role: Role,
        payload: Payload,
        filename: &str,
        options: AssetOptions,
    ) -> Result<String, ArchiveError> {
        let key = naming::primary_key(role, self.role_count(role));
        let path = naming::asset_path(&key, extension_of(filename).as_deref());

        let mut entry = DataEntry::new(path.clone(), role);
        entry.created_by = options.created_by.unwrap_or_default();
        entry.parameters = Some(options.transform.unwrap_or_default().into());
        entry.face_count = options.face_count;
        entry.size_bytes = Some(payload.size() as u64);
        entry.original_name = Some(filename.to_string());

        self.register_file(path, payload)?;
        tracing::debug!(%key, file = %entry.file_name, "added {role} entry");
        self.manifest.data_entries.insert(key.clone(), entry);
        Ok(key)
    }

    pub fn add_scene(
        &mut self,
        payload: Payload,
        filename: &str,
        options: AssetOptions,
    ) -> Result<String, ArchiveError> {
        self.add_primary(Role::Scene, payload, filename, options)
    }

    pub fn add_mesh(
        &mut self,
        payload: Payload,
        filename: &str,
        options: AssetOptions,
    ) -> Result<String, ArchiveError> {
        self.add_primary(Role::Mesh, payload, filename, options)
    }

    pub fn add_pointcloud(
        &mut self,
        payload: Payload,
        filename: &str,
        options: AssetOptions,
    ) -> Result<String, ArchiveError> {
        self.add_primary(Role::Pointcloud, payload, filename, options)
    }

    /// Proxy of the most recently added primary of `role`. Without an explicit transform the
    /// proxy inherits the primary's.
    fn add_proxy(
        &mut self,
        role: Role,
        payload: Payload,
        filename: &str,
        options: AssetOptions,
    ) -> Result<String, ArchiveError> {
        let count = self.role_count(role);
        if count == 0 {
            return Err(ArchiveError::InvalidArgument(format!(
                "add a {role} entry before its proxy"
            )));
        }
        let primary_key = naming::primary_key(role, count - 1);
        let key = naming::proxy_key(&primary_key);
        if self.manifest.data_entries.contains_key(&key) {
            return Err(ArchiveError::InvalidArgument(format!("`{key}` already exists")));
        }
        let transform = options.transform.unwrap_or_else(|| {
            self.manifest
                .data_entries
                .get(&primary_key)
                .map(DataEntry::transform)
                .unwrap_or_default()
        });
        let path = naming::asset_path(&key, extension_of(filename).as_deref());

        let mut entry = DataEntry::new(path.clone(), Role::Derived);
        entry.created_by = options.created_by.unwrap_or_default();
        entry.parameters = Some(transform.into());
        entry.derived_from = Some(primary_key);
        entry.lod = Some(Lod::Proxy);
        entry.face_count = options.face_count;
        entry.size_bytes = Some(payload.size() as u64);
        entry.original_name = Some(filename.to_string());

        self.register_file(path, payload)?;
        tracing::debug!(%key, "added proxy");
        self.manifest.data_entries.insert(key.clone(), entry);
        Ok(key)
    }

    pub fn add_scene_proxy(
        &mut self,
        payload: Payload,
        filename: &str,
        options: AssetOptions,
    ) -> Result<String, ArchiveError> {
        self.add_proxy(Role::Scene, payload, filename, options)
    }

    pub fn add_mesh_proxy(
        &mut self,
        payload: Payload,
        filename: &str,
        options: AssetOptions,
    ) -> Result<String, ArchiveError> {
        self.add_proxy(Role::Mesh, payload, filename, options)
    }

    /// Raw source file kept for provenance, stored under a sanitized unique name.
    pub fn add_source_file(
        &mut self,
        payload: Payload,
        filename: &str,
        options: SourceFileOptions,
    ) -> Result<String, ArchiveError> {
        let key = format!("source_{}", self.role_count(Role::Source));
        let path = self.source_names.allocate(filename);

        let mut entry = DataEntry::new(path.clone(), Role::Source);
        entry.created_by = options.created_by.unwrap_or_default();
        entry.source_category = options.category;
        entry.size_bytes = Some(payload.size() as u64);
        entry.original_name = Some(filename.to_string());

        self.register_file(path, payload)?;
        self.manifest.data_entries.insert(key.clone(), entry);
        Ok(key)
    }

    /// The single preview image; a second call replaces the first.
    pub fn add_thumbnail(&mut self, payload: Payload, filename: &str) -> Result<String, ArchiveError> {
        let key = "thumbnail_0".to_string();
        if let Some(old) = self.manifest.data_entries.remove(&key) {
            self.unregister_file(&old.file_name);
        }
        let path = naming::thumbnail_path(extension_of(filename).as_deref());
        let mut entry = DataEntry::new(path.clone(), Role::Thumbnail);
        entry.size_bytes = Some(payload.size() as u64);
        self.register_file(path, payload)?;
        self.manifest.data_entries.insert(key.clone(), entry);
        Ok(key)
    }

    pub fn add_screenshot(&mut self, payload: Payload, filename: &str) -> Result<String, ArchiveError> {
        let n = self.role_count(Role::Screenshot);
        let key = format!("screenshot_{n}");
        let path = naming::screenshot_path(n, extension_of(filename).as_deref());
        let mut entry = DataEntry::new(path.clone(), Role::Screenshot);
        entry.size_bytes = Some(payload.size() as u64);
        self.register_file(path, payload)?;
        self.manifest.data_entries.insert(key.clone(), entry);
        Ok(key)
    }

    /// Image stored at a caller-chosen path, as referenced from rich-text annotation bodies.
    pub fn add_image(&mut self, payload: Payload, path: &str) -> Result<String, ArchiveError> {
        if path.is_empty()
            || path.starts_with('/')
            || path.contains('\\')
            || path.split('/').any(|seg| seg.is_empty() || seg == "..")
        {
            return Err(ArchiveError::InvalidArgument(format!("invalid image path `{path}`")));
        }
        let key = format!("image_{}", self.role_count(Role::Image));
        let mut entry = DataEntry::new(path, Role::Image);
        entry.size_bytes = Some(payload.size() as u64);
        self.register_file(path.to_string(), payload)?;
        self.manifest.data_entries.insert(key.clone(), entry);
        Ok(key)
    }

    pub fn set_project_info(&mut self, fields: Value) -> Result<(), ArchiveError> {
        merge_section(&mut self.manifest.project, fields, PROJECT_FIELDS)
    }

    pub fn set_provenance(&mut self, fields: Value) -> Result<(), ArchiveError> {
        merge_section(&mut self.manifest.provenance, fields, PROVENANCE_FIELDS)
    }

    pub fn set_quality_metrics(&mut self, fields: Value) -> Result<(), ArchiveError> {
        merge_section(&mut self.manifest.quality_metrics, fields, QUALITY_FIELDS)
    }

    pub fn set_archival_record(&mut self, fields: Value) -> Result<(), ArchiveError> {
        merge_section(&mut self.manifest.archival_record, fields, ARCHIVAL_FIELDS)
    }

    pub fn set_relationships(&mut self, fields: Value) -> Result<(), ArchiveError> {
        merge_section(&mut self.manifest.relationships, fields, RELATIONSHIP_FIELDS)
    }

    pub fn set_preservation(&mut self, fields: Value) -> Result<(), ArchiveError> {
        merge_section(&mut self.manifest.preservation, fields, PRESERVATION_FIELDS)
    }

    pub fn set_viewer_settings(&mut self, fields: Value) -> Result<(), ArchiveError> {
        merge_section(&mut self.manifest.viewer_settings, fields, VIEWER_FIELDS)
    }

    /// Capture/render statistics in `_meta.quality`.
    pub fn set_quality_stats(&mut self, fields: Value) -> Result<(), ArchiveError> {
        merge_section(&mut self.manifest.meta.quality, fields, QUALITY_FIELDS)
    }

    pub fn set_alignment(&mut self, alignment: GlobalAlignment) {
        self.manifest.alignment = Some(alignment);
    }

    /// Replace every custom field.
    pub fn set_custom_fields(&mut self, fields: impl IntoIterator<Item = (String, Value)>) {
        self.manifest.meta.custom_fields = fields.into_iter().collect();
    }

    pub fn add_custom_field(&mut self, key: impl Into<String>, value: Value) {
        self.manifest.meta.custom_fields.insert(key.into(), value);
    }

    pub fn set_annotations(&mut self, annotations: Vec<Annotation>) {
        self.manifest.annotations = annotations.clone();
        self.annotations = annotations;
    }

    pub fn add_annotation(&mut self, annotation: Annotation) {
        self.manifest.annotations.push(annotation.clone());
        self.annotations.push(annotation);
    }

    pub fn annotations(&self) -> &[Annotation] {
        &self.annotations
    }

    /// Append a version-history record; versions count up from 1.
    pub fn add_version_entry(&mut self, description: impl Into<String>) -> u32 {
        let version = self
            .manifest
            .version_history
            .iter()
            .map(|v| v.version)
            .max()
            .unwrap_or(0)
            + 1;
        self.manifest.version_history.push(VersionEntry {
            version,
            date: Utc::now(),
            description: description.into(),
        });
        version
    }

    /// Digest of a payload, memoized by payload identity; `None` when hashing is unavailable.
    pub async fn precompute_hash(&self, payload: &Payload) -> Option<ContentDigest> {
        self.hash_cache.precompute(payload).await
    }

    pub fn validate(&self) -> ValidationReport {
        validate(&self.manifest, &self.files)
    }

    /// The manifest as currently accumulated.
    pub fn preview_manifest(&self) -> &Manifest {
        &self.manifest
    }

    fn stamped_manifest(&self) -> Manifest {
        let mut manifest = self.manifest.clone();
        manifest.meta.created_at = Some(Utc::now());
        manifest.meta.packer = Some(format!(
            "{} {}",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION")
        ));
        manifest
    }

    /// Manifest JSON as it would be written, stamped with creation time and packer.
    pub fn generate_manifest(&self) -> Result<String, ArchiveError> {
        Ok(self.stamped_manifest().to_json_pretty()?)
    }

    /// File names in the order `pack` writes them (after the manifest).
    pub fn file_names(&self) -> &[String] {
        &self.order
    }

    /// Package manifest and payloads. Fails with every validation issue when invalid.
    pub async fn pack(
        &self,
        options: &PackOptions,
        mut on_progress: impl FnMut(f32),
    ) -> Result<Bytes, ArchiveError> {
        let report = self.validate();
        if !report.valid {
            return Err(ArchiveError::Validation(report.errors));
        }

        let mut manifest = self.stamped_manifest();
        manifest.integrity = None;
        if options.include_hashes {
            if self.hash_cache.is_available() {
                manifest.integrity = Some(self.integrity_block(&manifest).await?);
            } else {
                tracing::warn!("hashing unavailable, packing without integrity block");
            }
        }

        let total = self.order.len() + 1;
        let mut writer = ContainerWriter::new(
            options.format,
            options.deflate_level,
            manifest
                .meta
                .created_at
                .unwrap_or_else(Utc::now)
                .naive_utc(),
        );
        writer.add(MANIFEST_NAME, manifest.to_json_pretty()?.as_bytes())?;
        on_progress(1.0 / total as f32);

        for (i, path) in self.order.iter().enumerate() {
            tokio::task::yield_now().await;
            let payload = self
                .files
                .get(path)
                .ok_or_else(|| ArchiveError::NotFound(path.clone()))?;
            writer.add(path, payload.bytes())?;
            on_progress((i + 2) as f32 / total as f32);
        }

        let bytes = writer.finish()?;
        tracing::info!(
            entries = total,
            size = bytes.len(),
            format = ?options.format,
            "archive packed"
        );
        Ok(Bytes::from(bytes))
    }

    async fn integrity_block(&self, manifest: &Manifest) -> Result<IntegrityBlock, ArchiveError> {
        let mut per_file = std::collections::BTreeMap::new();
        for path in &self.order {
            let Some(payload) = self.files.get(path) else {
                continue;
            };
            if let Some(digest) = self.hash_cache.precompute(payload).await {
                per_file.insert(path.clone(), digest.to_hex());
            }
        }
        let mut unsigned = manifest.clone();
        unsigned.integrity = None;
        Ok(IntegrityBlock {
            algorithm: DIGEST_ALGORITHM.to_string(),
            manifest_hash: canonical_json_digest(&unsigned)?.to_hex(),
            per_file_hashes: Some(per_file),
        })
    }

    /// Back to an empty manifest, payload set and annotation list. The digest cache is kept.
    pub fn reset(&mut self) {
        self.manifest = Manifest::new();
        self.files.clear();
        self.order.clear();
        self.annotations.clear();
        self.source_names.clear();
        tracing::debug!(cached_digests = self.hash_cache.len(), "builder reset");
    }
}
