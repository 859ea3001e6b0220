//! Manifest schema shared by the write path and the read path.
//!
//! One definition of the manifest, its data entries and their transforms lives here, together
//! with the naming conventions ([`naming`]) and the single validator ([`validate`]) that both
//! [`crate::builder::ArchiveBuilder`] and [`crate::reader::ArchiveReader`] consume.

pub mod naming;
mod validate;

use std::{collections::BTreeMap, fmt};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub use validate::{PayloadIndex, ValidationIssue, ValidationReport, validate};

/// Container version written by this crate.
pub const CONTAINER_VERSION: &str = "1.0";

/// Container versions the reader accepts.
pub const SUPPORTED_VERSIONS: &[&str] = &[CONTAINER_VERSION];

/// Name of the manifest entry inside the container.
pub const MANIFEST_NAME: &str = "manifest.json";

/// Role of a packaged file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Scene,
    Mesh,
    Pointcloud,
    Derived,
    Thumbnail,
    Screenshot,
    Image,
    Source,
}

impl Role {
    /// Roles that count as a viewable primary asset.
    pub const PRIMARY: [Role; 3] = [Role::Scene, Role::Mesh, Role::Pointcloud];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Role::Scene => "scene",
            Role::Mesh => "mesh",
            Role::Pointcloud => "pointcloud",
            Role::Derived => "derived",
            Role::Thumbnail => "thumbnail",
            Role::Screenshot => "screenshot",
            Role::Image => "image",
            Role::Source => "source",
        }
    }

    pub fn is_primary_asset(&self) -> bool {
        Self::PRIMARY.contains(self)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Level-of-detail tag of a derived entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lod {
    Proxy,
    #[serde(other)]
    Other,
}

/// Placement transform with identity defaults applied.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    pub position: [f64; 3],
    pub rotation: [f64; 3],
    pub scale: f64,
}

impl Transform {
    pub const IDENTITY: Transform = Transform {
        position: [0.0; 3],
        rotation: [0.0; 3],
        scale: 1.0,
    };
}

impl Default for Transform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Transform as stored in `_parameters`; any field may be absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransformParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<[f64; 3]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation: Option<[f64; 3]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<f64>,
}

impl TransformParams {
    pub fn resolve(&self) -> Transform {
        Transform {
            position: self.position.unwrap_or([0.0; 3]),
            rotation: self.rotation.unwrap_or([0.0; 3]),
            scale: self.scale.unwrap_or(1.0),
        }
    }
}

impl From<Transform> for TransformParams {
    fn from(t: Transform) -> Self {
        Self {
            position: Some(t.position),
            rotation: Some(t.rotation),
            scale: Some(t.scale),
        }
    }
}

/// One packaged file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataEntry {
    pub file_name: String,
    pub role: Role,
    #[serde(default)]
    pub created_by: String,
    #[serde(rename = "_parameters", default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<TransformParams>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub derived_from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lod: Option<Lod>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub face_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_name: Option<String>,
}

impl DataEntry {
    pub fn new(file_name: impl Into<String>, role: Role) -> Self {
        Self {
            file_name: file_name.into(),
            role,
            created_by: String::new(),
            parameters: None,
            derived_from: None,
            lod: None,
            face_count: None,
            size_bytes: None,
            source_category: None,
            original_name: None,
        }
    }

    /// Transform with identity defaults for every missing field.
    pub fn transform(&self) -> Transform {
        self.parameters
            .as_ref()
            .map(TransformParams::resolve)
            .unwrap_or_default()
    }

    pub fn is_proxy(&self) -> bool {
        self.role == Role::Derived && self.lod == Some(Lod::Proxy)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectInfo {
    pub title: String,
    pub id: String,
    pub license: String,
    pub description: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Provenance {
    pub capture_device: String,
    pub capture_date: String,
    pub operator: String,
    pub location: String,
    pub processing_software: Vec<Value>,
    pub convention_hints: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Preservation {
    pub format_registry: BTreeMap<String, String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Per-kind alignment transforms applied on top of entry transforms.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalAlignment {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub splat: Option<TransformParams>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mesh: Option<TransformParams>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pointcloud: Option<TransformParams>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrityBlock {
    pub algorithm: String,
    pub manifest_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_file_hashes: Option<BTreeMap<String, String>>,
}

/// An annotation as stored in the manifest; fields beyond the id, title and body belong to the
/// annotation system and pass through untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Annotation {
    pub id: String,
    pub title: String,
    pub body: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionEntry {
    pub version: u32,
    pub date: DateTime<Utc>,
    pub description: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManifestMeta {
    pub custom_fields: BTreeMap<String, Value>,
    pub quality: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub packer: Option<String>,
}

/// Root metadata document of one archive.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Manifest {
    pub container_version: String,
    pub project: ProjectInfo,
    pub provenance: Provenance,
    pub quality_metrics: Map<String, Value>,
    pub archival_record: Map<String, Value>,
    pub relationships: Map<String, Value>,
    pub preservation: Preservation,
    pub viewer_settings: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alignment: Option<GlobalAlignment>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub integrity: Option<IntegrityBlock>,
    pub annotations: Vec<Annotation>,
    pub version_history: Vec<VersionEntry>,
    #[serde(rename = "_meta")]
    pub meta: ManifestMeta,
    pub data_entries: BTreeMap<String, DataEntry>,
}

impl Manifest {
    /// Empty manifest at the current container version.
    pub fn new() -> Self {
        Self {
            container_version: CONTAINER_VERSION.to_string(),
            ..Default::default()
        }
    }

    pub fn is_supported_version(&self) -> bool {
        SUPPORTED_VERSIONS.contains(&self.container_version.as_str())
    }

    /// Primary (scene, mesh or pointcloud) entries, by key.
    pub fn primary_entries(&self) -> impl Iterator<Item = (&String, &DataEntry)> {
        self.data_entries
            .iter()
            .filter(|(_, e)| e.role.is_primary_asset())
    }

    pub fn entries_with_role(&self, role: Role) -> impl Iterator<Item = (&String, &DataEntry)> {
        self.data_entries.iter().filter(move |(_, e)| e.role == role)
    }

    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    /// Missing transform fields fall back to identity.
    #[test]
    fn transform_defaults() {
        let mut e = DataEntry::new("assets/mesh_0.glb", Role::Mesh);
        assert_eq!(e.transform(), Transform::IDENTITY);
        e.parameters = Some(TransformParams {
            position: Some([1.0, 2.0, 3.0]),
            rotation: None,
            scale: None,
        });
        let t = e.transform();
        assert_eq!(t.position, [1.0, 2.0, 3.0]);
        assert_eq!(t.rotation, [0.0; 3]);
        assert_eq!(t.scale, 1.0);
    }

    /// Field names on the wire match the container layout, including the underscored ones.
    #[test]
    fn wire_field_names() {
        let mut m = Manifest::new();
        let mut e = DataEntry::new("assets/scene_0.ply", Role::Scene);
        e.parameters = Some(Transform::IDENTITY.into());
        m.data_entries.insert("scene_0".into(), e);
        m.meta.custom_fields.insert("site".into(), json!("north"));
        let v = serde_json::to_value(&m).unwrap();
        assert_eq!(v["container_version"], "1.0");
        assert_eq!(v["data_entries"]["scene_0"]["role"], "scene");
        assert_eq!(v["data_entries"]["scene_0"]["_parameters"]["scale"], 1.0);
        assert_eq!(v["_meta"]["custom_fields"]["site"], "north");
        assert!(v.get("integrity").is_none());
    }

    /// Unknown lod values and unknown section fields survive parsing.
    #[test]
    fn tolerant_parse() {
        let m = Manifest::from_json_slice(
            br#"{
                "container_version": "1.0",
                "project": {"title": "Kiln", "curator": "R. Ames"},
                "data_entries": {
                    "mesh_0_lite": {"file_name": "assets/x.glb", "role": "derived", "lod": "lite"}
                }
            }"#,
        )
        .unwrap();
        assert_eq!(m.project.title, "Kiln");
        assert_eq!(m.project.extra["curator"], "R. Ames");
        assert_eq!(m.data_entries["mesh_0_lite"].lod, Some(Lod::Other));
        assert!(!m.data_entries["mesh_0_lite"].is_proxy());
    }

    #[test]
    fn missing_version_is_unsupported() {
        let m = Manifest::from_json_slice(b"{}").unwrap();
        assert!(!m.is_supported_version());
        assert!(Manifest::new().is_supported_version());
    }
}
