//! Explicit byte-payload handle shared by the builder, the reader and scene collaborators, so the
//! crate never depends on a host runtime's ambient binary-buffer type.

use std::fmt;

use bytes::Bytes;
use uuid::Uuid;

/// Identity of a payload. Clones of a [`Payload`] share the same id; two payloads
/// created separately never do, even with identical bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PayloadId(Uuid);

impl PayloadId {
    fn fresh() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Debug for PayloadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PayloadId({})", self.0)
    }
}

/// Tagged `{bytes, size, name, mime}` handle.
///
/// Bytes are reference counted, so cloning a handle is cheap and never copies data.
#[derive(Clone)]
pub struct Payload {
    id: PayloadId,
    bytes: Bytes,
    name: String,
    mime: &'static str,
}

impl Payload {
    /// Wrap bytes under a display/file name; MIME type is derived from the extension.
    pub fn new(bytes: impl Into<Bytes>, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id: PayloadId::fresh(),
            bytes: bytes.into(),
            mime: mime_for(&name),
            name,
        }
    }

    pub fn id(&self) -> PayloadId {
        self.id
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mime(&self) -> &'static str {
        self.mime
    }

    /// Lower-cased extension of the payload name, if any.
    pub fn extension(&self) -> Option<String> {
        extension_of(&self.name)
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Payload")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("size", &self.bytes.len())
            .field("mime", &self.mime)
            .finish()
    }
}

/// Lower-cased extension after the last `.` of the final path segment.
pub fn extension_of(name: &str) -> Option<String> {
    let file = name.rsplit('/').next().unwrap_or(name);
    match file.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => Some(ext.to_ascii_lowercase()),
        _ => None,
    }
}

/// MIME type for a file name, by extension.
pub fn mime_for(name: &str) -> &'static str {
    match extension_of(name).as_deref() {
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        Some("json") => "application/json",
        Some("pdf") => "application/pdf",
        Some("glb") => "model/gltf-binary",
        Some("gltf") => "model/gltf+json",
        Some("obj") => "model/obj",
        Some("stl") => "model/stl",
        Some("ply") => "application/ply",
        Some("splat" | "ksplat" | "spz" | "sog") => "application/x-gaussian-splat",
        Some("e57") => "application/x-e57",
        Some("las") => "application/vnd.las",
        Some("laz") => "application/vnd.laszip",
        _ => "application/octet-stream",
    }
}
