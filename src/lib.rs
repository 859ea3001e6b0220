//! Vitrine-Archive: a Rust library for packaged 3D-asset archives (splat scenes, meshes, point
//! clouds, their low-detail proxies, annotations and provenance metadata) in one container.
//!
//! Goals
//! - One manifest schema and one validator shared by the write and read paths.
//! - Build, validate, hash and pack archives in memory.
//! - Open archives from bytes, disk or HTTP and decompress entries lazily.
//! - Load renderable assets in phases without blocking interactive use.
//!
//! Core Capabilities
//! - Container: ZIP-compatible layout with a stored (`.a3d`) and a DEFLATE (`.a3z`) variant;
//!   CRC-32 verified on every extraction.
//! - Integrity: optional SHA-256 per-file and canonical manifest hashes, verifiable on read.
//! - Loading: per-kind state machine with shared in-flight loads, SD/HD proxy policy and
//!   buffer release once everything needed is extracted.
//!
//! Modules
//! - `manifest`: schema, naming conventions, shared validator.
//! - `builder`: `ArchiveBuilder` accumulates entries and metadata, then packs.
//! - `container`: low-level container writer and central-directory reader.
//! - `reader`: `ArchiveReader` parses, indexes and extracts.
//! - `loader`: load coordinator, phased pipeline, quality-tier resolver.
//! - `source`: file handles and keyed XOR de-obfuscation for on-disk containers.
//! - `hash`, `payload`, `config`, `errors`: shared building blocks.
//!
//! Typical Usage
//! - Write: `ArchiveBuilder::add_mesh` + `set_project_info`, then `pack`.
//! - Read: `ArchiveReader::open` (or `open_path` / `open_from_location`), then
//!   `LoadPipeline::open` and `LoadPipeline::load(display_mode)`.

pub mod builder;
pub mod config;
pub mod container;
pub mod errors;
pub mod hash;
pub mod loader;
pub mod manifest;
pub mod payload;
pub mod reader;
pub mod source;

pub use builder::{ArchiveBuilder, AssetOptions, PackOptions, SourceFileOptions};
pub use config::ArchiveConfig;
pub use errors::ArchiveError;
pub use loader::{AssetKind, LoadCoordinator, LoadPipeline, LoadState, QualityTier};
pub use manifest::{Manifest, Role, Transform};
pub use payload::Payload;
pub use reader::{ArchiveReader, ContentSummary};
