//! Error types for the archive crate.
//!
//! This module defines the single error enumeration used by the builder, the
//! container codec, the reader and the asset loader. It integrates with
//! `thiserror` to provide `Display` implementations and source chaining.
//!
//! Notes:
//! - Hashing being unavailable is not an error; digest functions return `None`.
//! - Per-asset extraction failures never escape the load coordinator; they
//!   become `LoadState::Error` there.

use thiserror::Error;

use crate::manifest::ValidationIssue;

#[derive(Error, Debug)]
/// Unified error enumeration for archive operations.
pub enum ArchiveError {
    /// Builder state failed validation before packing. Carries every violated rule.
    #[error("archive is not valid: {}", join_issues(.0))]
    Validation(Vec<ValidationIssue>),

    /// Container bytes are not a readable archive or the manifest is missing/undecodable.
    #[error("malformed container: {0}")]
    MalformedContainer(String),

    /// Manifest declares a container version this crate does not read.
    #[error("unsupported container version `{0}`")]
    UnsupportedVersion(String),

    /// Requested entry has no index entry.
    #[error("entry not found: {0}")]
    NotFound(String),

    /// Entry is present but its bytes fail to decompress or verify.
    #[error("failed to decode `{0}`")]
    DecodeError(String),

    /// Remote container fetch failed.
    #[error("network error: {0}")]
    NetworkError(String),

    /// Raw container bytes were already released; uncached entries are gone.
    #[error("raw container buffer was released before `{0}` was extracted")]
    BufferReleased(String),

    /// The scene-placement collaborator rejected a payload.
    #[error("placement failed: {0}")]
    Placement(String),

    /// Invalid caller-supplied argument or configuration value.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// I/O error from an underlying reader or writer.
    #[error("IO Error: {0}")]
    IOError(#[from] std::io::Error),

    /// Manifest (de)serialization error.
    #[error("manifest json error: {0}")]
    Json(#[from] serde_json::Error),
}

fn join_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl ArchiveError {
    /// Whether the error is scoped to one entry rather than the whole archive.
    pub fn is_entry_level(&self) -> bool {
        matches!(
            self,
            ArchiveError::NotFound(_)
                | ArchiveError::DecodeError(_)
                | ArchiveError::BufferReleased(_)
                | ArchiveError::Placement(_)
        )
    }
}
