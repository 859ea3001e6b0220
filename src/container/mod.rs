//! Packaged container format: a ZIP-compatible layout (local headers, central directory,
//! end-of-central-directory record) holding the manifest plus every payload.
//!
//! Two variants share the same layout and manifest schema: [`ContainerFormat::Stored`] keeps
//! entries uncompressed, [`ContainerFormat::Deflate`] compresses each entry with raw DEFLATE.
//! Every entry carries a CRC-32 that is checked on extraction.

mod read;
mod write;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub use read::{extract_entry, read_central_directory};
pub use write::ContainerWriter;

use crate::manifest::PayloadIndex;

pub(crate) const LOCAL_HEADER_SIG: u32 = 0x0403_4b50;
pub(crate) const CENTRAL_HEADER_SIG: u32 = 0x0201_4b50;
pub(crate) const END_OF_CENTRAL_DIR_SIG: u32 = 0x0605_4b50;

pub(crate) const LOCAL_HEADER_LEN: usize = 30;
pub(crate) const CENTRAL_HEADER_LEN: usize = 46;
pub(crate) const END_OF_CENTRAL_DIR_LEN: usize = 22;

/// Version needed to extract: 2.0 (deflate).
pub(crate) const VERSION_NEEDED: u16 = 20;
/// General purpose flag bit 11: names are UTF-8.
pub(crate) const FLAG_UTF8: u16 = 1 << 11;
pub(crate) const FLAG_ENCRYPTED: u16 = 1;

/// Container variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerFormat {
    Stored,
    #[default]
    Deflate,
}

impl ContainerFormat {
    pub fn method(&self) -> CompressionMethod {
        match self {
            ContainerFormat::Stored => CompressionMethod::Stored,
            ContainerFormat::Deflate => CompressionMethod::Deflate,
        }
    }

    /// Conventional file extension for the variant.
    pub fn extension(&self) -> &'static str {
        match self {
            ContainerFormat::Stored => "a3d",
            ContainerFormat::Deflate => "a3z",
        }
    }
}

/// Per-entry compression method code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionMethod {
    Stored,
    Deflate,
    Unsupported(u16),
}

impl CompressionMethod {
    pub fn code(&self) -> u16 {
        match self {
            CompressionMethod::Stored => 0,
            CompressionMethod::Deflate => 8,
            CompressionMethod::Unsupported(c) => *c,
        }
    }

    pub fn from_code(code: u16) -> Self {
        match code {
            0 => CompressionMethod::Stored,
            8 => CompressionMethod::Deflate,
            other => CompressionMethod::Unsupported(other),
        }
    }
}

/// Central-directory record of one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerEntry {
    pub name: String,
    pub method: CompressionMethod,
    pub flags: u16,
    pub crc32: u32,
    pub compressed_size: u64,
    pub size: u64,
    pub local_header_offset: u64,
}

/// Name-addressable view of a container's central directory.
#[derive(Debug, Clone, Default)]
pub struct ContainerIndex {
    entries: Vec<ContainerEntry>,
    by_name: HashMap<String, usize>,
}

impl ContainerIndex {
    /// Read the central directory of `data`.
    pub fn parse(data: &[u8]) -> Result<Self, crate::errors::ArchiveError> {
        Ok(Self::from_entries(read_central_directory(data)?))
    }

    pub fn from_entries(entries: Vec<ContainerEntry>) -> Self {
        let by_name = entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.name.clone(), i))
            .collect();
        Self { entries, by_name }
    }

    pub fn get(&self, name: &str) -> Option<&ContainerEntry> {
        self.by_name.get(name).map(|&i| &self.entries[i])
    }

    /// Entries in container order.
    pub fn entries(&self) -> &[ContainerEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl PayloadIndex for ContainerIndex {
    fn contains_file(&self, file_name: &str) -> bool {
        self.by_name.contains_key(file_name)
    }
}
