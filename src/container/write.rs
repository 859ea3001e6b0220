//! Container writer. Layout:
//! - per entry: local header, name, payload (stored or raw DEFLATE)
//! - central directory: one record per entry, in write order
//! - end-of-central-directory record
//!
//! All integers are little-endian. No ZIP64: every size and offset must fit in 32 bits.

use std::{collections::HashSet, io::Write};

use byteorder::{LittleEndian, WriteBytesExt};
use chrono::{Datelike, NaiveDateTime, Timelike};
use flate2::{Compression, write::DeflateEncoder};

use super::{
    CENTRAL_HEADER_SIG, CompressionMethod, ContainerEntry, ContainerFormat,
    END_OF_CENTRAL_DIR_SIG, FLAG_UTF8, LOCAL_HEADER_SIG, VERSION_NEEDED,
};
use crate::errors::ArchiveError;

pub struct ContainerWriter {
    out: Vec<u8>,
    format: ContainerFormat,
    level: Compression,
    dos_time: u16,
    dos_date: u16,
    entries: Vec<ContainerEntry>,
    names: HashSet<String>,
}

impl ContainerWriter {
    pub fn new(format: ContainerFormat, deflate_level: u32, modified: NaiveDateTime) -> Self {
        let (dos_time, dos_date) = dos_datetime(modified);
        Self {
            out: Vec::new(),
            format,
            level: Compression::new(deflate_level.min(9)),
            dos_time,
            dos_date,
            entries: Vec::new(),
            names: HashSet::new(),
        }
    }

    /// Append one entry. Names must be unique within the container.
    pub fn add(&mut self, name: &str, data: &[u8]) -> Result<(), ArchiveError> {
        if name.is_empty() || name.len() > u16::MAX as usize {
            return Err(ArchiveError::InvalidArgument(format!(
                "entry name length out of range: `{name}`"
            )));
        }
        if !self.names.insert(name.to_string()) {
            return Err(ArchiveError::InvalidArgument(format!(
                "duplicate entry name `{name}`"
            )));
        }

        let method = self.format.method();
        let payload = match method {
            CompressionMethod::Deflate => {
                let mut encoder = DeflateEncoder::new(Vec::with_capacity(data.len() / 2), self.level);
                encoder.write_all(data)?;
                encoder.finish()?
            }
            _ => data.to_vec(),
        };

        let offset = self.out.len() as u64;
        let crc32 = crc32fast::hash(data);
        let entry = ContainerEntry {
            name: name.to_string(),
            method,
            flags: FLAG_UTF8,
            crc32,
            compressed_size: payload.len() as u64,
            size: data.len() as u64,
            local_header_offset: offset,
        };
        check_u32(entry.size, name)?;
        check_u32(entry.compressed_size, name)?;
        check_u32(offset, name)?;

        let out = &mut self.out;
        out.write_u32::<LittleEndian>(LOCAL_HEADER_SIG)?;
        out.write_u16::<LittleEndian>(VERSION_NEEDED)?;
        out.write_u16::<LittleEndian>(entry.flags)?;
        out.write_u16::<LittleEndian>(method.code())?;
        out.write_u16::<LittleEndian>(self.dos_time)?;
        out.write_u16::<LittleEndian>(self.dos_date)?;
        out.write_u32::<LittleEndian>(crc32)?;
        out.write_u32::<LittleEndian>(entry.compressed_size as u32)?;
        out.write_u32::<LittleEndian>(entry.size as u32)?;
        out.write_u16::<LittleEndian>(name.len() as u16)?;
        out.write_u16::<LittleEndian>(0)?;
        out.write_all(name.as_bytes())?;
        out.write_all(&payload)?;

        tracing::trace!(
            name,
            size = entry.size,
            compressed = entry.compressed_size,
            "container entry written"
        );
        self.entries.push(entry);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Write the central directory and end record, returning the container bytes.
    pub fn finish(mut self) -> Result<Vec<u8>, ArchiveError> {
        if self.entries.len() > u16::MAX as usize {
            return Err(ArchiveError::InvalidArgument(format!(
                "too many entries: {}",
                self.entries.len()
            )));
        }
        let cd_offset = self.out.len() as u64;
        check_u32(cd_offset, "central directory")?;

        let out = &mut self.out;
        for e in &self.entries {
            out.write_u32::<LittleEndian>(CENTRAL_HEADER_SIG)?;
            out.write_u16::<LittleEndian>(VERSION_NEEDED)?; // made by
            out.write_u16::<LittleEndian>(VERSION_NEEDED)?;
            out.write_u16::<LittleEndian>(e.flags)?;
            out.write_u16::<LittleEndian>(e.method.code())?;
            out.write_u16::<LittleEndian>(self.dos_time)?;
            out.write_u16::<LittleEndian>(self.dos_date)?;
            out.write_u32::<LittleEndian>(e.crc32)?;
            out.write_u32::<LittleEndian>(e.compressed_size as u32)?;
            out.write_u32::<LittleEndian>(e.size as u32)?;
            out.write_u16::<LittleEndian>(e.name.len() as u16)?;
            out.write_u16::<LittleEndian>(0)?; // extra
            out.write_u16::<LittleEndian>(0)?; // comment
            out.write_u16::<LittleEndian>(0)?; // disk
            out.write_u16::<LittleEndian>(0)?; // internal attrs
            out.write_u32::<LittleEndian>(0)?; // external attrs
            out.write_u32::<LittleEndian>(e.local_header_offset as u32)?;
            out.write_all(e.name.as_bytes())?;
        }
        let cd_size = out.len() as u64 - cd_offset;
        check_u32(cd_size, "central directory")?;

        let count = self.entries.len() as u16;
        out.write_u32::<LittleEndian>(END_OF_CENTRAL_DIR_SIG)?;
        out.write_u16::<LittleEndian>(0)?;
        out.write_u16::<LittleEndian>(0)?;
        out.write_u16::<LittleEndian>(count)?;
        out.write_u16::<LittleEndian>(count)?;
        out.write_u32::<LittleEndian>(cd_size as u32)?;
        out.write_u32::<LittleEndian>(cd_offset as u32)?;
        out.write_u16::<LittleEndian>(0)?;

        Ok(self.out)
    }
}

fn check_u32(v: u64, what: &str) -> Result<(), ArchiveError> {
    if v > u32::MAX as u64 {
        return Err(ArchiveError::InvalidArgument(format!(
            "`{what}` exceeds the 4 GiB container limit"
        )));
    }
    Ok(())
}

/// MS-DOS (time, date) pair; dates before 1980 clamp to 1980-01-01 00:00.
fn dos_datetime(t: NaiveDateTime) -> (u16, u16) {
    if t.year() < 1980 {
        return (0, (1 << 5) | 1);
    }
    let time = ((t.hour() as u16) << 11) | ((t.minute() as u16) << 5) | (t.second() as u16 / 2);
    let date = (((t.year() - 1980).min(127) as u16) << 9) | ((t.month() as u16) << 5) | t.day() as u16;
    (time, date)
}
