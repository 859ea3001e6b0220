//! Central-directory parsing and single-entry extraction over an in-memory container.

use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt};
use flate2::read::DeflateDecoder;
use memchr::memmem;

use super::{
    CENTRAL_HEADER_LEN, CENTRAL_HEADER_SIG, CompressionMethod, ContainerEntry,
    END_OF_CENTRAL_DIR_LEN, END_OF_CENTRAL_DIR_SIG, FLAG_ENCRYPTED, LOCAL_HEADER_LEN,
    LOCAL_HEADER_SIG,
};
use crate::errors::ArchiveError;

/// Largest possible archive comment; bounds the backwards search for the end record.
const MAX_COMMENT_LEN: usize = u16::MAX as usize;

/// Up-front inflate buffer, as a multiple of the compressed size.
const INITIAL_INFLATE_RATIO: u64 = 4;

fn malformed(msg: impl Into<String>) -> ArchiveError {
    ArchiveError::MalformedContainer(msg.into())
}

struct EndRecord {
    entries: u16,
    cd_size: u32,
    cd_offset: u32,
}

/// Locate the end record, scanning backwards. A candidate only counts when its comment length
/// reaches exactly to the end of the data.
fn find_end_record(data: &[u8]) -> Result<(usize, EndRecord), ArchiveError> {
    if data.len() < END_OF_CENTRAL_DIR_LEN {
        return Err(malformed("data too small for a container"));
    }
    let window_start = data
        .len()
        .saturating_sub(END_OF_CENTRAL_DIR_LEN + MAX_COMMENT_LEN);
    let window = &data[window_start..];
    let sig = END_OF_CENTRAL_DIR_SIG.to_le_bytes();

    for rel in memmem::rfind_iter(window, &sig) {
        let pos = window_start + rel;
        if pos + END_OF_CENTRAL_DIR_LEN > data.len() {
            continue;
        }
        let mut cur = Cursor::new(&data[pos + 4..pos + END_OF_CENTRAL_DIR_LEN]);
        let disk = cur.read_u16::<LittleEndian>()?;
        let cd_disk = cur.read_u16::<LittleEndian>()?;
        let _entries_on_disk = cur.read_u16::<LittleEndian>()?;
        let entries = cur.read_u16::<LittleEndian>()?;
        let cd_size = cur.read_u32::<LittleEndian>()?;
        let cd_offset = cur.read_u32::<LittleEndian>()?;
        let comment_len = cur.read_u16::<LittleEndian>()? as usize;
        if pos + END_OF_CENTRAL_DIR_LEN + comment_len != data.len() {
            continue;
        }
        if disk != 0 || cd_disk != 0 {
            return Err(malformed("multi-disk containers are not supported"));
        }
        return Ok((
            pos,
            EndRecord {
                entries,
                cd_size,
                cd_offset,
            },
        ));
    }
    Err(malformed("end of central directory not found"))
}

/// Parse every central-directory record of `data`.
pub fn read_central_directory(data: &[u8]) -> Result<Vec<ContainerEntry>, ArchiveError> {
    let (end_pos, end) = find_end_record(data)?;
    let cd_start = end.cd_offset as usize;
    let cd_end = cd_start + end.cd_size as usize;
    if cd_end > end_pos {
        return Err(malformed("central directory outside container"));
    }

    let mut cur = Cursor::new(&data[cd_start..cd_end]);
    let mut out = Vec::with_capacity(end.entries as usize);
    for _ in 0..end.entries {
        let remaining = (cd_end - cd_start) - cur.position() as usize;
        if remaining < CENTRAL_HEADER_LEN {
            return Err(malformed("truncated central directory"));
        }
        if cur.read_u32::<LittleEndian>()? != CENTRAL_HEADER_SIG {
            return Err(malformed("bad central directory signature"));
        }
        let _made_by = cur.read_u16::<LittleEndian>()?;
        let _needed = cur.read_u16::<LittleEndian>()?;
        let flags = cur.read_u16::<LittleEndian>()?;
        let method = CompressionMethod::from_code(cur.read_u16::<LittleEndian>()?);
        let _time = cur.read_u16::<LittleEndian>()?;
        let _date = cur.read_u16::<LittleEndian>()?;
        let crc32 = cur.read_u32::<LittleEndian>()?;
        let compressed_size = cur.read_u32::<LittleEndian>()? as u64;
        let size = cur.read_u32::<LittleEndian>()? as u64;
        let name_len = cur.read_u16::<LittleEndian>()? as usize;
        let extra_len = cur.read_u16::<LittleEndian>()? as usize;
        let comment_len = cur.read_u16::<LittleEndian>()? as usize;
        let _disk = cur.read_u16::<LittleEndian>()?;
        let _internal = cur.read_u16::<LittleEndian>()?;
        let _external = cur.read_u32::<LittleEndian>()?;
        let local_header_offset = cur.read_u32::<LittleEndian>()? as u64;

        let mut name_bytes = vec![0u8; name_len];
        cur.read_exact(&mut name_bytes)
            .map_err(|_| malformed("truncated entry name"))?;
        let name = String::from_utf8(name_bytes)
            .unwrap_or_else(|e| String::from_utf8_lossy(e.as_bytes()).into_owned());
        cur.set_position(cur.position() + (extra_len + comment_len) as u64);

        if local_header_offset as usize >= end_pos {
            return Err(malformed(format!("entry `{name}` starts outside container")));
        }
        out.push(ContainerEntry {
            name,
            method,
            flags,
            crc32,
            compressed_size,
            size,
            local_header_offset,
        });
    }
    Ok(out)
}

/// Decompress one entry and verify its size and CRC-32.
pub fn extract_entry(data: &[u8], entry: &ContainerEntry) -> Result<Vec<u8>, ArchiveError> {
    let decode_err = || ArchiveError::DecodeError(entry.name.clone());

    if entry.flags & FLAG_ENCRYPTED != 0 {
        return Err(decode_err());
    }
    let header_start = entry.local_header_offset as usize;
    let header = data
        .get(header_start..header_start + LOCAL_HEADER_LEN)
        .ok_or_else(decode_err)?;
    let mut cur = Cursor::new(header);
    if cur.read_u32::<LittleEndian>()? != LOCAL_HEADER_SIG {
        return Err(decode_err());
    }
    cur.set_position(26);
    let name_len = cur.read_u16::<LittleEndian>()? as usize;
    let extra_len = cur.read_u16::<LittleEndian>()? as usize;

    let start = header_start + LOCAL_HEADER_LEN + name_len + extra_len;
    let compressed = data
        .get(start..start + entry.compressed_size as usize)
        .ok_or_else(decode_err)?;

    let raw = match entry.method {
        CompressionMethod::Stored => compressed.to_vec(),
        CompressionMethod::Deflate => {
            // Header sizes are untrusted. Inflating stops one byte past the declared size.
            let capacity = entry.size.min(compressed.len() as u64 * INITIAL_INFLATE_RATIO);
            let mut out = Vec::with_capacity(capacity as usize);
            DeflateDecoder::new(compressed)
                .take(entry.size.saturating_add(1))
                .read_to_end(&mut out)
                .map_err(|e| {
                    tracing::debug!(name = %entry.name, error = %e, "inflate failed");
                    decode_err()
                })?;
            out
        }
        CompressionMethod::Unsupported(code) => {
            tracing::debug!(name = %entry.name, code, "unsupported compression method");
            return Err(decode_err());
        }
    };

    if raw.len() as u64 != entry.size || crc32fast::hash(&raw) != entry.crc32 {
        return Err(decode_err());
    }
    Ok(raw)
}
