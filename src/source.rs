//! Random-access container sources on disk.
//!
//! A [`HandleStore`] keeps files open behind opaque ids so callers can read byte ranges without
//! holding the file themselves. When an [`ArchiveKey`] is configured, every byte read at absolute
//! offset `o` is XOR-decoded with `key[o % key.len()]`.

use std::{collections::HashMap, io::SeekFrom, path::Path};

use bytes::{Bytes, BytesMut};
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt},
    sync::Mutex,
};
use uuid::Uuid;

use crate::errors::ArchiveError;

/// Chunk size used when buffering a whole container from a handle.
pub const READ_CHUNK: u32 = 8 << 20;

/// Repeating XOR key for obfuscated containers.
#[derive(Clone, PartialEq, Eq)]
pub struct ArchiveKey(Vec<u8>);

impl ArchiveKey {
    pub fn new(key: Vec<u8>) -> Result<Self, ArchiveError> {
        if key.is_empty() {
            return Err(ArchiveError::InvalidArgument("archive key is empty".into()));
        }
        Ok(Self(key))
    }

    pub fn from_hex(s: &str) -> Result<Self, ArchiveError> {
        let key = hex::decode(s.trim())
            .map_err(|e| ArchiveError::InvalidArgument(format!("archive key: {e}")))?;
        Self::new(key)
    }

    /// XOR `buf`, which starts at absolute container offset `offset`. Applying twice restores it.
    pub fn apply(&self, offset: u64, buf: &mut [u8]) {
        let n = self.0.len() as u64;
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte ^= self.0[((offset + i as u64) % n) as usize];
        }
    }
}

impl std::fmt::Debug for ArchiveKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ArchiveKey({} bytes)", self.0.len())
    }
}

struct FileHandle {
    file: File,
    size: u64,
}

/// Open file handles addressed by id.
#[derive(Default)]
pub struct HandleStore {
    handles: Mutex<HashMap<Uuid, FileHandle>>,
    key: Option<ArchiveKey>,
}

impl HandleStore {
    pub fn new(key: Option<ArchiveKey>) -> Self {
        Self {
            handles: Mutex::new(HashMap::new()),
            key,
        }
    }

    /// Open `path`, returning a handle id and the file size. The handle stays open until closed.
    pub async fn open(&self, path: impl AsRef<Path>) -> Result<(Uuid, u64), ArchiveError> {
        let path = path.as_ref();
        let file = File::open(path).await?;
        let size = file.metadata().await?.len();
        let id = Uuid::new_v4();
        self.handles.lock().await.insert(id, FileHandle { file, size });
        tracing::debug!(path = %path.display(), size, %id, "opened container handle");
        Ok((id, size))
    }

    /// Read exactly `length` bytes at `offset`, decoded with the store's key if any.
    pub async fn read_bytes(&self, id: Uuid, offset: u64, length: u32) -> Result<Vec<u8>, ArchiveError> {
        let mut handles = self.handles.lock().await;
        let handle = handles
            .get_mut(&id)
            .ok_or_else(|| ArchiveError::InvalidArgument(format!("invalid file handle: {id}")))?;
        if offset + length as u64 > handle.size {
            return Err(ArchiveError::InvalidArgument(format!(
                "read of {length} bytes at {offset} past end of {}-byte file",
                handle.size
            )));
        }
        handle.file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; length as usize];
        handle.file.read_exact(&mut buf).await?;
        if let Some(key) = &self.key {
            key.apply(offset, &mut buf);
        }
        Ok(buf)
    }

    /// Close a handle. Unknown ids are ignored.
    pub async fn close(&self, id: Uuid) {
        self.handles.lock().await.remove(&id);
    }

    pub async fn open_handles(&self) -> usize {
        self.handles.lock().await.len()
    }

    /// Buffer the whole file through a handle, reporting fractional progress.
    pub async fn read_all(
        &self,
        path: impl AsRef<Path>,
        max_size: u64,
        mut on_progress: impl FnMut(f32),
    ) -> Result<Bytes, ArchiveError> {
        let (id, size) = self.open(path).await?;
        let result = async {
            if size > max_size {
                return Err(ArchiveError::InvalidArgument(format!(
                    "container is {size} bytes, limit is {max_size}"
                )));
            }
            let mut buf = BytesMut::with_capacity(size as usize);
            let mut offset = 0u64;
            while offset < size {
                let len = (size - offset).min(READ_CHUNK as u64) as u32;
                buf.extend_from_slice(&self.read_bytes(id, offset, len).await?);
                offset += len as u64;
                on_progress(offset as f32 / size as f32);
            }
            Ok(buf.freeze())
        }
        .await;
        self.close(id).await;
        result
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn key_parsing() {
        assert!(ArchiveKey::from_hex("").is_err());
        assert!(ArchiveKey::from_hex("zz").is_err());
        assert!(ArchiveKey::from_hex("a1b2").is_ok());
    }

    /// The key position follows the absolute offset, so chunked decoding matches whole decoding.
    #[test]
    fn xor_is_offset_aligned() {
        let key = ArchiveKey::from_hex("0102ff").unwrap();
        let plain: Vec<u8> = (0u8..20).collect();
        let mut whole = plain.clone();
        key.apply(0, &mut whole);

        let mut chunked = plain.clone();
        let (a, b) = chunked.split_at_mut(7);
        key.apply(0, a);
        key.apply(7, b);
        assert_eq!(whole, chunked);

        key.apply(0, &mut whole);
        assert_eq!(whole, plain);
    }

    #[tokio::test]
    async fn handle_reads_ranges_and_closes() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"0123456789").unwrap();
        let store = HandleStore::new(None);
        let (id, size) = store.open(tmp.path()).await.unwrap();
        assert_eq!(size, 10);
        assert_eq!(store.read_bytes(id, 3, 4).await.unwrap(), b"3456");
        assert!(store.read_bytes(id, 8, 4).await.is_err());
        store.close(id).await;
        assert_eq!(store.open_handles().await, 0);
        assert!(store.read_bytes(id, 0, 1).await.is_err());
    }

    #[tokio::test]
    async fn read_all_decodes_with_key() {
        let key = ArchiveKey::from_hex("5a").unwrap();
        let mut data = b"obfuscated container".to_vec();
        key.apply(0, &mut data);
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&data).unwrap();

        let store = HandleStore::new(Some(key));
        let mut last = 0.0;
        let bytes = store
            .read_all(tmp.path(), 1 << 20, |p| last = p)
            .await
            .unwrap();
        assert_eq!(&bytes[..], b"obfuscated container");
        assert_eq!(last, 1.0);
        assert_eq!(store.open_handles().await, 0);

        let err = store.read_all(tmp.path(), 4, |_| {}).await.unwrap_err();
        assert!(matches!(err, ArchiveError::InvalidArgument(_)));
    }
}
