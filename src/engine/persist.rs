//! On-disk layout for path-backed stores.
//!
//! ```text
//! <dir>/LOCK        exclusive lock held while open
//! <dir>/MANIFEST    magic, format version, checksummed manifest
//! <dir>/data.bin    magic, format version, checksummed object data
//! ```
//!
//! Each file is a header (`magic[4] version[1] len[u32 LE] crc32[u32 LE]`)
//! followed by a MessagePack body. Writes go to a temp file and are renamed
//! into place.

use crate::error::{Result, StoreError};
use crate::types::Object;
use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// Magic bytes for the manifest.
const MANIFEST_MAGIC: &[u8; 4] = b"LSM\0";

/// Magic bytes for the data file.
const DATA_MAGIC: &[u8; 4] = b"LSD\0";

/// Current file format version.
const FORMAT_VERSION: u8 = 1;

const HEADER_LEN: usize = 4 + 1 + 4 + 4;

/// What a store was created with.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub(crate) struct Manifest {
    pub schema_version: u64,
    pub key_fingerprint: Option<String>,
    pub entity_types: Vec<String>,
}

/// Committed objects.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub(crate) struct DataFile {
    pub next_id: u64,
    pub objects: Vec<Object>,
}

/// Open files of a path-backed store.
pub(crate) struct StoreFiles {
    dir: PathBuf,
    /// Lock file for exclusive access.
    _lock_file: File,
}

impl StoreFiles {
    /// Create the directory if needed and take the exclusive lock.
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let lock_file = File::create(dir.join("LOCK"))?;
        lock_file
            .try_lock_exclusive()
            .map_err(|_| StoreError::Locked)?;

        Ok(Self {
            dir: dir.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    pub fn read_manifest(&self) -> Result<Option<Manifest>> {
        read_framed(&self.dir.join("MANIFEST"), MANIFEST_MAGIC)
    }

    pub fn write_manifest(&self, manifest: &Manifest) -> Result<()> {
        let body = rmp_serde::to_vec_named(manifest)?;
        write_framed(&self.dir.join("MANIFEST"), MANIFEST_MAGIC, &body)
    }

    pub fn read_data(&self) -> Result<Option<DataFile>> {
        read_framed(&self.dir.join("data.bin"), DATA_MAGIC)
    }

    /// Write the data file. Fails without touching disk if the encoded size
    /// exceeds `max_size`.
    pub fn write_data(&self, data: &DataFile, max_size: Option<u64>) -> Result<u64> {
        let body = rmp_serde::to_vec_named(data)?;
        let total = (HEADER_LEN + body.len()) as u64;
        if let Some(max) = max_size {
            if total > max {
                return Err(StoreError::Transaction(format!(
                    "data size {} exceeds max_file_size {}",
                    total, max
                )));
            }
        }
        write_framed(&self.dir.join("data.bin"), DATA_MAGIC, &body)?;
        Ok(total)
    }
}

fn write_framed(path: &Path, magic: &[u8; 4], body: &[u8]) -> Result<()> {
    let len = u32::try_from(body.len())
        .map_err(|_| StoreError::Serialization(format!("body too large: {} bytes", body.len())))?;
    let checksum = crc32fast::hash(body);

    let tmp = path.with_extension("tmp");
    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)?;
        file.write_all(magic)?;
        file.write_all(&[FORMAT_VERSION])?;
        file.write_all(&len.to_le_bytes())?;
        file.write_all(&checksum.to_le_bytes())?;
        file.write_all(body)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

fn read_framed<T: DeserializeOwned>(path: &Path, magic: &[u8; 4]) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let mut file = File::open(path)?;

    let mut found = [0u8; 4];
    file.read_exact(&mut found)?;
    if &found != magic {
        return Err(StoreError::Corruption(format!(
            "invalid magic in {}",
            path.display()
        )));
    }

    let mut version = [0u8; 1];
    file.read_exact(&mut version)?;
    if version[0] != FORMAT_VERSION {
        return Err(StoreError::Configuration(format!(
            "unsupported store format version: {}",
            version[0]
        )));
    }

    let mut len_bytes = [0u8; 4];
    file.read_exact(&mut len_bytes)?;
    let len = u32::from_le_bytes(len_bytes) as usize;

    let mut checksum_bytes = [0u8; 4];
    file.read_exact(&mut checksum_bytes)?;
    let expected = u32::from_le_bytes(checksum_bytes);

    let available = file.metadata()?.len().saturating_sub(HEADER_LEN as u64);
    if len as u64 > available {
        return Err(StoreError::Corruption(format!(
            "{} declares {} body bytes but holds {}",
            path.display(),
            len,
            available
        )));
    }

    let mut body = vec![0u8; len];
    file.read_exact(&mut body)?;

    let got = crc32fast::hash(&body);
    if got != expected {
        return Err(StoreError::ChecksumMismatch { expected, got });
    }

    Ok(Some(rmp_serde::from_slice(&body)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EntityId, Fields, InstanceId, Timestamp};
    use serde_json::json;
    use tempfile::TempDir;

    fn sample_data() -> DataFile {
        let mut fields = Fields::new();
        fields.insert("name".into(), json!("Ada"));
        fields.insert("tags".into(), json!(["a", "b"]));
        DataFile {
            next_id: 3,
            objects: vec![Object {
                id: EntityId(3),
                entity_type: "Person".into(),
                instance: InstanceId(42),
                fields,
                created: Timestamp(1),
                updated: Timestamp(2),
            }],
        }
    }

    #[test]
    fn test_manifest_persists() {
        let dir = TempDir::new().unwrap();
        let files = StoreFiles::open(dir.path()).unwrap();
        assert!(files.read_manifest().unwrap().is_none());

        let manifest = Manifest {
            schema_version: 4,
            key_fingerprint: Some("abc".into()),
            entity_types: vec!["Person".into()],
        };
        files.write_manifest(&manifest).unwrap();
        assert_eq!(files.read_manifest().unwrap(), Some(manifest));
    }

    #[test]
    fn test_data_persists_without_instance() {
        let dir = TempDir::new().unwrap();
        let files = StoreFiles::open(dir.path()).unwrap();
        files.write_data(&sample_data(), None).unwrap();

        let loaded = files.read_data().unwrap().unwrap();
        assert_eq!(loaded.next_id, 3);
        assert_eq!(loaded.objects[0].get("name"), Some(&json!("Ada")));
        assert!(loaded.objects[0].instance.is_detached());
    }

    #[test]
    fn test_max_size_enforced() {
        let dir = TempDir::new().unwrap();
        let files = StoreFiles::open(dir.path()).unwrap();
        let result = files.write_data(&sample_data(), Some(16));
        assert!(matches!(result, Err(StoreError::Transaction(_))));
        assert!(files.read_data().unwrap().is_none());
    }

    #[test]
    fn test_corrupted_body_detected() {
        let dir = TempDir::new().unwrap();
        let files = StoreFiles::open(dir.path()).unwrap();
        files.write_data(&sample_data(), None).unwrap();

        let path = dir.path().join("data.bin");
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        fs::write(&path, bytes).unwrap();

        assert!(matches!(
            files.read_data(),
            Err(StoreError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_oversized_length_header_detected() {
        let dir = TempDir::new().unwrap();
        let files = StoreFiles::open(dir.path()).unwrap();
        files.write_data(&sample_data(), None).unwrap();

        let path = dir.path().join("data.bin");
        let mut bytes = fs::read(&path).unwrap();
        bytes[5..9].copy_from_slice(&u32::MAX.to_le_bytes());
        fs::write(&path, bytes).unwrap();

        assert!(matches!(files.read_data(), Err(StoreError::Corruption(_))));
    }

    #[test]
    fn test_second_open_is_locked() {
        let dir = TempDir::new().unwrap();
        let _files = StoreFiles::open(dir.path()).unwrap();
        assert!(matches!(StoreFiles::open(dir.path()), Err(StoreError::Locked)));
    }
}
