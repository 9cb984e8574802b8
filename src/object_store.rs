//! Content-addressed blob store: one gzip-compressed JSON document per key.
//!
//! Files live under `object/xx/xx/xx/<rest-of-hex>` so no directory grows
//! past a few hundred entries. Writes land in a temporary file next to the
//! target and are renamed into place, so a reader never sees half a file.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;

use crate::buffer_pool::BufferPool;
use crate::key::Key;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Object not found: {0}")]
    NotFound(Key),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Decompression error for {key}: {source}")]
    Compression { key: Key, source: io::Error },

    #[error("Object too large: {0} bytes")]
    TooLarge(usize),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

/// Where a payload ended up, as recorded in a File record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredInfo {
    pub position: u64,
    pub length: u32,
    /// SHA-256 of the compressed bytes on disk.
    pub hash: Key,
}

#[derive(Debug)]
pub struct ObjectStore {
    root: PathBuf,
    pool: BufferPool,
}

impl ObjectStore {
    pub fn open<P: AsRef<Path>>(root: P, pool: BufferPool) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root, pool })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Shard path for a key. Pure function of the key.
    pub fn path_for(&self, key: &Key) -> PathBuf {
        let hex = key.to_hex();
        self.root
            .join(&hex[0..2])
            .join(&hex[2..4])
            .join(&hex[4..6])
            .join(&hex[6..])
    }

    /// Serialize, compress and write `value`, replacing any previous object for `key`.
    pub fn store<T: Serialize + ?Sized>(&self, key: &Key, value: &T) -> Result<StoredInfo, StoreError> {
        let mut raw = self.pool.take();
        serde_json::to_writer(&mut *raw, value)?;

        let mut packed = self.pool.take();
        {
            let mut encoder = GzEncoder::new(&mut *packed, Compression::default());
            encoder.write_all(&raw)?;
            encoder.finish()?;
        }
        let length = u32::try_from(packed.len()).map_err(|_| StoreError::TooLarge(packed.len()))?;

        let path = self.path_for(key);
        let dir = path.parent().unwrap_or(&self.root);
        fs::create_dir_all(dir)?;

        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(&packed)?;
        tmp.as_file().sync_data()?;
        tmp.persist(&path).map_err(|e| StoreError::Io(e.error))?;

        Ok(StoredInfo {
            position: 0,
            length,
            hash: Key::from_bytes(&packed),
        })
    }

    pub fn get<T: DeserializeOwned>(&self, key: &Key) -> Result<T, StoreError> {
        let file = match File::open(self.path_for(key)) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(StoreError::NotFound(*key)),
            Err(e) => return Err(e.into()),
        };

        let mut raw = self.pool.take();
        GzDecoder::new(BufReader::new(file))
            .read_to_end(&mut *raw)
            .map_err(|source| StoreError::Compression { key: *key, source })?;

        Ok(serde_json::from_slice(&raw)?)
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.path_for(key).is_file()
    }

    /// All stored keys in key order. Temporary files are skipped.
    pub fn keys(&self) -> Result<Vec<Key>, StoreError> {
        let mut keys = Vec::new();
        for a in read_dirs(&self.root)? {
            for b in read_dirs(&a)? {
                for c in read_dirs(&b)? {
                    for entry in fs::read_dir(&c)? {
                        let entry = entry?;
                        if !entry.file_type()?.is_file() {
                            continue;
                        }
                        let hex = format!(
                            "{}{}{}{}",
                            file_name(&a),
                            file_name(&b),
                            file_name(&c),
                            entry.file_name().to_string_lossy()
                        );
                        if let Ok(key) = hex.parse::<Key>() {
                            keys.push(key);
                        }
                    }
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

fn read_dirs(path: &Path) -> Result<Vec<PathBuf>, io::Error> {
    let mut dirs = Vec::new();
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            dirs.push(entry.path());
        }
    }
    Ok(dirs)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Doc {
        title: String,
        links: Vec<String>,
    }

    fn doc(title: &str) -> Doc {
        Doc {
            title: title.to_string(),
            links: vec!["https://example.org/a".to_string()],
        }
    }

    fn open(dir: &TempDir) -> ObjectStore {
        ObjectStore::open(dir.path().join("object"), BufferPool::new(4, 1 << 20)).unwrap()
    }

    #[test]
    fn test_store_and_get() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let key = Key::new("https://example.org/");

        let info = store.store(&key, &doc("home")).unwrap();
        assert_eq!(info.position, 0);
        assert!(info.length > 0);

        let back: Doc = store.get(&key).unwrap();
        assert_eq!(back, doc("home"));
    }

    #[test]
    fn test_sharded_layout() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let key = Key::new("x");
        let hex = key.to_hex();
        let path = store.path_for(&key);

        let expected = dir
            .path()
            .join("object")
            .join(&hex[0..2])
            .join(&hex[2..4])
            .join(&hex[4..6])
            .join(&hex[6..]);
        assert_eq!(path, expected);
    }

    #[test]
    fn test_payload_is_gzip_and_hash_matches() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let key = Key::new("k");
        let info = store.store(&key, &doc("t")).unwrap();

        let bytes = fs::read(store.path_for(&key)).unwrap();
        assert_eq!(&bytes[..2], &[0x1f, 0x8b]);
        assert_eq!(bytes.len() as u32, info.length);
        assert_eq!(Key::from_bytes(&bytes), info.hash);
    }

    #[test]
    fn test_not_found_is_distinct() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let err = store.get::<Doc>(&Key::new("missing")).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_garbage_is_compression_error() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let key = Key::new("bad");
        let path = store.path_for(&key);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"not gzip").unwrap();

        let err = store.get::<Doc>(&key).unwrap_err();
        assert!(matches!(err, StoreError::Compression { .. }));
    }

    #[test]
    fn test_overwrite_is_last_write_wins() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let key = Key::new("k");
        store.store(&key, &doc("first")).unwrap();
        store.store(&key, &doc("second")).unwrap();
        let back: Doc = store.get(&key).unwrap();
        assert_eq!(back.title, "second");
    }

    #[test]
    fn test_keys_and_reopen() {
        let dir = TempDir::new().unwrap();
        let mut expected = vec![Key::new("a"), Key::new("b"), Key::new("c")];
        {
            let store = open(&dir);
            for key in &expected {
                store.store(key, &doc(&key.to_hex())).unwrap();
            }
        }
        expected.sort();

        let store = open(&dir);
        assert_eq!(store.keys().unwrap(), expected);
        for key in &expected {
            let back: Doc = store.get(key).unwrap();
            assert_eq!(back.title, key.to_hex());
            assert!(store.contains(key));
        }
    }
}
