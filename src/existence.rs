//! Set of every key the crawl has ever classified, backed by the record log.

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use url::Url;

use crate::key::Key;
use crate::record::{self, CodecError, Record, RecordType};

#[derive(Error, Debug)]
pub enum ExistenceError {
    #[error("IO error on {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
}

struct Inner {
    records: HashMap<Key, Record>,
    log: File,
    path: PathBuf,
    scratch: Vec<u8>,
}

impl Inner {
    fn append(&mut self, key: &Key, record: &Record) -> Result<(), ExistenceError> {
        self.scratch.clear();
        record::encode_into(&mut self.scratch, key, record);
        self.log.write_all(&self.scratch).map_err(|source| ExistenceError::Io {
            path: self.path.clone(),
            source,
        })?;
        match record {
            Record::Nothing => {
                self.records.remove(key);
            }
            _ => {
                self.records.insert(*key, *record);
            }
        }
        Ok(())
    }
}

/// In-memory mirror of `existence.bin`.
///
/// Reads take the read lock, writes the write lock. After [`close`](Self::close)
/// the write lock is never released, so every later call blocks.
pub struct ExistingUrlSet {
    inner: RwLock<Inner>,
}

impl ExistingUrlSet {
    /// Replay the log at `path`, creating it if needed.
    ///
    /// A corrupt or torn tail is logged, cut off, and the set keeps whatever
    /// decoded before it.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ExistenceError> {
        let path = path.as_ref().to_path_buf();
        let io_err = |source| ExistenceError::Io {
            path: path.clone(),
            source,
        };

        let mut blob = Vec::new();
        match File::open(&path) {
            Ok(mut file) => {
                file.read_to_end(&mut blob).map_err(io_err)?;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_err(e)),
        }

        let replay = record::decode_all(&blob);
        if let Some(CodecError::CorruptLog { offset, reason }) = &replay.corrupt {
            tracing::warn!(
                path = %path.display(),
                offset,
                kept = replay.records.len(),
                "Corrupt existence log, recovering: {}",
                reason
            );
        }

        if replay.consumed < blob.len() {
            let file = OpenOptions::new().write(true).open(&path).map_err(io_err)?;
            file.set_len(replay.consumed as u64).map_err(io_err)?;
            tracing::debug!(
                dropped = blob.len() - replay.consumed,
                "Truncated unfinished tail of existence log"
            );
        }

        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(io_err)?;

        tracing::info!(keys = replay.records.len(), path = %path.display(), "Existence set loaded");

        Ok(Self {
            inner: RwLock::new(Inner {
                records: replay.records,
                log,
                path,
                scratch: Vec::with_capacity(128),
            }),
        })
    }

    /// Mark `key` as known. No-op when it already has a record.
    pub fn add(&self, key: Key) -> Result<(), ExistenceError> {
        let mut inner = self.inner.write();
        if inner.records.contains_key(&key) {
            return Ok(());
        }
        inner.append(&key, &Record::Known)
    }

    /// Append `record` for `key`. The newest record wins; `Nothing` forgets the key.
    pub fn record(&self, key: Key, record: Record) -> Result<(), ExistenceError> {
        self.inner.write().append(&key, &record)
    }

    pub fn exist(&self, key: &Key) -> bool {
        self.inner.read().records.contains_key(key)
    }

    pub fn get(&self, key: &Key) -> Option<Record> {
        self.inner.read().records.get(key).copied()
    }

    /// URLs whose keys are unknown, with duplicate keys removed (first wins).
    pub fn filter(&self, urls: Vec<Url>) -> Vec<Url> {
        let inner = self.inner.read();
        let mut seen = HashSet::with_capacity(urls.len());
        urls.into_iter()
            .filter(|url| {
                let key = Key::from_url(url);
                !inner.records.contains_key(&key) && seen.insert(key)
            })
            .collect()
    }

    /// Like [`filter`](Self::filter), but also marks the survivors known under
    /// the same lock, so two callers can never both claim a URL.
    pub fn claim(&self, urls: Vec<Url>) -> Result<Vec<Url>, ExistenceError> {
        let mut inner = self.inner.write();
        let mut claimed = Vec::new();
        for url in urls {
            let key = Key::from_url(&url);
            if inner.records.contains_key(&key) {
                continue;
            }
            inner.append(&key, &Record::Known)?;
            claimed.push(url);
        }
        Ok(claimed)
    }

    pub fn len(&self) -> usize {
        self.inner.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn counts(&self) -> BTreeMap<RecordType, usize> {
        let inner = self.inner.read();
        let mut counts = BTreeMap::new();
        for record in inner.records.values() {
            *counts.entry(record.record_type()).or_insert(0) += 1;
        }
        counts
    }

    /// Snapshot of the entries matching `pred`, sorted by key.
    pub fn select<F>(&self, pred: F) -> Vec<(Key, Record)>
    where
        F: Fn(&Record) -> bool,
    {
        let inner = self.inner.read();
        let mut out: Vec<(Key, Record)> = inner
            .records
            .iter()
            .filter(|(_, record)| pred(record))
            .map(|(key, record)| (*key, *record))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Visit a snapshot of every entry in key order. No lock is held during `f`.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&Key, &Record),
    {
        for (key, record) in self.select(|_| true) {
            f(&key, &record);
        }
    }

    /// Flush the log and freeze the set for good.
    pub fn close(&self) -> Result<(), ExistenceError> {
        let inner = self.inner.write();
        let result = inner.log.sync_all().map_err(|source| ExistenceError::Io {
            path: inner.path.clone(),
            source,
        });
        std::mem::forget(inner);
        result
    }
}
