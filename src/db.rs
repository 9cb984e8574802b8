//! The on-disk crawl database: existence log, frontier, object store and ban list
//! under one root directory.

use parking_lot::Mutex;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use url::Url;

use crate::buffer_pool::BufferPool;
use crate::config::Config;
use crate::existence::{ExistenceError, ExistingUrlSet};
use crate::frontier::{Frontier, FrontierError};
use crate::key::Key;
use crate::object_store::{ObjectStore, StoreError};
use crate::page::Page;
use crate::record::{FileKind, Record};
use crate::stats::Statistics;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Existence log error: {0}")]
    Existence(#[from] ExistenceError),

    #[error("Frontier error: {0}")]
    Frontier(#[from] FrontierError),

    #[error("Object store error: {0}")]
    Store(#[from] StoreError),

    #[error("IO error on {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
}

#[derive(Debug, Clone)]
pub struct DbOptions {
    pub frontier_file_entries: usize,
    pub pool_retained_buffers: usize,
    pub pool_max_buffer_capacity: usize,
}

impl Default for DbOptions {
    fn default() -> Self {
        Self {
            frontier_file_entries: Config::FRONTIER_FILE_ENTRIES,
            pool_retained_buffers: Config::POOL_RETAINED_BUFFERS,
            pool_max_buffer_capacity: Config::POOL_MAX_BUFFER_CAPACITY,
        }
    }
}

pub struct Db {
    root: PathBuf,
    existence: ExistingUrlSet,
    frontier: Frontier,
    objects: ObjectStore,
    ban_path: PathBuf,
    bans: Mutex<BufWriter<File>>,
}

impl Db {
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self, DbError> {
        Self::open_with(root, DbOptions::default())
    }

    pub fn open_with<P: AsRef<Path>>(root: P, options: DbOptions) -> Result<Self, DbError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(|source| DbError::Io {
            path: root.clone(),
            source,
        })?;

        let existence = ExistingUrlSet::open(root.join(Config::EXISTENCE_FILE))?;
        let frontier = Frontier::open(
            root.join(Config::FRONTIER_DIR),
            options.frontier_file_entries,
        )?;
        let pool = BufferPool::new(
            options.pool_retained_buffers,
            options.pool_max_buffer_capacity,
        );
        let objects = ObjectStore::open(root.join(Config::OBJECT_DIR), pool)?;

        let ban_path = root.join(Config::BAN_FILE);
        let ban_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&ban_path)
            .map_err(|source| DbError::Io {
                path: ban_path.clone(),
                source,
            })?;

        tracing::info!(root = %root.display(), "Database opened");

        Ok(Self {
            root,
            existence,
            frontier,
            objects,
            ban_path,
            bans: Mutex::new(BufWriter::new(ban_file)),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn existence(&self) -> &ExistingUrlSet {
        &self.existence
    }

    pub fn frontier(&self) -> &Frontier {
        &self.frontier
    }

    pub fn objects(&self) -> &ObjectStore {
        &self.objects
    }

    /// Queue the URLs no one has seen yet. Returns how many were queued.
    pub fn discover(&self, urls: Vec<Url>) -> Result<usize, DbError> {
        let fresh = self.existence.claim(urls)?;
        self.frontier.add(&fresh)?;
        Ok(fresh.len())
    }

    pub fn next_batch(&self) -> Result<Option<Vec<Url>>, DbError> {
        Ok(self.frontier.get()?)
    }

    /// Every URL of the oldest outstanding batch has been recorded.
    pub fn complete_batch(&self) -> Result<(), DbError> {
        self.frontier.complete()?;
        Ok(())
    }

    pub fn record(&self, url: &Url, record: Record) -> Result<(), DbError> {
        self.existence.record(Key::from_url(url), record)?;
        Ok(())
    }

    /// Store `value` under `key` and append the matching File record.
    pub fn store_file<T: Serialize + ?Sized>(
        &self,
        key: Key,
        kind: FileKind,
        value: &T,
    ) -> Result<Record, DbError> {
        let info = self.objects.store(&key, value)?;
        let record = Record::file(kind, info.position, info.length, info.hash);
        self.existence.record(key, record)?;
        Ok(record)
    }

    pub fn get_page(&self, key: &Key) -> Result<Page, DbError> {
        Ok(self.objects.get(key)?)
    }

    /// Visit every File-type key in key order.
    pub fn for_each_file<F>(&self, mut f: F)
    where
        F: FnMut(&Key, &Record),
    {
        for (key, record) in self.existence.select(|r| r.record_type().is_file()) {
            f(&key, &record);
        }
    }

    pub fn ban(&self, url: &Url) -> Result<(), DbError> {
        let mut bans = self.bans.lock();
        writeln!(bans, "{}", url)
            .and_then(|_| bans.flush())
            .map_err(|source| DbError::Io {
                path: self.ban_path.clone(),
                source,
            })
    }

    pub fn bans(&self) -> Result<Vec<String>, DbError> {
        let text = fs::read_to_string(&self.ban_path).map_err(|source| DbError::Io {
            path: self.ban_path.clone(),
            source,
        })?;
        Ok(text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    pub fn statistics(&self) -> Result<Statistics, DbError> {
        Ok(Statistics {
            by_type: self.existence.counts(),
            keys: self.existence.len(),
            frontier_entries: self.frontier.len_hint(),
            bans: self.bans()?.len(),
        })
    }

    /// Flush everything and freeze the stores. Later calls block.
    pub fn close(&self) -> Result<(), DbError> {
        {
            let mut bans = self.bans.lock();
            bans.flush()
                .and_then(|_| bans.get_ref().sync_all())
                .map_err(|source| DbError::Io {
                    path: self.ban_path.clone(),
                    source,
                })?;
        }
        self.frontier.close()?;
        self.existence.close()?;
        tracing::info!(root = %self.root.display(), "Database closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{ErrorKind, RecordType};
    use tempfile::TempDir;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_layout_on_open() {
        let dir = TempDir::new().unwrap();
        let _db = Db::open(dir.path()).unwrap();
        assert!(dir.path().join("existence.bin").is_file());
        assert!(dir.path().join("url").is_dir());
        assert!(dir.path().join("object").is_dir());
        assert!(dir.path().join("ban.txt").is_file());
    }

    #[test]
    fn test_discover_queues_each_url_once() {
        let dir = TempDir::new().unwrap();
        let db = Db::open(dir.path()).unwrap();
        let a = url("https://example.org/a");

        assert_eq!(db.discover(vec![a.clone(), a.clone()]).unwrap(), 1);
        assert_eq!(db.discover(vec![a.clone()]).unwrap(), 0);
        assert_eq!(db.next_batch().unwrap(), Some(vec![a.clone()]));
        assert_eq!(db.existence().get(&Key::from_url(&a)), Some(Record::Known));
    }

    #[test]
    fn test_unfinished_batch_is_handed_out_again_after_crash() {
        let dir = TempDir::new().unwrap();
        let a = url("https://example.org/a");
        {
            let db = Db::open(dir.path()).unwrap();
            db.discover(vec![a.clone()]).unwrap();
            assert_eq!(db.next_batch().unwrap(), Some(vec![a.clone()]));
            // Dropped without close or complete_batch.
        }

        let db = Db::open(dir.path()).unwrap();
        assert_eq!(db.discover(vec![a.clone()]).unwrap(), 0);
        assert_eq!(db.existence().get(&Key::from_url(&a)), Some(Record::Known));
        assert_eq!(db.next_batch().unwrap(), Some(vec![a.clone()]));

        db.complete_batch().unwrap();
        drop(db);
        let db = Db::open(dir.path()).unwrap();
        assert_eq!(db.next_batch().unwrap(), None);
    }

    #[test]
    fn test_store_file_and_scan() {
        let dir = TempDir::new().unwrap();
        let db = Db::open(dir.path()).unwrap();
        let u = url("https://example.org/");
        let key = Key::from_url(&u);
        let page = Page::new(u.clone(), 200, Some("text/html".to_string()));

        let record = db.store_file(key, FileKind::Html, &page).unwrap();
        assert_eq!(record.record_type(), RecordType::FileHtml);
        assert_eq!(db.get_page(&key).unwrap(), page);

        db.record(&url("https://example.org/broken"), Record::error(ErrorKind::Network))
            .unwrap();

        let mut files = Vec::new();
        db.for_each_file(|k, _| files.push(*k));
        assert_eq!(files, vec![key]);
    }

    #[test]
    fn test_bans_and_statistics_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let db = Db::open(dir.path()).unwrap();
            db.ban(&url("https://example.org/private")).unwrap();
            db.discover(vec![url("https://example.org/a")]).unwrap();
            db.record(&url("https://example.org/b"), Record::error(ErrorKind::FilterUrl))
                .unwrap();
            db.close().unwrap();
        }

        let db = Db::open(dir.path()).unwrap();
        assert_eq!(db.bans().unwrap(), vec!["https://example.org/private".to_string()]);
        let stats = db.statistics().unwrap();
        assert_eq!(stats.keys, 2);
        assert_eq!(stats.count(RecordType::Known), 1);
        assert_eq!(stats.count(RecordType::ErrorFilterUrl), 1);
        assert_eq!(stats.frontier_entries, 1);
        assert_eq!(stats.bans, 1);
    }
}
