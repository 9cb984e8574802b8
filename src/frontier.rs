//! Durable queue of discovered-but-unfetched URLs.
//!
//! URLs are appended, one per line, to the *current* file under `url/` and
//! mirrored in memory. Once the current file holds `max_entries` lines it is
//! rotated into the *previous* list and never written again. `get` hands out
//! the in-memory mirror first, then whole previous files, oldest first.
//!
//! A handed-out file is renamed to `inflight-*` rather than deleted, and is
//! only removed by [`Frontier::complete`] once its batch has been worked off.
//! In-flight files found at open are queued again, so a crash loses nothing
//! that was not yet recorded.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use url::Url;

const INFLIGHT_PREFIX: &str = "inflight-";

#[derive(Error, Debug)]
pub enum FrontierError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

struct Current {
    path: PathBuf,
    file: BufWriter<File>,
    /// Exactly the URLs written to `file`.
    buffer: Vec<Url>,
}

pub struct Frontier {
    dir: PathBuf,
    max_entries: usize,
    seq: AtomicU64,
    current: Mutex<Current>,
    /// Rotated files, oldest first, with their entry counts.
    previous: Mutex<VecDeque<(PathBuf, usize)>>,
    /// Handed-out files awaiting [`complete`](Self::complete), oldest first.
    inflight: Mutex<VecDeque<PathBuf>>,
}

/// Creation-order sort key: the file name without any in-flight prefix.
fn stamp(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    match name.strip_prefix(INFLIGHT_PREFIX) {
        Some(rest) => rest.to_string(),
        None => name,
    }
}

impl Frontier {
    /// Open the queue directory. Files left by an earlier run are queued as previous files.
    pub fn open<P: AsRef<Path>>(dir: P, max_entries: usize) -> Result<Self, FrontierError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut names: Vec<PathBuf> = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().map_or(false, |ext| ext == "txt") {
                names.push(path);
            }
        }
        // Names start with a zero-padded timestamp, so name order is creation order.
        names.sort_by_key(|path| stamp(path));
        let mut leftovers = VecDeque::with_capacity(names.len());
        for path in names {
            let count = fs::read_to_string(&path)?
                .lines()
                .filter(|l| !l.trim().is_empty())
                .count();
            leftovers.push_back((path, count));
        }
        if !leftovers.is_empty() {
            tracing::info!(files = leftovers.len(), "Resuming frontier from previous run");
        }

        let seq = AtomicU64::new(0);
        let current = Self::create_file(&dir, &seq)?;

        Ok(Self {
            dir,
            max_entries: max_entries.max(1),
            seq,
            current: Mutex::new(current),
            previous: Mutex::new(leftovers),
            inflight: Mutex::new(VecDeque::new()),
        })
    }

    fn create_file(dir: &Path, seq: &AtomicU64) -> Result<Current, FrontierError> {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let n = seq.fetch_add(1, Ordering::Relaxed);
        let path = dir.join(format!("{:020}-{:06}.txt", nanos, n));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Current {
            path,
            file: BufWriter::new(file),
            buffer: Vec::new(),
        })
    }

    /// Queue URLs, rotating the current file whenever it fills up.
    pub fn add(&self, urls: &[Url]) -> Result<(), FrontierError> {
        if urls.is_empty() {
            return Ok(());
        }
        let mut current = self.current.lock();
        for url in urls {
            writeln!(current.file, "{}", url)?;
            current.buffer.push(url.clone());

            if current.buffer.len() >= self.max_entries {
                current.file.flush()?;
                let fresh = Self::create_file(&self.dir, &self.seq)?;
                let full = std::mem::replace(&mut *current, fresh);
                tracing::debug!(path = %full.path.display(), entries = full.buffer.len(), "Rotated frontier file");
                self.previous.lock().push_back((full.path, full.buffer.len()));
            }
        }
        current.file.flush()?;
        Ok(())
    }

    /// Next batch of URLs, or `None` when nothing is queued right now.
    ///
    /// The batch's file stays on disk until [`complete`](Self::complete).
    pub fn get(&self) -> Result<Option<Vec<Url>>, FrontierError> {
        {
            let mut current = self.current.lock();
            if !current.buffer.is_empty() {
                let fresh = Self::create_file(&self.dir, &self.seq)?;
                let mut drained = std::mem::replace(&mut *current, fresh);
                drained.file.flush()?;
                drop(drained.file);
                self.check_out(&drained.path)?;
                return Ok(Some(drained.buffer));
            }
        }

        loop {
            let next = self.previous.lock().pop_front();
            let path = match next {
                Some((path, _)) => path,
                None => return Ok(None),
            };
            let urls = Self::read_file(&path)?;
            if urls.is_empty() {
                remove_if_present(&path)?;
                continue;
            }
            self.check_out(&path)?;
            return Ok(Some(urls));
        }
    }

    fn check_out(&self, path: &Path) -> Result<(), FrontierError> {
        let name = stamp(path);
        let target = self.dir.join(format!("{}{}", INFLIGHT_PREFIX, name));
        if target != path {
            fs::rename(path, &target)?;
        }
        self.inflight.lock().push_back(target);
        Ok(())
    }

    /// Drop the file of the oldest batch handed out by [`get`](Self::get).
    /// Returns `false` when no batch is in flight.
    pub fn complete(&self) -> Result<bool, FrontierError> {
        let oldest = self.inflight.lock().pop_front();
        match oldest {
            Some(path) => {
                remove_if_present(&path)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Batches handed out and not yet completed.
    pub fn in_flight(&self) -> usize {
        self.inflight.lock().len()
    }

    fn read_file(path: &Path) -> Result<Vec<Url>, FrontierError> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut urls = Vec::new();
        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            match Url::parse(line) {
                Ok(url) => urls.push(url),
                Err(e) => tracing::warn!(line, "Skipping bad frontier entry: {}", e),
            }
        }
        Ok(urls)
    }

    /// URLs in the current file plus the number of rotated files waiting.
    pub fn pending(&self) -> (usize, usize) {
        let buffered = self.current.lock().buffer.len();
        let files = self.previous.lock().len();
        (buffered, files)
    }

    /// Queued entries across the current file and every rotated file.
    pub fn len_hint(&self) -> usize {
        let buffered = self.current.lock().buffer.len();
        let rotated: usize = self.previous.lock().iter().map(|(_, n)| n).sum();
        buffered + rotated
    }

    pub fn is_empty(&self) -> bool {
        self.pending() == (0, 0)
    }

    /// Flush and freeze. Both locks stay held forever afterwards.
    pub fn close(&self) -> Result<(), FrontierError> {
        let mut current = self.current.lock();
        let result = current
            .file
            .flush()
            .and_then(|_| current.file.get_ref().sync_all());
        let previous = self.previous.lock();
        let inflight = self.inflight.lock();
        std::mem::forget(inflight);
        std::mem::forget(previous);
        std::mem::forget(current);
        result.map_err(FrontierError::from)
    }
}

fn remove_if_present(path: &Path) -> Result<(), FrontierError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn urls(n: usize, prefix: &str) -> Vec<Url> {
        (0..n)
            .map(|i| Url::parse(&format!("https://example.org/{}{}", prefix, i)).unwrap())
            .collect()
    }

    fn txt_files(dir: &Path) -> usize {
        fs::read_dir(dir).unwrap().count()
    }

    #[test]
    fn test_empty_frontier() {
        let dir = TempDir::new().unwrap();
        let frontier = Frontier::open(dir.path(), 10).unwrap();
        assert!(frontier.get().unwrap().is_none());
        assert!(frontier.is_empty());
    }

    #[test]
    fn test_buffer_is_drained_first() {
        let dir = TempDir::new().unwrap();
        let frontier = Frontier::open(dir.path(), 10).unwrap();
        frontier.add(&urls(3, "a")).unwrap();
        assert_eq!(frontier.pending(), (3, 0));

        let got = frontier.get().unwrap().unwrap();
        assert_eq!(got, urls(3, "a"));
        assert!(frontier.get().unwrap().is_none());
        // The drained file waits as in-flight next to the fresh current file.
        assert_eq!(txt_files(dir.path()), 2);
        assert_eq!(frontier.in_flight(), 1);

        assert!(frontier.complete().unwrap());
        assert_eq!(txt_files(dir.path()), 1);
        assert!(!frontier.complete().unwrap());
    }

    #[test]
    fn test_unfinished_batches_return_after_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let frontier = Frontier::open(dir.path(), 2).unwrap();
            frontier.add(&urls(3, "c")).unwrap();
            let first = frontier.get().unwrap().unwrap();
            assert_eq!(first, vec![urls(3, "c")[2].clone()]);
            let second = frontier.get().unwrap().unwrap();
            assert_eq!(second, urls(2, "c"));
            // Only the first batch finishes before the process goes away.
            frontier.complete().unwrap();
        }

        let frontier = Frontier::open(dir.path(), 2).unwrap();
        assert_eq!(frontier.len_hint(), 2);
        assert_eq!(frontier.get().unwrap(), Some(urls(2, "c")));
        assert!(frontier.get().unwrap().is_none());
    }

    #[test]
    fn test_rotation_and_order() {
        let dir = TempDir::new().unwrap();
        let frontier = Frontier::open(dir.path(), 2).unwrap();
        let all = urls(5, "p");
        frontier.add(&all).unwrap();
        // Two full files rotated out, one URL left in the current file.
        assert_eq!(frontier.pending(), (1, 2));
        assert_eq!(frontier.len_hint(), 5);

        let mut seen = Vec::new();
        while let Some(batch) = frontier.get().unwrap() {
            assert!(batch.len() <= 2);
            seen.extend(batch);
        }
        assert_eq!(seen.len(), 5);
        // Nothing is handed out twice.
        let mut dedup = seen.clone();
        dedup.sort();
        dedup.dedup();
        assert_eq!(dedup.len(), 5);
        // The tail comes first, then rotated files oldest first.
        assert_eq!(seen[0], all[4]);
        assert_eq!(&seen[1..], &all[..4]);
    }

    #[test]
    fn test_reopen_after_close() {
        let dir = TempDir::new().unwrap();
        {
            let frontier = Frontier::open(dir.path(), 2).unwrap();
            frontier.add(&urls(3, "r")).unwrap();
            frontier.close().unwrap();
        }

        let frontier = Frontier::open(dir.path(), 2).unwrap();
        assert_eq!(frontier.len_hint(), 3);
        let mut seen = Vec::new();
        while let Some(batch) = frontier.get().unwrap() {
            seen.extend(batch);
        }
        assert_eq!(seen, urls(3, "r"));
    }

    #[test]
    fn test_bad_lines_are_skipped() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("00000000000000000001-000000.txt"),
            "https://example.org/ok\nnot a url\n\nhttps://example.org/ok2\n",
        )
        .unwrap();
        let frontier = Frontier::open(dir.path(), 10).unwrap();
        let got = frontier.get().unwrap().unwrap();
        assert_eq!(got.len(), 2);
    }
}
