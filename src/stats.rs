use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::record::RecordType;

// Atomic counter for lock-free updates from workers
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, delta: u64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Per-run outcome counters, bumped by workers as URLs are recorded.
#[derive(Debug, Default)]
pub struct CrawlCounters {
    pub fetched: Counter,
    pub redirects: Counter,
    pub network_errors: Counter,
    pub parsing_errors: Counter,
    pub url_rejections: Counter,
    pub page_rejections: Counter,
    pub banned: Counter,
    pub discovered: Counter,
    pub bytes: Counter,
}

impl CrawlCounters {
    pub fn snapshot(&self) -> CrawlSummary {
        CrawlSummary {
            fetched: self.fetched.get(),
            redirects: self.redirects.get(),
            network_errors: self.network_errors.get(),
            parsing_errors: self.parsing_errors.get(),
            url_rejections: self.url_rejections.get(),
            page_rejections: self.page_rejections.get(),
            banned: self.banned.get(),
            discovered: self.discovered.get(),
            bytes: self.bytes.get(),
            cancelled: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CrawlSummary {
    pub fetched: u64,
    pub redirects: u64,
    pub network_errors: u64,
    pub parsing_errors: u64,
    pub url_rejections: u64,
    pub page_rejections: u64,
    pub banned: u64,
    pub discovered: u64,
    pub bytes: u64,
    pub cancelled: bool,
}

impl fmt::Display for CrawlSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "fetched:         {}", self.fetched)?;
        writeln!(f, "redirects:       {}", self.redirects)?;
        writeln!(f, "network errors:  {}", self.network_errors)?;
        writeln!(f, "parsing errors:  {}", self.parsing_errors)?;
        writeln!(f, "url rejected:    {}", self.url_rejections)?;
        writeln!(f, "page rejected:   {}", self.page_rejections)?;
        writeln!(f, "robots banned:   {}", self.banned)?;
        writeln!(f, "discovered:      {}", self.discovered)?;
        writeln!(f, "bytes:           {}", self.bytes)?;
        write!(f, "cancelled:       {}", self.cancelled)
    }
}

/// Database-wide counts, the main observability surface.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Statistics {
    pub by_type: BTreeMap<RecordType, usize>,
    pub keys: usize,
    pub frontier_entries: usize,
    pub bans: usize,
}

impl Statistics {
    pub fn count(&self, record_type: RecordType) -> usize {
        self.by_type.get(&record_type).copied().unwrap_or(0)
    }

    pub fn files(&self) -> usize {
        self.by_type
            .iter()
            .filter(|(t, _)| t.is_file())
            .map(|(_, n)| n)
            .sum()
    }

    pub fn errors(&self) -> usize {
        self.by_type
            .iter()
            .filter(|(t, _)| t.is_error())
            .map(|(_, n)| n)
            .sum()
    }
}

impl fmt::Display for Statistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "keys:      {}", self.keys)?;
        writeln!(f, "frontier:  {}", self.frontier_entries)?;
        writeln!(f, "bans:      {}", self.bans)?;
        for record_type in RecordType::ALL {
            let n = self.count(record_type);
            if n > 0 {
                writeln!(f, "  {:<18}{}", record_type.name(), n)?;
            }
        }
        write!(f, "files: {}  errors: {}", self.files(), self.errors())
    }
}
