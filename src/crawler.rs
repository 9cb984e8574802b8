use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio::time::{sleep_until, Duration, Instant};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::Config;
use crate::db::{Db, DbError};
use crate::filter::{default_url_filters, FilterList};
use crate::key::Key;
use crate::network::{FetchError, Fetcher};
use crate::page::Page;
use crate::parser::PageParser;
use crate::politeness::HostGate;
use crate::record::{ErrorKind, FileKind, Record};
use crate::robots::RobotsCache;
use crate::stats::{CrawlCounters, CrawlSummary};
use crate::url_utils;

pub const PROGRESS_INTERVAL: u64 = 100;

#[derive(Error, Debug)]
pub enum CrawlError {
    #[error("Database error: {0}")]
    Db(#[from] DbError),
}

#[derive(Debug, Clone)]
pub struct CrawlerConfig {
    pub max_workers: usize,
    pub user_agent: String,
    pub timeout: Duration,
    pub max_content_size: usize,
    pub min_crawl_delay: Duration,
    pub max_crawl_delay: Duration,
    pub robots_freshness: Duration,
    pub ignore_robots: bool,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            max_workers: Config::MAX_WORKERS,
            user_agent: Config::USER_AGENT.to_string(),
            timeout: Duration::from_secs(Config::REQUEST_TIMEOUT_SECS),
            max_content_size: Config::MAX_CONTENT_SIZE,
            min_crawl_delay: Duration::from_millis(Config::MIN_CRAWL_DELAY_MS),
            max_crawl_delay: Duration::from_secs(Config::MAX_CRAWL_DELAY_SECS),
            robots_freshness: Duration::from_secs(Config::ROBOTS_FRESHNESS_SECS),
            ignore_robots: false,
        }
    }
}

/// Crawl orchestrator with constructor-injected collaborators.
///
/// Cloning is cheap; every worker task owns a clone.
#[derive(Clone)]
pub struct Crawler {
    config: CrawlerConfig,
    db: Arc<Db>,
    fetcher: Arc<dyn Fetcher>,
    parser: Arc<dyn PageParser>,
    robots: Arc<RobotsCache>,
    gate: Arc<HostGate>,
    url_filters: FilterList<Url>,
    page_filters: FilterList<Page>,
    counters: Arc<CrawlCounters>,
}

impl Crawler {
    pub fn new(
        db: Arc<Db>,
        fetcher: Arc<dyn Fetcher>,
        parser: Arc<dyn PageParser>,
        config: CrawlerConfig,
    ) -> Self {
        let robots = Arc::new(RobotsCache::new(
            Arc::clone(&db),
            Arc::clone(&fetcher),
            config.robots_freshness,
        ));
        let gate = Arc::new(HostGate::new(config.min_crawl_delay, config.max_crawl_delay));
        Self {
            config,
            db,
            fetcher,
            parser,
            robots,
            gate,
            url_filters: default_url_filters(),
            page_filters: FilterList::new(),
            counters: Arc::new(CrawlCounters::default()),
        }
    }

    /// Replace the URL filters (the defaults reject non-http schemes and asset extensions).
    pub fn with_url_filters(mut self, filters: FilterList<Url>) -> Self {
        self.url_filters = filters;
        self
    }

    pub fn with_page_filters(mut self, filters: FilterList<Page>) -> Self {
        self.page_filters = filters;
        self
    }

    pub fn db(&self) -> &Arc<Db> {
        &self.db
    }

    /// Queue root URLs plus any sitemaps their robots.txt declares.
    pub async fn seed(&self, roots: Vec<Url>) -> Result<usize, CrawlError> {
        let mut seeds = Vec::with_capacity(roots.len());
        for mut root in roots {
            root.set_fragment(None);
            if !self.config.ignore_robots {
                let robots = self.robots.for_url(&root).await;
                seeds.extend(robots.sitemaps.iter().cloned());
            }
            seeds.push(root);
        }
        let queued = self.discover(seeds)?;
        tracing::info!(queued, "Seeded frontier");
        Ok(queued)
    }

    fn discover(&self, urls: Vec<Url>) -> Result<usize, CrawlError> {
        if urls.is_empty() {
            return Ok(0);
        }
        let queued = self.db.discover(urls)?;
        self.counters.discovered.add(queued as u64);
        Ok(queued)
    }

    // Core crawl loop that schedules work, tracks progress, and handles shutdown
    #[tracing::instrument(skip_all)]
    pub async fn crawl(&self, cancel: CancellationToken) -> Result<CrawlSummary, CrawlError> {
        let workers = self.config.max_workers.max(1);
        // Workers watch a child token so a fatal error can stop them without touching the caller's.
        let stop = cancel.child_token();
        let mut schedule = Schedule::default();
        let mut in_flight: JoinSet<(u64, Result<Step, CrawlError>)> = JoinSet::new();
        let mut fatal: Option<CrawlError> = None;
        let mut processed: u64 = 0;

        tracing::info!(workers, "Crawl started");

        loop {
            if stop.is_cancelled() {
                break;
            }

            // Phase 1: fill worker pool, URLs whose politeness slot arrived first
            while in_flight.len() < workers {
                if let Some((batch, url)) = schedule.pop_due(Instant::now()) {
                    let worker = self.clone();
                    let token = stop.clone();
                    in_flight.spawn(async move {
                        (batch, worker.fetch_and_record(url, token).await.map(|()| Step::Done))
                    });
                    continue;
                }
                if !schedule.has_ready() && schedule.deferred() < Config::MAX_DEFERRED {
                    match self.db.next_batch() {
                        Ok(Some(urls)) => schedule.push_batch(urls),
                        Ok(None) => {}
                        Err(e) => {
                            fatal = Some(e.into());
                            break;
                        }
                    }
                }
                let Some((batch, url)) = schedule.pop_ready() else {
                    break;
                };
                let worker = self.clone();
                let token = stop.clone();
                in_flight.spawn(async move { (batch, worker.process(url, token).await) });
            }
            if fatal.is_some() {
                stop.cancel();
                break;
            }

            // Phase 2: completion check
            if in_flight.is_empty() && schedule.deferred() == 0 {
                tracing::info!("Crawl complete: frontier empty and no tasks in flight");
                break;
            }

            // Phase 3: collect one finished task, or wake for the next politeness slot
            let next_due = schedule.next_due().filter(|_| in_flight.len() < workers);
            tokio::select! {
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    processed += 1;
                    if let Err(e) = self.settle(joined, &mut schedule) {
                        fatal = Some(e);
                        stop.cancel();
                        break;
                    }
                    if processed % PROGRESS_INTERVAL == 0 {
                        let (buffered, files) = self.db.frontier().pending();
                        tracing::info!(
                            processed,
                            fetched = self.counters.fetched.get(),
                            deferred = schedule.deferred(),
                            buffered,
                            files,
                            "Progress"
                        );
                    }
                }
                _ = sleep_until(next_due.unwrap_or_else(Instant::now)), if next_due.is_some() => {}
                _ = stop.cancelled() => {
                    tracing::info!("Cancellation requested, draining workers");
                }
            }
        }

        // Drain any tasks that are still running
        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = self.settle(joined, &mut schedule) {
                fatal.get_or_insert(e);
            }
        }

        if let Err(e) = self.wind_down(&mut schedule) {
            fatal.get_or_insert(e);
        }

        if let Some(e) = fatal {
            tracing::error!("Crawl aborted: {}", e);
            return Err(e);
        }

        let mut summary = self.counters.snapshot();
        summary.cancelled = cancel.is_cancelled();
        tracing::info!(
            fetched = summary.fetched,
            errors = summary.network_errors + summary.parsing_errors,
            cancelled = summary.cancelled,
            "Crawl finished"
        );
        Ok(summary)
    }

    fn settle(
        &self,
        joined: Result<(u64, Result<Step, CrawlError>), tokio::task::JoinError>,
        schedule: &mut Schedule,
    ) -> Result<(), CrawlError> {
        let (batch, result) = match joined {
            Ok(joined) => joined,
            Err(e) => {
                // The batch stays in flight and is handed out again next run.
                tracing::error!("Task join error: {}", e);
                return Ok(());
            }
        };
        match result? {
            Step::Done => self.finish(schedule, batch),
            Step::Deferred { url, ready_at } => {
                schedule.defer(batch, url, ready_at);
                Ok(())
            }
        }
    }

    fn finish(&self, schedule: &mut Schedule, batch: u64) -> Result<(), CrawlError> {
        for _ in 0..schedule.finish(batch) {
            self.db.complete_batch()?;
        }
        Ok(())
    }

    /// Put unstarted URLs back in the frontier and close out URLs still waiting
    /// on a politeness slot.
    fn wind_down(&self, schedule: &mut Schedule) -> Result<(), CrawlError> {
        let unstarted = schedule.take_ready();
        if !unstarted.is_empty() {
            tracing::debug!(count = unstarted.len(), "Returning unstarted URLs to frontier");
            let urls: Vec<Url> = unstarted.iter().map(|(_, url)| url.clone()).collect();
            self.db.frontier().add(&urls).map_err(DbError::from)?;
            for (batch, _) in unstarted {
                self.finish(schedule, batch)?;
            }
        }

        for (batch, url) in schedule.take_deferred() {
            tracing::debug!(url = %url, "Politeness wait cancelled");
            self.counters.network_errors.inc();
            self.db.record(&url, Record::error(ErrorKind::Network))?;
            self.finish(schedule, batch)?;
        }
        Ok(())
    }

    /// Take one URL from the frontier up to its fetch, or to its recorded
    /// outcome if it never gets that far. A URL whose host is not due yet comes
    /// back as [`Step::Deferred`] instead of holding a worker.
    #[tracing::instrument(skip(self, url, token), fields(url = %url))]
    async fn process(&self, url: Url, token: CancellationToken) -> Result<Step, CrawlError> {
        let key = Key::from_url(&url);
        if self.db.existence().get(&key).map_or(false, |r| r.is_resolved()) {
            tracing::debug!("Already resolved, skipping");
            return Ok(Step::Done);
        }

        if let Some(reason) = self.url_filters.first_rejection(&url) {
            tracing::info!(%reason, "URL filtered");
            self.counters.url_rejections.inc();
            self.db.record(&url, Record::error(ErrorKind::FilterUrl))?;
            return Ok(Step::Done);
        }

        let Some(host) = url_utils::host_key(&url) else {
            self.counters.url_rejections.inc();
            self.db.record(&url, Record::error(ErrorKind::FilterUrl))?;
            return Ok(Step::Done);
        };

        let crawl_delay = if self.config.ignore_robots {
            Duration::ZERO
        } else {
            let robots = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    tracing::debug!("Cancelled during robots.txt lookup");
                    self.counters.network_errors.inc();
                    self.db.record(&url, Record::error(ErrorKind::Network))?;
                    return Ok(Step::Done);
                }
                robots = self.robots.for_url(&url) => robots,
            };
            if !robots.allow(&url) {
                tracing::info!("Disallowed by robots.txt");
                self.counters.banned.inc();
                self.db.record(&url, Record::error(ErrorKind::FilterUrl))?;
                self.db.ban(&url)?;
                return Ok(Step::Done);
            }
            robots.crawl_delay()
        };

        let wait = self.gate.reserve(&host, crawl_delay);
        if !wait.is_zero() {
            tracing::debug!(wait_ms = wait.as_millis() as u64, "Waiting for politeness slot");
            return Ok(Step::Deferred {
                url,
                ready_at: Instant::now() + wait,
            });
        }

        self.fetch_and_record(url, token).await?;
        Ok(Step::Done)
    }

    /// Fetch a URL whose politeness slot has arrived and record the outcome.
    #[tracing::instrument(skip(self, url, token), fields(url = %url))]
    async fn fetch_and_record(&self, url: Url, token: CancellationToken) -> Result<(), CrawlError> {
        let key = Key::from_url(&url);
        let fetched = tokio::select! {
            biased;
            _ = token.cancelled() => Err(FetchError::Cancelled),
            result = self.fetcher.fetch(&url) => result,
        };

        let response = match fetched {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!("Fetch failed: {}", e);
                self.counters.network_errors.inc();
                self.db.record(&url, Record::error(ErrorKind::Network))?;
                return Ok(());
            }
        };
        self.counters.bytes.add(response.body.len() as u64);

        if let Some(mut target) = response.redirect_target() {
            target.set_fragment(None);
            tracing::info!(status = response.status, target = %target, "Redirect");
            self.counters.redirects.inc();
            self.db.record(&url, Record::redirect(Key::from_url(&target)))?;
            self.discover(vec![target])?;
            return Ok(());
        }

        if !response.is_success() {
            tracing::warn!(status = response.status, "Unsuccessful response");
            self.counters.network_errors.inc();
            self.db.record(&url, Record::error(ErrorKind::Network))?;
            return Ok(());
        }

        let parsed = match self.parser.parse(&url, &response) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!("Parse failed: {}", e);
                self.counters.parsing_errors.inc();
                self.db.record(&url, Record::error(ErrorKind::Parsing))?;
                return Ok(());
            }
        };

        if let Some(reason) = self.page_filters.first_rejection(&parsed.page) {
            tracing::info!(%reason, "Page filtered");
            self.counters.page_rejections.inc();
            self.db.record(&url, Record::error(ErrorKind::FilterPage))?;
            return Ok(());
        }

        self.db.store_file(key, parsed.kind, &parsed.page)?;
        self.counters.fetched.inc();
        tracing::info!(
            status = response.status,
            kind = ?parsed.kind,
            bytes = response.body.len(),
            links = parsed.links.len(),
            "fetch ok"
        );

        if matches!(parsed.kind, FileKind::Html | FileKind::Sitemap) {
            self.discover(parsed.links)?;
        }
        Ok(())
    }
}

/// What a worker hands back to the crawl loop.
#[derive(Debug)]
enum Step {
    Done,
    /// The host's next slot is at `ready_at`; fetch then.
    Deferred { url: Url, ready_at: Instant },
}

/// Crawl-loop bookkeeping: URLs not started yet, URLs waiting on a politeness
/// slot, and how many URLs of each frontier batch are still outstanding.
///
/// Batches complete oldest first, matching the frontier's in-flight files.
#[derive(Debug, Default)]
struct Schedule {
    ready: VecDeque<(u64, Url)>,
    delayed: BTreeMap<(Instant, u64), (u64, Url)>,
    outstanding: VecDeque<(u64, usize)>,
    next_batch: u64,
    next_seq: u64,
}

impl Schedule {
    fn push_batch(&mut self, urls: Vec<Url>) {
        let batch = self.next_batch;
        self.next_batch += 1;
        self.outstanding.push_back((batch, urls.len()));
        self.ready.extend(urls.into_iter().map(|url| (batch, url)));
    }

    fn has_ready(&self) -> bool {
        !self.ready.is_empty()
    }

    fn pop_ready(&mut self) -> Option<(u64, Url)> {
        self.ready.pop_front()
    }

    fn defer(&mut self, batch: u64, url: Url, ready_at: Instant) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.delayed.insert((ready_at, seq), (batch, url));
    }

    fn deferred(&self) -> usize {
        self.delayed.len()
    }

    fn next_due(&self) -> Option<Instant> {
        self.delayed.keys().next().map(|(at, _)| *at)
    }

    fn pop_due(&mut self, now: Instant) -> Option<(u64, Url)> {
        if self.next_due()? > now {
            return None;
        }
        self.delayed.pop_first().map(|(_, entry)| entry)
    }

    fn take_ready(&mut self) -> Vec<(u64, Url)> {
        self.ready.drain(..).collect()
    }

    fn take_deferred(&mut self) -> Vec<(u64, Url)> {
        std::mem::take(&mut self.delayed).into_values().collect()
    }

    /// Count one URL of `batch` as done. Returns how many batches, oldest
    /// first, are now fully done.
    fn finish(&mut self, batch: u64) -> usize {
        if let Some((_, left)) = self.outstanding.iter_mut().find(|(id, _)| *id == batch) {
            *left = left.saturating_sub(1);
        }
        let mut done = 0;
        while self.outstanding.front().map_or(false, |(_, left)| *left == 0) {
            self.outstanding.pop_front();
            done += 1;
        }
        done
    }
}
