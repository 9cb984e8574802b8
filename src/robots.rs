use chrono::{DateTime, Utc};
use dashmap::DashMap;
use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use url::Url;

use crate::config::Config;
use crate::db::Db;
use crate::key::Key;
use crate::network::{FetchError, FetchResponse, Fetcher};
use crate::page::Page;
use crate::record::FileKind;
use crate::url_utils;

/// One allow/disallow line, pattern already percent-decoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub allow: bool,
    pub pattern: String,
    /// Length of the pattern as written, used for precedence.
    pub raw_len: usize,
}

impl Rule {
    fn new(allow: bool, raw: &str) -> Self {
        Self {
            allow,
            pattern: decode(raw),
            raw_len: raw.len(),
        }
    }

    /// Robots glob match: `*` spans anything, a trailing `$` anchors the end.
    pub fn matches(&self, path: &str) -> bool {
        let (pattern, anchored) = match self.pattern.strip_suffix('$') {
            Some(p) => (p, true),
            None => (self.pattern.as_str(), false),
        };
        let segments: Vec<&str> = pattern.split('*').collect();
        let first = segments[0];
        if !path.starts_with(first) {
            return false;
        }
        if segments.len() == 1 {
            return !anchored || path.len() == first.len();
        }

        let mut rest = &path[first.len()..];
        let last = segments[segments.len() - 1];
        for middle in &segments[1..segments.len() - 1] {
            match rest.find(middle) {
                Some(at) => rest = &rest[at + middle.len()..],
                None => return false,
            }
        }
        if anchored {
            rest.ends_with(last)
        } else {
            rest.contains(last)
        }
    }
}

fn decode(s: &str) -> String {
    percent_decode_str(s).decode_utf8_lossy().into_owned()
}

/// Parsed robots.txt as it applies to this crawler (the `*` group only).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RobotsFile {
    /// Whole seconds, 0 when unset.
    pub crawl_delay: u64,
    pub sitemaps: Vec<Url>,
    /// Longest pattern first; the first matching rule decides.
    pub rules: Vec<Rule>,
}

impl RobotsFile {
    pub fn parse(content: &[u8]) -> Self {
        let text = String::from_utf8_lossy(content);
        let mut robots = RobotsFile::default();

        // The ungrouped preamble counts as the wildcard group.
        let mut in_wildcard = true;
        let mut group_has_rules = false;
        let mut last_was_agent = false;

        for raw_line in text.lines() {
            if raw_line.trim().is_empty() {
                if group_has_rules {
                    in_wildcard = false;
                    group_has_rules = false;
                    last_was_agent = false;
                }
                continue;
            }

            let line = match raw_line.find('#') {
                Some(at) => &raw_line[..at],
                None => raw_line,
            };
            let (key, value) = match line.split_once(':') {
                Some((key, value)) => (key.trim().to_lowercase(), value.trim()),
                None => continue,
            };

            match key.as_str() {
                "user-agent" => {
                    if !last_was_agent {
                        in_wildcard = false;
                        group_has_rules = false;
                    }
                    if value == "*" {
                        in_wildcard = true;
                    }
                    last_was_agent = true;
                }
                "allow" | "disallow" => {
                    last_was_agent = false;
                    group_has_rules = true;
                    if in_wildcard && !value.is_empty() {
                        robots.rules.push(Rule::new(key == "allow", value));
                    }
                }
                "sitemap" => {
                    if let Ok(url) = Url::parse(value) {
                        robots.sitemaps.push(url);
                    }
                }
                "crawl-delay" => {
                    if let Ok(secs) = value.parse::<f64>() {
                        if secs.is_finite() && secs > 0.0 {
                            robots.crawl_delay = secs.ceil() as u64;
                        }
                    }
                }
                _ => {}
            }
        }

        // Stable: equal-length patterns keep file order, except Allow goes first.
        robots
            .rules
            .sort_by(|a, b| b.raw_len.cmp(&a.raw_len).then(b.allow.cmp(&a.allow)));
        robots
    }

    pub fn allow(&self, url: &Url) -> bool {
        self.allow_path(&url_utils::request_path(url))
    }

    pub fn allow_path(&self, path: &str) -> bool {
        let path = decode(path);
        self.rules
            .iter()
            .find(|rule| rule.matches(&path))
            .map_or(true, |rule| rule.allow)
    }

    pub fn crawl_delay(&self) -> Duration {
        Duration::from_secs(self.crawl_delay)
    }
}

/// A loaded robots.txt and when it was fetched.
#[derive(Debug)]
struct Loaded {
    fetched_at: DateTime<Utc>,
    file: Arc<RobotsFile>,
}

/// Per-host robots.txt: memory first, then the object store while fresh, then the network.
///
/// Entries in either layer older than `freshness` are fetched again. Concurrent
/// lookups for one host share a single load; no lock is held while it runs.
pub struct RobotsCache {
    db: Arc<Db>,
    fetcher: Arc<dyn Fetcher>,
    freshness: Duration,
    memory: DashMap<String, Arc<OnceCell<Loaded>>>,
}

impl RobotsCache {
    pub fn new(db: Arc<Db>, fetcher: Arc<dyn Fetcher>, freshness: Duration) -> Self {
        Self {
            db,
            fetcher,
            freshness,
            memory: DashMap::new(),
        }
    }

    /// Rules for the origin of `url`. Never fails; anything unusable allows everything.
    pub async fn for_url(&self, url: &Url) -> Arc<RobotsFile> {
        match (url.host_str(), url_utils::host_key(url)) {
            (Some(_), Some(host)) => self.get_robots(url.scheme(), &host).await,
            _ => Arc::new(RobotsFile::default()),
        }
    }

    /// `host` may carry an explicit port.
    #[tracing::instrument(skip(self))]
    pub async fn get_robots(&self, scheme: &str, host: &str) -> Arc<RobotsFile> {
        let origin = format!("{}://{}", scheme, host);
        let cell = {
            let mut slot = self
                .memory
                .entry(origin.clone())
                .or_insert_with(|| Arc::new(OnceCell::new()));
            let stale = slot
                .value()
                .get()
                .map_or(false, |loaded| !self.is_fresh(loaded.fetched_at));
            if stale {
                *slot.value_mut() = Arc::new(OnceCell::new());
            }
            Arc::clone(slot.value())
        };

        let loaded = cell.get_or_init(|| self.load(&origin)).await;
        Arc::clone(&loaded.file)
    }

    fn is_fresh(&self, fetched_at: DateTime<Utc>) -> bool {
        let age = Utc::now().signed_duration_since(fetched_at).num_seconds();
        age < self.freshness.as_secs() as i64
    }

    async fn load(&self, origin: &str) -> Loaded {
        let robots_url = match Url::parse(origin).ok().and_then(|u| url_utils::robots_url(&u)) {
            Some(url) => url,
            None => {
                tracing::debug!(origin, "Unusable robots origin");
                return Loaded {
                    fetched_at: Utc::now(),
                    file: Arc::new(RobotsFile::default()),
                };
            }
        };
        let key = Key::from_url(&robots_url);

        match self.db.objects().get::<Page>(&key) {
            Ok(page) if self.is_fresh(page.fetched_at) => {
                tracing::debug!(origin, "robots.txt served from store");
                return Loaded {
                    fetched_at: page.fetched_at,
                    file: Arc::new(RobotsFile::parse(page.text.as_bytes())),
                };
            }
            Ok(_) => tracing::debug!(origin, "Stored robots.txt is stale"),
            Err(e) if e.is_not_found() => {}
            Err(e) => tracing::warn!(origin, "Failed to read stored robots.txt: {}", e),
        }

        let mut page = match self.fetch_following_redirects(&robots_url).await {
            Ok(response) if response.is_success() => {
                let mut page = Page::new(robots_url.clone(), response.status, response.content_type);
                page.text = String::from_utf8_lossy(&response.body).into_owned();
                page
            }
            Ok(response) => {
                tracing::debug!(origin, status = response.status, "No robots.txt, allowing all");
                Page::new(robots_url.clone(), response.status, response.content_type)
            }
            Err(e) => {
                tracing::debug!(origin, "robots.txt fetch failed, allowing all: {}", e);
                let mut page = Page::new(robots_url.clone(), 0, None);
                page.parse_error = Some(e.to_string());
                page
            }
        };
        let file = RobotsFile::parse(page.text.as_bytes());
        page.links = file.sitemaps.clone();

        if let Err(e) = self.db.store_file(key, FileKind::Robots, &page) {
            tracing::warn!(origin, "Failed to store robots.txt: {}", e);
        }
        tracing::info!(origin, rules = file.rules.len(), crawl_delay = file.crawl_delay, "robots.txt loaded");
        Loaded {
            fetched_at: page.fetched_at,
            file: Arc::new(file),
        }
    }

    /// robots.txt commonly moves to https or another host; follow a few hops.
    async fn fetch_following_redirects(&self, url: &Url) -> Result<FetchResponse, FetchError> {
        let mut target = url.clone();
        for _ in 0..=Config::MAX_ROBOTS_REDIRECTS {
            let response = self.fetcher.fetch(&target).await?;
            match response.redirect_target() {
                Some(next) => {
                    tracing::debug!(from = %target, to = %next, "robots.txt redirected");
                    target = next;
                }
                None => return Ok(response),
            }
        }
        Err(FetchError::Network(format!("too many redirects for {}", url)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RecordType;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn robots(content: &str) -> RobotsFile {
        RobotsFile::parse(content.as_bytes())
    }

    #[test]
    fn test_robots_txt_parsing() {
        let robots = robots(
            r#"
User-agent: *
Disallow: /private/
Disallow: /admin/
Allow: /public/

User-agent: Googlebot
Disallow: /secret/
"#,
        );

        assert!(!robots.allow_path("/private/secret"));
        assert!(!robots.allow_path("/admin/dashboard"));
        assert!(robots.allow_path("/public/info"));
        assert!(robots.allow_path("/other/page"));
        // Googlebot's group does not apply to us.
        assert!(robots.allow_path("/secret/data"));
    }

    #[test]
    fn test_longer_pattern_wins_and_allow_breaks_ties() {
        let robots = robots("User-agent: *\nDisallow: /dir/\nAllow: /dir/images/\n");
        assert!(robots.allow_path("/dir/images/cat.png"));
        assert!(!robots.allow_path("/dir/other"));

        let tie = RobotsFile::parse(b"User-agent: *\nDisallow: /page\nAllow: /page\n");
        assert!(tie.allow_path("/page"));
    }

    #[test]
    fn test_wildcards_and_end_anchor() {
        let robots = robots(
            r#"
User-agent: *
Disallow: /temp*
Disallow: /*.php$
Disallow: /a*b*c
"#,
        );
        assert!(!robots.allow_path("/temp123"));
        assert!(!robots.allow_path("/index.php"));
        assert!(robots.allow_path("/index.php?x=1"));
        assert!(!robots.allow_path("/a-b-c-d"));
        assert!(robots.allow_path("/a-c-b"));
    }

    #[test]
    fn test_anchor_without_wildcard() {
        let robots = robots("User-agent: *\nDisallow: /exact$\n");
        assert!(!robots.allow_path("/exact"));
        assert!(robots.allow_path("/exact/more"));
    }

    #[test]
    fn test_preamble_and_merged_agents() {
        let robots = robots(
            r#"
Disallow: /pre
User-agent: Googlebot
User-agent: *
Disallow: /shared
User-agent: Bingbot
Disallow: /bing
"#,
        );
        assert!(!robots.allow_path("/pre"));
        assert!(!robots.allow_path("/shared"));
        assert!(robots.allow_path("/bing"));
    }

    #[test]
    fn test_blank_line_closes_group() {
        let robots = robots("User-agent: *\nDisallow: /a\n\nDisallow: /b\n");
        assert!(!robots.allow_path("/a"));
        assert!(robots.allow_path("/b"));
    }

    #[test]
    fn test_empty_pattern_and_comments() {
        let robots = robots("# hello\nUser-agent: * # us\nDisallow:\nAllow: /everything/\nnonsense line\n");
        assert!(robots.allow_path("/anything"));
        assert_eq!(robots.rules.len(), 1);
    }

    #[test]
    fn test_globals() {
        let robots = robots(
            "Sitemap: https://example.org/sitemap.xml\nUser-agent: other\nCrawl-delay: 1.5\nSitemap: not a url\n",
        );
        assert_eq!(robots.crawl_delay, 2);
        assert_eq!(robots.sitemaps.len(), 1);

        assert_eq!(RobotsFile::parse(b"Crawl-delay: -3").crawl_delay, 0);
        assert_eq!(RobotsFile::parse(b"Crawl-delay: soon").crawl_delay, 0);
    }

    #[test]
    fn test_percent_encoding_is_normalized() {
        let robots = robots("User-agent: *\nDisallow: /caf%C3%A9\n");
        assert!(!robots.allow_path("/café"));
        assert!(!robots.allow(&Url::parse("https://example.org/caf%C3%A9/menu").unwrap()));
    }

    #[test]
    fn test_query_is_part_of_the_path() {
        let robots = robots("User-agent: *\nDisallow: /search?q=\n");
        assert!(!robots.allow(&Url::parse("https://example.org/search?q=rust").unwrap()));
        assert!(robots.allow(&Url::parse("https://example.org/search").unwrap()));
    }

    #[test]
    fn test_default_allows_all() {
        let robots = RobotsFile::default();
        assert!(robots.allow_path("/anything"));
        assert_eq!(robots.crawl_delay(), Duration::ZERO);
    }

    struct CountingFetcher {
        calls: AtomicUsize,
        status: u16,
        body: &'static str,
    }

    #[async_trait]
    impl Fetcher for CountingFetcher {
        async fn fetch(&self, url: &Url) -> Result<FetchResponse, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(FetchResponse {
                url: url.clone(),
                status: self.status,
                location: None,
                content_type: Some("text/plain".to_string()),
                body: self.body.as_bytes().to_vec(),
            })
        }
    }

    fn fetcher(status: u16, body: &'static str) -> Arc<CountingFetcher> {
        Arc::new(CountingFetcher {
            calls: AtomicUsize::new(0),
            status,
            body,
        })
    }

    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    #[tokio::test]
    async fn test_cache_fetches_once_and_records_robots_file() {
        let dir = TempDir::new().unwrap();
        let db = Arc::new(Db::open(dir.path()).unwrap());
        let fetch = fetcher(200, "User-agent: *\nDisallow: /x\nCrawl-delay: 3\n");
        let cache = RobotsCache::new(Arc::clone(&db), fetch.clone(), DAY);

        let first = cache.get_robots("https", "example.org").await;
        let second = cache.get_robots("https", "example.org").await;
        assert_eq!(fetch.calls.load(Ordering::SeqCst), 1);
        assert_eq!(first.crawl_delay, 3);
        assert_eq!(first, second);

        let key = Key::new("https://example.org/robots.txt");
        assert_eq!(
            db.existence().get(&key).map(|r| r.record_type()),
            Some(RecordType::FileRobots)
        );
    }

    #[tokio::test]
    async fn test_fresh_store_entry_skips_network() {
        let dir = TempDir::new().unwrap();
        let db = Arc::new(Db::open(dir.path()).unwrap());
        let fetch = fetcher(200, "User-agent: *\nDisallow: /x\n");
        RobotsCache::new(Arc::clone(&db), fetch.clone(), DAY)
            .get_robots("https", "example.org")
            .await;

        let again = RobotsCache::new(Arc::clone(&db), fetch.clone(), DAY);
        let robots = again.get_robots("https", "example.org").await;
        assert_eq!(fetch.calls.load(Ordering::SeqCst), 1);
        assert!(!robots.allow_path("/x"));

        let stale = RobotsCache::new(Arc::clone(&db), fetch.clone(), Duration::ZERO);
        stale.get_robots("https", "example.org").await;
        assert_eq!(fetch.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_missing_robots_allows_all() {
        let dir = TempDir::new().unwrap();
        let db = Arc::new(Db::open(dir.path()).unwrap());
        let cache = RobotsCache::new(db, fetcher(404, "Disallow: /"), DAY);
        let robots = cache
            .for_url(&Url::parse("https://example.org/deep/page").unwrap())
            .await;
        assert_eq!(*robots, RobotsFile::default());
    }

    #[tokio::test]
    async fn test_memory_entry_expires_with_freshness() {
        let dir = TempDir::new().unwrap();
        let db = Arc::new(Db::open(dir.path()).unwrap());
        let fetch = fetcher(200, "User-agent: *\nDisallow: /x\n");
        let cache = RobotsCache::new(db, fetch.clone(), Duration::ZERO);

        cache.get_robots("https", "example.org").await;
        cache.get_robots("https", "example.org").await;
        assert_eq!(fetch.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_stored_robots_reads_back_as_page() {
        let dir = TempDir::new().unwrap();
        let db = Arc::new(Db::open(dir.path()).unwrap());
        let body = "User-agent: *\nDisallow: /x\nSitemap: https://example.org/sitemap.xml\n";
        let cache = RobotsCache::new(Arc::clone(&db), fetcher(200, body), DAY);
        cache.get_robots("https", "example.org").await;

        let mut pages = Vec::new();
        db.for_each_file(|key, _| pages.push(db.get_page(key).unwrap()));
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].url.as_str(), "https://example.org/robots.txt");
        assert_eq!(pages[0].text, body);
        assert_eq!(pages[0].links[0].as_str(), "https://example.org/sitemap.xml");
    }

    /// `http://` robots.txt answers with a redirect to `https://`.
    struct MovedFetcher {
        calls: AtomicUsize,
        endless: bool,
    }

    #[async_trait]
    impl Fetcher for MovedFetcher {
        async fn fetch(&self, url: &Url) -> Result<FetchResponse, FetchError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            let (status, location, body) = if self.endless {
                (302, Some(format!("/robots.txt?hop={}", n)), "")
            } else if url.scheme() == "http" {
                (301, Some("https://example.org/robots.txt".to_string()), "")
            } else {
                (200, None, "User-agent: *\nDisallow: /private/\n")
            };
            Ok(FetchResponse {
                url: url.clone(),
                status,
                location,
                content_type: Some("text/plain".to_string()),
                body: body.as_bytes().to_vec(),
            })
        }
    }

    #[tokio::test]
    async fn test_robots_redirect_is_followed() {
        let dir = TempDir::new().unwrap();
        let db = Arc::new(Db::open(dir.path()).unwrap());
        let fetch = Arc::new(MovedFetcher {
            calls: AtomicUsize::new(0),
            endless: false,
        });
        let cache = RobotsCache::new(db, fetch.clone(), DAY);

        let robots = cache.get_robots("http", "example.org").await;
        assert!(!robots.allow_path("/private/page"));
        assert_eq!(fetch.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_redirect_loop_gives_up() {
        let dir = TempDir::new().unwrap();
        let db = Arc::new(Db::open(dir.path()).unwrap());
        let fetch = Arc::new(MovedFetcher {
            calls: AtomicUsize::new(0),
            endless: true,
        });
        let cache = RobotsCache::new(db, fetch.clone(), DAY);

        let robots = cache.get_robots("https", "example.org").await;
        assert_eq!(*robots, RobotsFile::default());
        assert_eq!(fetch.calls.load(Ordering::SeqCst), Config::MAX_ROBOTS_REDIRECTS + 1);
    }
}
