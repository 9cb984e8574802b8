//! Pluggable accept/reject predicates for URLs and pages.

use std::sync::Arc;
use url::Url;

use crate::page::{normalize_lang, Page};
use crate::url_utils;

/// Returns `Some(reason)` to reject, `None` to accept.
pub trait Filter<T: ?Sized>: Send + Sync {
    fn evaluate(&self, item: &T) -> Option<String>;
}

impl<T: ?Sized, F> Filter<T> for F
where
    F: Fn(&T) -> Option<String> + Send + Sync,
{
    fn evaluate(&self, item: &T) -> Option<String> {
        self(item)
    }
}

/// Ordered set of filters; the first rejection wins.
pub struct FilterList<T: ?Sized> {
    filters: Vec<Arc<dyn Filter<T>>>,
}

impl<T: ?Sized> Default for FilterList<T> {
    fn default() -> Self {
        Self {
            filters: Vec::new(),
        }
    }
}

impl<T: ?Sized> Clone for FilterList<T> {
    fn clone(&self) -> Self {
        Self {
            filters: self.filters.clone(),
        }
    }
}

impl<T: ?Sized> FilterList<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<F: Filter<T> + 'static>(mut self, filter: F) -> Self {
        self.push(filter);
        self
    }

    pub fn push<F: Filter<T> + 'static>(&mut self, filter: F) {
        self.filters.push(Arc::new(filter));
    }

    /// First non-empty reason; an empty reason counts as acceptance.
    pub fn first_rejection(&self, item: &T) -> Option<String> {
        self.filters
            .iter()
            .filter_map(|filter| filter.evaluate(item))
            .find(|reason| !reason.is_empty())
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}

/// Accept only the listed hosts and their subdomains.
#[derive(Debug, Clone)]
pub struct HostFilter {
    hosts: Vec<String>,
}

impl HostFilter {
    pub fn new<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            hosts: hosts
                .into_iter()
                .map(|h| h.into().to_ascii_lowercase())
                .collect(),
        }
    }
}

impl Filter<Url> for HostFilter {
    fn evaluate(&self, url: &Url) -> Option<String> {
        let host = match url.host_str() {
            Some(host) => host.to_ascii_lowercase(),
            None => return Some("no host".to_string()),
        };
        if self
            .hosts
            .iter()
            .any(|allowed| url_utils::is_same_domain(&host, allowed))
        {
            None
        } else {
            Some(format!("host {} not allowed", host))
        }
    }
}

/// Accept only http and https.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchemeFilter;

impl Filter<Url> for SchemeFilter {
    fn evaluate(&self, url: &Url) -> Option<String> {
        match url.scheme() {
            "http" | "https" => None,
            other => Some(format!("scheme {} not crawlable", other)),
        }
    }
}

/// Skip binaries, assets and download links.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtensionFilter;

impl Filter<Url> for ExtensionFilter {
    fn evaluate(&self, url: &Url) -> Option<String> {
        if let Some(ext) = url_utils::has_disallowed_extension(url) {
            return Some(format!("extension {} skipped", ext));
        }
        if url_utils::is_download_query(url) {
            return Some("download link".to_string());
        }
        None
    }
}

/// Keep pages in one of the given languages. Pages without a language pass.
#[derive(Debug, Clone)]
pub struct LangFilter {
    langs: Vec<String>,
}

impl LangFilter {
    pub fn new<I, S>(langs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            langs: langs
                .into_iter()
                .filter_map(|l| normalize_lang(l.as_ref()))
                .collect(),
        }
    }
}

impl Filter<Page> for LangFilter {
    fn evaluate(&self, page: &Page) -> Option<String> {
        match &page.lang {
            Some(lang) if !self.langs.iter().any(|l| l == lang) => {
                Some(format!("language {} not wanted", lang))
            }
            _ => None,
        }
    }
}

/// The URL filters every crawl starts with.
pub fn default_url_filters() -> FilterList<Url> {
    FilterList::new().with(SchemeFilter).with(ExtensionFilter)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_host_filter_accepts_subdomains() {
        let filter = HostFilter::new(["example.org"]);
        assert!(filter.evaluate(&url("https://example.org/a")).is_none());
        assert!(filter.evaluate(&url("https://www.Example.org/a")).is_none());
        assert!(filter.evaluate(&url("https://other.org/")).is_some());
        assert!(filter.evaluate(&url("https://notexample.org/")).is_some());
    }

    #[test]
    fn test_scheme_and_extension_filters() {
        let filters = default_url_filters();
        assert!(filters.first_rejection(&url("https://t.local/page")).is_none());
        assert!(filters.first_rejection(&url("ftp://t.local/page")).unwrap().contains("ftp"));
        assert!(filters.first_rejection(&url("https://t.local/a.pdf")).unwrap().contains(".pdf"));
        assert!(filters.first_rejection(&url("https://t.local/x?attachment=1")).is_some());
    }

    #[test]
    fn test_first_rejection_wins() {
        let filters: FilterList<Url> = FilterList::new()
            .with(|_: &Url| Some("first".to_string()))
            .with(|_: &Url| Some("second".to_string()));
        assert_eq!(filters.first_rejection(&url("https://t.local/")), Some("first".to_string()));
        assert_eq!(filters.len(), 2);
    }

    #[test]
    fn test_empty_reason_does_not_reject() {
        let filters: FilterList<Url> = FilterList::new()
            .with(|_: &Url| Some(String::new()))
            .with(|u: &Url| (u.path() == "/x").then(|| "x".to_string()));
        assert_eq!(filters.first_rejection(&url("https://t.local/")), None);
        assert_eq!(filters.first_rejection(&url("https://t.local/x")), Some("x".to_string()));
    }

    #[test]
    fn test_closure_filter() {
        let filters: FilterList<Url> =
            FilterList::new().with(|u: &Url| u.path().starts_with("/admin").then(|| "admin".to_string()));
        assert!(filters.first_rejection(&url("https://t.local/admin/x")).is_some());
        assert!(filters.first_rejection(&url("https://t.local/home")).is_none());
    }

    #[test]
    fn test_lang_filter() {
        let filter = LangFilter::new(["en-US"]);
        let base = Page::new(url("https://t.local/"), 200, None);
        assert!(filter.evaluate(&base.clone().with_lang("en")).is_none());
        assert!(filter.evaluate(&base.clone().with_lang("fr")).is_some());
        assert!(filter.evaluate(&base).is_none());
    }
}
