use scraper::{Html, Selector};
use sitemap::reader::{SiteMapEntity, SiteMapReader};
use std::collections::HashSet;
use std::io::Cursor;
use thiserror::Error;
use url::Url;

use crate::network::FetchResponse;
use crate::page::Page;
use crate::record::FileKind;
use crate::url_utils;

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Unsupported content type: {0}")]
    Unsupported(String),

    #[error("Invalid selector {selector}: {reason}")]
    Selector { selector: &'static str, reason: String },

    #[error("Malformed sitemap: {0}")]
    Sitemap(String),
}

/// Classifier output: what the document is, the page to store, and where it points.
#[derive(Debug, Clone)]
pub struct ParsedPage {
    pub kind: FileKind,
    pub page: Page,
    pub links: Vec<Url>,
}

/// Turns a successful response into a [`ParsedPage`].
pub trait PageParser: Send + Sync {
    fn parse(&self, url: &Url, response: &FetchResponse) -> Result<ParsedPage, ParseError>;
}

/// HTML through `scraper`, sitemaps through `sitemap`. Feeds and favicons are
/// stored but not mined for links.
pub struct DefaultParser {
    links: Selector,
    title: Selector,
    html: Selector,
    body: Selector,
}

fn selector(css: &'static str) -> Result<Selector, ParseError> {
    Selector::parse(css).map_err(|e| ParseError::Selector {
        selector: css,
        reason: format!("{:?}", e),
    })
}

impl DefaultParser {
    pub fn new() -> Result<Self, ParseError> {
        Ok(Self {
            links: selector("a[href]")?,
            title: selector("title")?,
            html: selector("html[lang]")?,
            body: selector("body")?,
        })
    }

    fn classify(url: &Url, response: &FetchResponse) -> Option<FileKind> {
        let content_type = response.content_type.as_deref().unwrap_or("");
        let path = url.path().to_ascii_lowercase();
        let head = String::from_utf8_lossy(&response.body[..response.body.len().min(512)])
            .to_ascii_lowercase();

        if path == "/robots.txt" {
            Some(FileKind::Robots)
        } else if url_utils::is_icon_content_type(content_type) || path.ends_with(".ico") {
            Some(FileKind::Favicon)
        } else if url_utils::is_feed_content_type(content_type) {
            Some(FileKind::Rss)
        } else if url_utils::is_html_content_type(content_type) {
            // A declared HTML type beats whatever the body happens to mention.
            Some(FileKind::Html)
        } else if head.contains("<rss") || head.contains("<feed") {
            Some(FileKind::Rss)
        } else if head.contains("<urlset") || head.contains("<sitemapindex") {
            Some(FileKind::Sitemap)
        } else if content_type.is_empty() && (head.contains("<html") || head.contains("<!doctype html")) {
            Some(FileKind::Html)
        } else if url_utils::is_xml_content_type(content_type) && path.ends_with("sitemap.xml") {
            Some(FileKind::Sitemap)
        } else {
            None
        }
    }

    fn parse_html(&self, page: &mut Page, body: &str) -> Vec<Url> {
        let document = Html::parse_document(body);

        page.title = document
            .select(&self.title)
            .next()
            .map(|t| t.text().collect::<String>().trim().to_string())
            .filter(|t| !t.is_empty());

        if let Some(html) = document.select(&self.html).next() {
            if let Some(lang) = html.value().attr("lang") {
                page.lang = crate::page::normalize_lang(lang);
            }
        }

        page.text = document
            .select(&self.body)
            .next()
            .map(|b| b.text().flat_map(str::split_whitespace).collect::<Vec<_>>().join(" "))
            .unwrap_or_default();

        let mut seen = HashSet::new();
        let mut links = Vec::new();
        for element in document.select(&self.links) {
            let Some(href) = element.value().attr("href") else {
                continue;
            };
            let href = href.trim();
            // Skip empty links, javascript links, mailto, tel, etc.
            if href.is_empty()
                || href.starts_with('#')
                || href.starts_with("javascript:")
                || href.starts_with("mailto:")
                || href.starts_with("tel:")
                || href.starts_with("data:")
                || href.starts_with("file:")
            {
                continue;
            }
            if let Ok(mut absolute) = page.url.join(href) {
                absolute.set_fragment(None);
                if seen.insert(absolute.clone()) {
                    links.push(absolute);
                }
            }
        }
        links
    }

    fn parse_sitemap(page: &mut Page, body: &[u8]) -> Vec<Url> {
        let mut links = Vec::new();
        let mut errors = Vec::new();
        for entity in SiteMapReader::new(Cursor::new(body)) {
            match entity {
                SiteMapEntity::Url(entry) => links.extend(entry.loc.get_url()),
                SiteMapEntity::SiteMap(entry) => links.extend(entry.loc.get_url()),
                SiteMapEntity::Err(e) => errors.push(e.to_string()),
            }
        }
        if !errors.is_empty() {
            page.parse_error = Some(errors.join("; "));
        }
        links
    }
}

impl PageParser for DefaultParser {
    fn parse(&self, url: &Url, response: &FetchResponse) -> Result<ParsedPage, ParseError> {
        let kind = Self::classify(url, response).ok_or_else(|| {
            ParseError::Unsupported(
                response
                    .content_type
                    .clone()
                    .unwrap_or_else(|| "unknown".to_string()),
            )
        })?;

        let mut page = Page::new(url.clone(), response.status, response.content_type.clone());
        let links = match kind {
            FileKind::Html => {
                let body = String::from_utf8_lossy(&response.body);
                self.parse_html(&mut page, &body)
            }
            FileKind::Sitemap => {
                let links = Self::parse_sitemap(&mut page, &response.body);
                if links.is_empty() {
                    if let Some(reason) = page.parse_error.take() {
                        return Err(ParseError::Sitemap(reason));
                    }
                }
                links
            }
            FileKind::Rss | FileKind::Robots => {
                page.text = String::from_utf8_lossy(&response.body).into_owned();
                Vec::new()
            }
            FileKind::Favicon => Vec::new(),
        };
        page.links = links.clone();

        Ok(ParsedPage { kind, page, links })
    }
}
