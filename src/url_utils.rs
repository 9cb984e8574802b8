//! URL utilities for consistent crawling behavior across modules.

use url::Url;

/// Binary and asset extensions that are never worth fetching.
pub const DISALLOWED_EXTENSIONS: &[&str] = &[
    ".pdf", ".jpg", ".jpeg", ".png", ".gif", ".css", ".js", ".zip", ".mp4", ".avi", ".mov",
    ".mp3", ".wav", ".doc", ".docx", ".xls", ".xlsx", ".ppt", ".pptx", ".tar", ".gz", ".tgz",
    ".bz2", ".7z", ".rar", ".exe", ".msi", ".dmg", ".iso", ".apk", ".woff", ".woff2", ".svg",
];

/// `scheme://host[:port]`, the unit robots.txt and politeness apply to.
pub fn origin(url: &Url) -> Option<String> {
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{}://{}:{}", url.scheme(), host, port),
        None => format!("{}://{}", url.scheme(), host),
    })
}

/// Host plus explicit port, used as the politeness key.
pub fn host_key(url: &Url) -> Option<String> {
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

pub fn is_same_domain(url_domain: &str, base_domain: &str) -> bool {
    url_domain == base_domain || url_domain.ends_with(&format!(".{}", base_domain))
}

pub fn robots_url(url: &Url) -> Option<Url> {
    Url::parse(&format!("{}/robots.txt", origin(url)?)).ok()
}

/// Path plus `?query`, the string robots rules are tested against.
pub fn request_path(url: &Url) -> String {
    match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    }
}

/// Extension check: skip binaries/assets and download links.
pub fn has_disallowed_extension(url: &Url) -> Option<&'static str> {
    let path = url.path().to_lowercase();
    DISALLOWED_EXTENSIONS
        .iter()
        .copied()
        .find(|ext| path.ends_with(ext))
}

pub fn is_download_query(url: &Url) -> bool {
    url.query().map_or(false, |query| {
        let query_lower = query.to_ascii_lowercase();
        query_lower.contains("download") || query_lower.contains("attachment")
    })
}

/// Add https:// prefix for bare domains (CLI convenience).
pub fn normalize_url_for_cli(url: &str) -> String {
    let trimmed = url.trim();

    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        return trimmed.to_string();
    }

    format!("https://{}", trimmed)
}

pub fn is_html_content_type(content_type: &str) -> bool {
    let lower = content_type.to_ascii_lowercase();
    lower.starts_with("text/html") || lower.starts_with("application/xhtml+xml")
}

pub fn is_xml_content_type(content_type: &str) -> bool {
    let lower = content_type.to_ascii_lowercase();
    lower.starts_with("application/xml") || lower.starts_with("text/xml")
}

pub fn is_feed_content_type(content_type: &str) -> bool {
    let lower = content_type.to_ascii_lowercase();
    lower.starts_with("application/rss+xml") || lower.starts_with("application/atom+xml")
}

pub fn is_icon_content_type(content_type: &str) -> bool {
    let lower = content_type.to_ascii_lowercase();
    lower.starts_with("image/x-icon") || lower.starts_with("image/vnd.microsoft.icon")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_origin_and_host_key() {
        assert_eq!(
            origin(&url("https://example.com/path")),
            Some("https://example.com".to_string())
        );
        assert_eq!(
            origin(&url("http://127.0.0.1:8080/x")),
            Some("http://127.0.0.1:8080".to_string())
        );
        assert_eq!(host_key(&url("http://127.0.0.1:8080/x")), Some("127.0.0.1:8080".to_string()));
        assert_eq!(host_key(&url("https://example.com:443/")), Some("example.com".to_string()));
    }

    #[test]
    fn test_is_same_domain() {
        assert!(is_same_domain("test.local", "test.local"));
        assert!(is_same_domain("www.test.local", "test.local"));
        assert!(!is_same_domain("test.local", "www.test.local"));
        assert!(!is_same_domain("other.local", "test.local"));
        assert!(!is_same_domain("eviltest.local", "test.local"));
    }

    #[test]
    fn test_robots_url() {
        assert_eq!(
            robots_url(&url("https://example.com/some/path?q=1")).unwrap().as_str(),
            "https://example.com/robots.txt"
        );
        assert_eq!(
            robots_url(&url("http://test.local")).unwrap().as_str(),
            "http://test.local/robots.txt"
        );
    }

    #[test]
    fn test_request_path() {
        assert_eq!(request_path(&url("https://a.b/x/y?z=1#f")), "/x/y?z=1");
        assert_eq!(request_path(&url("https://a.b")), "/");
    }

    #[test]
    fn test_extensions_and_downloads() {
        assert_eq!(has_disallowed_extension(&url("https://t.local/file.PDF")), Some(".pdf"));
        assert_eq!(has_disallowed_extension(&url("https://t.local/page")), None);
        assert!(is_download_query(&url("https://t.local/get?Download=1")));
        assert!(!is_download_query(&url("https://t.local/get?id=1")));
    }

    #[test]
    fn test_normalize_url_for_cli() {
        assert_eq!(normalize_url_for_cli("example.com"), "https://example.com");
        assert_eq!(normalize_url_for_cli("https://example.com"), "https://example.com");
        assert_eq!(normalize_url_for_cli("http://example.com"), "http://example.com");
    }

    #[test]
    fn test_content_types() {
        assert!(is_html_content_type("text/html; charset=utf-8"));
        assert!(is_html_content_type("application/xhtml+xml"));
        assert!(!is_html_content_type("application/json"));
        assert!(is_xml_content_type("application/xml"));
        assert!(is_feed_content_type("application/rss+xml"));
        assert!(is_icon_content_type("image/x-icon"));
    }
}
