use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

/// A fetched and classified document, as kept in the object store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page {
    pub url: Url,
    pub fetched_at: DateTime<Utc>,
    pub status: u16,
    pub content_type: Option<String>,
    pub title: Option<String>,
    /// Lowercased primary subtag, `"en"` for `en-US`.
    pub lang: Option<String>,
    pub text: String,
    pub links: Vec<Url>,
    /// Set when the classifier kept the page but could not read all of it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parse_error: Option<String>,
}

impl Page {
    pub fn new(url: Url, status: u16, content_type: Option<String>) -> Self {
        Self {
            url,
            fetched_at: Utc::now(),
            status,
            content_type,
            title: None,
            lang: None,
            text: String::new(),
            links: Vec::new(),
            parse_error: None,
        }
    }

    pub fn with_lang(mut self, lang: &str) -> Self {
        self.lang = normalize_lang(lang);
        self
    }
}

/// `"en-US"` becomes `"en"`; blank input yields `None`.
pub fn normalize_lang(lang: &str) -> Option<String> {
    let primary = lang.trim().split(['-', '_']).next().unwrap_or("").trim();
    if primary.is_empty() {
        None
    } else {
        Some(primary.to_ascii_lowercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_lang() {
        assert_eq!(normalize_lang("en-US"), Some("en".to_string()));
        assert_eq!(normalize_lang(" FR "), Some("fr".to_string()));
        assert_eq!(normalize_lang("pt_BR"), Some("pt".to_string()));
        assert_eq!(normalize_lang(""), None);
    }

    #[test]
    fn test_json_shape_omits_empty_parse_error() {
        let page = Page::new(Url::parse("https://example.org/").unwrap(), 200, None).with_lang("en");
        let json = serde_json::to_value(&page).unwrap();
        assert_eq!(json["lang"], "en");
        assert!(json.get("parse_error").is_none());

        let back: Page = serde_json::from_value(json).unwrap();
        assert_eq!(back, page);
    }
}
