use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{ACCEPT, CONTENT_LENGTH, CONTENT_TYPE, LOCATION};
use std::error::Error as _;
use std::time::Duration;
use tokio::time::timeout;
use url::Url;

use crate::config::Config;

/// Anything that can turn a URL into a response. The crawler only talks to this trait.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &Url) -> Result<FetchResponse, FetchError>;
}

/// Raw HTTP response as seen by the crawler. Redirects are never followed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResponse {
    pub url: Url,
    pub status: u16,
    /// Raw `Location` header, resolved against `url` by [`redirect_target`](Self::redirect_target).
    pub location: Option<String>,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl FetchResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_redirect(&self) -> bool {
        (300..400).contains(&self.status)
    }

    pub fn redirect_target(&self) -> Option<Url> {
        if !self.is_redirect() {
            return None;
        }
        self.location
            .as_deref()
            .and_then(|location| self.url.join(location).ok())
    }
}

/// HTTP client for making web requests
#[derive(Debug)]
pub struct HttpClient {
    client: reqwest::Client,
    timeout_duration: Duration,
    user_agent: String,
    max_content_size: usize,
}

impl HttpClient {
    pub fn new(user_agent: &str, timeout_duration: Duration, max_content_size: usize) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(timeout_duration)
            .connect_timeout(Duration::from_secs(Config::CONNECT_TIMEOUT_SECS))
            .pool_max_idle_per_host(Config::POOL_IDLE_PER_HOST)
            .pool_idle_timeout(Duration::from_secs(Config::POOL_IDLE_TIMEOUT_SECS))
            .tcp_nodelay(true)
            // The crawler records redirects itself.
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| FetchError::Client(e.to_string()))?;

        Ok(Self {
            client,
            timeout_duration,
            user_agent: user_agent.to_string(),
            max_content_size,
        })
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    async fn fetch_once(&self, url: &Url) -> Result<FetchResponse, FetchError> {
        let response = self
            .client
            .get(url.clone())
            .header(
                ACCEPT,
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
            )
            .send()
            .await
            .map_err(Self::classify_error)?;

        let status = response.status().as_u16();
        let header = |name| {
            response
                .headers()
                .get(name)
                .and_then(|h| h.to_str().ok())
                .map(|s| s.to_string())
        };
        let location = header(LOCATION);
        let content_type = header(CONTENT_TYPE);

        // Check content length header first
        if let Some(length) = header(CONTENT_LENGTH).and_then(|s| s.parse::<usize>().ok()) {
            if length > self.max_content_size {
                return Err(FetchError::ContentTooLarge(length, self.max_content_size));
            }
        }

        let mut body = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| FetchError::Body(e.to_string()))?;
            // Enforce size limit while streaming
            if body.len() + chunk.len() > self.max_content_size {
                return Err(FetchError::ContentTooLarge(
                    body.len() + chunk.len(),
                    self.max_content_size,
                ));
            }
            body.extend_from_slice(&chunk);
        }

        Ok(FetchResponse {
            url: url.clone(),
            status,
            location,
            content_type,
            body,
        })
    }

    /// Classify reqwest errors into our FetchError types
    fn classify_error(error: reqwest::Error) -> FetchError {
        if error.is_timeout() {
            return FetchError::Timeout;
        }

        let mut message = error.to_string();
        let mut source = error.source();
        while let Some(inner) = source {
            message.push_str(": ");
            message.push_str(&inner.to_string());
            source = inner.source();
        }
        let lower = message.to_lowercase();

        if lower.contains("connection refused") {
            FetchError::ConnectionRefused
        } else if lower.contains("dns") || lower.contains("name resolution") {
            FetchError::Dns
        } else if lower.contains("ssl") || lower.contains("tls") || lower.contains("certificate") {
            FetchError::Tls
        } else {
            FetchError::Network(message)
        }
    }
}

#[async_trait]
impl Fetcher for HttpClient {
    async fn fetch(&self, url: &Url) -> Result<FetchResponse, FetchError> {
        timeout(self.timeout_duration, self.fetch_once(url))
            .await
            .map_err(|_| FetchError::Timeout)?
    }
}

/// Errors that can occur during HTTP fetching
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection refused - server not accepting connections")]
    ConnectionRefused,

    #[error("DNS resolution failed")]
    Dns,

    #[error("SSL/TLS error - certificate or encryption issue")]
    Tls,

    #[error("Request timeout")]
    Timeout,

    #[error("Failed to read response body: {0}")]
    Body(String),

    #[error("Content too large: {0} bytes (max: {1} bytes)")]
    ContentTooLarge(usize, usize),

    #[error("Failed to build HTTP client: {0}")]
    Client(String),

    #[error("Fetch cancelled")]
    Cancelled,
}
