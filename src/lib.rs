pub mod buffer_pool;
pub mod cli;
pub mod config;
pub mod crawler;
pub mod db;
pub mod existence;
pub mod filter;
pub mod frontier;
pub mod key;
pub mod logging;
pub mod network;
pub mod object_store;
pub mod page;
pub mod parser;
pub mod politeness;
pub mod record;
pub mod robots;
pub mod stats;
pub mod url_utils;

// Re-export main types for library usage
pub use crawler::{CrawlError, Crawler, CrawlerConfig};
pub use db::{Db, DbError};
pub use filter::{Filter, FilterList, HostFilter, LangFilter};
pub use key::Key;
pub use network::{FetchError, FetchResponse, Fetcher, HttpClient};
pub use page::Page;
pub use parser::{DefaultParser, PageParser, ParsedPage};
pub use record::{Record, RecordType};
pub use robots::{RobotsCache, RobotsFile};
pub use stats::{CrawlSummary, Statistics};
