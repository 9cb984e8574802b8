// Global configuration constants - single source of truth

pub struct Config;

impl Config {
    // On-disk layout
    pub const EXISTENCE_FILE: &'static str = "existence.bin";
    pub const FRONTIER_DIR: &'static str = "url";
    pub const BAN_FILE: &'static str = "ban.txt";
    pub const OBJECT_DIR: &'static str = "object";
    pub const LOG_DIR: &'static str = "logs";

    // Frontier
    pub const FRONTIER_FILE_ENTRIES: usize = 10_000;

    // Robots
    pub const ROBOTS_FRESHNESS_SECS: u64 = 24 * 60 * 60;
    pub const MIN_CRAWL_DELAY_MS: u64 = 0;
    pub const MAX_CRAWL_DELAY_SECS: u64 = 10;
    pub const MAX_ROBOTS_REDIRECTS: usize = 5;

    // HTTP/Network config
    pub const USER_AGENT: &'static str = "crawldb/0.1";
    pub const REQUEST_TIMEOUT_SECS: u64 = 30;
    pub const CONNECT_TIMEOUT_SECS: u64 = 10;
    pub const MAX_CONTENT_SIZE: usize = 10 * 1024 * 1024; // 10MB
    pub const POOL_IDLE_PER_HOST: usize = 16;
    pub const POOL_IDLE_TIMEOUT_SECS: u64 = 30;

    // Workers
    pub const MAX_WORKERS: usize = 16;
    /// No new frontier batch is taken while this many URLs wait on a politeness slot.
    pub const MAX_DEFERRED: usize = 10_000;

    // Buffer pool
    pub const POOL_RETAINED_BUFFERS: usize = 64;
    pub const POOL_MAX_BUFFER_CAPACITY: usize = 4 * 1024 * 1024;
}
