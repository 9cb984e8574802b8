use clap::{Parser, Subcommand};

use crate::config::Config;

/// CLI entry point so users can control the crawler from the command line.
/// Exit codes: 0=success, 2=invalid arguments, 3=I/O or database error, 4=network setup error
#[derive(Parser, Debug)]
#[command(name = "crawldb")]
#[command(about = "A polite, resumable web crawler with a content-addressed store")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Crawl from root URLs. Re-running on the same data dir resumes.
    Crawl {
        #[arg(short, long = "root", required = true, help = "Root URL to start from (repeatable)")]
        roots: Vec<String>,

        #[arg(
            short,
            long,
            default_value = "./data",
            help = "Directory holding the crawl database"
        )]
        data_dir: String,

        #[arg(short, long, default_value_t = Config::MAX_WORKERS, help = "Concurrent workers")]
        workers: usize,

        #[arg(
            short,
            long,
            default_value = Config::USER_AGENT,
            help = "User agent string for requests"
        )]
        user_agent: String,

        #[arg(
            short,
            long,
            default_value_t = Config::REQUEST_TIMEOUT_SECS,
            help = "Request timeout in seconds"
        )]
        timeout: u64,

        #[arg(
            long,
            default_value_t = Config::MIN_CRAWL_DELAY_MS,
            help = "Minimum spacing between requests to one host, in milliseconds"
        )]
        min_crawl_delay: u64,

        #[arg(
            long,
            default_value_t = Config::MAX_CRAWL_DELAY_SECS,
            help = "Upper bound on a robots.txt crawl-delay, in seconds"
        )]
        max_crawl_delay: u64,

        #[arg(long, help = "Only keep pages in this language (repeatable)")]
        lang: Vec<String>,

        #[arg(long, help = "Stay on the hosts of the root URLs and their subdomains")]
        same_host: bool,

        #[arg(long, help = "Disable robots.txt compliance")]
        ignore_robots: bool,

        #[arg(
            long,
            default_value_t = Config::MAX_CONTENT_SIZE,
            help = "Largest response body accepted, in bytes"
        )]
        max_content_size: usize,
    },

    /// Print record counts for a crawl database.
    Stats {
        #[arg(short, long, default_value = "./data")]
        data_dir: String,

        #[arg(long, help = "Print as JSON")]
        json: bool,
    },

    /// Print the stored page for a URL as JSON.
    Get {
        #[arg(short, long, default_value = "./data")]
        data_dir: String,

        url: String,
    },

    /// List URLs banned by robots.txt.
    Bans {
        #[arg(short, long, default_value = "./data")]
        data_dir: String,
    },
}

impl Cli {
    /// Parse CLI arguments so the rest of the program can rely on structured options.
    /// On error, clap prints help and exits with code 2 (usage error).
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
