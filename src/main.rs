use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use url::Url;

use crawldb::cli::{Cli, Commands};
use crawldb::config::Config;
use crawldb::crawler::{CrawlError, Crawler, CrawlerConfig};
use crawldb::db::{Db, DbError};
use crawldb::filter::{default_url_filters, HostFilter, LangFilter, FilterList};
use crawldb::key::Key;
use crawldb::logging::{init_logging, LogGuards};
use crawldb::network::{FetchError, HttpClient};
use crawldb::parser::{DefaultParser, ParseError};
use crawldb::url_utils::normalize_url_for_cli;

#[derive(Error, Debug)]
pub enum MainError {
    #[error("Invalid URL {url}: {source}")]
    Url { url: String, source: url::ParseError },

    #[error("Database error: {0}")]
    Db(#[from] DbError),

    #[error("Crawler error: {0}")]
    Crawl(#[from] CrawlError),

    #[error("HTTP client error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Parser setup error: {0}")]
    Parser(#[from] ParseError),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Logging setup error: {0}")]
    Logging(String),

    #[error("No stored page for {0}")]
    NotStored(String),
}

impl MainError {
    fn exit_code(&self) -> i32 {
        match self {
            MainError::Url { .. } => 2,
            MainError::Fetch(_) => 4,
            _ => 3,
        }
    }
}

fn parse_url(raw: &str) -> Result<Url, MainError> {
    let normalized = normalize_url_for_cli(raw);
    Url::parse(&normalized).map_err(|source| MainError::Url {
        url: normalized,
        source,
    })
}

fn start_logging(data_dir: &Path) -> Result<LogGuards, MainError> {
    init_logging(data_dir.join(Config::LOG_DIR)).map_err(|e| MainError::Logging(e.to_string()))
}

struct CrawlArgs {
    roots: Vec<String>,
    data_dir: PathBuf,
    config: CrawlerConfig,
    lang: Vec<String>,
    same_host: bool,
}

/// Build crawler dependencies and wire concrete components together
fn build_crawler(args: &CrawlArgs, roots: &[Url], db: Arc<Db>) -> Result<Crawler, MainError> {
    let http = Arc::new(HttpClient::new(
        &args.config.user_agent,
        args.config.timeout,
        args.config.max_content_size,
    )?);
    let parser = Arc::new(DefaultParser::new()?);

    let mut url_filters = default_url_filters();
    if args.same_host {
        url_filters.push(HostFilter::new(roots.iter().filter_map(|u| u.host_str().map(str::to_string))));
    }
    let mut page_filters = FilterList::new();
    if !args.lang.is_empty() {
        page_filters.push(LangFilter::new(&args.lang));
    }

    Ok(Crawler::new(db, http, parser, args.config.clone())
        .with_url_filters(url_filters)
        .with_page_filters(page_filters))
}

async fn run_crawl_command(args: CrawlArgs) -> Result<(), MainError> {
    let roots = args
        .roots
        .iter()
        .map(|r| parse_url(r))
        .collect::<Result<Vec<_>, _>>()?;

    let db = Arc::new(Db::open(&args.data_dir)?);
    let crawler = build_crawler(&args, &roots, Arc::clone(&db))?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
            on_signal.cancel();
        }
    });

    println!(
        "Crawling {} root(s) ({} workers, {}s timeout)",
        roots.len(),
        args.config.max_workers,
        args.config.timeout.as_secs()
    );
    crawler.seed(roots).await?;
    let result = crawler.crawl(cancel).await;

    // Close even when the crawl failed so the logs are flushed.
    db.close()?;
    let summary = result?;
    println!("{}", summary);
    println!("data: {}", args.data_dir.display());
    Ok(())
}

fn run_stats_command(data_dir: &Path, json: bool) -> Result<(), MainError> {
    let db = Db::open(data_dir)?;
    let stats = db.statistics()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        println!("{}", stats);
    }
    Ok(())
}

fn run_get_command(data_dir: &Path, raw: &str) -> Result<(), MainError> {
    let db = Db::open(data_dir)?;
    let url = parse_url(raw)?;
    let key = Key::from_url(&url);
    match db.existence().get(&key) {
        Some(record) if record.record_type().is_file() => {
            let page = db.get_page(&key)?;
            println!("{}", serde_json::to_string_pretty(&page)?);
            Ok(())
        }
        Some(record) => {
            println!("{} is {}", url, record.record_type());
            Ok(())
        }
        None => Err(MainError::NotStored(url.to_string())),
    }
}

fn run_bans_command(data_dir: &Path) -> Result<(), MainError> {
    let db = Db::open(data_dir)?;
    for ban in db.bans()? {
        println!("{}", ban);
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<(), MainError> {
    match cli.command {
        Commands::Crawl {
            roots,
            data_dir,
            workers,
            user_agent,
            timeout,
            min_crawl_delay,
            max_crawl_delay,
            lang,
            same_host,
            ignore_robots,
            max_content_size,
        } => {
            let data_dir = PathBuf::from(data_dir);
            let _guards = start_logging(&data_dir)?;
            let config = CrawlerConfig {
                max_workers: workers,
                user_agent,
                timeout: Duration::from_secs(timeout),
                max_content_size,
                min_crawl_delay: Duration::from_millis(min_crawl_delay),
                max_crawl_delay: Duration::from_secs(max_crawl_delay),
                ignore_robots,
                ..CrawlerConfig::default()
            };
            run_crawl_command(CrawlArgs {
                roots,
                data_dir,
                config,
                lang,
                same_host,
            })
            .await
        }
        Commands::Stats { data_dir, json } => run_stats_command(Path::new(&data_dir), json),
        Commands::Get { data_dir, url } => run_get_command(Path::new(&data_dir), &url),
        Commands::Bans { data_dir } => run_bans_command(Path::new(&data_dir)),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse_args();
    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}
