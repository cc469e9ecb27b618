//! CLI entry point for the subway delay ingest.
//!
//! Provides subcommands for a single ingest pass over all configured feeds,
//! a polling loop, loading the static schedule tables, and inspecting a
//! single feed without writing anything.

use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::{Parser, Subcommand};
use subway_delays::config::IngestConfig;
use subway_delays::feed::NyctFeed;
use subway_delays::feed::nyct::snapshot_from_feed;
use subway_delays::fetch::auth::ApiKey;
use subway_delays::fetch::{BasicClient, HttpClient, fetch_bytes};
use subway_delays::ingest::Ingestor;
use subway_delays::loader::Loader;
use subway_delays::parser::parse_feed;
use subway_delays::static_gtfs::{self, StopDirectory};
use subway_delays::store::TableStore;
use tracing::{debug, info, warn};
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

#[derive(Parser)]
#[command(name = "subway_delays")]
#[command(about = "Land NYCT subway real-time trip data into analytical tables", long_about = None)]
struct Cli {
    /// JSON config file; defaults apply when omitted
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll every configured feed once and append the results
    Ingest {
        /// Only poll these source identifiers (repeatable)
        #[arg(short, long)]
        source: Vec<String>,
    },
    /// Poll every configured feed on an interval
    Poll {
        /// Seconds between polling rounds
        #[arg(short = 'r', long, default_value_t = 60)]
        interval: u64,

        /// Number of rounds to run (0 = infinite)
        #[arg(short = 'n', long, default_value_t = 0)]
        samples: usize,
    },
    /// Download the static schedule and append its reference tables
    Static,
    /// Decode a feed from a file or URL and report what would be written
    Inspect {
        /// Path to file or URL to fetch
        #[arg(value_name = "FILE_OR_URL")]
        source: String,
    },
}

type FeedIngestor = Ingestor<NyctFeed, Box<dyn TableStore>>;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok(); // Load .env file

    // Logging setup: colored stderr + JSON rolling log file
    let log_file_path =
        std::env::var("LOG_FILE_PATH").unwrap_or_else(|_| "logs/subway_delays.log".to_string());
    let log_dir = Path::new(&log_file_path)
        .parent()
        .unwrap_or(Path::new("logs"));
    let log_file_name = Path::new(&log_file_path)
        .file_name()
        .unwrap_or(OsStr::new("subway_delays.log"));

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, _file_guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::from_env("RUST_LOG").add_directive("info".parse()?));

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_file)
        .with_filter(EnvFilter::from_env("RUST_LOG_JSON").add_directive("debug".parse()?));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => IngestConfig::load(path)?,
        None => IngestConfig::default(),
    };

    match cli.command {
        Commands::Ingest { source } => {
            let sources = if source.is_empty() {
                config.sources.clone()
            } else {
                source
            };
            let ingestor = build_ingestor(&config).await?;
            let results = ingestor.run_sources(&sources, config.concurrency).await;

            let failed = results.iter().filter(|(_, r)| r.is_err()).count();
            if failed > 0 {
                bail!("{failed} of {} ticks failed", results.len());
            }
        }
        Commands::Poll { interval, samples } => {
            poll(&config, interval, samples).await?;
        }
        Commands::Static => {
            load_static(&config).await?;
        }
        Commands::Inspect { source } => {
            inspect(&config, &source).await?;
        }
    }

    Ok(())
}

/// HTTP client for the real-time feeds, with the API key header attached
/// when the configured environment variable is set.
fn feed_client(config: &IngestConfig) -> Result<Box<dyn HttpClient>> {
    let client = BasicClient::with_timeout(config.fetch_timeout())?;
    match std::env::var(&config.api_key_env) {
        Ok(key) if !key.is_empty() => {
            debug!(env = %config.api_key_env, "Using feed API key");
            Ok(Box::new(ApiKey::x_api_key(client, &key)?))
        }
        _ => Ok(Box::new(client)),
    }
}

/// Stop names for headsigns. A failed download only degrades output, so it
/// is logged and polling continues with an empty directory.
async fn stop_directory(config: &IngestConfig) -> Result<StopDirectory> {
    if !config.resolve_stop_names {
        return Ok(StopDirectory::default());
    }
    let client = BasicClient::with_timeout(config.fetch_timeout())?;
    match static_gtfs::fetch_stop_directory(&client, &config.static_url).await {
        Ok(stops) => {
            info!(stops = stops.len(), "Stop directory loaded");
            Ok(stops)
        }
        Err(e) => {
            warn!(error = %e, "Stop directory unavailable, stop names will be empty");
            Ok(StopDirectory::default())
        }
    }
}

async fn build_ingestor(config: &IngestConfig) -> Result<Arc<FeedIngestor>> {
    let feed = NyctFeed::new(feed_client(config)?, config.feed_base_url.clone())
        .with_stops(stop_directory(config).await?);
    let store = config.open_store().await;
    info!(store = store.name(), "Destination store opened");

    let ingestor = Ingestor::new(
        feed,
        config.extractor()?,
        Loader::new(store, config.load_timeout()),
        config.partition_window()?,
    );
    ingestor.prepare().await?;
    Ok(Arc::new(ingestor))
}

/// Runs a polling round over all sources every `interval` seconds.
#[tracing::instrument(skip(config), fields(sources = config.sources.len()))]
async fn poll(config: &IngestConfig, interval: u64, samples: usize) -> Result<()> {
    let ingestor = build_ingestor(config).await?;

    if samples == 0 {
        info!(interval, "Polling indefinitely. Press Ctrl+C to stop.");
    } else {
        info!(samples, interval, "Starting polling");
    }

    let mut round = 0;
    loop {
        if samples > 0 && round >= samples {
            break;
        }
        round += 1;

        let results = ingestor.run_sources(&config.sources, config.concurrency).await;
        let failed = results.iter().filter(|(_, r)| r.is_err()).count();
        info!(round, ticks = results.len(), failed, "Polling round finished");

        if samples == 0 || round < samples {
            tokio::time::sleep(tokio::time::Duration::from_secs(interval)).await;
        }
    }

    Ok(())
}

async fn load_static(config: &IngestConfig) -> Result<()> {
    let client = BasicClient::with_timeout(config.fetch_timeout())?;
    info!(url = %config.static_url, "Downloading static schedule");
    let archive = static_gtfs::fetch_archive(&client, &config.static_url).await?;

    let loader = Loader::new(config.open_store().await, config.load_timeout());
    let loaded =
        static_gtfs::load_static_tables(&loader, &archive, &config.static_tables, Utc::now()).await?;

    let rows: u64 = loaded.iter().map(|(_, rows)| rows).sum();
    info!(tables = loaded.len(), rows, "Static schedule loaded");
    Ok(())
}

/// Loads feed data from a local file path or fetches it over HTTP.
#[tracing::instrument(skip(config))]
async fn inspect(config: &IngestConfig, source: &str) -> Result<()> {
    let bytes = if source.starts_with("http") {
        let client = feed_client(config)?;
        fetch_bytes(&client, source).await?
    } else {
        std::fs::read(source).with_context(|| format!("reading {source}"))?
    };

    let feed = parse_feed(&bytes)?;
    let snapshot = snapshot_from_feed(source, &feed, &stop_directory(config).await?)?;
    let extraction = config
        .extractor()?
        .extract(&snapshot.trips, snapshot.generated_at)?;
    let partition = config.partition_window()?.partition_for(snapshot.generated_at);

    info!(
        generated_at = %snapshot.generated_at,
        %partition,
        entities = feed.entity.len(),
        trips = snapshot.trips.len(),
        underway = snapshot.trips.iter().filter(|t| t.underway).count(),
        without_updates = snapshot.trips.iter().filter(|t| t.stop_time_updates.is_empty()).count(),
        snapshot_rows = extraction.snapshot_batch.len(),
        boundary_rows = extraction.boundary_batch.len(),
        "Feed inspected"
    );
    Ok(())
}
