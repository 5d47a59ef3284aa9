//! CLI entry point for the GTFS-RT JSON proxy.
//!
//! `serve` runs the transform filter in front of a backend; `convert` turns a
//! single feed from a file or URL into JSON.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gtfs_rt_json_proxy::{
    fetch::{BasicClient, fetch_bytes},
    json::to_json,
    parser::{feed_timestamp, parse_feed},
    server,
};
use reqwest::Url;
use std::ffi::OsStr;
use std::io::Write;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

#[derive(Parser)]
#[command(name = "gtfs_rt_json_proxy")]
#[command(about = "Serve GTFS-RT protobuf feeds as JSON", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Proxy requests to a backend, converting GTFS-RT responses to JSON
    Serve {
        /// Address to listen on
        #[arg(short, long, env = "GTFS_PROXY_LISTEN", default_value = "0.0.0.0:8080")]
        listen: SocketAddr,

        /// Base URL of the backend, e.g. "https://cdn.example.org/realtime"
        #[arg(short, long, env = "GTFS_PROXY_UPSTREAM")]
        upstream: Url,

        /// Total time allowed for a backend exchange, in seconds
        #[arg(long, env = "GTFS_PROXY_TIMEOUT_SECS", default_value_t = 30)]
        timeout_secs: u64,

        /// Largest request body accepted from callers
        #[arg(long, env = "GTFS_PROXY_MAX_BODY_BYTES", default_value_t = 10 * 1024 * 1024)]
        max_body_bytes: usize,
    },
    /// Convert a GTFS-RT feed from a file or URL to JSON
    Convert {
        /// Path to file or URL to fetch
        #[arg(value_name = "FILE_OR_URL")]
        source: String,

        /// File to write the JSON to (defaults to stdout)
        #[arg(short, long)]
        output: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok(); // Load .env file

    let _file_guard = init_logging()?;

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            listen,
            upstream,
            timeout_secs,
            max_body_bytes,
        } => {
            let client = BasicClient::for_proxy(Duration::from_secs(timeout_secs))?;
            info!(%upstream, timeout_secs, max_body_bytes, "Starting GTFS-RT JSON proxy");

            let app = server::router(client, upstream, max_body_bytes);
            let listener = tokio::net::TcpListener::bind(listen)
                .await
                .with_context(|| format!("failed to bind {listen}"))?;
            server::serve(listener, app).await?;
        }
        Commands::Convert { source, output } => {
            let bytes = fetcher(&source).await?;
            let feed = parse_feed(&bytes).context("source is not a GTFS-RT feed")?;
            let json = to_json(&feed)?;

            info!(
                entities = feed.entity.len(),
                feed_timestamp = ?feed_timestamp(&feed).map(|ts| ts.to_rfc3339()),
                "Feed converted"
            );

            match output {
                Some(path) => std::fs::write(&path, &json)?,
                None => {
                    let mut stdout = std::io::stdout().lock();
                    stdout.write_all(&json)?;
                    stdout.write_all(b"\n")?;
                }
            }
        }
    }

    Ok(())
}

/// Logging setup: colored stderr + JSON rolling log file.
///
/// The returned guard flushes the file writer when dropped and must live
/// until the process exits.
fn init_logging() -> Result<WorkerGuard> {
    let log_file_path = std::env::var("LOG_FILE_PATH")
        .unwrap_or_else(|_| "logs/gtfs_rt_json_proxy.log".to_string());
    let log_dir = Path::new(&log_file_path)
        .parent()
        .unwrap_or(Path::new("logs"));
    let log_file_name = Path::new(&log_file_path)
        .file_name()
        .unwrap_or(OsStr::new("gtfs_rt_json_proxy.log"));

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, file_guard) = tracing_appender::non_blocking(file_appender);

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

    Ok(file_guard)
}

/// Loads feed data from a local file path or fetches it over HTTP.
#[tracing::instrument(fields(source = %url))]
async fn fetcher(url: &str) -> Result<Vec<u8>> {
    let bytes = if url.starts_with("http") {
        let client = BasicClient::new();
        fetch_bytes(&client, url).await?
    } else {
        std::fs::read(url).with_context(|| format!("failed to read {url}"))?
    };
    Ok(bytes)
}
