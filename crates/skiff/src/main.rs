//! skiff - SSH session and tunnel engine
//!
//! Reads one JSON request per line on stdin and writes one JSON response per
//! line on stdout. Logs go to stderr.

use anyhow::{Context, Result};
use session::{Bridge, ProfileStore, SessionRegistry};
use settings::Config;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info};
use transport::{SshConnector, SshOptions};

/// Crates whose logs are shown at the default level.
const LOG_TARGETS: &[&str] = &[
    "skiff",
    "session",
    "transport",
    "terminal",
    "remote_fs",
    "forward",
];

/// Initialize required directories (cross-platform).
fn init_paths() -> Result<()> {
    let config_dir = skiff_paths::config_dir();
    let data_dir = skiff_paths::data_dir();
    std::fs::create_dir_all(config_dir)
        .with_context(|| format!("Failed to create config directory: {:?}", config_dir))?;
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("Failed to create data directory: {:?}", data_dir))?;
    Ok(())
}

/// Check if debug mode is enabled via environment variable.
fn is_debug_mode() -> bool {
    std::env::var("SKIFF_DEBUG").is_ok()
}

fn default_filter(debug: bool) -> String {
    let level = if debug { "trace" } else { "info" };
    let mut directives: Vec<String> = LOG_TARGETS
        .iter()
        .map(|target| format!("{target}={level}"))
        .collect();
    directives.push(if debug { "russh=debug,info" } else { "warn" }.to_string());
    directives.join(",")
}

/// Initialize the logging system. `RUST_LOG` wins over the config file,
/// which wins over the built-in default.
fn init_logging(configured: Option<&str>) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let directives = configured
        .map(str::to_string)
        .unwrap_or_else(|| default_filter(is_debug_mode()));
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&directives))
        .unwrap_or_else(|_| EnvFilter::new(default_filter(false)));

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_line_number(true),
        )
        .with(filter)
        .init();

    if is_debug_mode() {
        info!(
            "skiff v{} starting up (DEBUG MODE ENABLED)",
            env!("CARGO_PKG_VERSION")
        );
    } else {
        info!("skiff v{} starting up", env!("CARGO_PKG_VERSION"));
    }
}

fn ssh_options(config: &Config) -> SshOptions {
    let mut options = SshOptions::new(skiff_paths::known_hosts_file());
    options.connect_timeout = config.connect_timeout();
    options.keepalive_interval = config.keepalive_interval();
    options
}

/// Serve requests until stdin closes, then tear every session down.
async fn serve(config: Config) -> Result<()> {
    let connector = Arc::new(SshConnector::new(ssh_options(&config)));
    let registry = Arc::new(SessionRegistry::new(connector, config));
    let bridge = Arc::new(Bridge::new(registry, ProfileStore::open_default()));

    let (responses, mut outgoing) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = outgoing.recv().await {
            stdout.write_all(line.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
            stdout.flush().await?;
        }
        Ok::<_, std::io::Error>(())
    });

    let mut requests = JoinSet::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        if line.trim().is_empty() {
            continue;
        }
        let bridge = bridge.clone();
        let responses = responses.clone();
        requests.spawn(async move {
            let response = bridge.handle_json(&line).await;
            if responses.send(response).is_err() {
                debug!("Response dropped, stdout writer is gone");
            }
        });
        while requests.try_join_next().is_some() {}
    }

    info!("stdin closed, shutting down");
    requests.shutdown().await;
    bridge.shutdown().await;
    drop(responses);
    writer
        .await
        .context("Stdout writer panicked")?
        .context("Failed to write to stdout")?;
    Ok(())
}

fn main() -> Result<()> {
    init_paths()?;
    settings::ensure_config_file();
    let config = settings::load_config();
    init_logging(config.log_level.as_deref());

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("skiff-worker")
        .build()
        .context("Failed to start the async runtime")?;
    runtime.block_on(serve(config))
}
