//! # hubwire-cli
//!
//! Host process for the hubwire client. Loads configuration, keeps the
//! hub session alive and logs every received event until Ctrl-C.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use hubwire::{ConnectionEvent, HubConfig, HubService};

/// Keep a real-time event hub connection alive and log its events.
#[derive(Parser)]
#[command(name = "hubwire", version, about)]
struct Cli {
    /// Path to hubwire.toml config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Hub WebSocket URL override
    #[arg(long)]
    url: Option<String>,

    /// Enable verbose logging (set RUST_LOG for fine-grained control)
    #[arg(short, long)]
    verbose: bool,

    /// Seconds allowed for closing the session and draining queued events
    #[arg(long, default_value_t = 5)]
    stop_timeout_secs: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "hubwire=debug,hubwire_cli=debug"
    } else {
        "hubwire=info,hubwire_cli=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let mut config = HubConfig::discover(cli.config.as_deref())?;
    if let Some(url) = cli.url {
        config.realtime_url = url;
    }

    let service = HubService::new(config)?;
    tokio::spawn(log_connection_events(service.event_receiver()));

    let shutdown = CancellationToken::new();
    service.start(&shutdown);

    tokio::signal::ctrl_c().await?;
    tracing::info!("Ctrl-C received, shutting down");

    service.stop(Duration::from_secs(cli.stop_timeout_secs)).await;
    shutdown.cancel();
    Ok(())
}

/// Log lifecycle events until the supervisor closes. Returns how many were seen.
async fn log_connection_events(mut events: broadcast::Receiver<ConnectionEvent>) -> usize {
    let mut seen = 0;
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Connection event log fell behind");
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        seen += 1;
        match event {
            ConnectionEvent::ReconnectFailed { attempts, last_error } => {
                tracing::warn!(attempts, last_error = %last_error, "Automatic reconnect gave up");
            }
            ConnectionEvent::Closed { reason } => {
                tracing::info!(reason = %reason, "Hub session closed");
                break;
            }
            other => tracing::debug!(event = ?other, "Connection event"),
        }
    }
    seen
}
