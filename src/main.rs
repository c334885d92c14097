// src/main.rs

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::{Config, NotifierKind};
use crate::engine::{Engine, EngineSettings};
use crate::feed::WsTransport;
use crate::metrics::{spawn_http_server, spawn_stats_logger, Metrics};
use crate::notify::{BoxedWriter, DiscordNotifier, NdjsonDest, NdjsonNotifier, Notifier};
use crate::watchlist::JsonFileStore;

mod config;
mod dispatch;
mod engine;
mod error;
mod feed;
mod index;
mod metrics;
mod model;
mod notify;
mod refresh;
mod throttle;
mod watchlist;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Structured JSON logs on stderr; stdout is reserved for NDJSON notifications.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .json()
        .init();

    info!(target: "fanout_config", app_version = env!("CARGO_PKG_VERSION"), "starting");

    let cfg = Config::from_env()?;
    info!(
        target: "fanout_config",
        feed_url = %cfg.feed_url,
        watchlist = %cfg.watchlist_path.display(),
        notifier = ?cfg.notifier,
        refresh_secs = cfg.refresh_interval.as_secs(),
        default_notify_secs = cfg.default_notify_interval.as_secs(),
        concurrency = cfg.notify_concurrency,
        "config loaded"
    );

    let shutdown = CancellationToken::new();
    let shutdown_handle = handle_shutdown(shutdown.clone());

    let metrics = Metrics::new();
    let metrics_handle = if cfg.metrics_addr.trim().is_empty() {
        None
    } else {
        Some(spawn_http_server(
            metrics.clone(),
            cfg.metrics_addr.clone(),
            shutdown.clone(),
        ))
    };
    let stats_handle = spawn_stats_logger(metrics.clone(), shutdown.clone(), cfg.stats_interval);

    let (notifier, writer_handle): (Arc<dyn Notifier>, Option<JoinHandle<BoxedWriter>>) = match cfg.notifier {
        NotifierKind::Stdout => {
            let (n, h) = NdjsonNotifier::open(
                NdjsonDest::Stdout,
                cfg.notify_channel_cap,
                cfg.notify_flush_interval,
            )
            .await?;
            (Arc::new(n), Some(h))
        }
        NotifierKind::Ndjson => {
            let (n, h) = NdjsonNotifier::open(
                NdjsonDest::from_str(&cfg.notify_dest),
                cfg.notify_channel_cap,
                cfg.notify_flush_interval,
            )
            .await?;
            (Arc::new(n), Some(h))
        }
        NotifierKind::Discord => {
            let token = cfg.discord_bot_token.as_deref().unwrap_or_default();
            let n = DiscordNotifier::new(&cfg.discord_api_base, token)?;
            (Arc::new(n), None)
        }
    };

    let store = Arc::new(JsonFileStore::new(&cfg.watchlist_path));
    let transport = Arc::new(WsTransport::new(cfg.feed_ws_url(), cfg.feed_url.clone()));

    let engine = Engine::new(
        EngineSettings::from(&cfg),
        store,
        notifier,
        transport,
        metrics.clone(),
    );
    engine.run(shutdown.clone()).await;

    // The engine held the last notifier reference; the writer flushes and exits.
    if let Some(h) = writer_handle {
        if let Err(e) = h.await {
            error!(error = %e, "notification writer task failed");
        }
    }
    let _ = stats_handle.await;
    if let Some(h) = metrics_handle {
        let _ = h.await;
    }
    shutdown_handle.abort();

    info!(target: "fanout_config", "shutdown complete");
    Ok(())
}

fn handle_shutdown(shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", err);
            return;
        }
        info!("Ctrl+C received, shutting down");
        shutdown.cancel();
    })
}
