// src/engine.rs

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::Config;
use crate::dispatch::FanoutDispatcher;
use crate::feed::{FeedConnection, FeedSettings, FeedTransport};
use crate::index::SharedIndex;
use crate::metrics::Metrics;
use crate::notify::Notifier;
use crate::refresh::{RefreshLoop, Refresher};
use crate::throttle::ThrottleGate;
use crate::watchlist::WatchlistStore;

const COMMAND_QUEUE: usize = 16;

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub refresh_interval: Duration,
    pub default_notify_interval: Duration,
    pub notify_concurrency: usize,
    pub shutdown_grace: Duration,
    pub feed: FeedSettings,
}

impl From<&Config> for EngineSettings {
    fn from(cfg: &Config) -> Self {
        EngineSettings {
            refresh_interval: cfg.refresh_interval,
            default_notify_interval: cfg.default_notify_interval,
            notify_concurrency: cfg.notify_concurrency,
            shutdown_grace: cfg.shutdown_grace,
            feed: FeedSettings {
                reconnect_backoff: cfg.reconnect_backoff,
                read_timeout: cfg.read_timeout,
                heartbeat_interval: cfg.heartbeat_interval,
            },
        }
    }
}

/// The live fan-out engine: one feed connection, one refresh loop and the
/// dispatcher they share. All state lives here and is handed to each part
/// at construction.
pub struct Engine {
    settings: EngineSettings,
    store: Arc<dyn WatchlistStore>,
    notifier: Arc<dyn Notifier>,
    transport: Arc<dyn FeedTransport>,
    metrics: Metrics,
}

impl Engine {
    pub fn new(
        settings: EngineSettings,
        store: Arc<dyn WatchlistStore>,
        notifier: Arc<dyn Notifier>,
        transport: Arc<dyn FeedTransport>,
        metrics: Metrics,
    ) -> Self {
        Engine {
            settings,
            store,
            notifier,
            transport,
            metrics,
        }
    }

    /// Runs until `shutdown` fires, then waits for both loops and drains
    /// in-flight deliveries for up to the configured grace period.
    pub async fn run(self, shutdown: CancellationToken) {
        let index = SharedIndex::default();
        let gate = Arc::new(ThrottleGate::new(self.settings.default_notify_interval));
        let refresher = Arc::new(Refresher::new(
            self.store,
            index.clone(),
            gate.clone(),
            self.metrics.clone(),
        ));
        let dispatcher = Arc::new(FanoutDispatcher::new(
            index,
            gate,
            self.notifier,
            self.settings.notify_concurrency,
            self.metrics.clone(),
        ));

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE);
        let (ready_tx, ready_rx) = watch::channel(false);

        let feed = FeedConnection::new(
            self.transport,
            refresher.clone(),
            dispatcher.clone(),
            cmd_rx,
            self.settings.feed.clone(),
            self.metrics.clone(),
        );
        let feed_task = tokio::spawn(feed.run(shutdown.clone()));
        let refresh_task = tokio::spawn(
            RefreshLoop::new(refresher, cmd_tx, self.settings.refresh_interval)
                .run(ready_rx, shutdown.clone()),
        );

        let _ = ready_tx.send(true);
        info!(
            refresh_secs = self.settings.refresh_interval.as_secs(),
            concurrency = self.settings.notify_concurrency,
            "Fan-out engine started"
        );

        if let Err(e) = feed_task.await {
            error!(error = %e, "feed task failed");
        }
        if let Err(e) = refresh_task.await {
            error!(error = %e, "refresh task failed");
        }
        dispatcher.drain(self.settings.shutdown_grace).await;
        info!("Fan-out engine stopped");
    }
}
