// src/refresh.rs

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::StoreError;
use crate::feed::{wait_or_shutdown, FeedCommand};
use crate::index::{SharedIndex, SubscriptionIndex};
use crate::metrics::Metrics;
use crate::throttle::ThrottleGate;
use crate::watchlist::WatchlistStore;

/// Rebuilds the shared index from the watchlist store. Used by the periodic
/// loop and by the feed connection right after it connects.
///
/// Rebuilds are serialized: snapshot, swap and prune run under one lock, so
/// an older snapshot can never replace a newer one.
pub struct Refresher {
    store: Arc<dyn WatchlistStore>,
    index: SharedIndex,
    gate: Arc<ThrottleGate>,
    metrics: Metrics,
    rebuild_lock: Mutex<()>,
}

impl Refresher {
    pub fn new(
        store: Arc<dyn WatchlistStore>,
        index: SharedIndex,
        gate: Arc<ThrottleGate>,
        metrics: Metrics,
    ) -> Self {
        Refresher {
            store,
            index,
            gate,
            metrics,
            rebuild_lock: Mutex::new(()),
        }
    }

    pub fn index(&self) -> &SharedIndex {
        &self.index
    }

    /// Reads a fresh snapshot and swaps in the rebuilt index. On a store
    /// error the current index stays in place.
    pub async fn refresh_now(&self) -> Result<Arc<SubscriptionIndex>, StoreError> {
        let _rebuilding = self.rebuild_lock.lock().await;
        let docs = match self.store.snapshot().await {
            Ok(docs) => docs,
            Err(err) => {
                self.metrics.inc_refresh_failed();
                error!(target: "fanout_refresh", error = %err, "watchlist read failed; keeping current index");
                return Err(err);
            }
        };
        let next = SubscriptionIndex::rebuild(&docs, self.gate.default_interval());
        let current = self.index.replace(next);
        let pruned = self.gate.prune(&current);
        self.metrics.inc_refresh_ok();
        self.metrics
            .set_index_size(current.symbol_count(), current.subscriber_count());
        self.metrics.set_throttle_entries(self.gate.len());
        if current.is_empty() {
            info!(target: "fanout_refresh", "watchlist store is empty; nothing to subscribe");
        }
        debug!(
            target: "fanout_refresh",
            symbols = current.symbol_count(),
            subscribers = current.subscriber_count(),
            pruned,
            "index rebuilt"
        );
        Ok(current)
    }
}

pub struct RefreshLoop {
    refresher: Arc<Refresher>,
    commands: mpsc::Sender<FeedCommand>,
    period: Duration,
}

impl RefreshLoop {
    pub fn new(refresher: Arc<Refresher>, commands: mpsc::Sender<FeedCommand>, period: Duration) -> Self {
        RefreshLoop {
            refresher,
            commands,
            period,
        }
    }

    /// Waits for `ready`, then rebuilds the index every `period` and asks the
    /// feed to subscribe to whatever the new index contains.
    pub async fn run(self, mut ready: watch::Receiver<bool>, shutdown: CancellationToken) {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            became_ready = async { ready.wait_for(|r| *r).await.is_ok() } => {
                if !became_ready {
                    warn!(target: "fanout_refresh", "ready signal dropped; refresh loop not started");
                    return;
                }
            }
        }
        info!(target: "fanout_refresh", period_secs = self.period.as_secs(), "refresh loop started");

        loop {
            let refreshed = tokio::select! {
                _ = shutdown.cancelled() => break,
                res = self.refresher.refresh_now() => res,
            };
            if let Ok(index) = refreshed {
                let mut symbols: Vec<String> = index.symbols().map(str::to_string).collect();
                symbols.sort();
                match self.commands.try_send(FeedCommand::Subscribe(symbols)) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(target: "fanout_refresh", "feed command queue full; symbols will sync on next refresh");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        debug!(target: "fanout_refresh", "feed command channel closed");
                    }
                }
            }
            if wait_or_shutdown(self.period, &shutdown).await {
                break;
            }
        }
        info!(target: "fanout_refresh", "refresh loop stopped");
    }
}
