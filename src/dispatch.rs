// src/dispatch.rs

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::index::SharedIndex;
use crate::metrics::Metrics;
use crate::model::Tick;
use crate::notify::{Notification, Notifier};
use crate::throttle::ThrottleGate;

/// Routes ticks to the subscribers watching their symbol.
///
/// Runs inline on the feed read loop: the index lookup and throttle check are
/// in-memory, and each delivery is a tracked task so a slow notifier never
/// holds up the next tick. At most `concurrency` deliveries are in flight;
/// beyond that a notification is dropped and counted.
pub struct FanoutDispatcher {
    index: SharedIndex,
    gate: Arc<ThrottleGate>,
    notifier: Arc<dyn Notifier>,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    abandon: CancellationToken,
    metrics: Metrics,
}

impl FanoutDispatcher {
    pub fn new(
        index: SharedIndex,
        gate: Arc<ThrottleGate>,
        notifier: Arc<dyn Notifier>,
        concurrency: usize,
        metrics: Metrics,
    ) -> Self {
        FanoutDispatcher {
            index,
            gate,
            notifier,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            tracker: TaskTracker::new(),
            abandon: CancellationToken::new(),
            metrics,
        }
    }

    /// Handles one tick and returns how many deliveries were started.
    pub fn dispatch(&self, tick: &Tick) -> usize {
        let index = self.index.load();
        let Some(subscribers) = index.subscribers(&tick.symbol) else {
            self.metrics.inc_unrouted();
            return 0;
        };

        let now = Instant::now();
        let mut started = 0;
        for subscriber in subscribers {
            // A dropped notification must not consume the throttle window, so
            // the pool slot is taken before the gate is touched.
            let permit = match self.permits.clone().try_acquire_owned() {
                Ok(p) => p,
                Err(_) => {
                    self.metrics.inc_notify_dropped();
                    warn!(target: "fanout_dispatch", subscriber = %subscriber, symbol = %tick.symbol, "notification dropped: delivery pool full");
                    continue;
                }
            };
            if !self.gate.should_notify(&index, subscriber, &tick.symbol, now) {
                self.metrics.inc_notify_throttled();
                continue;
            }

            let notification = Notification::for_tick(subscriber.clone(), tick);
            let notifier = self.notifier.clone();
            let abandon = self.abandon.clone();
            let metrics = self.metrics.clone();
            self.metrics.inc_notify_queued();
            self.tracker.spawn(async move {
                let _permit = permit;
                let begin = Instant::now();
                tokio::select! {
                    _ = abandon.cancelled() => {
                        debug!(target: "fanout_dispatch", subscriber = %notification.subscriber_id, symbol = %notification.symbol, "delivery abandoned at shutdown");
                    }
                    res = notifier.notify(&notification) => match res {
                        Ok(()) => {
                            metrics.inc_notify_sent();
                            metrics.observe_delivery_secs(begin.elapsed().as_secs_f64());
                        }
                        Err(err) => {
                            metrics.inc_notify_failed();
                            warn!(target: "fanout_dispatch", subscriber = %notification.subscriber_id, symbol = %notification.symbol, error = %err, "notification delivery failed");
                        }
                    }
                }
            });
            started += 1;
        }
        self.metrics.set_throttle_entries(self.gate.len());
        started
    }

    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Stops accepting work, waits up to `grace` for in-flight deliveries and
    /// abandons whatever is still running after that.
    pub async fn drain(&self, grace: Duration) {
        self.tracker.close();
        let pending = self.in_flight();
        if pending == 0 {
            return;
        }
        info!(target: "fanout_dispatch", pending, grace_secs = grace.as_secs_f64(), "waiting for in-flight notifications");
        if timeout(grace, self.tracker.wait()).await.is_err() {
            warn!(target: "fanout_dispatch", remaining = self.in_flight(), "abandoning in-flight notifications");
            self.abandon.cancel();
            self.tracker.wait().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NotifyError;
    use crate::index::SubscriptionIndex;
    use crate::watchlist::{AssetKind, SubscriberDoc, SubscriberId, WatchItem};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tokio::sync::Notify;

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<Notification>>,
        fail_for: Option<&'static str>,
        gate: Option<Arc<Notify>>,
        // When set, only this subscriber waits on `gate`.
        hold_only: Option<&'static str>,
    }

    #[async_trait]
    impl Notifier for Recorder {
        async fn notify(&self, n: &Notification) -> Result<(), NotifyError> {
            if let Some(g) = &self.gate {
                if self.hold_only.map_or(true, |id| id == n.subscriber_id.as_str()) {
                    g.notified().await;
                }
            }
            if self.fail_for == Some(n.subscriber_id.as_str()) {
                return Err(NotifyError::Closed);
            }
            self.sent.lock().unwrap().push(n.clone());
            Ok(())
        }
    }

    fn doc(id: &str, delay: Option<f64>, symbols: &[&str]) -> SubscriberDoc {
        SubscriberDoc {
            subscriber_id: SubscriberId::new(id),
            delay_secs: delay,
            watchlist: symbols.iter().map(|s| WatchItem::new(*s, AssetKind::Stock)).collect(),
        }
    }

    fn index(docs: Vec<SubscriberDoc>) -> SharedIndex {
        SharedIndex::new(SubscriptionIndex::rebuild(&docs, Duration::from_secs(30)))
    }

    fn tick(symbol: &str, price: f64) -> Tick {
        Tick {
            symbol: symbol.to_string(),
            price,
            volume: 1.0,
            timestamp: 0,
        }
    }

    fn dispatcher(idx: SharedIndex, notifier: Arc<dyn Notifier>, concurrency: usize) -> (FanoutDispatcher, Metrics) {
        let metrics = Metrics::new();
        let d = FanoutDispatcher::new(
            idx,
            Arc::new(ThrottleGate::new(Duration::from_secs(30))),
            notifier,
            concurrency,
            metrics.clone(),
        );
        (d, metrics)
    }

    #[tokio::test]
    async fn unwatched_symbol_creates_no_jobs() {
        let rec = Arc::new(Recorder::default());
        let (d, metrics) = dispatcher(index(vec![doc("u1", None, &["AAPL"])]), rec.clone(), 8);
        assert_eq!(d.dispatch(&tick("TSLA", 200.0)), 0);
        d.drain(Duration::from_secs(1)).await;
        assert!(rec.sent.lock().unwrap().is_empty());
        assert_eq!(metrics.snapshot().unrouted, 1);
        assert_eq!(metrics.snapshot().notify_queued, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn throttles_per_subscriber_and_symbol() {
        let rec = Arc::new(Recorder::default());
        let idx = index(vec![doc("U1", Some(30.0), &["AAPL"]), doc("U2", Some(0.0), &["AAPL"])]);
        let (d, metrics) = dispatcher(idx, rec.clone(), 8);

        assert_eq!(d.dispatch(&tick("AAPL", 100.0)), 2);
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(d.dispatch(&tick("AAPL", 100.5)), 1);
        tokio::time::advance(Duration::from_secs(21)).await;
        assert_eq!(d.dispatch(&tick("AAPL", 101.0)), 2);
        d.drain(Duration::from_secs(1)).await;

        let sent = rec.sent.lock().unwrap();
        let mut u1: Vec<f64> = sent.iter().filter(|n| n.subscriber_id.as_str() == "U1").map(|n| n.price).collect();
        u1.sort_by(|a, b| a.total_cmp(b));
        assert_eq!(u1, vec![100.0, 101.0]);
        assert_eq!(sent.iter().filter(|n| n.subscriber_id.as_str() == "U2").count(), 3);
        assert_eq!(metrics.snapshot().throttled, 1);
    }

    #[tokio::test]
    async fn burst_in_one_window_delivers_first_tick_only() {
        let rec = Arc::new(Recorder::default());
        let (d, _) = dispatcher(index(vec![doc("u", None, &["X"])]), rec.clone(), 8);
        for p in [1.0, 2.0, 3.0, 4.0] {
            d.dispatch(&tick("X", p));
        }
        d.drain(Duration::from_secs(1)).await;
        let sent = rec.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].price, 1.0);
    }

    #[tokio::test]
    async fn failure_for_one_subscriber_does_not_affect_others() {
        let rec = Arc::new(Recorder {
            fail_for: Some("bad"),
            ..Default::default()
        });
        let (d, metrics) = dispatcher(index(vec![doc("bad", None, &["X"]), doc("good", None, &["X"])]), rec.clone(), 8);
        assert_eq!(d.dispatch(&tick("X", 5.0)), 2);
        d.drain(Duration::from_secs(1)).await;
        let sent = rec.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].subscriber_id.as_str(), "good");
        let snap = metrics.snapshot();
        assert_eq!(snap.notify_sent, 1);
        assert_eq!(snap.notify_failed, 1);
    }

    #[tokio::test]
    async fn slow_delivery_does_not_block_dispatch_and_pool_is_bounded() {
        let release = Arc::new(Notify::new());
        let rec = Arc::new(Recorder {
            gate: Some(release.clone()),
            ..Default::default()
        });
        let idx = index(vec![doc("a", Some(0.0), &["X", "Y"]), doc("b", Some(0.0), &["Y"])]);
        let (d, metrics) = dispatcher(idx, rec.clone(), 2);

        assert_eq!(d.dispatch(&tick("X", 1.0)), 1);
        assert_eq!(d.dispatch(&tick("Y", 2.0)), 1);
        assert_eq!(d.in_flight(), 2);
        assert_eq!(metrics.snapshot().dropped, 1);

        d.drain(Duration::from_millis(50)).await;
        assert!(rec.sent.lock().unwrap().is_empty());
        assert_eq!(d.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn capacity_drop_leaves_throttle_window_open() {
        let release = Arc::new(Notify::new());
        let rec = Arc::new(Recorder {
            gate: Some(release.clone()),
            hold_only: Some("hog"),
            ..Default::default()
        });
        let idx = index(vec![doc("hog", Some(0.0), &["X"]), doc("u1", Some(30.0), &["AAPL"])]);
        let (d, metrics) = dispatcher(idx, rec.clone(), 1);

        assert_eq!(d.dispatch(&tick("X", 1.0)), 1);
        assert_eq!(d.dispatch(&tick("AAPL", 100.0)), 0);
        assert_eq!(metrics.snapshot().dropped, 1);

        release.notify_one();
        while d.in_flight() > 0 {
            tokio::task::yield_now().await;
        }
        tokio::time::advance(Duration::from_secs(5)).await;

        assert_eq!(d.dispatch(&tick("AAPL", 101.0)), 1);
        d.drain(Duration::from_secs(1)).await;

        let sent = rec.sent.lock().unwrap();
        let mut who: Vec<&str> = sent.iter().map(|n| n.subscriber_id.as_str()).collect();
        who.sort();
        assert_eq!(who, vec!["hog", "u1"]);
        assert_eq!(sent.iter().find(|n| n.subscriber_id.as_str() == "u1").map(|n| n.price), Some(101.0));
        assert_eq!(metrics.snapshot().throttled, 0);
    }
}
