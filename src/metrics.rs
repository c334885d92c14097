use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Clone, Default)]
pub struct Metrics {
    inner: Arc<Counters>,
}

#[derive(Default)]
struct Counters {
    reconnects_total: AtomicU64,
    reconnect_success_total: AtomicU64,
    reconnect_failure_total: AtomicU64,
    read_timeouts_total: AtomicU64,
    heartbeats_sent_total: AtomicU64,
    frames_received_total: AtomicU64,
    ignored_frames_total: AtomicU64,
    trades_total: AtomicU64,
    malformed_records_total: AtomicU64,
    unrouted_ticks_total: AtomicU64,
    subscribes_sent_total: AtomicU64,
    refresh_ok_total: AtomicU64,
    refresh_failed_total: AtomicU64,
    notify_queued_total: AtomicU64,
    notify_sent_total: AtomicU64,
    notify_failed_total: AtomicU64,
    notify_throttled_total: AtomicU64,
    notify_dropped_total: AtomicU64,
    errors_total: AtomicU64,
    indexed_symbols: AtomicU64,
    indexed_subscribers: AtomicU64,
    throttle_entries: AtomicU64,
    ready: AtomicBool,
    reconnect_hist: Histogram,
    delivery_hist: Histogram,
}

impl Default for Histogram {
    fn default() -> Self {
        Histogram::new(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0])
    }
}

macro_rules! counter_ops {
    ($($inc:ident => $field:ident),* $(,)?) => {
        $(
            pub fn $inc(&self) {
                self.inner.$field.fetch_add(1, Ordering::Relaxed);
            }
        )*
    };
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    counter_ops! {
        inc_reconnect => reconnects_total,
        inc_reconnect_success => reconnect_success_total,
        inc_reconnect_failure => reconnect_failure_total,
        inc_timeout => read_timeouts_total,
        inc_heartbeat => heartbeats_sent_total,
        inc_received => frames_received_total,
        inc_ignored => ignored_frames_total,
        inc_trade => trades_total,
        inc_unrouted => unrouted_ticks_total,
        inc_subscribe => subscribes_sent_total,
        inc_refresh_ok => refresh_ok_total,
        inc_refresh_failed => refresh_failed_total,
        inc_notify_queued => notify_queued_total,
        inc_notify_sent => notify_sent_total,
        inc_notify_failed => notify_failed_total,
        inc_notify_throttled => notify_throttled_total,
        inc_notify_dropped => notify_dropped_total,
        inc_error => errors_total,
    }

    pub fn add_malformed(&self, n: u64) {
        self.inner.malformed_records_total.fetch_add(n, Ordering::Relaxed);
    }

    pub fn set_index_size(&self, symbols: usize, subscribers: usize) {
        self.inner.indexed_symbols.store(symbols as u64, Ordering::Relaxed);
        self.inner
            .indexed_subscribers
            .store(subscribers as u64, Ordering::Relaxed);
    }

    pub fn set_throttle_entries(&self, n: usize) {
        self.inner.throttle_entries.store(n as u64, Ordering::Relaxed);
    }

    pub fn set_ready(&self, v: bool) {
        self.inner.ready.store(v, Ordering::Relaxed);
    }

    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::Relaxed)
    }

    pub fn observe_reconnect_success_secs(&self, secs: f64) {
        self.inner.reconnect_hist.observe(secs);
    }

    pub fn observe_delivery_secs(&self, secs: f64) {
        self.inner.delivery_hist.observe(secs);
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot::from(self)
    }

    pub fn render_prometheus(&self) -> String {
        let c = &self.inner;
        let mut s = Vec::with_capacity(2048);
        let name = env!("CARGO_PKG_NAME");
        let version = env!("CARGO_PKG_VERSION");
        let _ = writeln!(&mut s, "# HELP fanout_build_info Build information");
        let _ = writeln!(&mut s, "# TYPE fanout_build_info gauge");
        let _ = writeln!(
            &mut s,
            "fanout_build_info{{name=\"{}\",version=\"{}\"}} 1",
            name, version
        );

        let counters: [(&str, &str, &AtomicU64); 19] = [
            ("fanout_reconnects_total", "Feed connection attempts", &c.reconnects_total),
            ("fanout_reconnect_success_total", "Feed connections established", &c.reconnect_success_total),
            ("fanout_reconnect_failure_total", "Feed connection attempts that failed", &c.reconnect_failure_total),
            ("fanout_read_timeouts_total", "Idle read timeouts on the feed", &c.read_timeouts_total),
            ("fanout_heartbeats_sent_total", "Heartbeat pings sent", &c.heartbeats_sent_total),
            ("fanout_frames_received_total", "Text frames received from the feed", &c.frames_received_total),
            ("fanout_ignored_frames_total", "Non-trade frames ignored", &c.ignored_frames_total),
            ("fanout_trades_total", "Trade records decoded", &c.trades_total),
            ("fanout_malformed_records_total", "Trade records skipped as malformed", &c.malformed_records_total),
            ("fanout_unrouted_ticks_total", "Ticks for symbols nobody watches", &c.unrouted_ticks_total),
            ("fanout_subscribes_sent_total", "Subscribe commands sent upstream", &c.subscribes_sent_total),
            ("fanout_refresh_ok_total", "Successful index rebuilds", &c.refresh_ok_total),
            ("fanout_refresh_failed_total", "Index rebuilds that kept the previous index", &c.refresh_failed_total),
            ("fanout_notify_queued_total", "Notification jobs started", &c.notify_queued_total),
            ("fanout_notify_sent_total", "Notifications delivered", &c.notify_sent_total),
            ("fanout_notify_failed_total", "Notification deliveries that failed", &c.notify_failed_total),
            ("fanout_notify_throttled_total", "Notifications suppressed by the throttle window", &c.notify_throttled_total),
            ("fanout_notify_dropped_total", "Notifications dropped at the concurrency limit", &c.notify_dropped_total),
            ("fanout_errors_total", "Errors encountered", &c.errors_total),
        ];
        for (metric, help, value) in counters {
            let _ = writeln!(&mut s, "# HELP {} {}", metric, help);
            let _ = writeln!(&mut s, "# TYPE {} counter", metric);
            let _ = writeln!(&mut s, "{} {}", metric, value.load(Ordering::Relaxed));
        }

        let gauges: [(&str, &str, u64); 4] = [
            ("fanout_indexed_symbols", "Symbols in the current index", c.indexed_symbols.load(Ordering::Relaxed)),
            ("fanout_indexed_subscribers", "Subscribers in the current index", c.indexed_subscribers.load(Ordering::Relaxed)),
            ("fanout_throttle_entries", "Tracked (subscriber, symbol) throttle entries", c.throttle_entries.load(Ordering::Relaxed)),
            ("fanout_feed_connected", "1 while the feed connection is up", c.ready.load(Ordering::Relaxed) as u64),
        ];
        for (metric, help, value) in gauges {
            let _ = writeln!(&mut s, "# HELP {} {}", metric, help);
            let _ = writeln!(&mut s, "# TYPE {} gauge", metric);
            let _ = writeln!(&mut s, "{} {}", metric, value);
        }

        c.reconnect_hist
            .render("fanout_reconnect_duration_seconds", &mut s);
        c.delivery_hist
            .render("fanout_delivery_duration_seconds", &mut s);

        String::from_utf8(s).unwrap_or_default()
    }
}

pub fn spawn_http_server(
    metrics: Metrics,
    addr: String,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        match TcpListener::bind(&addr).await {
            Ok(listener) => {
                info!("metrics_http_listen" = %addr, "Listening for /metrics, /health and /ready");
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => {
                            info!("metrics_http_shutdown" = true, "Shutting down metrics server");
                            break;
                        }
                        accept_res = listener.accept() => {
                            match accept_res {
                                Ok((socket, _peer)) => {
                                    let m = metrics.clone();
                                    tokio::spawn(async move {
                                        if let Err(e) = handle_conn(socket, m).await {
                                            debug!(error = %e, "metrics_http_conn_error");
                                        }
                                    });
                                }
                                Err(e) => {
                                    warn!(error = %e, "metrics_http_accept_error");
                                }
                            }
                        }
                    }
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to bind metrics HTTP server");
            }
        }
    })
}

fn route(req: &str, metrics: &Metrics) -> (&'static str, &'static str, String) {
    let is = |path: &str| {
        req.starts_with(&format!("GET {} ", path)) || req.starts_with(&format!("GET {}\r", path))
    };
    if is("/metrics") {
        (
            "200 OK",
            "text/plain; version=0.0.4",
            metrics.render_prometheus(),
        )
    } else if is("/health") || is("/") {
        ("200 OK", "text/plain", "OK".to_string())
    } else if is("/ready") {
        if metrics.is_ready() {
            ("200 OK", "text/plain", "READY".to_string())
        } else {
            (
                "503 Service Unavailable",
                "text/plain",
                "NOT READY".to_string(),
            )
        }
    } else {
        ("404 Not Found", "text/plain", "Not Found".to_string())
    }
}

async fn handle_conn(
    mut socket: TcpStream,
    metrics: Metrics,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut buf = [0u8; 1024];
    let n = socket.read(&mut buf).await?;
    let req = std::str::from_utf8(&buf[..n]).unwrap_or("");
    let (status, content_type, body) = route(req, &metrics);
    let resp = format!(
        "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        content_type,
        body.len(),
        body
    );
    socket.write_all(resp.as_bytes()).await?;
    socket.shutdown().await?;
    Ok(())
}

pub fn spawn_stats_logger(
    metrics: Metrics,
    shutdown: CancellationToken,
    period: std::time::Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut last = metrics.snapshot();
        let mut tick = interval(period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick fires immediately.
        tick.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => {
                    let now = metrics.snapshot();
                    let secs = period.as_secs_f64().max(0.001);
                    info!(target: "fanout_stats",
                        trades = now.trades - last.trades,
                        unrouted = now.unrouted - last.unrouted,
                        queued = now.notify_queued - last.notify_queued,
                        notified = now.notify_sent - last.notify_sent,
                        notify_failed = now.notify_failed - last.notify_failed,
                        throttled = now.throttled - last.throttled,
                        dropped = now.dropped - last.dropped,
                        reconnects = now.reconnects - last.reconnects,
                        subscribes = now.subscribes - last.subscribes,
                        refresh_ok = now.refresh_ok - last.refresh_ok,
                        refresh_failed = now.refresh_failed - last.refresh_failed,
                        errors = now.errors - last.errors,
                        trades_rate = (now.trades - last.trades) as f64 / secs,
                        connected = metrics.is_ready(),
                        "stats"
                    );
                    last = now;
                }
            }
        }
    })
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Snapshot {
    pub trades: u64,
    pub unrouted: u64,
    pub notify_queued: u64,
    pub notify_sent: u64,
    pub notify_failed: u64,
    pub throttled: u64,
    pub dropped: u64,
    pub subscribes: u64,
    pub reconnects: u64,
    pub refresh_ok: u64,
    pub refresh_failed: u64,
    pub errors: u64,
}

impl From<&Metrics> for Snapshot {
    fn from(m: &Metrics) -> Self {
        use std::sync::atomic::Ordering::Relaxed;
        let c = &m.inner;
        Snapshot {
            trades: c.trades_total.load(Relaxed),
            unrouted: c.unrouted_ticks_total.load(Relaxed),
            notify_queued: c.notify_queued_total.load(Relaxed),
            notify_sent: c.notify_sent_total.load(Relaxed),
            notify_failed: c.notify_failed_total.load(Relaxed),
            throttled: c.notify_throttled_total.load(Relaxed),
            dropped: c.notify_dropped_total.load(Relaxed),
            subscribes: c.subscribes_sent_total.load(Relaxed),
            reconnects: c.reconnects_total.load(Relaxed),
            refresh_ok: c.refresh_ok_total.load(Relaxed),
            refresh_failed: c.refresh_failed_total.load(Relaxed),
            errors: c.errors_total.load(Relaxed),
        }
    }
}

struct Histogram {
    buckets: Vec<f64>,
    counts: Vec<AtomicU64>,
    sum_us: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    fn new(mut buckets: Vec<f64>) -> Self {
        buckets.sort_by(|a, b| a.total_cmp(b));
        let counts = (0..buckets.len()).map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            counts,
            sum_us: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    fn observe(&self, value_secs: f64) {
        let us = if value_secs.is_sign_positive() {
            (value_secs * 1_000_000.0) as u64
        } else {
            0
        };
        self.sum_us.fetch_add(us, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        for (i, b) in self.buckets.iter().enumerate() {
            if value_secs <= *b {
                self.counts[i].fetch_add(1, Ordering::Relaxed);
                break;
            }
        }
    }

    fn render(&self, name: &str, out: &mut Vec<u8>) {
        let _ = writeln!(out, "# HELP {} Histogram of {}", name, name);
        let _ = writeln!(out, "# TYPE {} histogram", name);
        let mut cumulative = 0u64;
        for (i, b) in self.buckets.iter().enumerate() {
            cumulative += self.counts[i].load(Ordering::Relaxed);
            let _ = writeln!(out, "{}_bucket{{le=\"{}\"}} {}", name, b, cumulative);
        }
        let total = self.count.load(Ordering::Relaxed);
        let _ = writeln!(out, "{}_bucket{{le=\"+Inf\"}} {}", name, total);
        let sum_secs = (self.sum_us.load(Ordering::Relaxed) as f64) / 1_000_000.0;
        let _ = writeln!(out, "{}_sum {}", name, sum_secs);
        let _ = writeln!(out, "{}_count {}", name, total);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_render_in_prometheus_text() {
        let m = Metrics::new();
        m.inc_notify_sent();
        m.inc_notify_sent();
        m.inc_notify_throttled();
        m.add_malformed(3);
        m.set_index_size(4, 2);
        let text = m.render_prometheus();
        assert!(text.contains("fanout_notify_sent_total 2"));
        assert!(text.contains("fanout_notify_throttled_total 1"));
        assert!(text.contains("fanout_malformed_records_total 3"));
        assert!(text.contains("fanout_indexed_symbols 4"));
        assert!(text.contains("fanout_feed_connected 0"));
    }

    #[test]
    fn histogram_buckets_are_cumulative() {
        let m = Metrics::new();
        m.observe_delivery_secs(0.01);
        m.observe_delivery_secs(0.2);
        m.observe_delivery_secs(100.0);
        let text = m.render_prometheus();
        assert!(text.contains("fanout_delivery_duration_seconds_bucket{le=\"0.05\"} 1"));
        assert!(text.contains("fanout_delivery_duration_seconds_bucket{le=\"0.25\"} 2"));
        assert!(text.contains("fanout_delivery_duration_seconds_bucket{le=\"+Inf\"} 3"));
        assert!(text.contains("fanout_delivery_duration_seconds_count 3"));
    }

    #[test]
    fn routes() {
        let m = Metrics::new();
        assert_eq!(route("GET /health HTTP/1.1\r\n", &m).0, "200 OK");
        assert_eq!(route("GET /ready HTTP/1.1\r\n", &m).0, "503 Service Unavailable");
        m.set_ready(true);
        assert_eq!(route("GET /ready HTTP/1.1\r\n", &m).2, "READY");
        assert_eq!(route("GET /nope HTTP/1.1\r\n", &m).0, "404 Not Found");
        assert!(route("GET /metrics HTTP/1.1\r\n", &m).2.contains("fanout_build_info"));
    }

    #[test]
    fn clones_share_counters() {
        let m = Metrics::new();
        let c = m.clone();
        c.inc_subscribe();
        assert_eq!(m.snapshot().subscribes, 1);
    }
}
