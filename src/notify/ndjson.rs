use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, warn};

use super::{Notification, Notifier};
use crate::error::NotifyError;

#[derive(Serialize)]
struct NdjsonRecord<'a> {
    ingest_ts: i64,
    app_version: &'static str,
    #[serde(flatten)]
    notification: &'a Notification,
}

pub type BoxedWriter = Box<dyn AsyncWrite + Unpin + Send>;

pub enum NdjsonDest {
    Stdout,
    File(String),
}

impl NdjsonDest {
    pub fn from_str(s: &str) -> Self {
        if s.eq_ignore_ascii_case("stdout") {
            NdjsonDest::Stdout
        } else {
            NdjsonDest::File(s.to_string())
        }
    }
}

/// Writes one JSON line per notification. Lines are serialized on the
/// caller's task and handed to a single writer task over a bounded channel.
pub struct NdjsonNotifier {
    tx: Sender<Vec<u8>>,
}

impl NdjsonNotifier {
    pub async fn open(
        dest: NdjsonDest,
        channel_cap: usize,
        flush_interval: Duration,
    ) -> Result<(Self, JoinHandle<BoxedWriter>), NotifyError> {
        let writer: BoxedWriter = match dest {
            NdjsonDest::Stdout => Box::new(tokio::io::stdout()),
            NdjsonDest::File(path) => Box::new(
                tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(Path::new(&path))
                    .await?,
            ),
        };
        Ok(Self::with_writer(writer, channel_cap, flush_interval))
    }

    /// Spawns the writer task over any async writer. The task ends, flushing
    /// and returning the writer, once the notifier is dropped.
    pub fn with_writer<W>(
        writer: W,
        channel_cap: usize,
        flush_interval: Duration,
    ) -> (Self, JoinHandle<W>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel::<Vec<u8>>(channel_cap.max(1));
        let handle = tokio::spawn(writer_loop(rx, writer, flush_interval));
        (NdjsonNotifier { tx }, handle)
    }
}

#[async_trait]
impl Notifier for NdjsonNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        let record = NdjsonRecord {
            ingest_ts: now_millis(),
            app_version: env!("CARGO_PKG_VERSION"),
            notification,
        };
        let mut line = serde_json::to_vec(&record).map_err(std::io::Error::from)?;
        line.push(b'\n');
        self.tx.send(line).await.map_err(|_| NotifyError::Closed)
    }
}

async fn writer_loop<W>(mut rx: Receiver<Vec<u8>>, writer: W, flush_interval: Duration) -> W
where
    W: AsyncWrite + Unpin,
{
    let mut w = BufWriter::new(writer);
    let mut flush_tick = interval(flush_interval.max(Duration::from_millis(1)));
    flush_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut dirty = false;
    loop {
        tokio::select! {
            maybe = rx.recv() => {
                match maybe {
                    Some(line) => {
                        if let Err(e) = w.write_all(&line).await {
                            warn!(target: "fanout_notify", error = %e, "ndjson_write_error");
                        } else {
                            dirty = true;
                        }
                    }
                    None => break,
                }
            }
            _ = flush_tick.tick(), if dirty => {
                if let Err(e) = w.flush().await {
                    warn!(target: "fanout_notify", error = %e, "ndjson_flush_error");
                }
                dirty = false;
            }
        }
    }
    if let Err(e) = w.flush().await {
        error!(target: "fanout_notify", error = %e, "ndjson_final_flush_failed");
    }
    w.into_inner()
}

pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
