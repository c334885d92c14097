// src/feed.rs

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::Receiver;
use tokio::time::{interval, sleep, sleep_until, Instant, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::dispatch::FanoutDispatcher;
use crate::error::FeedError;
use crate::metrics::Metrics;
use crate::model::{decode_frame, ControlMessage, FeedFrame};
use crate::refresh::Refresher;

/// Requests from the refresh loop to the connection.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedCommand {
    /// Make sure every listed symbol is subscribed.
    Subscribe(Vec<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting,
    Connected,
}

/// Opens sessions to the upstream feed.
#[async_trait]
pub trait FeedTransport: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn FeedSession>, FeedError>;
}

/// One live connection. `next_frame` yields `Some(text)` for text frames and
/// `None` for control frames that only prove the link is alive.
#[async_trait]
pub trait FeedSession: Send {
    async fn send_text(&mut self, text: String) -> Result<(), FeedError>;
    async fn send_ping(&mut self) -> Result<(), FeedError>;
    async fn next_frame(&mut self) -> Result<Option<String>, FeedError>;
    async fn close(&mut self);
}

pub struct WsTransport {
    url: String,
    display_url: String,
}

impl WsTransport {
    /// `url` carries the token; `display_url` is what gets logged.
    pub fn new(url: String, display_url: String) -> Self {
        WsTransport { url, display_url }
    }
}

#[async_trait]
impl FeedTransport for WsTransport {
    async fn connect(&self) -> Result<Box<dyn FeedSession>, FeedError> {
        info!(target: "fanout_feed", url = %self.display_url, "Connecting");
        let (socket, response) = connect_async(self.url.as_str())
            .await
            .map_err(|e| FeedError::Connect(e.to_string()))?;
        info!(target: "fanout_feed", status = %response.status(), "Connected");
        Ok(Box::new(WsSession { socket }))
    }
}

struct WsSession {
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl FeedSession for WsSession {
    async fn send_text(&mut self, text: String) -> Result<(), FeedError> {
        self.socket.send(Message::Text(text.into())).await?;
        Ok(())
    }

    async fn send_ping(&mut self) -> Result<(), FeedError> {
        self.socket.send(Message::Ping(Vec::new().into())).await?;
        Ok(())
    }

    async fn next_frame(&mut self) -> Result<Option<String>, FeedError> {
        match self.socket.next().await {
            Some(Ok(Message::Text(text))) => Ok(Some(text.as_str().to_owned())),
            Some(Ok(Message::Close(frame))) => {
                debug!(target: "fanout_feed", ?frame, "close frame received");
                Err(FeedError::Closed)
            }
            Some(Ok(_)) => Ok(None),
            Some(Err(err)) => Err(err.into()),
            None => Err(FeedError::Closed),
        }
    }

    async fn close(&mut self) {
        if let Err(err) = self.socket.close(None).await {
            error!(target: "fanout_feed", error = %err, "Error closing websocket");
        }
    }
}

#[derive(Debug, Clone)]
pub struct FeedSettings {
    pub reconnect_backoff: Duration,
    pub read_timeout: Duration,
    pub heartbeat_interval: Option<Duration>,
}

enum SessionEnd {
    Shutdown,
    Failed(FeedError),
}

/// Owns the connection lifecycle:
/// `Disconnected -> Connecting -> Connected -> Disconnected`, forever, until
/// the shutdown token fires. Any failure, including a failed connect, clears
/// the subscribed set and waits `reconnect_backoff` before the next attempt.
pub struct FeedConnection {
    transport: Arc<dyn FeedTransport>,
    refresher: Arc<Refresher>,
    dispatcher: Arc<FanoutDispatcher>,
    commands: Receiver<FeedCommand>,
    commands_open: bool,
    subscribed: HashSet<String>,
    state: ConnState,
    settings: FeedSettings,
    metrics: Metrics,
}

impl FeedConnection {
    pub fn new(
        transport: Arc<dyn FeedTransport>,
        refresher: Arc<Refresher>,
        dispatcher: Arc<FanoutDispatcher>,
        commands: Receiver<FeedCommand>,
        settings: FeedSettings,
        metrics: Metrics,
    ) -> Self {
        FeedConnection {
            transport,
            refresher,
            dispatcher,
            commands,
            commands_open: true,
            subscribed: HashSet::new(),
            state: ConnState::Disconnected,
            settings,
            metrics,
        }
    }

    fn set_state(&mut self, next: ConnState) {
        if next == ConnState::Disconnected {
            self.subscribed.clear();
        }
        self.metrics.set_ready(next == ConnState::Connected);
        debug!(target: "fanout_feed", from = ?self.state, to = ?next, "state");
        self.state = next;
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        loop {
            self.set_state(ConnState::Connecting);
            self.metrics.inc_reconnect();
            let attempt_start = Instant::now();
            let connected = tokio::select! {
                _ = shutdown.cancelled() => break,
                res = self.transport.connect() => res,
            };
            match connected {
                Ok(mut session) => {
                    self.set_state(ConnState::Connected);
                    self.metrics.inc_reconnect_success();
                    self.metrics
                        .observe_reconnect_success_secs(attempt_start.elapsed().as_secs_f64());
                    match self.drive(session.as_mut(), &shutdown).await {
                        SessionEnd::Shutdown => {
                            session.close().await;
                            break;
                        }
                        SessionEnd::Failed(err) => {
                            if matches!(err, FeedError::ReadTimeout(_)) {
                                self.metrics.inc_timeout();
                            }
                            self.metrics.inc_error();
                            warn!(target: "fanout_feed", error = %err, backoff_secs = self.settings.reconnect_backoff.as_secs(), "feed connection lost; reconnecting");
                        }
                    }
                }
                Err(err) => {
                    self.metrics.inc_error();
                    self.metrics.inc_reconnect_failure();
                    warn!(target: "fanout_feed", error = %err, backoff_secs = self.settings.reconnect_backoff.as_secs(), "connect failed; retrying");
                }
            }
            self.set_state(ConnState::Disconnected);
            if wait_or_shutdown(self.settings.reconnect_backoff, &shutdown).await {
                break;
            }
        }
        self.set_state(ConnState::Disconnected);
        info!(target: "fanout_feed", "feed connection stopped");
    }

    async fn drive(&mut self, session: &mut dyn FeedSession, shutdown: &CancellationToken) -> SessionEnd {
        // A failed rebuild falls back to the index we already have.
        let index = match self.refresher.refresh_now().await {
            Ok(index) => index,
            Err(_) => self.refresher.index().load(),
        };
        let mut symbols: Vec<String> = index.symbols().map(str::to_string).collect();
        symbols.sort();
        if let Err(err) = self.subscribe_all(session, &symbols).await {
            return SessionEnd::Failed(err);
        }
        info!(target: "fanout_feed", symbols = self.subscribed.len(), "subscribed");

        let heartbeat_enabled = self.settings.heartbeat_interval.is_some();
        let mut hb = interval(
            self.settings
                .heartbeat_interval
                .unwrap_or(Duration::from_secs(3600)),
        );
        hb.set_missed_tick_behavior(MissedTickBehavior::Delay);
        hb.tick().await;
        let mut deadline = Instant::now() + self.settings.read_timeout;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(target: "fanout_feed", "Feed reader received shutdown signal.");
                    return SessionEnd::Shutdown;
                }
                cmd = self.commands.recv(), if self.commands_open => match cmd {
                    Some(FeedCommand::Subscribe(symbols)) => {
                        if let Err(err) = self.subscribe_all(session, &symbols).await {
                            return SessionEnd::Failed(err);
                        }
                    }
                    None => self.commands_open = false,
                },
                frame = session.next_frame() => match frame {
                    Ok(Some(text)) => {
                        deadline = Instant::now() + self.settings.read_timeout;
                        self.metrics.inc_received();
                        if let Err(err) = self.handle_text(&text) {
                            return SessionEnd::Failed(err);
                        }
                    }
                    Ok(None) => {
                        deadline = Instant::now() + self.settings.read_timeout;
                    }
                    Err(err) => return SessionEnd::Failed(err),
                },
                _ = sleep_until(deadline) => {
                    return SessionEnd::Failed(FeedError::ReadTimeout(self.settings.read_timeout));
                }
                _ = hb.tick(), if heartbeat_enabled => {
                    if let Err(err) = session.send_ping().await {
                        return SessionEnd::Failed(err);
                    }
                    self.metrics.inc_heartbeat();
                }
            }
        }
    }

    /// Sends one subscribe per symbol not yet subscribed on this connection.
    async fn subscribe_all(&mut self, session: &mut dyn FeedSession, symbols: &[String]) -> Result<(), FeedError> {
        for symbol in symbols {
            if self.subscribed.contains(symbol) {
                continue;
            }
            let msg = serde_json::to_string(&ControlMessage::subscribe(symbol))?;
            debug!(target: "fanout_feed", %symbol, "subscribing");
            session.send_text(msg).await?;
            self.subscribed.insert(symbol.clone());
            self.metrics.inc_subscribe();
        }
        Ok(())
    }

    fn handle_text(&self, text: &str) -> Result<(), FeedError> {
        if tracing::event_enabled!(target: "fanout_feed", tracing::Level::DEBUG) {
            debug!(target: "fanout_feed", frame = %text, "raw frame");
        }
        match decode_frame(text)? {
            FeedFrame::Trades { ticks, malformed } => {
                if malformed > 0 {
                    self.metrics.add_malformed(malformed as u64);
                    debug!(target: "fanout_feed", malformed, "skipped malformed trade records");
                }
                for tick in &ticks {
                    self.metrics.inc_trade();
                    self.dispatcher.dispatch(tick);
                }
            }
            FeedFrame::Other => self.metrics.inc_ignored(),
        }
        Ok(())
    }
}

/// Sleeps for `duration`; returns `true` if shutdown fired first.
pub async fn wait_or_shutdown(duration: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = sleep(duration) => false,
        _ = shutdown.cancelled() => true,
    }
}
