//! Outbound delivery of price notifications.
//!
//! The engine only depends on the [`Notifier`] trait. Two backends exist:
//! an NDJSON writer (stdout or file) and Discord direct messages.

use async_trait::async_trait;
use serde::Serialize;

use crate::error::NotifyError;
use crate::model::Tick;
use crate::watchlist::SubscriberId;

mod discord;
mod ndjson;

pub use discord::DiscordNotifier;
pub use ndjson::{BoxedWriter, NdjsonDest, NdjsonNotifier};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub subscriber_id: SubscriberId,
    pub symbol: String,
    pub price: f64,
    pub volume: f64,
    pub trade_ts: i64,
    pub text: String,
}

impl Notification {
    pub fn for_tick(subscriber_id: SubscriberId, tick: &Tick) -> Self {
        Notification {
            subscriber_id,
            symbol: tick.symbol.clone(),
            price: tick.price,
            volume: tick.volume,
            trade_ts: tick.timestamp,
            text: render_text(&tick.symbol, tick.price),
        }
    }
}

pub fn render_text(symbol: &str, price: f64) -> String {
    format!("📈 {} price updated: **${}**", symbol, price)
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError>;
}
