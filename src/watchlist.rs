//! Watchlist documents and the stores that serve them.
//!
//! A document belongs to one subscriber and lists the symbols they watch:
//!
//! ```json
//! {"user_id": "4242", "delay": 30, "watchlist": [{"symbol": "AAPL", "type": "stock"}]}
//! ```
//!
//! The fan-out engine only ever reads a full snapshot of all documents.

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::StoreError;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SubscriberId(String);

impl SubscriberId {
    pub fn new(id: impl Into<String>) -> Self {
        SubscriberId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetKind {
    Crypto,
    CryptoFutures,
    Stock,
    Forex,
    IndicesFutures,
    Other,
}

impl AssetKind {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "crypto" => AssetKind::Crypto,
            "crypto futures" => AssetKind::CryptoFutures,
            "stock" => AssetKind::Stock,
            "forex" => AssetKind::Forex,
            "indices futures" => AssetKind::IndicesFutures,
            _ => AssetKind::Other,
        }
    }
}

/// One entry of a subscriber's watchlist. `symbol` is `None` when the stored
/// entry had no usable symbol; such entries are skipped by the index.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchItem {
    pub symbol: Option<String>,
    pub kind: AssetKind,
}

#[cfg(test)]
impl WatchItem {
    pub fn new(symbol: impl Into<String>, kind: AssetKind) -> Self {
        WatchItem {
            symbol: Some(symbol.into()),
            kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubscriberDoc {
    pub subscriber_id: SubscriberId,
    /// Notification interval in seconds; `None` means use the default.
    pub delay_secs: Option<f64>,
    pub watchlist: Vec<WatchItem>,
}

/// Flattened `(subscriber, symbol, kind)` row.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchEntry {
    pub subscriber_id: SubscriberId,
    pub symbol: String,
    pub kind: AssetKind,
}

impl SubscriberDoc {
    pub fn entries(&self) -> impl Iterator<Item = WatchEntry> + '_ {
        self.watchlist.iter().filter_map(move |item| {
            let symbol = item.symbol.as_deref()?.trim();
            if symbol.is_empty() {
                return None;
            }
            Some(WatchEntry {
                subscriber_id: self.subscriber_id.clone(),
                symbol: symbol.to_string(),
                kind: item.kind,
            })
        })
    }
}

#[async_trait]
pub trait WatchlistStore: Send + Sync {
    async fn snapshot(&self) -> Result<Vec<SubscriberDoc>, StoreError>;
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Text(String),
    Number(u64),
}

// `delay` and `watchlist` stay loose so one bad field costs the default,
// not the subscriber's whole document.
#[derive(Deserialize)]
struct RawDoc {
    user_id: Option<RawId>,
    #[serde(default)]
    delay: Value,
    #[serde(default)]
    watchlist: Value,
}

#[derive(Deserialize)]
struct RawItem {
    symbol: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
}

/// Decodes stored documents one by one; a document that does not decode, or
/// has no `user_id`, is skipped with a warning.
pub fn decode_documents(docs: Vec<Value>) -> Vec<SubscriberDoc> {
    let mut out = Vec::with_capacity(docs.len());
    for (pos, raw) in docs.into_iter().enumerate() {
        let doc: RawDoc = match serde_json::from_value(raw) {
            Ok(d) => d,
            Err(err) => {
                warn!(target: "fanout_refresh", position = pos, error = %err, "skipping undecodable watchlist document");
                continue;
            }
        };
        let subscriber_id = match doc.user_id {
            Some(RawId::Text(s)) if !s.trim().is_empty() => SubscriberId::new(s.trim()),
            Some(RawId::Number(n)) => SubscriberId::new(n.to_string()),
            _ => {
                warn!(target: "fanout_refresh", position = pos, "skipping watchlist document without user_id");
                continue;
            }
        };
        let items = match doc.watchlist {
            Value::Array(items) => items,
            Value::Null => Vec::new(),
            other => {
                warn!(target: "fanout_refresh", subscriber = %subscriber_id, found = %other, "watchlist is not an array; treating as empty");
                Vec::new()
            }
        };
        let delay_secs = match &doc.delay {
            Value::Null => None,
            Value::Number(n) => n.as_f64(),
            other => {
                warn!(target: "fanout_refresh", subscriber = %subscriber_id, found = %other, "delay is not a number; using default");
                None
            }
        };
        let watchlist = items
            .into_iter()
            .map(|item| match serde_json::from_value::<RawItem>(item) {
                Ok(it) => WatchItem {
                    symbol: it.symbol,
                    kind: it.kind.as_deref().map(AssetKind::parse).unwrap_or(AssetKind::Other),
                },
                Err(_) => WatchItem {
                    symbol: None,
                    kind: AssetKind::Other,
                },
            })
            .collect();
        out.push(SubscriberDoc {
            subscriber_id,
            delay_secs,
            watchlist,
        });
    }
    out
}

/// Store backed by a JSON array of documents on disk, re-read on every
/// snapshot so edits are picked up by the next refresh.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        JsonFileStore {
            path: path.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl WatchlistStore for JsonFileStore {
    async fn snapshot(&self) -> Result<Vec<SubscriberDoc>, StoreError> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| StoreError::Io {
                path: self.path.clone(),
                source,
            })?;
        let docs: Vec<Value> = serde_json::from_str(&text)?;
        Ok(decode_documents(docs))
    }
}

/// In-process store for tests.
#[cfg(test)]
#[derive(Default)]
pub struct MemoryStore {
    docs: std::sync::RwLock<Vec<SubscriberDoc>>,
}

#[cfg(test)]
impl MemoryStore {
    pub fn new(docs: Vec<SubscriberDoc>) -> Self {
        MemoryStore {
            docs: std::sync::RwLock::new(docs),
        }
    }

    pub fn replace(&self, docs: Vec<SubscriberDoc>) {
        let mut guard = self.docs.write().unwrap_or_else(|e| e.into_inner());
        *guard = docs;
    }
}

#[cfg(test)]
#[async_trait]
impl WatchlistStore for MemoryStore {
    async fn snapshot(&self) -> Result<Vec<SubscriberDoc>, StoreError> {
        let guard = self.docs.read().unwrap_or_else(|e| e.into_inner());
        Ok(guard.clone())
    }
}
