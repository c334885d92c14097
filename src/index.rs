// src/index.rs

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tracing::debug;

use crate::watchlist::{AssetKind, SubscriberDoc, SubscriberId};

/// Point-in-time view of who watches what. Built from scratch on every
/// refresh and never mutated afterwards.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubscriptionIndex {
    symbols: HashMap<String, BTreeSet<SubscriberId>>,
    intervals: HashMap<SubscriberId, Duration>,
}

impl SubscriptionIndex {
    /// Builds an index from a store snapshot. Entries without a symbol are
    /// skipped; every symbol key ends up with at least one subscriber.
    pub fn rebuild(snapshot: &[SubscriberDoc], default_interval: Duration) -> Self {
        let mut symbols: HashMap<String, BTreeSet<SubscriberId>> = HashMap::new();
        let mut intervals = HashMap::with_capacity(snapshot.len());
        for doc in snapshot {
            let interval = doc
                .delay_secs
                .and_then(|d| Duration::try_from_secs_f64(d.max(0.0)).ok())
                .unwrap_or(default_interval);
            intervals.insert(doc.subscriber_id.clone(), interval);
            for entry in doc.entries() {
                if entry.kind == AssetKind::Other {
                    debug!(target: "fanout_refresh", subscriber = %entry.subscriber_id, symbol = %entry.symbol, "unrecognised asset kind");
                }
                symbols
                    .entry(entry.symbol)
                    .or_default()
                    .insert(entry.subscriber_id);
            }
        }
        SubscriptionIndex { symbols, intervals }
    }

    pub fn subscribers(&self, symbol: &str) -> Option<&BTreeSet<SubscriberId>> {
        self.symbols.get(symbol)
    }

    pub fn interval(&self, subscriber: &SubscriberId) -> Option<Duration> {
        self.intervals.get(subscriber).copied()
    }

    pub fn symbols(&self) -> impl Iterator<Item = &str> {
        self.symbols.keys().map(String::as_str)
    }

    pub fn watches(&self, subscriber: &SubscriberId, symbol: &str) -> bool {
        self.symbols
            .get(symbol)
            .map(|subs| subs.contains(subscriber))
            .unwrap_or(false)
    }

    pub fn symbol_count(&self) -> usize {
        self.symbols.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.intervals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty() && self.intervals.is_empty()
    }
}

/// Shared handle to the current index. Writers swap in a whole new index;
/// readers load an `Arc` and never block.
#[derive(Clone)]
pub struct SharedIndex {
    inner: Arc<ArcSwap<SubscriptionIndex>>,
}

impl SharedIndex {
    pub fn new(index: SubscriptionIndex) -> Self {
        SharedIndex {
            inner: Arc::new(ArcSwap::from_pointee(index)),
        }
    }

    pub fn load(&self) -> Arc<SubscriptionIndex> {
        self.inner.load_full()
    }

    pub fn replace(&self, index: SubscriptionIndex) -> Arc<SubscriptionIndex> {
        let next = Arc::new(index);
        self.inner.store(next.clone());
        next
    }
}

impl Default for SharedIndex {
    fn default() -> Self {
        SharedIndex::new(SubscriptionIndex::default())
    }
}
