// src/throttle.rs

use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::Instant;

use crate::index::SubscriptionIndex;
use crate::watchlist::SubscriberId;

/// Per (subscriber, symbol) minimum-interval gate.
///
/// The check and the update of the last-notified time happen under the same
/// shard lock, so two ticks racing for one pair can never both pass.
pub struct ThrottleGate {
    last_notified: DashMap<(SubscriberId, String), Instant>,
    default_interval: Duration,
}

impl ThrottleGate {
    pub fn new(default_interval: Duration) -> Self {
        ThrottleGate {
            last_notified: DashMap::new(),
            default_interval,
        }
    }

    pub fn default_interval(&self) -> Duration {
        self.default_interval
    }

    /// Returns `true` and records `now` if the pair is outside its window.
    pub fn should_notify(
        &self,
        index: &SubscriptionIndex,
        subscriber: &SubscriberId,
        symbol: &str,
        now: Instant,
    ) -> bool {
        let interval = index
            .interval(subscriber)
            .unwrap_or(self.default_interval);
        self.try_acquire(subscriber, symbol, interval, now)
    }

    pub fn try_acquire(
        &self,
        subscriber: &SubscriberId,
        symbol: &str,
        interval: Duration,
        now: Instant,
    ) -> bool {
        match self
            .last_notified
            .entry((subscriber.clone(), symbol.to_string()))
        {
            Entry::Occupied(mut slot) => {
                if now.saturating_duration_since(*slot.get()) >= interval {
                    slot.insert(now);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(now);
                true
            }
        }
    }

    /// Drops entries for pairs the index no longer contains. Returns how
    /// many were removed.
    pub fn prune(&self, index: &SubscriptionIndex) -> usize {
        let before = self.last_notified.len();
        self.last_notified
            .retain(|(subscriber, symbol), _| index.watches(subscriber, symbol));
        before.saturating_sub(self.last_notified.len())
    }

    pub fn len(&self) -> usize {
        self.last_notified.len()
    }
}
