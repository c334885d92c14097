use std::{env, path::PathBuf, time::Duration};

use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifierKind {
    Stdout,
    Ndjson,
    Discord,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub feed_url: String,
    pub feed_token: String,
    pub refresh_interval: Duration,
    pub reconnect_backoff: Duration,
    pub default_notify_interval: Duration,
    pub read_timeout: Duration,
    pub heartbeat_interval: Option<Duration>,
    pub watchlist_path: PathBuf,
    pub notifier: NotifierKind,
    pub notify_dest: String,
    pub notify_channel_cap: usize,
    pub notify_flush_interval: Duration,
    pub discord_bot_token: Option<String>,
    pub discord_api_base: String,
    pub notify_concurrency: usize,
    pub shutdown_grace: Duration,
    pub metrics_addr: String,
    pub stats_interval: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(var: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let feed_token = var("FINNHUB_TOKEN")
            .or_else(|| var("FINNHUB_KEY"))
            .filter(|v| !v.trim().is_empty())
            .ok_or(ConfigError::Missing("FINNHUB_TOKEN"))?;

        let feed_url = var("FEED_URL").unwrap_or_else(|| "wss://ws.finnhub.io".to_string());

        let notifier = match var("NOTIFIER").map(|s| s.to_ascii_lowercase()) {
            None => NotifierKind::Stdout,
            Some(ref s) if s == "stdout" => NotifierKind::Stdout,
            Some(ref s) if s == "ndjson" => NotifierKind::Ndjson,
            Some(ref s) if s == "discord" => NotifierKind::Discord,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    key: "NOTIFIER",
                    value: other,
                })
            }
        };

        let discord_bot_token = var("DISCORD_BOT_TOKEN").filter(|v| !v.trim().is_empty());
        if notifier == NotifierKind::Discord && discord_bot_token.is_none() {
            return Err(ConfigError::Missing("DISCORD_BOT_TOKEN"));
        }

        let heartbeat_interval = parse_u64(var("HEARTBEAT_INTERVAL_SECS"))
            .map(|secs| if secs == 0 { None } else { Some(Duration::from_secs(secs)) })
            .unwrap_or_else(|| Some(Duration::from_secs(30)));

        Ok(Config {
            feed_url,
            feed_token,
            refresh_interval: secs_or(var("REFRESH_INTERVAL_SECS"), 60),
            reconnect_backoff: secs_or(var("RECONNECT_BACKOFF_SECS"), 5),
            default_notify_interval: secs_or(var("DEFAULT_NOTIFY_INTERVAL_SECS"), 30),
            read_timeout: secs_or(var("READ_TIMEOUT_SECS"), 90),
            heartbeat_interval,
            watchlist_path: var("WATCHLIST_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("watchlist.json")),
            notifier,
            notify_dest: var("NOTIFY_DEST").unwrap_or_else(|| "stdout".to_string()),
            notify_channel_cap: parse_u64(var("NOTIFY_CHANNEL_CAP"))
                .map(|v| v.max(1) as usize)
                .unwrap_or(1024),
            notify_flush_interval: var("NOTIFY_FLUSH_INTERVAL_MS")
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_millis)
                .unwrap_or_else(|| Duration::from_millis(1000)),
            discord_bot_token,
            discord_api_base: var("DISCORD_API_BASE")
                .unwrap_or_else(|| "https://discord.com/api/v10".to_string()),
            notify_concurrency: parse_u64(var("NOTIFY_CONCURRENCY"))
                .map(|v| v.max(1) as usize)
                .unwrap_or(64),
            shutdown_grace: secs_or(var("SHUTDOWN_GRACE_SECS"), 5),
            metrics_addr: var("METRICS_ADDR").unwrap_or_else(|| "127.0.0.1:9898".to_string()),
            stats_interval: secs_or(var("STATS_INTERVAL_SECS"), 60),
        })
    }

    /// Feed URL with the auth token attached as a query parameter.
    pub fn feed_ws_url(&self) -> String {
        let sep = if self.feed_url.contains('?') { '&' } else { '?' };
        format!("{}{}token={}", self.feed_url, sep, self.feed_token)
    }
}

fn parse_u64(src: Option<String>) -> Option<u64> {
    src.and_then(|v| v.trim().parse::<u64>().ok())
}

fn secs_or(src: Option<String>, default_secs: u64) -> Duration {
    Duration::from_secs(parse_u64(src).unwrap_or(default_secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults_apply_when_only_token_is_set() {
        let cfg = Config::from_lookup(lookup(&[("FINNHUB_TOKEN", "abc")])).unwrap();
        assert_eq!(cfg.refresh_interval, Duration::from_secs(60));
        assert_eq!(cfg.reconnect_backoff, Duration::from_secs(5));
        assert_eq!(cfg.default_notify_interval, Duration::from_secs(30));
        assert_eq!(cfg.heartbeat_interval, Some(Duration::from_secs(30)));
        assert_eq!(cfg.notifier, NotifierKind::Stdout);
        assert_eq!(cfg.feed_ws_url(), "wss://ws.finnhub.io?token=abc");
    }

    #[test]
    fn missing_token_is_an_error() {
        let err = Config::from_lookup(lookup(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("FINNHUB_TOKEN")));
    }

    #[test]
    fn legacy_key_name_is_accepted() {
        let cfg = Config::from_lookup(lookup(&[("FINNHUB_KEY", "k")])).unwrap();
        assert_eq!(cfg.feed_token, "k");
    }

    #[test]
    fn unparseable_numbers_fall_back_and_zero_disables_heartbeat() {
        let cfg = Config::from_lookup(lookup(&[
            ("FINNHUB_TOKEN", "abc"),
            ("REFRESH_INTERVAL_SECS", "soon"),
            ("HEARTBEAT_INTERVAL_SECS", "0"),
            ("FEED_URL", "wss://example.test/ws?v=2"),
        ]))
        .unwrap();
        assert_eq!(cfg.refresh_interval, Duration::from_secs(60));
        assert_eq!(cfg.heartbeat_interval, None);
        assert_eq!(cfg.feed_ws_url(), "wss://example.test/ws?v=2&token=abc");
    }

    #[test]
    fn discord_notifier_needs_bot_token() {
        let err = Config::from_lookup(lookup(&[("FINNHUB_TOKEN", "abc"), ("NOTIFIER", "discord")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Missing("DISCORD_BOT_TOKEN")));

        let err = Config::from_lookup(lookup(&[("FINNHUB_TOKEN", "abc"), ("NOTIFIER", "pager")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "NOTIFIER", .. }));
    }
}
