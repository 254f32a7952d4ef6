//! Gateway configuration, read from the environment
//!
//! Every setting has a default; a malformed value falls back to it with a
//! warning instead of aborting startup.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use market_data::chain::ChainConfig;
use market_data::decoder::DecoderMode;
use market_data::directory::{DEFAULT_SNAPSHOT_URL, DirectoryConfig};
use market_data::session::{DEFAULT_AUTHORIZE_URL, DEFAULT_KEEPALIVE_INTERVAL, FeedConfig};
use tracing::warn;
use types::ids::InstrumentId;
use types::instrument::normalize_symbol;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_addr: SocketAddr,
    pub instruments_url: String,
    pub directory: DirectoryConfig,
    pub authorize_url: String,
    /// Bearer credential for the upstream feed; the feed stays off without it.
    pub access_token: Option<String>,
    pub keepalive_interval: Duration,
    /// Upper bound on one send to a subscriber socket.
    pub send_timeout: Duration,
    pub chain: ChainConfig,
    pub feed: FeedConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            instruments_url: DEFAULT_SNAPSHOT_URL.to_string(),
            directory: DirectoryConfig::default(),
            authorize_url: DEFAULT_AUTHORIZE_URL.to_string(),
            access_token: None,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            send_timeout: Duration::from_millis(5000),
            chain: ChainConfig::default(),
            feed: FeedConfig {
                decoder: DecoderMode::IncludeMarket,
                ..FeedConfig::default()
            },
        }
    }
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        let var = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        config.bind_addr = parse_or(var("GATEWAY_BIND_ADDR"), "GATEWAY_BIND_ADDR", config.bind_addr);
        if let Some(url) = var("INSTRUMENTS_URL") {
            config.instruments_url = url;
        }
        if let Some(segment) = var("INSTRUMENTS_SEGMENT") {
            config.directory.segment = segment;
        }
        if let Some(raw) = var("UNDERLYINGS") {
            match parse_underlyings(&raw) {
                Some(underlyings) => config.directory.underlyings = underlyings,
                None => warn!(value = %raw, "Malformed UNDERLYINGS, using defaults"),
            }
        }
        if let Some(url) = var("FEED_AUTHORIZE_URL") {
            config.authorize_url = url;
        }
        config.access_token = var("FEED_ACCESS_TOKEN");

        let keepalive_secs = parse_or(var("KEEPALIVE_SECS"), "KEEPALIVE_SECS", config.keepalive_interval.as_secs());
        config.keepalive_interval = Duration::from_secs(keepalive_secs.max(1));

        let publish_ms = parse_or(
            var("CHAIN_PUBLISH_MS"),
            "CHAIN_PUBLISH_MS",
            config.chain.publish_interval.as_millis() as u64,
        );
        config.chain.publish_interval = Duration::from_millis(publish_ms.max(1));

        let send_ms = parse_or(var("SEND_TIMEOUT_MS"), "SEND_TIMEOUT_MS", config.send_timeout.as_millis() as u64);
        config.send_timeout = Duration::from_millis(send_ms.max(1));

        let include_market = parse_or(var("FEED_INCLUDE_MARKET"), "FEED_INCLUDE_MARKET", true);
        config.feed.decoder = if include_market {
            DecoderMode::IncludeMarket
        } else {
            DecoderMode::IndexOnly
        };

        config
    }
}

fn parse_or<T>(raw: Option<String>, name: &str, default: T) -> T
where
    T: FromStr + Display,
{
    match raw {
        None => default,
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            warn!(variable = name, value = %raw, default = %default, "Malformed setting, using default");
            default
        }),
    }
}

/// `SYMBOL=INDEX_KEY,SYMBOL=INDEX_KEY,...`
fn parse_underlyings(raw: &str) -> Option<BTreeMap<String, InstrumentId>> {
    let mut underlyings = BTreeMap::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (symbol, key) = pair.split_once('=')?;
        let symbol = normalize_symbol(symbol);
        let key = key.trim();
        if symbol.is_empty() || key.is_empty() {
            return None;
        }
        underlyings.insert(symbol, InstrumentId::new(key));
    }
    if underlyings.is_empty() { None } else { Some(underlyings) }
}
