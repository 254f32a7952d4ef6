//! Error taxonomy for the streaming core
//!
//! Every error here is scoped to the entity that produced it: a failed
//! directory load leaves the directory unloaded, a failed send drops one
//! subscriber, a feed error ends one connection attempt.

use thiserror::Error;

/// Instrument snapshot fetch/parse failures
#[derive(Error, Debug)]
pub enum DirectoryError {
    #[error("Snapshot fetch failed: {0}")]
    Fetch(#[from] reqwest::Error),

    #[error("Snapshot endpoint returned status {status}")]
    HttpStatus { status: u16 },

    #[error("Snapshot decompression failed: {0}")]
    Decompress(#[from] std::io::Error),

    #[error("Snapshot parse failed: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Snapshot source unavailable: {message}")]
    Source { message: String },
}

/// Upstream feed failures
#[derive(Error, Debug)]
pub enum FeedError {
    #[error("Access token unavailable: {message}")]
    Token { message: String },

    #[error("Feed authorization failed: {message}")]
    Authorize { message: String },

    #[error("Feed socket error: {0}")]
    Socket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Delivery failure on one subscriber handle
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("Subscriber connection closed")]
    Closed,

    #[error("Send timed out after {millis}ms")]
    Timeout { millis: u64 },
}
