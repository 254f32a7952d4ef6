//! Feed decoder
//!
//! Turns one binary upstream frame into an ordered list of ticks.
//!
//! Each entry is checked in order: full-feed section present, index
//! sub-section present, last-traded price present, price positive. A failed
//! check skips that entry only. A frame that does not parse at all yields
//! no ticks. Upstream interleaves heartbeats and shapes this decoder does
//! not read, so neither case is an error.

use prost::Message;
use tracing::debug;
use types::ids::InstrumentId;
use types::tick::Tick;

use crate::proto::{feed::FeedUnion, full_feed::FullFeedUnion, Feed, FeedResponse, Ltpc};

/// Which entry shapes produce ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DecoderMode {
    /// Index full feeds only.
    #[default]
    IndexOnly,
    /// Index full feeds, market full feeds, and bare LTPC entries.
    IncludeMarket,
}

/// Why one entry produced no tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NoFullFeed,
    UnsupportedShape,
    NoPrice,
    NonPositivePrice,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::NoFullFeed => "no_full_feed",
            SkipReason::UnsupportedShape => "unsupported_shape",
            SkipReason::NoPrice => "no_price",
            SkipReason::NonPositivePrice => "non_positive_price",
        }
    }
}

/// Result of decoding one frame.
#[derive(Debug, Clone, Default)]
pub struct DecodedFrame {
    pub ticks: Vec<Tick>,
    /// Entries present in the frame that produced no tick
    pub skipped: usize,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FeedDecoder {
    mode: DecoderMode,
}

impl FeedDecoder {
    pub fn new(mode: DecoderMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> DecoderMode {
        self.mode
    }

    /// Decode a frame into ticks, in instrument-identifier order.
    pub fn decode(&self, frame: &[u8]) -> Vec<Tick> {
        self.decode_frame(frame).ticks
    }

    pub fn decode_frame(&self, frame: &[u8]) -> DecodedFrame {
        let response = match FeedResponse::decode(frame) {
            Ok(response) => response,
            Err(e) => {
                debug!(len = frame.len(), error = %e, "Discarding unparseable frame");
                return DecodedFrame::default();
            }
        };

        let fallback_ts = if response.current_ts > 0 {
            response.current_ts
        } else {
            chrono::Utc::now().timestamp_millis()
        };

        let mut decoded = DecodedFrame {
            ticks: Vec::with_capacity(response.feeds.len()),
            skipped: 0,
        };

        for (instrument, feed) in &response.feeds {
            match self.decode_entry(instrument, feed, fallback_ts) {
                Ok(tick) => decoded.ticks.push(tick),
                Err(reason) => {
                    decoded.skipped += 1;
                    debug!(instrument = %instrument, reason = reason.as_str(), "Skipping feed entry");
                }
            }
        }

        decoded
    }

    fn decode_entry(&self, instrument: &str, feed: &Feed, fallback_ts: i64) -> Result<Tick, SkipReason> {
        let ltpc = match (&feed.feed_union, self.mode) {
            (Some(FeedUnion::FullFeed(full)), mode) => match (&full.full_feed_union, mode) {
                (Some(FullFeedUnion::IndexFf(index)), _) => index.ltpc.as_ref(),
                (Some(FullFeedUnion::MarketFf(market)), DecoderMode::IncludeMarket) => market.ltpc.as_ref(),
                _ => return Err(SkipReason::UnsupportedShape),
            },
            (Some(FeedUnion::Ltpc(ltpc)), DecoderMode::IncludeMarket) => Some(ltpc),
            _ => return Err(SkipReason::NoFullFeed),
        };

        let ltpc = ltpc.ok_or(SkipReason::NoPrice)?;
        to_tick(instrument, ltpc, fallback_ts)
    }
}

fn to_tick(instrument: &str, ltpc: &Ltpc, fallback_ts: i64) -> Result<Tick, SkipReason> {
    let observed_at = if ltpc.ltt > 0 { ltpc.ltt } else { fallback_ts };
    Tick::new(InstrumentId::new(instrument), ltpc.ltp, observed_at).ok_or(SkipReason::NonPositivePrice)
}
