//! Upstream feed frame schema
//!
//! Protobuf messages of the broker's market-data feed, declared by hand
//! with `prost` derives. Only the fields the core reads are declared;
//! prost skips everything else on decode, so newer upstream revisions keep
//! parsing.

use std::collections::BTreeMap;

/// Last traded price, time, quantity and close price.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Ltpc {
    #[prost(double, tag = "1")]
    pub ltp: f64,
    /// Last traded time, Unix milliseconds
    #[prost(int64, tag = "2")]
    pub ltt: i64,
    #[prost(int64, tag = "3")]
    pub ltq: i64,
    #[prost(double, tag = "4")]
    pub cp: f64,
}

/// Full feed of a tradable contract (options, futures, equities).
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MarketFullFeed {
    #[prost(message, optional, tag = "1")]
    pub ltpc: Option<Ltpc>,
    #[prost(double, tag = "5")]
    pub atp: f64,
    #[prost(int64, tag = "6")]
    pub vtt: i64,
    #[prost(double, tag = "7")]
    pub oi: f64,
    #[prost(double, tag = "8")]
    pub iv: f64,
}

/// Full feed of an index.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct IndexFullFeed {
    #[prost(message, optional, tag = "1")]
    pub ltpc: Option<Ltpc>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FullFeed {
    #[prost(oneof = "full_feed::FullFeedUnion", tags = "1, 2")]
    pub full_feed_union: Option<full_feed::FullFeedUnion>,
}

pub mod full_feed {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum FullFeedUnion {
        #[prost(message, tag = "1")]
        MarketFf(super::MarketFullFeed),
        #[prost(message, tag = "2")]
        IndexFf(super::IndexFullFeed),
    }
}

/// One instrument's entry in a frame.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Feed {
    #[prost(oneof = "feed::FeedUnion", tags = "1, 2")]
    pub feed_union: Option<feed::FeedUnion>,
}

pub mod feed {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum FeedUnion {
        #[prost(message, tag = "1")]
        Ltpc(super::Ltpc),
        #[prost(message, tag = "2")]
        FullFeed(super::FullFeed),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum FeedType {
    InitialFeed = 0,
    LiveFeed = 1,
    MarketInfo = 2,
}

/// Top-level frame: instrument identifier -> feed entry.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FeedResponse {
    #[prost(enumeration = "FeedType", tag = "1")]
    pub r#type: i32,
    #[prost(btree_map = "string, message", tag = "2")]
    pub feeds: BTreeMap<String, Feed>,
    /// Server time of the frame, Unix milliseconds
    #[prost(int64, tag = "3")]
    pub current_ts: i64,
}

impl Feed {
    /// Entry carrying an index full feed.
    pub fn index(ltp: f64, ltt: i64) -> Self {
        Self {
            feed_union: Some(feed::FeedUnion::FullFeed(FullFeed {
                full_feed_union: Some(full_feed::FullFeedUnion::IndexFf(IndexFullFeed {
                    ltpc: Some(Ltpc {
                        ltp,
                        ltt,
                        ..Default::default()
                    }),
                })),
            })),
        }
    }

    /// Entry carrying a market (contract) full feed.
    pub fn market(ltp: f64, ltt: i64) -> Self {
        Self {
            feed_union: Some(feed::FeedUnion::FullFeed(FullFeed {
                full_feed_union: Some(full_feed::FullFeedUnion::MarketFf(MarketFullFeed {
                    ltpc: Some(Ltpc {
                        ltp,
                        ltt,
                        ..Default::default()
                    }),
                    ..Default::default()
                })),
            })),
        }
    }
}
