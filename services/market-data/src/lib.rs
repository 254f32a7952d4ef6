//! Option-chain streaming core
//!
//! Ingests one upstream binary price feed, assembles per-(symbol, expiry)
//! option chains from it, and fans the chains out to subscriber
//! connections.
//!
//! # Architecture
//!
//! ```text
//!  Remote snapshot ──► InstrumentDirectory (load once, read-only)
//!                              │ legs / future / index ids
//!  Upstream feed               ▼
//!      │              ChainRegistry ── one ChainBuilder per ChainKey
//!  ┌───▼────────┐              │ register route
//!  │FeedSession │──► Decoder ──► TickRouter ──► builder tasks
//!  └───┬────────┘                                  │ payload
//!      └──► SpotBoard (latest tick per id)         ▼
//!                                       SubscriptionRegistry ──► subscribers
//! ```
//!
//! Each shared structure has its own short lock; no I/O happens while any
//! lock is held. The directory's snapshot fetch runs under a claimed
//! "loading" phase, not a lock, and concurrent loaders park on it.

pub mod chain;
pub mod decoder;
pub mod directory;
pub mod error;
pub mod metrics;
pub mod proto;
pub mod registry;
pub mod session;
pub mod subscriptions;

pub use chain::{BuilderState, ChainBuilder, ChainConfig, ChainPayload, Quote, StrikeRow};
pub use decoder::{DecoderMode, FeedDecoder};
pub use directory::{DirectoryConfig, HttpSnapshotSource, InstrumentDirectory, SnapshotSource};
pub use error::{DeliveryError, DirectoryError, FeedError};
pub use registry::ChainRegistry;
pub use session::{keepalive, publish_spots, FeedConfig, FeedSession};
pub use subscriptions::{BroadcastReport, Subscriber, SubscriptionRegistry, MARKET_DATA_CHANNEL};

// Library version
pub const SERVICE_VERSION: &str = "0.1.0";
