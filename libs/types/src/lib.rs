//! Types library for the option-chain streaming core
//!
//! This library provides the domain types shared by the market-data core
//! and the gateway. Nothing here performs I/O.
//!
//! # Modules
//! - `ids`: Identifiers (InstrumentId, ConnectionId)
//! - `expiry`: Canonical expiry dates and their normalization
//! - `instrument`: Instrument sides, instrument keys, chain keys
//! - `tick`: Normalized price ticks
//! - `errors`: Key error taxonomy

// Public modules
pub mod ids;
pub mod expiry;
pub mod instrument;
pub mod tick;
pub mod errors;

// Library version constant
pub const LIB_VERSION: &str = "1.0.0";

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::ids::*;
    pub use crate::expiry::*;
    pub use crate::instrument::*;
    pub use crate::tick::*;
    pub use crate::errors::*;
}
