//! Instrument and chain keys
//!
//! An [`InstrumentKey`] is the human-facing description of a contract
//! (symbol, expiry, strike, side); the directory resolves it to the
//! upstream [`InstrumentId`](crate::ids::InstrumentId). A [`ChainKey`]
//! identifies one option chain and doubles as the channel name subscribers
//! connect to.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::KeyError;
use crate::expiry::{ExpiryDate, ExpiryInput};

/// Which leg of the underlying an instrument represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum InstrumentSide {
    Call,
    Put,
    Future,
    Index,
}

impl InstrumentSide {
    /// Map the upstream `instrument_type` code (`CE`, `PE`, `FUT`, `INDEX`)
    pub fn from_code(code: &str) -> Option<Self> {
        match code.trim().to_ascii_uppercase().as_str() {
            "CE" | "CALL" => Some(InstrumentSide::Call),
            "PE" | "PUT" => Some(InstrumentSide::Put),
            "FUT" | "FUTURE" => Some(InstrumentSide::Future),
            "INDEX" => Some(InstrumentSide::Index),
            _ => None,
        }
    }

    pub fn is_option(&self) -> bool {
        matches!(self, InstrumentSide::Call | InstrumentSide::Put)
    }
}

impl fmt::Display for InstrumentSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            InstrumentSide::Call => "CALL",
            InstrumentSide::Put => "PUT",
            InstrumentSide::Future => "FUTURE",
            InstrumentSide::Index => "INDEX",
        };
        f.write_str(label)
    }
}

/// Human description of a contract.
///
/// `strike` is only meaningful for option legs; `expiry` is ignored for
/// the index side.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstrumentKey {
    pub symbol: String,
    pub expiry: ExpiryDate,
    pub strike: Option<i64>,
    pub side: InstrumentSide,
}

impl InstrumentKey {
    pub fn option(symbol: &str, expiry: ExpiryDate, strike: i64, side: InstrumentSide) -> Self {
        Self {
            symbol: normalize_symbol(symbol),
            expiry,
            strike: Some(strike),
            side,
        }
    }

    pub fn future(symbol: &str, expiry: ExpiryDate) -> Self {
        Self {
            symbol: normalize_symbol(symbol),
            expiry,
            strike: None,
            side: InstrumentSide::Future,
        }
    }
}

/// Canonical (symbol, expiry) pair identifying one option chain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChainKey {
    pub symbol: String,
    pub expiry: ExpiryDate,
}

impl ChainKey {
    pub fn new(symbol: &str, expiry: ExpiryDate) -> Result<Self, KeyError> {
        let symbol = normalize_symbol(symbol);
        if symbol.is_empty() {
            return Err(KeyError::EmptySymbol);
        }
        Ok(Self { symbol, expiry })
    }

    /// Build a key from a raw expiry in any accepted encoding.
    pub fn normalize(symbol: &str, expiry: &ExpiryInput) -> Result<Self, KeyError> {
        Self::new(symbol, ExpiryDate::normalize(expiry)?)
    }

    /// Channel name subscribers of this chain are registered under
    pub fn channel(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ChainKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.symbol, self.expiry)
    }
}

/// Symbols are matched case-insensitively; the canonical form is uppercase.
pub fn normalize_symbol(symbol: &str) -> String {
    symbol.trim().to_ascii_uppercase()
}
