//! Error types for key construction
//!
//! Key errors are raised at the boundary (connection upgrade, directory
//! load) and never propagate past the entity that triggered them.

use thiserror::Error;

/// Errors produced while building a chain key or normalizing an expiry
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("Missing expiry")]
    MissingExpiry,

    #[error("Expiry carries no value: {raw:?}")]
    SentinelExpiry { raw: String },

    #[error("Unrecognized expiry encoding: {raw}")]
    InvalidExpiry { raw: String },

    #[error("Epoch timestamp out of range: {millis}")]
    TimestampOutOfRange { millis: i64 },

    #[error("Empty symbol")]
    EmptySymbol,
}
