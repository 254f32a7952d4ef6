//! Expiry normalization
//!
//! Upstream records and client requests encode the same expiry three ways:
//! - epoch milliseconds (`1740528000000`)
//! - compact digit string (`"20250226"`)
//! - ISO date, optionally with a time part (`"2025-02-26"`)
//!
//! All of them collapse into one [`ExpiryDate`], a calendar date in exchange
//! local time. Every map keyed by expiry uses this type, so two encodings of
//! the same day always hash and compare equal.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, FixedOffset, NaiveDate, Offset, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::KeyError;

/// Exchange local time (IST, UTC+05:30). Epoch timestamps are converted to
/// a calendar date in this zone.
pub const EXCHANGE_UTC_OFFSET_SECS: i32 = 5 * 3600 + 30 * 60;

/// Strings clients send when they mean "no expiry".
const SENTINELS: &[&str] = &["null", "none", "undefined", "nan", "nat"];

/// Raw expiry as it appears on the wire, before normalization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExpiryInput {
    Millis(i64),
    Text(String),
}

impl From<i64> for ExpiryInput {
    fn from(millis: i64) -> Self {
        ExpiryInput::Millis(millis)
    }
}

impl From<&str> for ExpiryInput {
    fn from(s: &str) -> Self {
        ExpiryInput::Text(s.to_string())
    }
}

impl From<String> for ExpiryInput {
    fn from(s: String) -> Self {
        ExpiryInput::Text(s)
    }
}

/// Canonical expiry: one calendar date, rendered as `YYYY-MM-DD`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "ExpiryInput", into = "String")]
pub struct ExpiryDate(NaiveDate);

impl ExpiryDate {
    pub fn from_naive(date: NaiveDate) -> Self {
        Self(date)
    }

    pub fn from_ymd(year: i32, month: u32, day: u32) -> Option<Self> {
        NaiveDate::from_ymd_opt(year, month, day).map(Self)
    }

    /// Normalize any accepted wire encoding.
    pub fn normalize(input: &ExpiryInput) -> Result<Self, KeyError> {
        match input {
            ExpiryInput::Millis(millis) => Self::from_millis(*millis),
            ExpiryInput::Text(text) => Self::parse(text),
        }
    }

    /// Convert epoch milliseconds to the exchange-local calendar date.
    pub fn from_millis(millis: i64) -> Result<Self, KeyError> {
        let instant = DateTime::<Utc>::from_timestamp_millis(millis)
            .ok_or(KeyError::TimestampOutOfRange { millis })?;
        Ok(Self(instant.with_timezone(&exchange_offset()).date_naive()))
    }

    /// Parse a textual expiry: compact digits, epoch digits, or ISO.
    pub fn parse(raw: &str) -> Result<Self, KeyError> {
        let text = raw.trim();
        if text.is_empty() {
            return Err(KeyError::MissingExpiry);
        }
        if is_sentinel(text) {
            return Err(KeyError::SentinelExpiry {
                raw: raw.to_string(),
            });
        }

        if text.bytes().all(|b| b.is_ascii_digit()) {
            return match text.len() {
                8 => NaiveDate::parse_from_str(text, "%Y%m%d")
                    .map(Self)
                    .map_err(|_| invalid(raw)),
                11..=13 => text
                    .parse::<i64>()
                    .map_err(|_| invalid(raw))
                    .and_then(Self::from_millis),
                _ => Err(invalid(raw)),
            };
        }

        if let Ok(instant) = DateTime::parse_from_rfc3339(text) {
            return Ok(Self(instant.with_timezone(&exchange_offset()).date_naive()));
        }

        // Date prefix of an ISO datetime without offset ("2025-02-26T15:30:00")
        let date_part = text
            .split(|c| c == 'T' || c == ' ')
            .next()
            .unwrap_or(text);
        NaiveDate::parse_from_str(date_part, "%Y-%m-%d")
            .map(Self)
            .map_err(|_| invalid(raw))
    }

    pub fn as_naive(&self) -> NaiveDate {
        self.0
    }

    /// Compact `YYYYMMDD` rendering
    pub fn compact(&self) -> String {
        self.0.format("%Y%m%d").to_string()
    }
}

/// Whether a client-supplied expiry string means "no value".
pub fn is_sentinel(raw: &str) -> bool {
    let text = raw.trim();
    text.is_empty() || SENTINELS.iter().any(|s| text.eq_ignore_ascii_case(s))
}

fn exchange_offset() -> FixedOffset {
    FixedOffset::east_opt(EXCHANGE_UTC_OFFSET_SECS).unwrap_or_else(|| Utc.fix())
}

fn invalid(raw: &str) -> KeyError {
    KeyError::InvalidExpiry {
        raw: raw.to_string(),
    }
}

impl fmt::Display for ExpiryDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d"))
    }
}

impl FromStr for ExpiryDate {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<ExpiryInput> for ExpiryDate {
    type Error = KeyError;

    fn try_from(input: ExpiryInput) -> Result<Self, Self::Error> {
        Self::normalize(&input)
    }
}

impl From<ExpiryDate> for String {
    fn from(expiry: ExpiryDate) -> Self {
        expiry.to_string()
    }
}
