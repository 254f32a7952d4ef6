//! Normalized price ticks
//!
//! A tick is a transient message: produced by the decoder, handed to the
//! router, applied by whoever consumes it, then dropped.

use serde::{Deserialize, Serialize};

use crate::ids::InstrumentId;

/// One last-traded-price observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub instrument_id: InstrumentId,
    /// Always finite and strictly positive
    pub last_traded_price: f64,
    /// Unix milliseconds
    pub observed_at: i64,
}

impl Tick {
    /// Build a tick, rejecting non-positive or non-finite prices.
    pub fn new(instrument_id: InstrumentId, last_traded_price: f64, observed_at: i64) -> Option<Self> {
        if !last_traded_price.is_finite() || last_traded_price <= 0.0 {
            return None;
        }
        Some(Self {
            instrument_id,
            last_traded_price,
            observed_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_accepts_positive_price() {
        let tick = Tick::new(InstrumentId::new("NSE_FO|1"), 125.5, 1_740_528_000_000).unwrap();
        assert_eq!(tick.last_traded_price, 125.5);
    }

    #[test]
    fn test_tick_rejects_bad_prices() {
        let id = InstrumentId::new("NSE_FO|1");
        assert!(Tick::new(id.clone(), 0.0, 0).is_none());
        assert!(Tick::new(id.clone(), -1.0, 0).is_none());
        assert!(Tick::new(id, f64::NAN, 0).is_none());
    }
}
