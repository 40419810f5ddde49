//! Price data types.

use alloy::primitives::U256;
use serde::{Deserialize, Serialize};

/// Price observation with metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceData {
    /// Price value (in `decimals` decimals)
    pub price: U256,
    /// Price decimals
    pub decimals: u8,
    /// Unix timestamp of the observation
    pub timestamp: u64,
}

impl PriceData {
    /// Create new price data.
    pub fn new(price: U256, decimals: u8, timestamp: u64) -> Self {
        Self {
            price,
            decimals,
            timestamp,
        }
    }

    /// Price already expressed with 18 decimals.
    pub fn wad(price: U256, timestamp: u64) -> Self {
        Self::new(price, 18, timestamp)
    }

    /// Check if price is stale.
    pub fn is_stale(&self, threshold_secs: u64, current_time: u64) -> bool {
        self.age_secs(current_time) > threshold_secs
    }

    /// Get age in seconds.
    pub fn age_secs(&self, current_time: u64) -> u64 {
        current_time.saturating_sub(self.timestamp)
    }

    /// Normalize price to 18 decimals.
    pub fn normalize_to_18(&self) -> U256 {
        let ten = U256::from(10u64);
        if self.decimals == 18 {
            self.price
        } else if self.decimals < 18 {
            self.price
                .saturating_mul(ten.pow(U256::from(18 - self.decimals)))
        } else {
            self.price / ten.pow(U256::from(self.decimals - 18))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_chainlink_price() {
        // $2000.00 with 8 decimals
        let data = PriceData::new(U256::from(200_000_000_000u64), 8, 0);
        let expected = U256::from(2_000u64) * U256::from(10u64).pow(U256::from(18));
        assert_eq!(data.normalize_to_18(), expected);
    }

    #[test]
    fn test_normalize_high_precision_price() {
        let data = PriceData::new(U256::from(5_000_000_000_000_000_000_000u128), 21, 0);
        assert_eq!(
            data.normalize_to_18(),
            U256::from(5_000_000_000_000_000_000u128)
        );
    }

    #[test]
    fn test_staleness() {
        let data = PriceData::wad(U256::from(1u64), 1_000);
        assert!(!data.is_stale(60, 1_060));
        assert!(data.is_stale(60, 1_061));
        assert_eq!(data.age_secs(900), 0);
    }
}
