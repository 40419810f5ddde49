//! In-memory price cache.

use alloy::primitives::{Address, U256};
use dashmap::DashMap;
use tracing::debug;

use super::{PriceData, PriceFeed};
use crate::ChainError;

/// Concurrent price cache keyed by asset.
///
/// Prices can be pushed through a shared reference, so one handle can sit
/// inside the engine while another is driven by a feeder.
#[derive(Debug, Default)]
pub struct PriceCache {
    prices: DashMap<Address, PriceData>,
}

impl PriceCache {
    pub fn new() -> Self {
        Self {
            prices: DashMap::new(),
        }
    }

    /// Store a price observation.
    pub fn set(&self, asset: Address, data: PriceData) {
        debug!(
            asset = %asset,
            price = %data.price,
            decimals = data.decimals,
            timestamp = data.timestamp,
            "Price updated"
        );
        self.prices.insert(asset, data);
    }

    /// Store an 18-decimal price.
    pub fn set_price(&self, asset: Address, price: U256, timestamp: u64) {
        self.set(asset, PriceData::wad(price, timestamp));
    }

    pub fn remove(&self, asset: &Address) -> Option<PriceData> {
        self.prices.remove(asset).map(|(_, data)| data)
    }

    pub fn get(&self, asset: &Address) -> Option<PriceData> {
        self.prices.get(asset).map(|p| *p)
    }

    pub fn len(&self) -> usize {
        self.prices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prices.is_empty()
    }
}

impl PriceFeed for PriceCache {
    fn price(&self, asset: Address) -> Result<PriceData, ChainError> {
        self.get(&asset).ok_or(ChainError::NoPrice { asset })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_missing_price() {
        let cache = PriceCache::new();
        let asset = Address::repeat_byte(0xAA);
        assert_eq!(cache.price(asset), Err(ChainError::NoPrice { asset }));
    }

    #[test]
    fn test_shared_handle_sees_updates() {
        let cache = Arc::new(PriceCache::new());
        let feeder = cache.clone();
        let asset = Address::repeat_byte(0xAA);

        feeder.set_price(asset, U256::from(7u64), 10);
        let data = cache.price(asset).unwrap();
        assert_eq!(data.price, U256::from(7u64));
        assert_eq!(data.timestamp, 10);

        assert!(feeder.remove(&asset).is_some());
        assert!(cache.is_empty());
    }
}
