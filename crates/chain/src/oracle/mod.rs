//! Price lookup abstraction.
//!
//! The core consumes prices through [`PriceFeed`] as a pure lookup. Freshness
//! and positivity are judged by the caller against its own clock; fallback
//! between sources, if any, belongs behind this trait.
//!
//! # Example
//!
//! ```rust,ignore
//! use cdp_chain::oracle::{PriceCache, PriceFeed};
//!
//! let cache = PriceCache::new();
//! cache.set_price(weth, wad(2_000), now);
//!
//! let data = cache.price(weth)?;
//! if data.is_stale(3600, now) {
//!     warn!("Price is stale!");
//! }
//! ```

mod cache;
mod config;
mod types;

pub use cache::PriceCache;
pub use config::{OracleConfig, OraclesConfig};
pub use types::PriceData;

use alloy::primitives::Address;
use std::sync::Arc;

use crate::ChainError;

/// Price lookup for a collateral asset, quoted in debt-token units.
pub trait PriceFeed {
    /// Latest known price for `asset`.
    fn price(&self, asset: Address) -> Result<PriceData, ChainError>;
}

impl<T: PriceFeed + ?Sized> PriceFeed for Arc<T> {
    fn price(&self, asset: Address) -> Result<PriceData, ChainError> {
        (**self).price(asset)
    }
}

impl<T: PriceFeed + ?Sized> PriceFeed for &T {
    fn price(&self, asset: Address) -> Result<PriceData, ChainError> {
        (**self).price(asset)
    }
}
