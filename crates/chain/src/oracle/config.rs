//! Oracle configuration for TOML-based price seeding.

use alloy::primitives::{Address, U256};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::{PriceCache, PriceData};

/// Static price entry from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleConfig {
    /// Asset address this price applies to
    pub asset: String,
    /// Raw answer as a decimal integer string (e.g. "200000000000")
    pub answer: String,
    /// Answer decimals
    #[serde(default = "default_decimals")]
    pub decimals: u8,
    /// Human-readable description
    #[serde(default)]
    pub description: Option<String>,
}

fn default_decimals() -> u8 {
    8
}

impl OracleConfig {
    /// Parse asset address.
    pub fn asset_address(&self) -> Result<Address> {
        self.asset
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid asset address '{}': {}", self.asset, e))
    }

    /// Parse the raw answer.
    pub fn answer_value(&self) -> Result<U256> {
        U256::from_str_radix(self.answer.trim(), 10)
            .map_err(|e| anyhow::anyhow!("Invalid answer '{}': {}", self.answer, e))
    }

    /// Build a price observation stamped at `timestamp`.
    pub fn price_data(&self, timestamp: u64) -> Result<PriceData> {
        Ok(PriceData::new(self.answer_value()?, self.decimals, timestamp))
    }
}

/// Collection of static prices.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OraclesConfig {
    #[serde(default)]
    pub oracles: Vec<OracleConfig>,
}

impl OraclesConfig {
    /// Load from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read oracle config {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse {:?}", path))
    }

    /// Push every configured price into `cache`.
    pub fn seed(&self, cache: &PriceCache, timestamp: u64) -> Result<usize> {
        for oracle in &self.oracles {
            cache.set(oracle.asset_address()?, oracle.price_data(timestamp)?);
        }
        Ok(self.oracles.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PriceFeed;

    #[test]
    fn test_parse_and_seed() {
        let toml_str = r#"
            [[oracles]]
            asset = "0x1111111111111111111111111111111111111111"
            answer = "200000000000"
            description = "WETH / USD"
        "#;

        let config: OraclesConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.oracles.len(), 1);
        assert_eq!(config.oracles[0].decimals, 8);

        let cache = PriceCache::new();
        assert_eq!(config.seed(&cache, 42).unwrap(), 1);

        let asset = config.oracles[0].asset_address().unwrap();
        let data = cache.price(asset).unwrap();
        assert_eq!(data.timestamp, 42);
        assert_eq!(
            data.normalize_to_18(),
            U256::from(2_000u64) * U256::from(10u64).pow(U256::from(18))
        );
    }

    #[test]
    fn test_invalid_answer() {
        let config = OracleConfig {
            asset: "0x1111111111111111111111111111111111111111".to_string(),
            answer: "12abc".to_string(),
            decimals: 8,
            description: None,
        };
        assert!(config.answer_value().is_err());
    }
}
