//! Collateral asset configuration loading from TOML files.

use alloy::primitives::Address;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Asset configuration file structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssetsConfig {
    /// List of assets
    #[serde(default)]
    pub assets: Vec<AssetConfig>,
}

/// Individual collateral asset (TOML-loadable).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetConfig {
    /// Asset symbol (e.g., "WETH")
    pub symbol: String,
    /// Token address (as hex string)
    pub address: String,
    /// Index capacity override
    #[serde(default)]
    pub max_troves: Option<usize>,
    /// Whether this asset accepts new troves
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_true() -> bool {
    true
}

impl AssetConfig {
    /// Parse token address.
    pub fn token_address(&self) -> Result<Address> {
        self.address
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid asset address '{}': {}", self.address, e))
    }
}

impl AssetsConfig {
    /// Load assets config from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read assets config {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse {:?}", path))
    }

    /// Get active assets only.
    pub fn active_assets(&self) -> impl Iterator<Item = &AssetConfig> {
        self.assets.iter().filter(|a| a.active)
    }

    /// Look up an asset by symbol (case-insensitive).
    pub fn by_symbol(&self, symbol: &str) -> Option<&AssetConfig> {
        self.assets
            .iter()
            .find(|a| a.symbol.eq_ignore_ascii_case(symbol))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_asset_config() {
        let toml_str = r#"
            [[assets]]
            symbol = "WETH"
            address = "0x1111111111111111111111111111111111111111"

            [[assets]]
            symbol = "WBTC"
            address = "0x2222222222222222222222222222222222222222"
            max_troves = 500
            active = false
        "#;

        let config: AssetsConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.assets.len(), 2);
        assert!(config.assets[0].active);
        assert_eq!(config.assets[1].max_troves, Some(500));
        assert_eq!(config.active_assets().count(), 1);
        assert_eq!(
            config.by_symbol("weth").unwrap().token_address().unwrap(),
            Address::repeat_byte(0x11)
        );
    }

    #[test]
    fn test_invalid_address() {
        let config = AssetConfig {
            symbol: "BAD".to_string(),
            address: "0x1234".to_string(),
            max_troves: None,
            active: true,
        };
        assert!(config.token_address().is_err());
    }
}
