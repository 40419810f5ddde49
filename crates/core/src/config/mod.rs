//! Configuration system for the CDP engine.
//!
//! This module provides:
//! - Protocol parameters (ratios, fees, limits) with named profiles
//! - Collateral asset lists loaded from TOML

mod asset_config;
mod protocol;

// Re-export protocol config (main runtime config)
pub use protocol::{
    config, init_config, CollateralConfig, FeeConfig, LimitsConfig, OracleLimits, ProtocolConfig,
};

// Re-export asset config
pub use asset_config::{AssetConfig, AssetsConfig};
