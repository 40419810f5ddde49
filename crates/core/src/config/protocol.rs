//! Protocol parameters with profile support.
//!
//! Ratios and fees are stored in basis points and converted to WAD at the
//! point of use; nothing inside the engine sees a float.

use alloy::primitives::{Address, U256};
use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::fees::FeeSchedule;
use crate::u256_math::{self, WAD};

/// Main protocol configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Profile name (for logging/identification)
    #[serde(default = "default_profile_name")]
    pub profile: String,

    /// Receiver of borrowing and redemption fees
    #[serde(default)]
    pub fee_recipient: Address,

    /// Collateralization thresholds
    #[serde(default)]
    pub collateral: CollateralConfig,

    /// Borrowing and redemption fees
    #[serde(default)]
    pub fees: FeeConfig,

    /// Size and iteration limits
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Price acceptance
    #[serde(default)]
    pub oracle: OracleLimits,
}

fn default_profile_name() -> String {
    "default".to_string()
}

/// Collateralization thresholds in basis points.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollateralConfig {
    /// Minimum collateral ratio per trove (11000 = 110%)
    #[serde(default = "default_mcr")]
    pub mcr_bps: u32,

    /// System ratio below which recovery mode applies (15000 = 150%)
    #[serde(default = "default_ccr")]
    pub ccr_bps: u32,

    /// Share of seized collateral paid to the liquidator (50 = 0.5%)
    #[serde(default = "default_gas_compensation")]
    pub gas_compensation_bps: u32,
}

fn default_mcr() -> u32 {
    11_000
}
fn default_ccr() -> u32 {
    15_000
}
fn default_gas_compensation() -> u32 {
    50
}

impl Default for CollateralConfig {
    fn default() -> Self {
        Self {
            mcr_bps: default_mcr(),
            ccr_bps: default_ccr(),
            gas_compensation_bps: default_gas_compensation(),
        }
    }
}

/// Fee parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeeConfig {
    #[serde(default = "default_fee_floor")]
    pub borrowing_fee_floor_bps: u32,

    #[serde(default = "default_max_borrowing_fee")]
    pub max_borrowing_fee_bps: u32,

    #[serde(default = "default_fee_floor")]
    pub redemption_fee_floor_bps: u32,

    /// Base-rate sensitivity to borrowing (0 disables the increment)
    #[serde(default = "default_beta")]
    pub borrowing_beta: u64,

    /// Base-rate sensitivity to redemptions (0 disables the increment)
    #[serde(default = "default_beta")]
    pub redemption_beta: u64,

    /// Per-minute base-rate decay (WAD); the default halves in 12 hours
    #[serde(default = "default_minute_decay_factor")]
    pub minute_decay_factor: u64,
}

fn default_fee_floor() -> u32 {
    50
}
fn default_max_borrowing_fee() -> u32 {
    500
}
fn default_beta() -> u64 {
    2
}
fn default_minute_decay_factor() -> u64 {
    999_037_758_833_783_000
}

impl Default for FeeConfig {
    fn default() -> Self {
        Self {
            borrowing_fee_floor_bps: default_fee_floor(),
            max_borrowing_fee_bps: default_max_borrowing_fee(),
            redemption_fee_floor_bps: default_fee_floor(),
            borrowing_beta: default_beta(),
            redemption_beta: default_beta(),
            minute_decay_factor: default_minute_decay_factor(),
        }
    }
}

/// Size and iteration limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Minimum trove debt, in whole debt tokens
    #[serde(default = "default_min_net_debt")]
    pub min_net_debt: u64,

    /// Maximum candidates in one batch liquidation
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Maximum hops when correcting a stale insert hint
    #[serde(default = "default_max_scan_steps")]
    pub max_scan_steps: usize,

    /// Default index capacity per asset
    #[serde(default = "default_max_troves")]
    pub max_troves_per_asset: usize,
}

fn default_min_net_debt() -> u64 {
    1_800
}
fn default_max_batch_size() -> usize {
    100
}
fn default_max_scan_steps() -> usize {
    500
}
fn default_max_troves() -> usize {
    100_000
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            min_net_debt: default_min_net_debt(),
            max_batch_size: default_max_batch_size(),
            max_scan_steps: default_max_scan_steps(),
            max_troves_per_asset: default_max_troves(),
        }
    }
}

/// Price acceptance limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleLimits {
    /// Prices older than this are rejected
    #[serde(default = "default_max_price_age")]
    pub max_price_age_secs: u64,
}

fn default_max_price_age() -> u64 {
    3_600
}

impl Default for OracleLimits {
    fn default() -> Self {
        Self {
            max_price_age_secs: default_max_price_age(),
        }
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            profile: default_profile_name(),
            collateral: CollateralConfig::default(),
            fees: FeeConfig::default(),
            limits: LimitsConfig::default(),
            oracle: OracleLimits::default(),
            fee_recipient: Address::ZERO,
        }
    }
}

impl ProtocolConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read protocol config {:?}", path))?;
        let config: Self =
            toml::from_str(&content).with_context(|| format!("Failed to parse {:?}", path))?;
        config.validate()?;
        Ok(config)
    }

    /// Small debt floor and flat borrowing fees, for tests and simulation.
    pub fn testing() -> Self {
        Self {
            profile: "testing".to_string(),
            collateral: CollateralConfig::default(),
            fees: FeeConfig {
                borrowing_fee_floor_bps: 0, // exact debt amounts in tests
                borrowing_beta: 0,
                ..Default::default()
            },
            limits: LimitsConfig {
                min_net_debt: 100,
                max_batch_size: 50,
                max_scan_steps: 100,
                max_troves_per_asset: 1_000,
            },
            oracle: OracleLimits {
                max_price_age_secs: 86_400,
            },
            fee_recipient: Address::repeat_byte(0xFE),
        }
    }

    /// Higher ratios and a larger debt floor.
    pub fn conservative() -> Self {
        Self {
            profile: "conservative".to_string(),
            collateral: CollateralConfig {
                mcr_bps: 12_000,
                ccr_bps: 16_000,
                gas_compensation_bps: 50,
            },
            fees: FeeConfig {
                borrowing_fee_floor_bps: 100,
                redemption_fee_floor_bps: 100,
                ..Default::default()
            },
            limits: LimitsConfig {
                min_net_debt: 2_000,
                max_batch_size: 50,
                ..Default::default()
            },
            oracle: OracleLimits {
                max_price_age_secs: 900,
            },
            fee_recipient: Address::ZERO,
        }
    }

    /// Get profile from environment variable CDP_PROFILE, or default.
    /// Supported values: testing, conservative
    pub fn from_env() -> Self {
        let profile = std::env::var("CDP_PROFILE").unwrap_or_else(|_| "default".to_string());
        match profile.to_lowercase().as_str() {
            "testing" | "test" => Self::testing(),
            "conservative" | "safe" => Self::conservative(),
            _ => Self::default(),
        }
    }

    /// Reject parameter combinations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        let c = &self.collateral;
        let f = &self.fees;
        ensure!(c.mcr_bps > 10_000, "mcr_bps must exceed 10000, got {}", c.mcr_bps);
        ensure!(c.ccr_bps >= c.mcr_bps, "ccr_bps {} below mcr_bps {}", c.ccr_bps, c.mcr_bps);
        ensure!(
            c.gas_compensation_bps < 10_000,
            "gas_compensation_bps must be below 10000"
        );
        ensure!(
            f.borrowing_fee_floor_bps <= f.max_borrowing_fee_bps,
            "borrowing fee floor above its cap"
        );
        ensure!(f.max_borrowing_fee_bps <= 10_000, "max_borrowing_fee_bps above 100%");
        ensure!(f.redemption_fee_floor_bps <= 10_000, "redemption_fee_floor_bps above 100%");
        ensure!(
            U256::from(f.minute_decay_factor) <= WAD,
            "minute_decay_factor above 1e18"
        );
        ensure!(self.limits.max_batch_size > 0, "max_batch_size must be positive");
        ensure!(
            self.limits.max_troves_per_asset > 0,
            "max_troves_per_asset must be positive"
        );
        Ok(())
    }

    pub fn mcr(&self) -> U256 {
        u256_math::bps_to_wad(self.collateral.mcr_bps)
    }

    pub fn ccr(&self) -> U256 {
        u256_math::bps_to_wad(self.collateral.ccr_bps)
    }

    pub fn min_net_debt(&self) -> U256 {
        u256_math::wad(self.limits.min_net_debt)
    }

    pub fn minute_decay_factor(&self) -> U256 {
        U256::from(self.fees.minute_decay_factor)
    }

    pub fn borrowing_schedule(&self) -> FeeSchedule {
        FeeSchedule {
            floor: u256_math::bps_to_wad(self.fees.borrowing_fee_floor_bps),
            cap: u256_math::bps_to_wad(self.fees.max_borrowing_fee_bps),
            beta: self.fees.borrowing_beta,
        }
    }

    pub fn redemption_schedule(&self) -> FeeSchedule {
        FeeSchedule {
            floor: u256_math::bps_to_wad(self.fees.redemption_fee_floor_bps),
            cap: WAD,
            beta: self.fees.redemption_beta,
        }
    }

    /// Log the current configuration.
    pub fn log_config(&self) {
        tracing::info!(profile = %self.profile, "Protocol configuration loaded");
        tracing::info!(
            mcr_bps = self.collateral.mcr_bps,
            ccr_bps = self.collateral.ccr_bps,
            gas_compensation_bps = self.collateral.gas_compensation_bps,
            "Collateral thresholds"
        );
        tracing::info!(
            borrowing_floor_bps = self.fees.borrowing_fee_floor_bps,
            borrowing_cap_bps = self.fees.max_borrowing_fee_bps,
            redemption_floor_bps = self.fees.redemption_fee_floor_bps,
            "Fee parameters"
        );
        tracing::info!(
            min_net_debt = self.limits.min_net_debt,
            max_batch_size = self.limits.max_batch_size,
            max_scan_steps = self.limits.max_scan_steps,
            max_price_age_secs = self.oracle.max_price_age_secs,
            "Limits"
        );
    }
}

/// Global configuration holder using lazy initialization.
use std::sync::OnceLock;

static GLOBAL_CONFIG: OnceLock<ProtocolConfig> = OnceLock::new();

/// Initialize global configuration.
pub fn init_config(config: ProtocolConfig) {
    let _ = GLOBAL_CONFIG.set(config);
}

/// Get the global configuration, initializing from environment if needed.
pub fn config() -> &'static ProtocolConfig {
    GLOBAL_CONFIG.get_or_init(ProtocolConfig::from_env)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ProtocolConfig::default();
        assert_eq!(config.collateral.mcr_bps, 11_000);
        assert_eq!(config.mcr(), WAD + WAD / U256::from(10u64));
        assert_eq!(config.ccr(), WAD + WAD / U256::from(2u64));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_profiles_validate() {
        assert!(ProtocolConfig::testing().validate().is_ok());
        assert!(ProtocolConfig::conservative().validate().is_ok());
        assert_eq!(ProtocolConfig::testing().borrowing_schedule().floor, U256::ZERO);
    }

    #[test]
    fn test_invalid_ratios_rejected() {
        let mut config = ProtocolConfig::default();
        config.collateral.ccr_bps = 10_500;
        assert!(config.validate().is_err());

        let mut config = ProtocolConfig::default();
        config.fees.minute_decay_factor = u64::MAX;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_serialization() {
        let config = ProtocolConfig::testing();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("profile = \"testing\""));

        let parsed: ProtocolConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.profile, "testing");
        assert_eq!(parsed.limits.min_net_debt, 100);
        assert_eq!(parsed.fee_recipient, Address::repeat_byte(0xFE));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let parsed: ProtocolConfig = toml::from_str(
            r#"
            profile = "custom"
            [collateral]
            mcr_bps = 12500
            "#,
        )
        .unwrap();
        assert_eq!(parsed.collateral.mcr_bps, 12_500);
        assert_eq!(parsed.collateral.ccr_bps, 15_000);
        assert_eq!(parsed.limits.max_scan_steps, 500);
    }
}
